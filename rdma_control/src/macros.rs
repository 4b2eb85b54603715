/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/// Implements [`crate::wire::Wire`] for a struct by encoding the listed
/// fields one after another in the given order. The listed fields must be
/// every field of the struct.
macro_rules! impl_wire {
    ($ty:ty { $($field:ident: $fty:ty),* $(,)? }) => {
        impl $crate::wire::Wire for $ty {
            const SIZE: usize = 0 $(+ <$fty as $crate::wire::Wire>::SIZE)*;

            fn encode(&self, buf: &mut bytes::BytesMut) {
                $(<$fty as $crate::wire::Wire>::encode(&self.$field, buf);)*
            }

            fn decode(buf: &mut &[u8]) -> Self {
                Self {
                    $($field: <$fty as $crate::wire::Wire>::decode(buf),)*
                }
            }
        }
    };
}
