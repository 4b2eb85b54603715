/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixed-layout binary encoding for the structs exchanged during bootstrap.
//!
//! Every wire struct has an explicit layout: fields are written in
//! declaration order with no padding, and every integer is little-endian.
//! Peers never copy in-memory struct images onto the wire, so two binaries
//! built with different compilers or for different targets agree on the
//! encoding as long as they agree on the field list.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

/// A value with a fixed encoded size.
pub trait Wire: Sized {
    /// Number of bytes [`Wire::encode`] appends.
    const SIZE: usize;

    /// Appends exactly `Self::SIZE` bytes to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes a value from the front of `buf` and advances it by
    /// `Self::SIZE` bytes. Callers guarantee `buf.len() >= Self::SIZE`;
    /// use [`dedump`] for untrusted input.
    fn decode(buf: &mut &[u8]) -> Self;
}

macro_rules! impl_wire_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Wire for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn encode(&self, buf: &mut BytesMut) {
                    buf.$put(*self);
                }

                fn decode(buf: &mut &[u8]) -> Self {
                    buf.$get()
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16_le, get_u16_le;
    u32 => put_u32_le, get_u32_le;
    u64 => put_u64_le, get_u64_le;
}

impl<T: Wire, const N: usize> Wire for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn encode(&self, buf: &mut BytesMut) {
        for item in self {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Self {
        std::array::from_fn(|_| T::decode(buf))
    }
}

/// Encodes `value` into a fresh buffer of exactly `T::SIZE` bytes.
pub fn dump<T: Wire>(value: &T) -> Bytes {
    let mut buf = BytesMut::with_capacity(T::SIZE);
    value.encode(&mut buf);
    buf.freeze()
}

/// Decodes a `T` from the prefix of `buf`.
///
/// Returns `None` if `buf` is shorter than `T::SIZE`; trailing bytes are
/// ignored.
pub fn dedump<T: Wire>(buf: &[u8]) -> Option<T> {
    if buf.len() < T::SIZE {
        return None;
    }
    let mut cursor = &buf[..T::SIZE];
    Some(T::decode(&mut cursor))
}

/// Returns the suffix of `buf` starting at `offset`, or `None` when
/// `offset` is at or past the end.
pub fn forward(buf: &Bytes, offset: usize) -> Option<Bytes> {
    if offset >= buf.len() {
        return None;
    }
    Some(buf.slice(offset..))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Sample {
        a: u8,
        b: u16,
        c: u32,
        d: u64,
        e: [u16; 3],
    }

    impl_wire!(Sample {
        a: u8,
        b: u16,
        c: u32,
        d: u64,
        e: [u16; 3],
    });

    #[test]
    fn test_packed_size() {
        assert_eq!(Sample::SIZE, 1 + 2 + 4 + 8 + 6);
        let v = Sample {
            a: 1,
            b: 2,
            c: 3,
            d: 4,
            e: [5, 6, 7],
        };
        assert_eq!(dump(&v).len(), Sample::SIZE);
    }

    #[test]
    fn test_little_endian_layout() {
        let v = Sample {
            a: 0xaa,
            b: 0x0102,
            c: 0x03040506,
            d: 0x0708090a0b0c0d0e,
            e: [0x1122, 0, 0xffff],
        };
        let bytes = dump(&v);
        assert_eq!(
            &bytes[..],
            &[
                0xaa, // a
                0x02, 0x01, // b
                0x06, 0x05, 0x04, 0x03, // c
                0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 0x09, 0x08, 0x07, // d
                0x22, 0x11, 0x00, 0x00, 0xff, 0xff, // e
            ]
        );
        assert_eq!(dedump::<Sample>(&bytes), Some(v));
    }

    #[test]
    fn test_dedump_undersized() {
        let bytes = dump(&Sample::default());
        assert_eq!(dedump::<Sample>(&bytes[..Sample::SIZE - 1]), None);
        assert_eq!(dedump::<u64>(&[1, 2, 3]), None);
        assert_eq!(dedump::<u8>(&[]), None);
    }

    #[test]
    fn test_dedump_ignores_trailing_bytes() {
        let mut buf = BytesMut::new();
        42u32.encode(&mut buf);
        buf.put_slice(b"trailer");
        assert_eq!(dedump::<u32>(&buf), Some(42));
    }

    #[test]
    fn test_forward() {
        let buf = Bytes::from_static(b"hello");
        assert_eq!(forward(&buf, 0).as_deref(), Some(&b"hello"[..]));
        assert_eq!(forward(&buf, 3).as_deref(), Some(&b"lo"[..]));
        assert_eq!(forward(&buf, 5), None);
        assert_eq!(forward(&buf, 100), None);
    }
}
