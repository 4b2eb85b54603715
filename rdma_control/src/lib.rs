/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Connection bootstrap and queue pair lifecycle for RDMA.
//!
//! Two nodes exchange queue pair numbers, memory region keys and addressing
//! facts over a small UDP RPC protocol before any RDMA path exists. The
//! server side runs a [`ControlDaemon`] that owns resource registries; the
//! client side drives a [`ConnectManager`] against it and then walks its own
//! queue pair through INIT -> RTR -> RTS with the returned attributes.

#[macro_use]
mod macros;

pub mod channel;
pub mod config;
mod connect_manager;
mod control_daemon;
mod ibverbs_primitives;
pub mod multi_msg;
pub mod proto;
mod queue_pair;
mod rdma_components;
mod registry;
pub mod rpc;
pub mod verbs;
pub mod wire;

pub use connect_manager::*;
pub use control_daemon::*;
pub use ibverbs_primitives::*;
pub use queue_pair::*;
pub use rdma_components::*;
pub use registry::*;

/// Coarse outcome classes shared by every fallible operation in the crate.
///
/// Each typed error maps onto one of these through its `code()` method so
/// callers can decide between retrying, polling again and giving up without
/// matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoCode {
    Ok,
    /// Generic failure.
    Err,
    /// The deadline elapsed with no result.
    Timeout,
    /// A tolerable conflict, e.g. a duplicate registration.
    NearOk,
    /// The queried resource is not registered yet; poll again later.
    NotReady,
}

impl std::fmt::Display for IoCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoCode::Ok => "ok",
            IoCode::Err => "err",
            IoCode::Timeout => "timeout",
            IoCode::NearOk => "near ok",
            IoCode::NotReady => "not ready",
        };
        f.write_str(s)
    }
}

#[cfg(all(test, not(feature = "ibverbs")))]
mod test_utils;
