/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Verbs
//!
//! The verbs-equivalent primitive surface the control plane is written
//! against: device enumeration, context and protection domain allocation,
//! completion queues, queue pairs, memory registration, posting work
//! requests and polling completions.
//!
//! The plain data types live here. The handles (`Context`, `Pd`, `Cq`, `Qp`,
//! `Mr`) and the calls come from one of two providers:
//!
//! * the default software provider, an in-process soft RoCE fabric that
//!   needs no RDMA hardware (see `soft.rs`);
//! * with the `ibverbs` feature, libibverbs through `ibverbs-sys`, which
//!   drives real NICs and connects queue pairs across hosts.
//!
//! Both report failures as `std::io::Error`s carrying the errno, and both
//! take attribute masks and access flags with the bit values libibverbs
//! uses.

use std::io;
use std::ops::BitOr;

#[cfg(not(feature = "ibverbs"))]
mod soft;
#[cfg(not(feature = "ibverbs"))]
pub use soft::*;

#[cfg(feature = "ibverbs")]
mod ibverbs;
#[cfg(feature = "ibverbs")]
pub use self::ibverbs::*;

/// Bytes reserved at the front of every UD receive buffer for the global
/// routing header.
pub const GRH_SIZE: usize = 40;

/// Most work requests rung with one doorbell.
pub const MAX_DOORBELL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpType {
    /// Reliable connection.
    Rc,
    /// Unreliable datagram.
    Ud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// Attribute mask for [`modify_qp`], one bit per attribute group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrMask(pub u32);

impl AttrMask {
    pub const STATE: AttrMask = AttrMask(1 << 0);
    pub const ACCESS_FLAGS: AttrMask = AttrMask(1 << 3);
    pub const PKEY_INDEX: AttrMask = AttrMask(1 << 4);
    pub const PORT: AttrMask = AttrMask(1 << 5);
    pub const QKEY: AttrMask = AttrMask(1 << 6);
    pub const AV: AttrMask = AttrMask(1 << 7);
    pub const PATH_MTU: AttrMask = AttrMask(1 << 8);
    pub const TIMEOUT: AttrMask = AttrMask(1 << 9);
    pub const RETRY_CNT: AttrMask = AttrMask(1 << 10);
    pub const RNR_RETRY: AttrMask = AttrMask(1 << 11);
    pub const RQ_PSN: AttrMask = AttrMask(1 << 12);
    pub const MAX_QP_RD_ATOMIC: AttrMask = AttrMask(1 << 13);
    pub const MIN_RNR_TIMER: AttrMask = AttrMask(1 << 15);
    pub const SQ_PSN: AttrMask = AttrMask(1 << 16);
    pub const MAX_DEST_RD_ATOMIC: AttrMask = AttrMask(1 << 17);
    pub const DEST_QPN: AttrMask = AttrMask(1 << 20);

    pub fn contains(&self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

/// Memory and queue pair access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(1 << 1);
    pub const REMOTE_READ: AccessFlags = AccessFlags(1 << 2);
    pub const REMOTE_ATOMIC: AccessFlags = AccessFlags(1 << 3);

    pub fn contains(&self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

/// Global routing header fields of an address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: [u8; 16],
    pub hop_limit: u8,
    pub sgid_index: u8,
}

/// Address vector used to reach a remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub is_global: bool,
    pub grh: GlobalRoute,
}

/// Attributes passed to [`modify_qp`] and returned by [`query_qp`]. Only
/// the fields selected by the accompanying [`AttrMask`] are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModifyAttr {
    pub qp_state: QpState,
    pub pkey_index: u16,
    pub port_num: u8,
    pub qp_access_flags: AccessFlags,
    pub qkey: u32,
    pub ah_attr: AhAttr,
    /// Path MTU in bytes.
    pub path_mtu: u32,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub sq_psn: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub qp_type: QpType,
    pub send_cq: Cq,
    pub recv_cq: Cq,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    RdmaWrite,
    RdmaWriteWithImm,
    Send,
    SendWithImm,
    RdmaRead,
    AtomicCmpAndSwp,
    AtomicFetchAndAdd,
}

/// A scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Destination of a UD send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdDest {
    pub dlid: u16,
    pub remote_qpn: u32,
    pub remote_qkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub signaled: bool,
    pub sge: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
    pub imm_data: Option<u32>,
    /// Compare value for compare-and-swap, addend for fetch-and-add.
    pub compare_add: u64,
    pub swap: u64,
    pub ud: Option<UdDest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocProtErr,
    WrFlushErr,
    RemInvReqErr,
    RemAccessErr,
    RetryExcErr,
    RnrRetryExcErr,
    /// A status this crate does not name, as the raw provider value.
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    CompSwap,
    FetchAdd,
    Recv,
    RecvRdmaWithImm,
    Other(u32),
}

/// A work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub imm_data: Option<u32>,
    pub qp_num: u32,
    pub src_qp: u32,
    pub slid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAttr {
    pub name: String,
    pub node_guid: u64,
    pub phys_port_cnt: u8,
    pub max_qp: u32,
    pub max_cq: u32,
    pub max_mr: u32,
    pub max_qp_wr: u32,
    pub max_cqe: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub lid: u16,
    /// Active MTU in bytes.
    pub active_mtu: u32,
}

/// Posts one work request to the send queue of `qp`.
pub fn post_send(qp: Qp, wr: &SendWr) -> io::Result<()> {
    post_send_list(qp, std::slice::from_ref(wr)).map_err(|(_, e)| e)
}
