/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Software verbs provider.
//!
//! A fabric living inside the process, in the spirit of soft RoCE. Every
//! opened context attaches to one of a fixed number of emulated devices,
//! each with a single active port, a unique LID and a GID. Queue pair
//! numbers are unique across the whole fabric so a queue pair on one device
//! can address a queue pair on another exactly like two hosts on one subnet.
//!
//! The provider enforces the same contract a driver does:
//!
//! * `modify_qp` only accepts the legal edges (RESET -> INIT -> RTR -> RTS,
//!   plus any -> RESET/ERR) and rejects a call whose attribute mask lacks a
//!   bit the edge requires for the queue pair type with `EINVAL`.
//! * `post_send` requires RTS. RDMA READ/WRITE and atomics check keys,
//!   bounds and access flags before touching memory; violations become
//!   error completions and move the queue pair to ERR.
//! * SEND consumes a posted receive on the destination. RC reports an RNR
//!   error when none is posted; UD drops the datagram silently.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use super::*;

/// Number of entries in every port's GID table.
pub const GID_TABLE_LEN: u8 = 4;

const FIRST_QPN: u32 = 0x100;
const FIRST_LID: u16 = 0x10;
const MAX_QP_WR: u32 = 16384;
const MAX_CQE: u32 = 65536;

/// An opened device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context(u32);

/// A protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pd(u32);

/// A completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cq(u32);

/// A queue pair, identified by its fabric-wide queue pair number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Qp(u32);

impl Qp {
    pub fn qp_num(&self) -> u32 {
        self.0
    }
}

/// A memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mr {
    handle: u32,
    pub lkey: u32,
    pub rkey: u32,
}


struct SoftDevice {
    name: String,
    lid: u16,
    gid: [u8; 16],
    node_guid: u64,
}

impl SoftDevice {
    fn new(idx: usize) -> Self {
        let node_guid = 0x0200_5eff_fe00_0000 | idx as u64;
        let mut gid = [0u8; 16];
        gid[..8].copy_from_slice(&0xfe80_0000_0000_0000u64.to_be_bytes());
        gid[8..].copy_from_slice(&node_guid.to_be_bytes());
        Self {
            name: format!("rxe{}", idx),
            lid: FIRST_LID + idx as u16,
            gid,
            node_guid,
        }
    }
}

struct CqEntry {
    ctx: u32,
    capacity: usize,
    entries: VecDeque<Wc>,
}

struct QpEntry {
    pd: u32,
    dev: usize,
    qp_type: QpType,
    send_cq: u32,
    recv_cq: u32,
    max_recv_wr: u32,
    attr: ModifyAttr,
    recv_queue: VecDeque<RecvWr>,
}

struct MrEntry {
    pd: u32,
    addr: u64,
    len: usize,
    access: AccessFlags,
}

#[derive(Default)]
struct FabricState {
    next_handle: u32,
    next_qpn: u32,
    contexts: HashMap<u32, usize>,
    pds: HashMap<u32, u32>,
    cqs: HashMap<u32, CqEntry>,
    qps: HashMap<u32, QpEntry>,
    mrs: HashMap<u32, MrEntry>,
}

struct Fabric {
    devices: Vec<SoftDevice>,
    state: Mutex<FabricState>,
}

static FABRIC: LazyLock<Fabric> = LazyLock::new(|| {
    let num_devices = crate::config::global::num_soft_devices();
    tracing::debug!("initializing soft verbs fabric with {} devices", num_devices);
    Fabric {
        devices: (0..num_devices).map(SoftDevice::new).collect(),
        state: Mutex::new(FabricState {
            next_handle: 1,
            next_qpn: FIRST_QPN,
            ..Default::default()
        }),
    }
});

fn fabric_state() -> MutexGuard<'static, FabricState> {
    FABRIC.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn valid_mtu(mtu: u32) -> bool {
    matches!(mtu, 256 | 512 | 1024 | 2048 | 4096)
}

/// Returns the names of all devices, indexed by device id.
pub fn get_device_list() -> Vec<String> {
    FABRIC.devices.iter().map(|d| d.name.clone()).collect()
}

pub fn query_device(dev_id: usize) -> io::Result<DeviceAttr> {
    let device = FABRIC.devices.get(dev_id).ok_or_else(|| errno(libc::ENODEV))?;
    Ok(DeviceAttr {
        name: device.name.clone(),
        node_guid: device.node_guid,
        phys_port_cnt: 1,
        max_qp: 1 << 16,
        max_cq: 1 << 16,
        max_mr: 1 << 16,
        max_qp_wr: MAX_QP_WR,
        max_cqe: MAX_CQE,
    })
}

pub fn open_device(dev_id: usize) -> io::Result<Context> {
    if dev_id >= FABRIC.devices.len() {
        return Err(errno(libc::ENODEV));
    }
    let mut state = fabric_state();
    let handle = state.alloc_handle();
    state.contexts.insert(handle, dev_id);
    Ok(Context(handle))
}

pub fn close_device(ctx: Context) -> io::Result<()> {
    let mut state = fabric_state();
    if !state.contexts.contains_key(&ctx.0) {
        return Err(errno(libc::EINVAL));
    }
    let in_use = state.pds.values().any(|c| *c == ctx.0)
        || state.cqs.values().any(|cq| cq.ctx == ctx.0);
    if in_use {
        return Err(errno(libc::EBUSY));
    }
    state.contexts.remove(&ctx.0);
    Ok(())
}

pub fn query_port(ctx: Context, port_num: u8) -> io::Result<PortAttr> {
    let state = fabric_state();
    let dev = state.device_of(ctx)?;
    if port_num != 1 {
        return Err(errno(libc::EINVAL));
    }
    Ok(PortAttr {
        state: PortState::Active,
        lid: FABRIC.devices[dev].lid,
        active_mtu: 4096,
    })
}

pub fn query_gid(ctx: Context, port_num: u8, index: u8) -> io::Result<[u8; 16]> {
    let state = fabric_state();
    let dev = state.device_of(ctx)?;
    if port_num != 1 || index >= GID_TABLE_LEN {
        return Err(errno(libc::EINVAL));
    }
    Ok(FABRIC.devices[dev].gid)
}

pub fn alloc_pd(ctx: Context) -> io::Result<Pd> {
    let mut state = fabric_state();
    state.device_of(ctx)?;
    let handle = state.alloc_handle();
    state.pds.insert(handle, ctx.0);
    Ok(Pd(handle))
}

pub fn dealloc_pd(pd: Pd) -> io::Result<()> {
    let mut state = fabric_state();
    if !state.pds.contains_key(&pd.0) {
        return Err(errno(libc::EINVAL));
    }
    let in_use = state.qps.values().any(|qp| qp.pd == pd.0)
        || state.mrs.values().any(|mr| mr.pd == pd.0);
    if in_use {
        return Err(errno(libc::EBUSY));
    }
    state.pds.remove(&pd.0);
    Ok(())
}

pub fn create_cq(ctx: Context, cqe: u32) -> io::Result<Cq> {
    let mut state = fabric_state();
    state.device_of(ctx)?;
    if cqe == 0 || cqe > MAX_CQE {
        return Err(errno(libc::EINVAL));
    }
    let handle = state.alloc_handle();
    state.cqs.insert(
        handle,
        CqEntry {
            ctx: ctx.0,
            capacity: cqe as usize,
            entries: VecDeque::new(),
        },
    );
    Ok(Cq(handle))
}

pub fn destroy_cq(cq: Cq) -> io::Result<()> {
    let mut state = fabric_state();
    if !state.cqs.contains_key(&cq.0) {
        return Err(errno(libc::EINVAL));
    }
    if state
        .qps
        .values()
        .any(|qp| qp.send_cq == cq.0 || qp.recv_cq == cq.0)
    {
        return Err(errno(libc::EBUSY));
    }
    state.cqs.remove(&cq.0);
    Ok(())
}

pub fn create_qp(pd: Pd, init_attr: &QpInitAttr) -> io::Result<Qp> {
    let mut state = fabric_state();
    let ctx = *state.pds.get(&pd.0).ok_or_else(|| errno(libc::EINVAL))?;
    let dev = state.device_of(Context(ctx))?;
    for cq in [init_attr.send_cq, init_attr.recv_cq] {
        match state.cqs.get(&cq.0) {
            Some(entry) if entry.ctx == ctx => {}
            _ => return Err(errno(libc::EINVAL)),
        }
    }
    if init_attr.max_send_wr == 0
        || init_attr.max_send_wr > MAX_QP_WR
        || init_attr.max_recv_wr > MAX_QP_WR
    {
        return Err(errno(libc::EINVAL));
    }
    let qpn = state.next_qpn;
    state.next_qpn += 1;
    state.qps.insert(
        qpn,
        QpEntry {
            pd: pd.0,
            dev,
            qp_type: init_attr.qp_type,
            send_cq: init_attr.send_cq.0,
            recv_cq: init_attr.recv_cq.0,
            max_recv_wr: init_attr.max_recv_wr,
            attr: ModifyAttr::default(),
            recv_queue: VecDeque::new(),
        },
    );
    Ok(Qp(qpn))
}

pub fn destroy_qp(qp: Qp) -> io::Result<()> {
    let mut state = fabric_state();
    state
        .qps
        .remove(&qp.0)
        .map(|_| ())
        .ok_or_else(|| errno(libc::EINVAL))
}

/// Returns the attribute mask an edge requires, or `None` if the edge is
/// not a legal transition.
fn required_mask(qp_type: QpType, from: QpState, to: QpState) -> Option<AttrMask> {
    use QpState::*;
    let mask = match (from, to, qp_type) {
        (_, Reset, _) | (_, Error, _) => AttrMask::STATE,
        (Reset, Init, QpType::Rc) => {
            AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT | AttrMask::ACCESS_FLAGS
        }
        (Reset, Init, QpType::Ud) => {
            AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT | AttrMask::QKEY
        }
        (Init, Rtr, QpType::Rc) => {
            AttrMask::STATE
                | AttrMask::AV
                | AttrMask::PATH_MTU
                | AttrMask::DEST_QPN
                | AttrMask::RQ_PSN
                | AttrMask::MAX_DEST_RD_ATOMIC
                | AttrMask::MIN_RNR_TIMER
        }
        (Init, Rtr, QpType::Ud) => AttrMask::STATE,
        (Rtr, Rts, QpType::Rc) => {
            AttrMask::STATE
                | AttrMask::TIMEOUT
                | AttrMask::RETRY_CNT
                | AttrMask::SQ_PSN
                | AttrMask::RNR_RETRY
                | AttrMask::MAX_QP_RD_ATOMIC
        }
        (Rtr, Rts, QpType::Ud) => AttrMask::STATE | AttrMask::SQ_PSN,
        _ => return None,
    };
    Some(mask)
}

pub fn modify_qp(qp: Qp, attr: &ModifyAttr, mask: AttrMask) -> io::Result<()> {
    let mut state = fabric_state();
    let entry = state.qps.get_mut(&qp.0).ok_or_else(|| errno(libc::EINVAL))?;
    if !mask.contains(AttrMask::STATE) {
        return Err(errno(libc::EINVAL));
    }
    let required = required_mask(entry.qp_type, entry.attr.qp_state, attr.qp_state)
        .ok_or_else(|| errno(libc::EINVAL))?;
    if !mask.contains(required) {
        return Err(errno(libc::EINVAL));
    }
    if mask.contains(AttrMask::PORT) && attr.port_num != 1 {
        return Err(errno(libc::EINVAL));
    }
    if mask.contains(AttrMask::PATH_MTU) && !valid_mtu(attr.path_mtu) {
        return Err(errno(libc::EINVAL));
    }
    if mask.contains(AttrMask::AV) && attr.ah_attr.is_global {
        if attr.ah_attr.grh.sgid_index >= GID_TABLE_LEN {
            return Err(errno(libc::EINVAL));
        }
    }

    let cur = &mut entry.attr;
    cur.qp_state = attr.qp_state;
    if mask.contains(AttrMask::PKEY_INDEX) {
        cur.pkey_index = attr.pkey_index;
    }
    if mask.contains(AttrMask::PORT) {
        cur.port_num = attr.port_num;
    }
    if mask.contains(AttrMask::ACCESS_FLAGS) {
        cur.qp_access_flags = attr.qp_access_flags;
    }
    if mask.contains(AttrMask::QKEY) {
        cur.qkey = attr.qkey;
    }
    if mask.contains(AttrMask::AV) {
        cur.ah_attr = attr.ah_attr;
    }
    if mask.contains(AttrMask::PATH_MTU) {
        cur.path_mtu = attr.path_mtu;
    }
    if mask.contains(AttrMask::DEST_QPN) {
        cur.dest_qp_num = attr.dest_qp_num;
    }
    if mask.contains(AttrMask::RQ_PSN) {
        cur.rq_psn = attr.rq_psn;
    }
    if mask.contains(AttrMask::MAX_DEST_RD_ATOMIC) {
        cur.max_dest_rd_atomic = attr.max_dest_rd_atomic;
    }
    if mask.contains(AttrMask::MIN_RNR_TIMER) {
        cur.min_rnr_timer = attr.min_rnr_timer;
    }
    if mask.contains(AttrMask::SQ_PSN) {
        cur.sq_psn = attr.sq_psn;
    }
    if mask.contains(AttrMask::TIMEOUT) {
        cur.timeout = attr.timeout;
    }
    if mask.contains(AttrMask::RETRY_CNT) {
        cur.retry_cnt = attr.retry_cnt;
    }
    if mask.contains(AttrMask::RNR_RETRY) {
        cur.rnr_retry = attr.rnr_retry;
    }
    if mask.contains(AttrMask::MAX_QP_RD_ATOMIC) {
        cur.max_rd_atomic = attr.max_rd_atomic;
    }

    match attr.qp_state {
        QpState::Reset => {
            entry.attr = ModifyAttr::default();
            entry.recv_queue.clear();
        }
        QpState::Error => {
            let qp_num = qp.0;
            let recv_cq = entry.recv_cq;
            let flushed: Vec<RecvWr> = entry.recv_queue.drain(..).collect();
            for wr in flushed {
                state.push_completion(
                    recv_cq,
                    Wc {
                        wr_id: wr.wr_id,
                        status: WcStatus::WrFlushErr,
                        opcode: WcOpcode::Recv,
                        byte_len: 0,
                        imm_data: None,
                        qp_num,
                        src_qp: 0,
                        slid: 0,
                    },
                );
            }
        }
        _ => {}
    }
    Ok(())
}

pub fn query_qp(qp: Qp) -> io::Result<ModifyAttr> {
    let state = fabric_state();
    state
        .qps
        .get(&qp.0)
        .map(|entry| entry.attr)
        .ok_or_else(|| errno(libc::EINVAL))
}

/// Registers `len` bytes at `addr`.
///
/// # Safety
///
/// The caller guarantees `addr..addr + len` stays allocated until the
/// registration is released with [`dereg_mr`]; the fabric reads and writes
/// this range on behalf of local and remote work requests.
pub unsafe fn reg_mr(pd: Pd, addr: u64, len: usize, access: AccessFlags) -> io::Result<Mr> {
    let mut state = fabric_state();
    if !state.pds.contains_key(&pd.0) {
        return Err(errno(libc::EINVAL));
    }
    if addr == 0 || len == 0 || addr.checked_add(len as u64).is_none() {
        return Err(errno(libc::EINVAL));
    }
    // Remote access requires local write, as with real devices.
    let remote = AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC;
    if access.0 & remote.0 != 0 && !access.contains(AccessFlags::LOCAL_WRITE) {
        return Err(errno(libc::EINVAL));
    }
    let handle = state.alloc_handle();
    state.mrs.insert(
        handle,
        MrEntry {
            pd: pd.0,
            addr,
            len,
            access,
        },
    );
    Ok(Mr {
        handle,
        lkey: handle,
        rkey: handle,
    })
}

pub fn dereg_mr(mr: Mr) -> io::Result<()> {
    let mut state = fabric_state();
    state
        .mrs
        .remove(&mr.handle)
        .map(|_| ())
        .ok_or_else(|| errno(libc::EINVAL))
}

pub fn post_recv(qp: Qp, wr: &RecvWr) -> io::Result<()> {
    let mut state = fabric_state();
    let entry = state.qps.get_mut(&qp.0).ok_or_else(|| errno(libc::EINVAL))?;
    if matches!(entry.attr.qp_state, QpState::Reset | QpState::Error) {
        return Err(errno(libc::EINVAL));
    }
    if entry.recv_queue.len() >= entry.max_recv_wr as usize {
        return Err(errno(libc::ENOMEM));
    }
    entry.recv_queue.push_back(*wr);
    Ok(())
}

/// Posts `wrs` in order under one lock, the way a single doorbell hands a
/// linked list to the device. Stops at the first request that cannot be
/// posted and returns its index; the ones before it stay posted.
pub fn post_send_list(qp: Qp, wrs: &[SendWr]) -> Result<(), (usize, io::Error)> {
    let mut state = fabric_state();
    for (idx, wr) in wrs.iter().enumerate() {
        state.post_one(qp, wr).map_err(|e| (idx, e))?;
    }
    Ok(())
}

/// Pops at most one completion from `cq`.
pub fn poll_cq(cq: Cq) -> io::Result<Option<Wc>> {
    let mut state = fabric_state();
    let entry = state.cqs.get_mut(&cq.0).ok_or_else(|| errno(libc::EINVAL))?;
    Ok(entry.entries.pop_front())
}

fn send_wc_opcode(op: WrOpcode) -> WcOpcode {
    match op {
        WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => WcOpcode::RdmaWrite,
        WrOpcode::Send | WrOpcode::SendWithImm => WcOpcode::Send,
        WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        WrOpcode::AtomicCmpAndSwp => WcOpcode::CompSwap,
        WrOpcode::AtomicFetchAndAdd => WcOpcode::FetchAdd,
    }
}

struct LocalQp {
    qp_num: u32,
    pd: u32,
    dev: usize,
    qp_type: QpType,
    send_cq: u32,
    attr: ModifyAttr,
}

impl FabricState {
    fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn post_one(&mut self, qp: Qp, wr: &SendWr) -> io::Result<()> {
        let entry = self.qps.get(&qp.0).ok_or_else(|| errno(libc::EINVAL))?;
        if entry.attr.qp_state != QpState::Rts {
            return Err(errno(libc::EINVAL));
        }
        let local = LocalQp {
            qp_num: qp.0,
            pd: entry.pd,
            dev: entry.dev,
            qp_type: entry.qp_type,
            send_cq: entry.send_cq,
            attr: entry.attr,
        };
        if local.qp_type == QpType::Ud
            && (wr.ud.is_none() || !matches!(wr.opcode, WrOpcode::Send | WrOpcode::SendWithImm))
        {
            return Err(errno(libc::EINVAL));
        }
        let cq_full = self
            .cqs
            .get(&local.send_cq)
            .map_or(true, |cq| cq.entries.len() >= cq.capacity);
        if cq_full {
            return Err(errno(libc::ENOMEM));
        }

        let status = match local.qp_type {
            QpType::Rc => self.execute_rc(&local, wr),
            QpType::Ud => self.execute_ud(&local, wr),
        };
        if status != WcStatus::Success {
            tracing::debug!(
                "work request {} on qp {} completed with {:?}",
                wr.wr_id,
                qp.0,
                status
            );
            if let Some(entry) = self.qps.get_mut(&qp.0) {
                entry.attr.qp_state = QpState::Error;
            }
        }
        if wr.signaled || status != WcStatus::Success {
            self.push_completion(
                local.send_cq,
                Wc {
                    wr_id: wr.wr_id,
                    status,
                    opcode: send_wc_opcode(wr.opcode),
                    byte_len: wr.sge.length,
                    imm_data: None,
                    qp_num: qp.0,
                    src_qp: 0,
                    slid: 0,
                },
            );
        }
        Ok(())
    }

    fn device_of(&self, ctx: Context) -> io::Result<usize> {
        self.contexts
            .get(&ctx.0)
            .copied()
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn push_completion(&mut self, cq: u32, wc: Wc) {
        if let Some(entry) = self.cqs.get_mut(&cq) {
            entry.entries.push_back(wc);
        }
    }

    /// Checks that `addr..addr + len` lies inside the region registered
    /// under `key` in protection domain `pd` with `access`.
    fn check_region(&self, pd: u32, key: u32, addr: u64, len: u64, access: AccessFlags) -> bool {
        match self.mrs.get(&key) {
            Some(mr) => {
                mr.pd == pd
                    && mr.access.contains(access)
                    && addr >= mr.addr
                    && addr
                        .checked_add(len)
                        .is_some_and(|end| end <= mr.addr + mr.len as u64)
            }
            None => false,
        }
    }

    fn execute_rc(&mut self, local: &LocalQp, wr: &SendWr) -> WcStatus {
        let len = wr.sge.length as u64;
        let local_access = match wr.opcode {
            WrOpcode::RdmaRead | WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd => {
                AccessFlags::LOCAL_WRITE
            }
            _ => AccessFlags::default(),
        };
        if len > 0 && !self.check_region(local.pd, wr.sge.lkey, wr.sge.addr, len, local_access) {
            return WcStatus::LocProtErr;
        }

        let remote_qpn = local.attr.dest_qp_num;
        let (remote_pd, remote_access, remote_recv_cq) = match self.qps.get(&remote_qpn) {
            Some(remote)
                if remote.qp_type == QpType::Rc
                    && matches!(remote.attr.qp_state, QpState::Rtr | QpState::Rts)
                    && remote.attr.dest_qp_num == local.qp_num
                    && self.route_matches(&local.attr.ah_attr, remote.dev) =>
            {
                (remote.pd, remote.attr.qp_access_flags, remote.recv_cq)
            }
            _ => return WcStatus::RetryExcErr,
        };

        match wr.opcode {
            WrOpcode::RdmaWrite | WrOpcode::RdmaWriteWithImm => {
                if !remote_access.contains(AccessFlags::REMOTE_WRITE)
                    || (len > 0
                        && !self.check_region(
                            remote_pd,
                            wr.rkey,
                            wr.remote_addr,
                            len,
                            AccessFlags::REMOTE_WRITE,
                        ))
                {
                    return WcStatus::RemAccessErr;
                }
                if wr.opcode == WrOpcode::RdmaWriteWithImm {
                    let Some(recv) = self.pop_recv(remote_qpn) else {
                        return WcStatus::RnrRetryExcErr;
                    };
                    copy_memory(wr.sge.addr, wr.remote_addr, len);
                    self.push_completion(
                        remote_recv_cq,
                        Wc {
                            wr_id: recv.wr_id,
                            status: WcStatus::Success,
                            opcode: WcOpcode::RecvRdmaWithImm,
                            byte_len: wr.sge.length,
                            imm_data: wr.imm_data,
                            qp_num: remote_qpn,
                            src_qp: local.qp_num,
                            slid: FABRIC.devices[local.dev].lid,
                        },
                    );
                } else {
                    copy_memory(wr.sge.addr, wr.remote_addr, len);
                }
                WcStatus::Success
            }
            WrOpcode::RdmaRead => {
                if !remote_access.contains(AccessFlags::REMOTE_READ)
                    || (len > 0
                        && !self.check_region(
                            remote_pd,
                            wr.rkey,
                            wr.remote_addr,
                            len,
                            AccessFlags::REMOTE_READ,
                        ))
                {
                    return WcStatus::RemAccessErr;
                }
                copy_memory(wr.remote_addr, wr.sge.addr, len);
                WcStatus::Success
            }
            WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd => {
                if len != 8 || wr.remote_addr % 8 != 0 {
                    return WcStatus::RemInvReqErr;
                }
                if !remote_access.contains(AccessFlags::REMOTE_ATOMIC)
                    || !self.check_region(
                        remote_pd,
                        wr.rkey,
                        wr.remote_addr,
                        8,
                        AccessFlags::REMOTE_ATOMIC,
                    )
                {
                    return WcStatus::RemAccessErr;
                }
                // SAFETY: both 8-byte ranges were validated against live
                // registrations above, and the fabric lock serializes every
                // access the fabric itself makes.
                unsafe {
                    let target = wr.remote_addr as *mut u64;
                    let old = std::ptr::read_unaligned(target);
                    let new = match wr.opcode {
                        WrOpcode::AtomicCmpAndSwp if old == wr.compare_add => wr.swap,
                        WrOpcode::AtomicCmpAndSwp => old,
                        _ => old.wrapping_add(wr.compare_add),
                    };
                    std::ptr::write_unaligned(target, new);
                    std::ptr::write_unaligned(wr.sge.addr as *mut u64, old);
                }
                WcStatus::Success
            }
            WrOpcode::Send | WrOpcode::SendWithImm => {
                let Some(recv) = self.pop_recv(remote_qpn) else {
                    return WcStatus::RnrRetryExcErr;
                };
                let fits = len <= recv.sge.length as u64
                    && (len == 0
                        || self.check_region(
                            remote_pd,
                            recv.sge.lkey,
                            recv.sge.addr,
                            len,
                            AccessFlags::LOCAL_WRITE,
                        ));
                let status = if fits {
                    copy_memory(wr.sge.addr, recv.sge.addr, len);
                    WcStatus::Success
                } else {
                    WcStatus::LocLenErr
                };
                self.push_completion(
                    remote_recv_cq,
                    Wc {
                        wr_id: recv.wr_id,
                        status,
                        opcode: WcOpcode::Recv,
                        byte_len: wr.sge.length,
                        imm_data: wr.imm_data,
                        qp_num: remote_qpn,
                        src_qp: local.qp_num,
                        slid: FABRIC.devices[local.dev].lid,
                    },
                );
                if fits {
                    WcStatus::Success
                } else {
                    WcStatus::RemInvReqErr
                }
            }
        }
    }

    fn execute_ud(&mut self, local: &LocalQp, wr: &SendWr) -> WcStatus {
        let len = wr.sge.length as u64;
        if len > 0
            && !self.check_region(
                local.pd,
                wr.sge.lkey,
                wr.sge.addr,
                len,
                AccessFlags::default(),
            )
        {
            return WcStatus::LocProtErr;
        }
        let Some(dest) = wr.ud else {
            return WcStatus::RemInvReqErr;
        };
        let (remote_pd, remote_recv_cq) = match self.qps.get(&dest.remote_qpn) {
            Some(remote)
                if remote.qp_type == QpType::Ud
                    && matches!(remote.attr.qp_state, QpState::Rtr | QpState::Rts)
                    && remote.attr.qkey == dest.remote_qkey
                    && FABRIC.devices[remote.dev].lid == dest.dlid =>
            {
                (remote.pd, remote.recv_cq)
            }
            // Datagrams to nowhere are silently dropped.
            _ => return WcStatus::Success,
        };
        let Some(recv) = self.pop_recv(dest.remote_qpn) else {
            return WcStatus::Success;
        };
        let needed = len + GRH_SIZE as u64;
        let fits = needed <= recv.sge.length as u64
            && self.check_region(
                remote_pd,
                recv.sge.lkey,
                recv.sge.addr,
                needed,
                AccessFlags::LOCAL_WRITE,
            );
        if fits {
            copy_memory(wr.sge.addr, recv.sge.addr + GRH_SIZE as u64, len);
        }
        self.push_completion(
            remote_recv_cq,
            Wc {
                wr_id: recv.wr_id,
                status: if fits {
                    WcStatus::Success
                } else {
                    WcStatus::LocLenErr
                },
                opcode: WcOpcode::Recv,
                byte_len: needed as u32,
                imm_data: wr.imm_data,
                qp_num: dest.remote_qpn,
                src_qp: local.qp_num,
                slid: FABRIC.devices[local.dev].lid,
            },
        );
        WcStatus::Success
    }

    fn route_matches(&self, ah: &AhAttr, remote_dev: usize) -> bool {
        let device = &FABRIC.devices[remote_dev];
        if ah.is_global {
            ah.grh.dgid == device.gid
        } else {
            ah.dlid == device.lid
        }
    }

    fn pop_recv(&mut self, qpn: u32) -> Option<RecvWr> {
        self.qps
            .get_mut(&qpn)
            .and_then(|qp| qp.recv_queue.pop_front())
    }
}

fn copy_memory(src: u64, dst: u64, len: u64) {
    if len == 0 {
        return;
    }
    // SAFETY: callers validate both ranges against live registrations while
    // holding the fabric lock; registrations outlive the memory they cover
    // by contract of `reg_mr`. Ranges may overlap on loopback.
    unsafe {
        std::ptr::copy(src as *const u8, dst as *mut u8, len as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        ctx: Context,
        pd: Pd,
        cq: Cq,
        qp: Qp,
        buf: Vec<u8>,
        addr: u64,
        mr: Mr,
    }

    fn full_access() -> AccessFlags {
        AccessFlags::LOCAL_WRITE
            | AccessFlags::REMOTE_WRITE
            | AccessFlags::REMOTE_READ
            | AccessFlags::REMOTE_ATOMIC
    }

    fn node(dev: usize, qp_type: QpType) -> Node {
        let ctx = open_device(dev).unwrap();
        let pd = alloc_pd(ctx).unwrap();
        let cq = create_cq(ctx, 64).unwrap();
        let qp = create_qp(
            pd,
            &QpInitAttr {
                qp_type,
                send_cq: cq,
                recv_cq: cq,
                max_send_wr: 16,
                max_recv_wr: 16,
            },
        )
        .unwrap();
        let mut buf = vec![0u8; 256];
        let addr = buf.as_mut_ptr() as u64;
        // SAFETY: `buf` moves into the returned node and outlives the test.
        let mr = unsafe { reg_mr(pd, addr, buf.len(), full_access()) }.unwrap();
        Node {
            ctx,
            pd,
            cq,
            qp,
            buf,
            addr,
            mr,
        }
    }

    fn rc_init(qp: Qp) {
        let attr = ModifyAttr {
            qp_state: QpState::Init,
            port_num: 1,
            qp_access_flags: full_access(),
            ..Default::default()
        };
        modify_qp(
            qp,
            &attr,
            AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT | AttrMask::ACCESS_FLAGS,
        )
        .unwrap();
    }

    fn rc_connect(qp: Qp, remote: Qp, remote_dev: usize) {
        let attr = ModifyAttr {
            qp_state: QpState::Rtr,
            path_mtu: 4096,
            dest_qp_num: remote.qp_num(),
            ah_attr: AhAttr {
                dlid: FIRST_LID + remote_dev as u16,
                port_num: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        modify_qp(
            qp,
            &attr,
            AttrMask::STATE
                | AttrMask::AV
                | AttrMask::PATH_MTU
                | AttrMask::DEST_QPN
                | AttrMask::RQ_PSN
                | AttrMask::MAX_DEST_RD_ATOMIC
                | AttrMask::MIN_RNR_TIMER,
        )
        .unwrap();
        let attr = ModifyAttr {
            qp_state: QpState::Rts,
            ..Default::default()
        };
        modify_qp(
            qp,
            &attr,
            AttrMask::STATE
                | AttrMask::TIMEOUT
                | AttrMask::RETRY_CNT
                | AttrMask::SQ_PSN
                | AttrMask::RNR_RETRY
                | AttrMask::MAX_QP_RD_ATOMIC,
        )
        .unwrap();
    }

    fn write_wr(src: &Node, dst: &Node, len: u32) -> SendWr {
        SendWr {
            wr_id: 7,
            opcode: WrOpcode::RdmaWrite,
            signaled: true,
            sge: Sge {
                addr: src.addr,
                length: len,
                lkey: src.mr.lkey,
            },
            remote_addr: dst.addr,
            rkey: dst.mr.rkey,
            imm_data: None,
            compare_add: 0,
            swap: 0,
            ud: None,
        }
    }

    #[test]
    fn test_device_list() {
        let names = get_device_list();
        assert!(!names.is_empty());
        assert_eq!(names[0], "rxe0");
        assert!(open_device(names.len()).is_err());
    }

    #[test]
    fn test_rejects_skipping_init() {
        let n = node(0, QpType::Rc);
        let attr = ModifyAttr {
            qp_state: QpState::Rtr,
            ..Default::default()
        };
        let err = modify_qp(n.qp, &attr, AttrMask(u32::MAX)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(query_qp(n.qp).unwrap().qp_state, QpState::Reset);
    }

    #[test]
    fn test_rejects_incomplete_mask() {
        let n = node(0, QpType::Rc);
        let attr = ModifyAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        // Missing ACCESS_FLAGS for an RC queue pair.
        let err = modify_qp(
            n.qp,
            &attr,
            AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT,
        )
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        // Sufficient for UD, but this is RC.
        let err = modify_qp(
            n.qp,
            &attr,
            AttrMask::STATE | AttrMask::PKEY_INDEX | AttrMask::PORT | AttrMask::QKEY,
        )
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        rc_init(n.qp);
        assert_eq!(query_qp(n.qp).unwrap().qp_state, QpState::Init);
    }

    #[test]
    fn test_rc_write_and_read() {
        let mut a = node(0, QpType::Rc);
        let mut b = node(1, QpType::Rc);
        rc_init(a.qp);
        rc_init(b.qp);
        rc_connect(a.qp, b.qp, 1);
        rc_connect(b.qp, a.qp, 0);

        a.buf[..4].copy_from_slice(b"ping");
        post_send(a.qp, &write_wr(&a, &b, 4)).unwrap();
        let wc = poll_cq(a.cq).unwrap().unwrap();
        assert_eq!(wc.status, WcStatus::Success);
        assert_eq!(wc.wr_id, 7);
        assert_eq!(&b.buf[..4], b"ping");

        b.buf[8..12].copy_from_slice(b"pong");
        let mut read = write_wr(&a, &b, 4);
        read.opcode = WrOpcode::RdmaRead;
        read.remote_addr += 8;
        post_send(a.qp, &read).unwrap();
        assert_eq!(poll_cq(a.cq).unwrap().unwrap().status, WcStatus::Success);
        assert_eq!(&a.buf[..4], b"pong");
    }

    #[test]
    fn test_rc_bad_rkey_moves_to_error() {
        let a = node(0, QpType::Rc);
        let b = node(1, QpType::Rc);
        rc_init(a.qp);
        rc_init(b.qp);
        rc_connect(a.qp, b.qp, 1);
        rc_connect(b.qp, a.qp, 0);

        let mut wr = write_wr(&a, &b, 4);
        wr.rkey = 0;
        post_send(a.qp, &wr).unwrap();
        assert_eq!(poll_cq(a.cq).unwrap().unwrap().status, WcStatus::RemAccessErr);
        assert_eq!(query_qp(a.qp).unwrap().qp_state, QpState::Error);
        assert!(post_send(a.qp, &write_wr(&a, &b, 4)).is_err());
    }

    #[test]
    fn test_post_send_list_stops_at_first_failure() {
        let a = node(0, QpType::Rc);
        let b = node(1, QpType::Rc);
        rc_init(a.qp);
        rc_init(b.qp);
        rc_connect(a.qp, b.qp, 1);
        rc_connect(b.qp, a.qp, 0);

        let good = write_wr(&a, &b, 4);
        let mut bad = write_wr(&a, &b, 4);
        bad.rkey = 0;
        // The bad key errors the queue pair, so the third request is refused.
        let (idx, err) = post_send_list(a.qp, &[good, bad, good]).unwrap_err();
        assert_eq!(idx, 2);
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(poll_cq(a.cq).unwrap().unwrap().status, WcStatus::Success);
        assert_eq!(poll_cq(a.cq).unwrap().unwrap().status, WcStatus::RemAccessErr);
        assert!(poll_cq(a.cq).unwrap().is_none());
    }

    #[test]
    fn test_send_without_recv_is_rnr() {
        let a = node(0, QpType::Rc);
        let b = node(1, QpType::Rc);
        rc_init(a.qp);
        rc_init(b.qp);
        rc_connect(a.qp, b.qp, 1);
        rc_connect(b.qp, a.qp, 0);

        let mut wr = write_wr(&a, &b, 4);
        wr.opcode = WrOpcode::Send;
        post_send(a.qp, &wr).unwrap();
        assert_eq!(
            poll_cq(a.cq).unwrap().unwrap().status,
            WcStatus::RnrRetryExcErr
        );
    }

    #[test]
    fn test_teardown_order() {
        let n = node(0, QpType::Rc);
        assert_eq!(
            dealloc_pd(n.pd).unwrap_err().raw_os_error(),
            Some(libc::EBUSY)
        );
        destroy_qp(n.qp).unwrap();
        dereg_mr(n.mr).unwrap();
        destroy_cq(n.cq).unwrap();
        dealloc_pd(n.pd).unwrap();
        close_device(n.ctx).unwrap();
    }
}
