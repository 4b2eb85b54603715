/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! libibverbs provider, built with the `ibverbs` feature.
//!
//! Thin calls over the raw `ibverbs-sys` bindings. Handles wrap the
//! provider's pointers; the device owns every object they point at until
//! the matching destroy call. Device ids index the list returned by
//! `ibv_get_device_list`.
//!
//! UD address handles are created on first use per (protection domain,
//! port, LID) and live for the rest of the process, since a handle must
//! outlive every send that references it. UD destinations are addressed by
//! LID, so UD needs an InfiniBand fabric; RC works over RoCE through the
//! global route in [`AhAttr`].

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::os::raw::c_int;
use std::os::raw::c_void;
use std::ptr;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;

use ibverbs_sys as ffi;

use super::*;

/// An opened device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context(*mut ffi::ibv_context);

/// A protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pd(*mut ffi::ibv_pd);

/// A completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cq(*mut ffi::ibv_cq);

/// A queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Qp(*mut ffi::ibv_qp);

/// A memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mr {
    ptr: *mut ffi::ibv_mr,
    pub lkey: u32,
    pub rkey: u32,
}

// SAFETY: libibverbs objects may be used from any thread; the library
// serializes access to shared device state internally.
unsafe impl Send for Context {}
// SAFETY: see `Context`.
unsafe impl Sync for Context {}
// SAFETY: see `Context`.
unsafe impl Send for Pd {}
// SAFETY: see `Context`.
unsafe impl Sync for Pd {}
// SAFETY: see `Context`.
unsafe impl Send for Cq {}
// SAFETY: see `Context`.
unsafe impl Sync for Cq {}
// SAFETY: see `Context`.
unsafe impl Send for Qp {}
// SAFETY: see `Context`.
unsafe impl Sync for Qp {}
// SAFETY: see `Context`.
unsafe impl Send for Mr {}
// SAFETY: see `Context`.
unsafe impl Sync for Mr {}

impl Qp {
    pub fn qp_num(&self) -> u32 {
        // SAFETY: `self.0` was returned by `ibv_create_qp` and is live until
        // `destroy_qp`.
        unsafe { (*self.0).qp_num }
    }
}

/// Address handles keyed by (pd, port, dlid), stored as addresses.
static ADDRESS_HANDLES: LazyLock<Mutex<HashMap<(usize, u8, u16), usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Maps a libibverbs return code (0 or an errno) onto a result.
fn check(rc: c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc if rc > 0 => Err(errno(rc)),
        _ => Err(io::Error::last_os_error()),
    }
}

fn non_null<T>(ptr: *mut T) -> io::Result<*mut T> {
    if ptr.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr)
    }
}

fn mtu_to_ibv(bytes: u32) -> io::Result<ffi::ibv_mtu> {
    Ok(match bytes {
        256 => ffi::IBV_MTU_256,
        512 => ffi::IBV_MTU_512,
        1024 => ffi::IBV_MTU_1024,
        2048 => ffi::IBV_MTU_2048,
        4096 => ffi::IBV_MTU_4096,
        _ => return Err(errno(libc::EINVAL)),
    })
}

fn mtu_from_ibv(mtu: ffi::ibv_mtu) -> u32 {
    match mtu {
        ffi::IBV_MTU_256 => 256,
        ffi::IBV_MTU_512 => 512,
        ffi::IBV_MTU_1024 => 1024,
        ffi::IBV_MTU_2048 => 2048,
        ffi::IBV_MTU_4096 => 4096,
        _ => 0,
    }
}

fn state_to_ibv(state: QpState) -> ffi::ibv_qp_state {
    match state {
        QpState::Reset => ffi::ibv_qp_state::IBV_QPS_RESET,
        QpState::Init => ffi::ibv_qp_state::IBV_QPS_INIT,
        QpState::Rtr => ffi::ibv_qp_state::IBV_QPS_RTR,
        QpState::Rts => ffi::ibv_qp_state::IBV_QPS_RTS,
        QpState::Error => ffi::ibv_qp_state::IBV_QPS_ERR,
    }
}

fn state_from_ibv(state: ffi::ibv_qp_state) -> QpState {
    match state {
        ffi::ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
        ffi::ibv_qp_state::IBV_QPS_INIT => QpState::Init,
        ffi::ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
        ffi::ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
        // Drain states and unknown values are not reachable through this
        // crate's transitions; treat them as unusable.
        _ => QpState::Error,
    }
}

/// Runs `f` over the current device list and frees it afterwards.
fn with_device_list<T>(f: impl FnOnce(&[*mut ffi::ibv_device]) -> T) -> io::Result<T> {
    let mut n: c_int = 0;
    // SAFETY: `n` is a valid out-pointer; the list is freed below.
    let list = unsafe { ffi::ibv_get_device_list(&mut n) };
    if list.is_null() {
        return Err(io::Error::last_os_error());
    }
    let len = usize::try_from(n).unwrap_or(0);
    // SAFETY: the library returned `n` valid entries at `list`.
    let devices = unsafe { std::slice::from_raw_parts(list, len) };
    let out = f(devices);
    // SAFETY: `list` came from `ibv_get_device_list` and is freed once.
    unsafe { ffi::ibv_free_device_list(list) };
    Ok(out)
}

fn device_name(dev: *mut ffi::ibv_device) -> String {
    // SAFETY: `dev` is an entry of a live device list.
    let name = unsafe { ffi::ibv_get_device_name(dev) };
    if name.is_null() {
        return String::new();
    }
    // SAFETY: the library returns a NUL-terminated name owned by `dev`.
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}

/// Returns the names of all devices, indexed by device id.
pub fn get_device_list() -> Vec<String> {
    with_device_list(|devices| devices.iter().map(|d| device_name(*d)).collect())
        .unwrap_or_default()
}

pub fn query_device(dev_id: usize) -> io::Result<DeviceAttr> {
    let ctx = open_device(dev_id)?;
    let name = with_device_list(|devices| devices.get(dev_id).map(|d| device_name(*d)))?
        .unwrap_or_default();
    // SAFETY: an all-zero `ibv_device_attr` is a valid out-buffer.
    let mut attr: ffi::ibv_device_attr = unsafe { std::mem::zeroed() };
    // SAFETY: `ctx` is open and `attr` is a valid out-pointer.
    let rc = unsafe { ffi::ibv_query_device(ctx.0, &mut attr) };
    let closed = close_device(ctx);
    check(rc)?;
    closed?;
    let count = |v: c_int| u32::try_from(v).unwrap_or(0);
    Ok(DeviceAttr {
        name,
        node_guid: u64::from_be(attr.node_guid),
        phys_port_cnt: attr.phys_port_cnt,
        max_qp: count(attr.max_qp),
        max_cq: count(attr.max_cq),
        max_mr: count(attr.max_mr),
        max_qp_wr: count(attr.max_qp_wr),
        max_cqe: count(attr.max_cqe),
    })
}

pub fn open_device(dev_id: usize) -> io::Result<Context> {
    let ctx = with_device_list(|devices| match devices.get(dev_id) {
        // SAFETY: `dev` is an entry of the live device list; the context
        // stays valid after the list is freed.
        Some(dev) => non_null(unsafe { ffi::ibv_open_device(*dev) }),
        None => Err(errno(libc::ENODEV)),
    })??;
    Ok(Context(ctx))
}

pub fn close_device(ctx: Context) -> io::Result<()> {
    // SAFETY: `ctx` came from `open_device`.
    check(unsafe { ffi::ibv_close_device(ctx.0) })
}

pub fn query_port(ctx: Context, port_num: u8) -> io::Result<PortAttr> {
    // SAFETY: an all-zero `ibv_port_attr` is a valid out-buffer.
    let mut attr: ffi::ibv_port_attr = unsafe { std::mem::zeroed() };
    // SAFETY: `ctx` is open; the compat struct shares the layout.
    check(unsafe { ffi::ibv_query_port(ctx.0, port_num, &mut attr as *mut _ as *mut _) })?;
    let state = match attr.state {
        ffi::ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
        _ => PortState::Down,
    };
    Ok(PortAttr {
        state,
        lid: attr.lid,
        active_mtu: mtu_from_ibv(attr.active_mtu),
    })
}

pub fn query_gid(ctx: Context, port_num: u8, index: u8) -> io::Result<[u8; 16]> {
    // SAFETY: an all-zero GID is a valid out-buffer.
    let mut gid: ffi::ibv_gid = unsafe { std::mem::zeroed() };
    // SAFETY: `ctx` is open and `gid` is a valid out-pointer.
    check(unsafe { ffi::ibv_query_gid(ctx.0, port_num, c_int::from(index), &mut gid) })?;
    // SAFETY: every bit pattern of the union is a valid byte array.
    Ok(unsafe { gid.raw })
}

pub fn alloc_pd(ctx: Context) -> io::Result<Pd> {
    // SAFETY: `ctx` is open.
    non_null(unsafe { ffi::ibv_alloc_pd(ctx.0) }).map(Pd)
}

pub fn dealloc_pd(pd: Pd) -> io::Result<()> {
    // SAFETY: `pd` came from `alloc_pd`.
    check(unsafe { ffi::ibv_dealloc_pd(pd.0) })
}

pub fn create_cq(ctx: Context, cqe: u32) -> io::Result<Cq> {
    let cqe = c_int::try_from(cqe).map_err(|_| errno(libc::EINVAL))?;
    // SAFETY: `ctx` is open; no completion channel is attached.
    non_null(unsafe { ffi::ibv_create_cq(ctx.0, cqe, ptr::null_mut(), ptr::null_mut(), 0) })
        .map(Cq)
}

pub fn destroy_cq(cq: Cq) -> io::Result<()> {
    // SAFETY: `cq` came from `create_cq`.
    check(unsafe { ffi::ibv_destroy_cq(cq.0) })
}

pub fn create_qp(pd: Pd, init_attr: &QpInitAttr) -> io::Result<Qp> {
    // SAFETY: an all-zero init attr is valid; the fields below fill it in.
    let mut attr: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
    attr.qp_type = match init_attr.qp_type {
        QpType::Rc => ffi::ibv_qp_type::IBV_QPT_RC,
        QpType::Ud => ffi::ibv_qp_type::IBV_QPT_UD,
    };
    attr.send_cq = init_attr.send_cq.0;
    attr.recv_cq = init_attr.recv_cq.0;
    attr.cap.max_send_wr = init_attr.max_send_wr;
    attr.cap.max_recv_wr = init_attr.max_recv_wr;
    attr.cap.max_send_sge = 1;
    attr.cap.max_recv_sge = 1;
    // SAFETY: `pd` and both CQs are live.
    non_null(unsafe { ffi::ibv_create_qp(pd.0, &mut attr) }).map(Qp)
}

pub fn destroy_qp(qp: Qp) -> io::Result<()> {
    // SAFETY: `qp` came from `create_qp`.
    check(unsafe { ffi::ibv_destroy_qp(qp.0) })
}

pub fn modify_qp(qp: Qp, attr: &ModifyAttr, mask: AttrMask) -> io::Result<()> {
    // SAFETY: an all-zero qp attr is valid; only masked fields are read.
    let mut raw: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };
    raw.qp_state = state_to_ibv(attr.qp_state);
    raw.pkey_index = attr.pkey_index;
    raw.port_num = attr.port_num;
    raw.qp_access_flags = attr.qp_access_flags.0;
    raw.qkey = attr.qkey;
    if mask.contains(AttrMask::PATH_MTU) {
        raw.path_mtu = mtu_to_ibv(attr.path_mtu)?;
    }
    raw.dest_qp_num = attr.dest_qp_num;
    raw.rq_psn = attr.rq_psn;
    raw.max_dest_rd_atomic = attr.max_dest_rd_atomic;
    raw.min_rnr_timer = attr.min_rnr_timer;
    raw.sq_psn = attr.sq_psn;
    raw.timeout = attr.timeout;
    raw.retry_cnt = attr.retry_cnt;
    raw.rnr_retry = attr.rnr_retry;
    raw.max_rd_atomic = attr.max_rd_atomic;

    let ah = &attr.ah_attr;
    raw.ah_attr.dlid = ah.dlid;
    raw.ah_attr.sl = ah.sl;
    raw.ah_attr.src_path_bits = ah.src_path_bits;
    raw.ah_attr.port_num = ah.port_num;
    raw.ah_attr.is_global = u8::from(ah.is_global);
    raw.ah_attr.grh.dgid.raw = ah.grh.dgid;
    raw.ah_attr.grh.hop_limit = ah.grh.hop_limit;
    raw.ah_attr.grh.sgid_index = ah.grh.sgid_index;

    // The mask bits share libibverbs' values.
    // SAFETY: `qp` is live and `raw` is a valid attribute block.
    check(unsafe { ffi::ibv_modify_qp(qp.0, &mut raw, mask.0 as c_int) })
}

pub fn query_qp(qp: Qp) -> io::Result<ModifyAttr> {
    // SAFETY: all-zero out-buffers are valid.
    let mut raw: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };
    // SAFETY: see above.
    let mut init: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
    let mask = AttrMask::STATE
        | AttrMask::PKEY_INDEX
        | AttrMask::PORT
        | AttrMask::ACCESS_FLAGS
        | AttrMask::QKEY
        | AttrMask::AV
        | AttrMask::PATH_MTU
        | AttrMask::DEST_QPN
        | AttrMask::RQ_PSN
        | AttrMask::MAX_DEST_RD_ATOMIC
        | AttrMask::MIN_RNR_TIMER
        | AttrMask::SQ_PSN
        | AttrMask::TIMEOUT
        | AttrMask::RETRY_CNT
        | AttrMask::RNR_RETRY
        | AttrMask::MAX_QP_RD_ATOMIC;
    // SAFETY: `qp` is live and both out-pointers are valid.
    check(unsafe { ffi::ibv_query_qp(qp.0, &mut raw, mask.0 as c_int, &mut init) })?;
    Ok(ModifyAttr {
        qp_state: state_from_ibv(raw.qp_state),
        pkey_index: raw.pkey_index,
        port_num: raw.port_num,
        qp_access_flags: AccessFlags(raw.qp_access_flags),
        qkey: raw.qkey,
        ah_attr: AhAttr {
            dlid: raw.ah_attr.dlid,
            sl: raw.ah_attr.sl,
            src_path_bits: raw.ah_attr.src_path_bits,
            port_num: raw.ah_attr.port_num,
            is_global: raw.ah_attr.is_global != 0,
            grh: GlobalRoute {
                // SAFETY: every bit pattern of the union is a valid array.
                dgid: unsafe { raw.ah_attr.grh.dgid.raw },
                hop_limit: raw.ah_attr.grh.hop_limit,
                sgid_index: raw.ah_attr.grh.sgid_index,
            },
        },
        path_mtu: mtu_from_ibv(raw.path_mtu),
        dest_qp_num: raw.dest_qp_num,
        rq_psn: raw.rq_psn,
        max_dest_rd_atomic: raw.max_dest_rd_atomic,
        min_rnr_timer: raw.min_rnr_timer,
        sq_psn: raw.sq_psn,
        timeout: raw.timeout,
        retry_cnt: raw.retry_cnt,
        rnr_retry: raw.rnr_retry,
        max_rd_atomic: raw.max_rd_atomic,
    })
}

/// Registers `len` bytes at `addr`.
///
/// # Safety
///
/// The caller guarantees `addr..addr + len` stays allocated until the
/// registration is released with [`dereg_mr`]; the device reads and writes
/// this range on behalf of local and remote work requests.
pub unsafe fn reg_mr(pd: Pd, addr: u64, len: usize, access: AccessFlags) -> io::Result<Mr> {
    if addr == 0 || len == 0 {
        return Err(errno(libc::EINVAL));
    }
    // SAFETY: the caller keeps the range alive; `pd` is live.
    let mr = non_null(unsafe {
        ffi::ibv_reg_mr(pd.0, addr as *mut c_void, len, access.0 as c_int)
    })?;
    // SAFETY: `mr` was just returned by the library.
    let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
    Ok(Mr { ptr: mr, lkey, rkey })
}

pub fn dereg_mr(mr: Mr) -> io::Result<()> {
    // SAFETY: `mr` came from `reg_mr`.
    check(unsafe { ffi::ibv_dereg_mr(mr.ptr) })
}

pub fn post_recv(qp: Qp, wr: &RecvWr) -> io::Result<()> {
    let mut sge = ffi::ibv_sge {
        addr: wr.sge.addr,
        length: wr.sge.length,
        lkey: wr.sge.lkey,
    };
    // SAFETY: an all-zero recv wr is valid; the fields below fill it in.
    let mut raw: ffi::ibv_recv_wr = unsafe { std::mem::zeroed() };
    raw.wr_id = wr.wr_id;
    raw.sg_list = &mut sge;
    raw.num_sge = 1;
    let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
    // SAFETY: `qp` is live; `raw` and `sge` outlive the call.
    unsafe {
        let ops = &mut (*(*qp.0).context).ops;
        let post = ops.post_recv.as_mut().ok_or_else(|| errno(libc::ENOSYS))?;
        check(post(qp.0, &mut raw, &mut bad))
    }
}

/// Returns the address handle reaching `dlid` from the port `qp` is bound
/// to, creating it on first use.
fn address_handle(qp: Qp, dlid: u16) -> io::Result<*mut ffi::ibv_ah> {
    // SAFETY: `qp` is live.
    let pd = unsafe { (*qp.0).pd };
    let port_num = query_qp(qp)?.port_num;
    let mut cache = ADDRESS_HANDLES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    let key = (pd as usize, port_num, dlid);
    if let Some(ah) = cache.get(&key) {
        return Ok(*ah as *mut ffi::ibv_ah);
    }
    // SAFETY: an all-zero ah attr is a valid local route.
    let mut attr: ffi::ibv_ah_attr = unsafe { std::mem::zeroed() };
    attr.dlid = dlid;
    attr.port_num = port_num;
    // SAFETY: `pd` is live and `attr` is valid.
    let ah = non_null(unsafe { ffi::ibv_create_ah(pd, &mut attr) })?;
    cache.insert(key, ah as usize);
    Ok(ah)
}

/// Posts `wrs` as one linked list with a single doorbell. On failure the
/// index of the first request the device refused is returned; the ones
/// before it stay posted.
pub fn post_send_list(qp: Qp, wrs: &[SendWr]) -> Result<(), (usize, io::Error)> {
    if wrs.is_empty() {
        return Ok(());
    }
    let mut sges: Vec<ffi::ibv_sge> = wrs
        .iter()
        .map(|wr| ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        })
        .collect();
    let mut raws: Vec<ffi::ibv_send_wr> = Vec::with_capacity(wrs.len());
    for (idx, (wr, sge)) in wrs.iter().zip(sges.iter_mut()).enumerate() {
        // SAFETY: an all-zero send wr is valid; the fields below fill it in.
        let mut raw: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = sge;
        raw.num_sge = 1;
        if wr.signaled {
            raw.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        raw.opcode = match wr.opcode {
            WrOpcode::RdmaWrite => ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            WrOpcode::RdmaWriteWithImm => ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
            WrOpcode::Send => ffi::ibv_wr_opcode::IBV_WR_SEND,
            WrOpcode::SendWithImm => ffi::ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            WrOpcode::RdmaRead => ffi::ibv_wr_opcode::IBV_WR_RDMA_READ,
            WrOpcode::AtomicCmpAndSwp => ffi::ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP,
            WrOpcode::AtomicFetchAndAdd => ffi::ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD,
        };
        if let Some(imm) = wr.imm_data {
            raw.__bindgen_anon_1.imm_data = imm.to_be();
        }
        match (wr.opcode, wr.ud) {
            (_, Some(dest)) => {
                let ah = address_handle(qp, dest.dlid).map_err(|e| (idx, e))?;
                raw.wr.ud.ah = ah;
                raw.wr.ud.remote_qpn = dest.remote_qpn;
                raw.wr.ud.remote_qkey = dest.remote_qkey;
            }
            (WrOpcode::AtomicCmpAndSwp | WrOpcode::AtomicFetchAndAdd, None) => {
                raw.wr.atomic.remote_addr = wr.remote_addr;
                raw.wr.atomic.rkey = wr.rkey;
                raw.wr.atomic.compare_add = wr.compare_add;
                raw.wr.atomic.swap = wr.swap;
            }
            (_, None) => {
                raw.wr.rdma.remote_addr = wr.remote_addr;
                raw.wr.rdma.rkey = wr.rkey;
            }
        }
        raws.push(raw);
    }
    // Link only after the vector stops growing so the pointers stay put.
    let base = raws.as_mut_ptr();
    for idx in 1..raws.len() {
        // SAFETY: both indices are in bounds of `raws`.
        unsafe { (*base.add(idx - 1)).next = base.add(idx) };
    }

    let mut bad: *mut ffi::ibv_send_wr = ptr::null_mut();
    // SAFETY: `qp` is live; `raws` and `sges` outlive the call.
    let rc = unsafe {
        let ops = &mut (*(*qp.0).context).ops;
        match ops.post_send.as_mut() {
            Some(post) => post(qp.0, base, &mut bad),
            None => return Err((0, errno(libc::ENOSYS))),
        }
    };
    check(rc).map_err(|e| {
        let idx = if bad.is_null() {
            0
        } else {
            // SAFETY: the library points `bad` into the list it was given.
            usize::try_from(unsafe { bad.offset_from(base) }).unwrap_or(0)
        };
        (idx, e)
    })
}

fn wc_status(status: ffi::ibv_wc_status::Type) -> WcStatus {
    match status {
        ffi::ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ffi::ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
        ffi::ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
        ffi::ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
        ffi::ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
        ffi::ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemAccessErr,
        ffi::ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
        ffi::ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
        other => WcStatus::Other(other),
    }
}

fn wc_opcode(opcode: ffi::ibv_wc_opcode::Type) -> WcOpcode {
    match opcode {
        ffi::ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ffi::ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ffi::ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        ffi::ibv_wc_opcode::IBV_WC_COMP_SWAP => WcOpcode::CompSwap,
        ffi::ibv_wc_opcode::IBV_WC_FETCH_ADD => WcOpcode::FetchAdd,
        ffi::ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        ffi::ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
        other => WcOpcode::Other(other),
    }
}

/// Pops at most one completion from `cq`.
pub fn poll_cq(cq: Cq) -> io::Result<Option<Wc>> {
    let mut wc = ffi::ibv_wc::default();
    // SAFETY: `cq` is live and `wc` has room for one entry.
    let n = unsafe {
        let ops = &mut (*(*cq.0).context).ops;
        let poll = ops.poll_cq.as_mut().ok_or_else(|| errno(libc::ENOSYS))?;
        poll(cq.0, 1, &mut wc)
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Ok(None);
    }
    let status = wc_status(wc.status);
    // Only the id, status and queue pair number are defined on errors.
    let (opcode, imm_data) = if status == WcStatus::Success {
        (wc_opcode(wc.opcode()), wc.imm_data().map(u32::from_be))
    } else {
        (WcOpcode::Other(0), None)
    };
    Ok(Some(Wc {
        wr_id: wc.wr_id(),
        status,
        opcode,
        byte_len: wc.byte_len,
        imm_data,
        qp_num: wc.qp_num,
        src_qp: wc.src_qp,
        slid: wc.slid,
    }))
}
