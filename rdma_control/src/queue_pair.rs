/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Queue Pairs
//!
//! A queue pair moves through `Created -> Init -> ReadyToRecv -> ReadyToSend`.
//! Each edge is its own type ([`ToInit`], [`ToRtr`], [`ToRts`]) whose
//! constructors assemble the exact attribute set and mask the edge needs for
//! RC or UD. Call sites never build masks by hand; they pick an edge and
//! [`apply`] it, which first checks the queue pair is in the edge's source
//! state.
//!
//! * [`RcQueuePair`] reaches Init at construction and RTR/RTS in
//!   [`RcQueuePair::connect`].
//! * [`UdQueuePair`] walks all the way to RTS at construction.
//!
//! Both share [`QpCore`], which owns the completion queues and the queue pair
//! and tracks signaled requests with a [`Progress`] watermark pair.
//!
//! Around the single-request path sit a few helpers: [`DoorbellBatch`] rings
//! one doorbell for up to [`verbs::MAX_DOORBELL`] requests, [`Op`] builds a
//! one-sided request against a raw remote address, and [`RecvEntries`] with
//! [`RecvIter`] keep a ring of receive buffers posted.

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::IoCode;
use crate::ibverbs_primitives::IbvWc;
use crate::ibverbs_primitives::QpAttr;
use crate::ibverbs_primitives::QpConfig;
use crate::ibverbs_primitives::RdmaOperation;
use crate::ibverbs_primitives::RegAttr;
use crate::rdma_components::RdmaDomain;
use crate::verbs;

mod doorbell;
mod op;
mod rc;
mod recv;
mod ud;

pub use doorbell::DoorbellBatch;
pub use op::Op;
pub use rc::RcQueuePair;
pub use recv::RecvAllocator;
pub use recv::RecvEntries;
pub use recv::RecvIter;
pub use recv::RecvMsg;
pub use recv::SimpleAllocator;
pub use ud::UdQueuePair;

/// Low bits of a work request id that carry the progress watermark. The
/// caller's tag lives above them.
pub const PROGRESS_BITS: u32 = 16;
const PROGRESS_MASK: u64 = (1 << PROGRESS_BITS) - 1;

/// Packs a caller tag and a watermark into a work request id.
pub fn encode_wr_id(tag: u64, watermark: u64) -> u64 {
    (tag << PROGRESS_BITS) | (watermark & PROGRESS_MASK)
}

/// Splits a work request id into `(tag, masked watermark)`.
pub fn decode_wr_id(wr_id: u64) -> (u64, u64) {
    (wr_id >> PROGRESS_BITS, wr_id & PROGRESS_MASK)
}

/// High and low watermarks of signaled requests.
///
/// `high - low` (wrapping) is the number of signaled requests posted but
/// not yet polled.
#[derive(Debug, Default)]
pub struct Progress {
    high: AtomicU64,
    low: AtomicU64,
}

impl Progress {
    /// Advances the high watermark by `num` and returns the new value.
    pub fn forward(&self, num: u64) -> u64 {
        self.high.fetch_add(num, Ordering::AcqRel).wrapping_add(num)
    }

    fn backward(&self, num: u64) {
        self.high.fetch_sub(num, Ordering::AcqRel);
    }

    /// Records that every request up to the one whose id carried `watermark`
    /// has completed. Only the low [`PROGRESS_BITS`] of `watermark` are
    /// used; the full low watermark is reconstructed from them.
    pub fn done(&self, watermark: u64) {
        let cur = self.low.load(Ordering::Acquire);
        let delta = (watermark & PROGRESS_MASK).wrapping_sub(cur & PROGRESS_MASK) & PROGRESS_MASK;
        self.low.store(cur.wrapping_add(delta), Ordering::Release);
    }

    pub fn high(&self) -> u64 {
        self.high.load(Ordering::Acquire)
    }

    pub fn low(&self) -> u64 {
        self.low.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> u64 {
        self.high().wrapping_sub(self.low())
    }
}

/// Externally visible state of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpStatus {
    Created,
    Init,
    ReadyToRecv,
    ReadyToSend,
    Error,
}

impl From<verbs::QpState> for QpStatus {
    fn from(state: verbs::QpState) -> Self {
        match state {
            verbs::QpState::Reset => QpStatus::Created,
            verbs::QpState::Init => QpStatus::Init,
            verbs::QpState::Rtr => QpStatus::ReadyToRecv,
            verbs::QpState::Rts => QpStatus::ReadyToSend,
            verbs::QpState::Error => QpStatus::Error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QpError {
    #[error("failed to create {what}: {source}")]
    Create {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to transition QP to {to}: {source}")]
    Modify {
        to: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: QpStatus, to: QpStatus },
    #[error("qp {qpn} is already connected to qp {peer}")]
    AlreadyConnected { qpn: u32, peer: u32 },
    #[error("remote {0} out of range")]
    InvalidAttr(&'static str),
    #[error("failed to query QP: {0}")]
    Query(#[source] io::Error),
    #[error("no {0} memory region bound or given")]
    NoMemoryRegion(&'static str),
    #[error("{0:?} is not supported on this queue pair")]
    InvalidOperation(RdmaOperation),
    #[error("failed to post work request: {0}")]
    Post(#[source] io::Error),
    #[error("posted {posted} requests of a batch, then: {source}")]
    PartialPost {
        posted: usize,
        #[source]
        source: io::Error,
    },
    #[error("receive buffers ran out after {0} entries")]
    OutOfRecvBuffers(usize),
    #[error("failed to poll completion queue: {0}")]
    Poll(#[source] io::Error),
    #[error("work request 0x{wr_id:x} completed with {status:?}")]
    Completion { wr_id: u64, status: verbs::WcStatus },
    #[error("no completion within {0:?}")]
    Timeout(Duration),
}

impl QpError {
    pub fn code(&self) -> IoCode {
        match self {
            QpError::Timeout(_) => IoCode::Timeout,
            _ => IoCode::Err,
        }
    }
}

/// Narrows a 64-bit wire field to the width the device takes.
fn narrow<T: TryFrom<u64>>(value: u64, field: &'static str) -> Result<T, QpError> {
    T::try_from(value).map_err(|_| QpError::InvalidAttr(field))
}

/// One legal edge of the queue pair state machine.
pub trait Transition {
    const FROM: verbs::QpState;
    const TO: verbs::QpState;
    const NAME: &'static str;

    fn attr(&self) -> &verbs::ModifyAttr;
    fn mask(&self) -> verbs::AttrMask;
}

/// RESET -> INIT.
#[derive(Debug, Clone, Copy)]
pub struct ToInit {
    attr: verbs::ModifyAttr,
    mask: verbs::AttrMask,
}

impl ToInit {
    pub fn rc(config: &QpConfig, port_num: u8) -> Self {
        Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Init,
                pkey_index: config.pkey_index,
                port_num,
                qp_access_flags: config.access(),
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE
                | verbs::AttrMask::PKEY_INDEX
                | verbs::AttrMask::PORT
                | verbs::AttrMask::ACCESS_FLAGS,
        }
    }

    pub fn ud(config: &QpConfig, port_num: u8) -> Self {
        Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Init,
                pkey_index: config.pkey_index,
                port_num,
                qkey: config.qkey,
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE
                | verbs::AttrMask::PKEY_INDEX
                | verbs::AttrMask::PORT
                | verbs::AttrMask::QKEY,
        }
    }
}

impl Transition for ToInit {
    const FROM: verbs::QpState = verbs::QpState::Reset;
    const TO: verbs::QpState = verbs::QpState::Init;
    const NAME: &'static str = "INIT";

    fn attr(&self) -> &verbs::ModifyAttr {
        &self.attr
    }

    fn mask(&self) -> verbs::AttrMask {
        self.mask
    }
}

/// INIT -> RTR.
#[derive(Debug, Clone, Copy)]
pub struct ToRtr {
    attr: verbs::ModifyAttr,
    mask: verbs::AttrMask,
}

impl ToRtr {
    /// Points an RC queue pair at `remote`. A remote advertising a non-zero
    /// GID is routed with a global routing header. Wire fields wider than
    /// the device takes are rejected with [`QpError::InvalidAttr`].
    pub fn rc(config: &QpConfig, port_num: u8, remote: &QpAttr) -> Result<Self, QpError> {
        let gid = remote.addr.gid();
        let is_global = gid.subnet_prefix() != 0 || gid.interface_id() != 0;
        Ok(Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Rtr,
                path_mtu: config.path_mtu,
                dest_qp_num: narrow(remote.qpn, "qpn")?,
                rq_psn: narrow(remote.psn, "psn")?,
                max_dest_rd_atomic: config.max_dest_rd_atomic,
                min_rnr_timer: config.min_rnr_timer,
                ah_attr: verbs::AhAttr {
                    dlid: narrow(remote.lid, "lid")?,
                    sl: 0,
                    src_path_bits: 0,
                    port_num,
                    is_global,
                    grh: if is_global {
                        verbs::GlobalRoute {
                            dgid: *gid.raw(),
                            hop_limit: 0xff,
                            sgid_index: config.gid_index,
                        }
                    } else {
                        verbs::GlobalRoute::default()
                    },
                },
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE
                | verbs::AttrMask::AV
                | verbs::AttrMask::PATH_MTU
                | verbs::AttrMask::DEST_QPN
                | verbs::AttrMask::RQ_PSN
                | verbs::AttrMask::MAX_DEST_RD_ATOMIC
                | verbs::AttrMask::MIN_RNR_TIMER,
        })
    }

    pub fn ud() -> Self {
        Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Rtr,
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE,
        }
    }
}

impl Transition for ToRtr {
    const FROM: verbs::QpState = verbs::QpState::Init;
    const TO: verbs::QpState = verbs::QpState::Rtr;
    const NAME: &'static str = "RTR";

    fn attr(&self) -> &verbs::ModifyAttr {
        &self.attr
    }

    fn mask(&self) -> verbs::AttrMask {
        self.mask
    }
}

/// RTR -> RTS.
#[derive(Debug, Clone, Copy)]
pub struct ToRts {
    attr: verbs::ModifyAttr,
    mask: verbs::AttrMask,
}

impl ToRts {
    pub fn rc(config: &QpConfig) -> Self {
        Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Rts,
                sq_psn: config.psn,
                timeout: config.timeout,
                retry_cnt: config.retry_count,
                rnr_retry: config.rnr_retry,
                max_rd_atomic: config.max_rd_atomic,
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE
                | verbs::AttrMask::TIMEOUT
                | verbs::AttrMask::RETRY_CNT
                | verbs::AttrMask::SQ_PSN
                | verbs::AttrMask::RNR_RETRY
                | verbs::AttrMask::MAX_QP_RD_ATOMIC,
        }
    }

    pub fn ud(config: &QpConfig) -> Self {
        Self {
            attr: verbs::ModifyAttr {
                qp_state: verbs::QpState::Rts,
                sq_psn: config.psn,
                ..Default::default()
            },
            mask: verbs::AttrMask::STATE | verbs::AttrMask::SQ_PSN,
        }
    }
}

impl Transition for ToRts {
    const FROM: verbs::QpState = verbs::QpState::Rtr;
    const TO: verbs::QpState = verbs::QpState::Rts;
    const NAME: &'static str = "RTS";

    fn attr(&self) -> &verbs::ModifyAttr {
        &self.attr
    }

    fn mask(&self) -> verbs::AttrMask {
        self.mask
    }
}

/// Applies `edge` to `qp` if `qp` is in the edge's source state.
pub fn apply<T: Transition>(qp: verbs::Qp, edge: &T) -> Result<(), QpError> {
    let cur = verbs::query_qp(qp).map_err(QpError::Query)?.qp_state;
    if cur != T::FROM {
        return Err(QpError::InvalidTransition {
            from: cur.into(),
            to: T::TO.into(),
        });
    }
    verbs::modify_qp(qp, edge.attr(), edge.mask()).map_err(|source| {
        tracing::error!(
            "failed to transition qp {} to {}: {}",
            qp.qp_num(),
            T::NAME,
            source
        );
        QpError::Modify {
            to: T::NAME,
            source,
        }
    })?;
    tracing::debug!("qp {} transitioned to {}", qp.qp_num(), T::NAME);
    Ok(())
}

/// Describes one work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqDesc {
    pub op: RdmaOperation,
    /// Whether the request produces a completion on success.
    pub signaled: bool,
    pub len: u32,
    /// Caller tag, recoverable from the completion through [`decode_wr_id`].
    pub tag: u64,
}

/// Addresses and operands of one work request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqPayload {
    /// Absolute address inside the local region.
    pub local_addr: u64,
    /// Offset inside the remote region.
    pub remote_offset: u64,
    pub imm_data: Option<u32>,
    /// Compare value of a compare-and-swap or addend of a fetch-and-add.
    pub compare_add: u64,
    pub swap: u64,
}

fn needs_remote(op: RdmaOperation) -> bool {
    !matches!(op, RdmaOperation::Send | RdmaOperation::SendWithImm)
}

/// A request with its regions resolved, waiting for a work request id.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    op: RdmaOperation,
    signaled: bool,
    tag: u64,
    sge: verbs::Sge,
    remote_addr: u64,
    rkey: u32,
    imm_data: Option<u32>,
    compare_add: u64,
    swap: u64,
    ud: Option<verbs::UdDest>,
}

/// Resources and bookkeeping shared by RC and UD queue pairs.
pub struct QpCore {
    domain: Arc<RdmaDomain>,
    qp: verbs::Qp,
    send_cq: verbs::Cq,
    recv_cq: verbs::Cq,
    config: QpConfig,
    progress: Progress,
    local_mr: Mutex<Option<RegAttr>>,
    remote_mr: Mutex<Option<RegAttr>>,
}

impl std::fmt::Debug for QpCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QpCore")
            .field("domain", &self.domain.name())
            .field("qpn", &self.qp.qp_num())
            .field("progress", &self.progress)
            .finish()
    }
}

impl QpCore {
    /// Allocates the send completion queue, the receive completion queue and
    /// the queue pair, in RESET.
    fn create(
        domain: Arc<RdmaDomain>,
        config: QpConfig,
        qp_type: verbs::QpType,
    ) -> Result<Self, QpError> {
        tracing::debug!("creating a {:?} queue pair from config {}", qp_type, config);
        let send_cq = verbs::create_cq(domain.context(), config.max_send_size).map_err(|source| {
            QpError::Create {
                what: "send completion queue (CQ)",
                source,
            }
        })?;
        let recv_cq = match verbs::create_cq(domain.context(), config.max_recv_size) {
            Ok(cq) => cq,
            Err(source) => {
                let _ = verbs::destroy_cq(send_cq);
                return Err(QpError::Create {
                    what: "receive completion queue (CQ)",
                    source,
                });
            }
        };
        let qp = verbs::create_qp(
            domain.pd(),
            &verbs::QpInitAttr {
                qp_type,
                send_cq,
                recv_cq,
                max_send_wr: config.max_send_size,
                max_recv_wr: config.max_recv_size,
            },
        );
        let qp = match qp {
            Ok(qp) => qp,
            Err(source) => {
                let _ = verbs::destroy_cq(recv_cq);
                let _ = verbs::destroy_cq(send_cq);
                return Err(QpError::Create {
                    what: "queue pair (QP)",
                    source,
                });
            }
        };
        Ok(Self {
            domain,
            qp,
            send_cq,
            recv_cq,
            config,
            progress: Progress::default(),
            local_mr: Mutex::new(None),
            remote_mr: Mutex::new(None),
        })
    }

    fn port_num(&self) -> u8 {
        self.domain.idx().port_id
    }

    pub fn status(&self) -> QpStatus {
        match verbs::query_qp(self.qp) {
            Ok(attr) => attr.qp_state.into(),
            Err(e) => {
                tracing::warn!("failed to query qp {}: {}", self.qp.qp_num(), e);
                QpStatus::Error
            }
        }
    }

    /// Whether the queue pair can still be connected or used.
    pub fn valid(&self) -> bool {
        matches!(
            self.status(),
            QpStatus::Init | QpStatus::ReadyToRecv | QpStatus::ReadyToSend
        )
    }

    pub fn qp_num(&self) -> u32 {
        self.qp.qp_num()
    }

    pub fn config(&self) -> &QpConfig {
        &self.config
    }

    pub fn domain(&self) -> &Arc<RdmaDomain> {
        &self.domain
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    fn attr(&self, qkey: u32) -> QpAttr {
        QpAttr {
            addr: self.domain.addr(),
            lid: self.domain.lid() as u64,
            psn: self.config.psn as u64,
            port_id: self.port_num() as u64,
            qpn: self.qp.qp_num() as u64,
            qkey: qkey as u64,
        }
    }

    /// Default local region, carrying the local key.
    pub fn bind_local_mr(&self, attr: RegAttr) {
        *self.local_mr.lock().unwrap_or_else(PoisonError::into_inner) = Some(attr);
    }

    /// Default remote region, carrying the remote key.
    pub fn bind_remote_mr(&self, attr: RegAttr) {
        *self.remote_mr.lock().unwrap_or_else(PoisonError::into_inner) = Some(attr);
    }

    fn local_mr(&self) -> Option<RegAttr> {
        *self.local_mr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote_mr(&self) -> Option<RegAttr> {
        *self.remote_mr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the regions of one request. Regions passed explicitly take
    /// precedence over bound defaults.
    fn resolve(
        &self,
        desc: &ReqDesc,
        payload: &ReqPayload,
        local: Option<RegAttr>,
        remote: Option<RegAttr>,
        ud: Option<verbs::UdDest>,
    ) -> Result<Resolved, QpError> {
        let local = local
            .or_else(|| self.local_mr())
            .ok_or(QpError::NoMemoryRegion("local"))?;
        let (remote_addr, rkey) = if ud.is_none() && needs_remote(desc.op) {
            let remote = remote
                .or_else(|| self.remote_mr())
                .ok_or(QpError::NoMemoryRegion("remote"))?;
            (remote.buf.wrapping_add(payload.remote_offset), remote.key)
        } else {
            (0, 0)
        };
        Ok(Resolved {
            op: desc.op,
            signaled: desc.signaled,
            tag: desc.tag,
            sge: verbs::Sge {
                addr: payload.local_addr,
                length: desc.len,
                lkey: local.key,
            },
            remote_addr,
            rkey,
            imm_data: payload.imm_data,
            compare_add: payload.compare_add,
            swap: payload.swap,
            ud,
        })
    }

    /// Posts `reqs` with one doorbell and returns their work request ids.
    ///
    /// Signaled requests advance the high watermark in order. When the
    /// device refuses a request, the ones before it stay posted and the
    /// watermark gives back every signaled request from it on.
    fn post_resolved(&self, reqs: &[Resolved]) -> Result<Vec<u64>, QpError> {
        let signaled = reqs.iter().filter(|r| r.signaled).count() as u64;
        let mut watermark = self.progress.forward(signaled).wrapping_sub(signaled);
        let wrs: Vec<verbs::SendWr> = reqs
            .iter()
            .map(|req| {
                if req.signaled {
                    watermark = watermark.wrapping_add(1);
                }
                verbs::SendWr {
                    wr_id: encode_wr_id(req.tag, watermark),
                    opcode: req.op.into(),
                    signaled: req.signaled,
                    sge: req.sge,
                    remote_addr: req.remote_addr,
                    rkey: req.rkey,
                    imm_data: req.imm_data,
                    compare_add: req.compare_add,
                    swap: req.swap,
                    ud: req.ud,
                }
            })
            .collect();
        if let Err((posted, source)) = verbs::post_send_list(self.qp, &wrs) {
            let unposted = reqs[posted..].iter().filter(|r| r.signaled).count() as u64;
            self.progress.backward(unposted);
            tracing::debug!(
                "qp {} posted {} of {} requests: {}",
                self.qp.qp_num(),
                posted,
                reqs.len(),
                source
            );
            return Err(if posted == 0 {
                QpError::Post(source)
            } else {
                QpError::PartialPost { posted, source }
            });
        }
        Ok(wrs.iter().map(|wr| wr.wr_id).collect())
    }

    /// Posts one work request and returns the work request id it carries.
    fn post(
        &self,
        desc: &ReqDesc,
        payload: &ReqPayload,
        local: Option<RegAttr>,
        remote: Option<RegAttr>,
        ud: Option<verbs::UdDest>,
    ) -> Result<u64, QpError> {
        let req = self.resolve(desc, payload, local, remote, ud)?;
        let ids = self.post_resolved(std::slice::from_ref(&req))?;
        Ok(ids[0])
    }

    /// Posts every request of `batch` with one doorbell.
    fn post_batch(
        &self,
        batch: &DoorbellBatch,
        ud: Option<verbs::UdDest>,
    ) -> Result<Vec<u64>, QpError> {
        let reqs = batch
            .iter()
            .map(|(desc, payload)| self.resolve(desc, payload, None, None, ud))
            .collect::<Result<Vec<_>, _>>()?;
        self.post_resolved(&reqs)
    }

    /// Pops one send completion, advancing the low watermark.
    pub fn poll_send(&self) -> Result<Option<IbvWc>, QpError> {
        let wc = verbs::poll_cq(self.send_cq).map_err(QpError::Poll)?;
        Ok(wc.map(|wc| {
            let wc = IbvWc::from(wc);
            self.progress.done(decode_wr_id(wc.wr_id()).1);
            wc
        }))
    }

    /// Spins on the send completion queue until one completion arrives or
    /// `timeout` elapses. A completion with an error status is an error.
    pub fn wait_one_completion(&self, timeout: Duration) -> Result<IbvWc, QpError> {
        // A deadline past what `Instant` can represent means wait forever.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(wc) = self.poll_send()? {
                return match wc.error() {
                    None => Ok(wc),
                    Some(status) => Err(QpError::Completion {
                        wr_id: wc.wr_id(),
                        status,
                    }),
                };
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(QpError::Timeout(timeout));
            }
            std::hint::spin_loop();
        }
    }

    /// Posts a receive of up to `len` bytes at `addr`, registered under
    /// `lkey`.
    pub fn post_recv(&self, addr: u64, len: u32, lkey: u32, wr_id: u64) -> Result<(), QpError> {
        verbs::post_recv(
            self.qp,
            &verbs::RecvWr {
                wr_id,
                sge: verbs::Sge {
                    addr,
                    length: len,
                    lkey,
                },
            },
        )
        .map_err(QpError::Post)
    }

    pub fn poll_recv(&self) -> Result<Option<IbvWc>, QpError> {
        let wc = verbs::poll_cq(self.recv_cq).map_err(QpError::Poll)?;
        Ok(wc.map(IbvWc::from))
    }

    /// Posts the next `num` entries of the ring, starting at its header.
    /// Each receive carries its buffer address as the work request id.
    pub fn post_recvs(&self, entries: &mut RecvEntries, num: usize) -> Result<(), QpError> {
        if entries.is_empty() {
            return Ok(());
        }
        for _ in 0..num {
            let sge = entries.header_sge();
            self.post_recv(sge.addr, sge.length, sge.lkey, sge.addr)?;
            entries.advance();
        }
        Ok(())
    }
}

impl Drop for QpCore {
    fn drop(&mut self) {
        if let Err(e) = verbs::destroy_qp(self.qp) {
            tracing::warn!("failed to destroy qp {}: {}", self.qp.qp_num(), e);
        }
        for cq in [self.send_cq, self.recv_cq] {
            if let Err(e) = verbs::destroy_cq(cq) {
                tracing::warn!("failed to destroy cq: {}", e);
            }
        }
    }
}
