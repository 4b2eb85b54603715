/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::Arc;
use std::time::Duration;

use super::DoorbellBatch;
use super::QpCore;
use super::QpError;
use super::QpStatus;
use super::RecvEntries;
use super::RecvIter;
use super::ReqDesc;
use super::ReqPayload;
use super::ToInit;
use super::Transition;
use super::ToRtr;
use super::ToRts;
use super::apply;
use crate::ibverbs_primitives::IbvWc;
use crate::ibverbs_primitives::QpAttr;
use crate::ibverbs_primitives::QpConfig;
use crate::ibverbs_primitives::RegAttr;
use crate::rdma_components::RdmaDomain;
use crate::verbs;

/// A reliable-connection queue pair.
///
/// # Connection Lifecycle
///
/// 1. Create with [`RcQueuePair::create`]; the queue pair is in INIT
/// 2. Exchange [`RcQueuePair::my_attr`] with the remote peer
/// 3. Connect to the remote endpoint with [`RcQueuePair::connect`]
/// 4. Post requests with [`RcQueuePair::send_normal`]
/// 5. Wait for completions with [`RcQueuePair::wait_one_completion`]
#[derive(Debug)]
pub struct RcQueuePair {
    core: QpCore,
}

impl RcQueuePair {
    /// Creates the queue pair and moves it to INIT.
    ///
    /// Failure at any step releases what was allocated and returns the
    /// error; there is no partially constructed queue pair to retry on.
    pub fn create(domain: Arc<RdmaDomain>, config: QpConfig) -> Result<Self, QpError> {
        let core = QpCore::create(domain, config, verbs::QpType::Rc)?;
        apply(core.qp, &ToInit::rc(&core.config, core.port_num()))?;
        Ok(Self { core })
    }

    /// Drives the queue pair through RTR and RTS against `remote`.
    ///
    /// Connecting again to the peer the queue pair is already connected to
    /// is a no-op; any other peer gets [`QpError::AlreadyConnected`]. RTS
    /// failing after RTR succeeded is reported; the queue pair is then stuck
    /// in RTR and must be discarded.
    pub fn connect(&self, remote: &QpAttr) -> Result<(), QpError> {
        let rtr = ToRtr::rc(&self.core.config, self.core.port_num(), remote)?;
        let cur = verbs::query_qp(self.core.qp).map_err(QpError::Query)?;
        if cur.qp_state == verbs::QpState::Rts {
            if same_peer(&cur, rtr.attr()) {
                tracing::debug!("qp {} already connected", self.qp_num());
                return Ok(());
            }
            return Err(QpError::AlreadyConnected {
                qpn: self.qp_num(),
                peer: cur.dest_qp_num,
            });
        }
        tracing::debug!("connecting qp {} to {:?}", self.qp_num(), remote);
        apply(self.core.qp, &rtr)?;
        apply(self.core.qp, &ToRts::rc(&self.core.config))?;
        Ok(())
    }

    /// Attributes a peer needs to connect to this queue pair.
    pub fn my_attr(&self) -> QpAttr {
        self.core.attr(0)
    }

    pub fn status(&self) -> QpStatus {
        self.core.status()
    }

    pub fn valid(&self) -> bool {
        self.core.valid()
    }

    pub fn qp_num(&self) -> u32 {
        self.core.qp_num()
    }

    pub fn config(&self) -> &QpConfig {
        self.core.config()
    }

    pub fn domain(&self) -> &Arc<RdmaDomain> {
        self.core.domain()
    }

    pub fn progress(&self) -> &super::Progress {
        self.core.progress()
    }

    pub fn bind_local_mr(&self, attr: RegAttr) {
        self.core.bind_local_mr(attr)
    }

    pub fn bind_remote_mr(&self, attr: RegAttr) {
        self.core.bind_remote_mr(attr)
    }

    /// Posts one request against the bound regions. Returns the work
    /// request id; never blocks.
    pub fn send_normal(&self, desc: &ReqDesc, payload: &ReqPayload) -> Result<u64, QpError> {
        self.core.post(desc, payload, None, None, None)
    }

    /// Posts one request against explicitly given regions.
    pub fn send_normal_with(
        &self,
        desc: &ReqDesc,
        payload: &ReqPayload,
        local: RegAttr,
        remote: RegAttr,
    ) -> Result<u64, QpError> {
        self.core
            .post(desc, payload, Some(local), Some(remote), None)
    }

    pub fn poll_send(&self) -> Result<Option<IbvWc>, QpError> {
        self.core.poll_send()
    }

    pub fn wait_one_completion(&self, timeout: Duration) -> Result<IbvWc, QpError> {
        self.core.wait_one_completion(timeout)
    }

    /// Posts every request of `batch` with one doorbell and returns their
    /// work request ids in order.
    pub fn send_doorbell(&self, batch: &DoorbellBatch) -> Result<Vec<u64>, QpError> {
        self.core.post_batch(batch, None)
    }

    pub fn post_recv(&self, addr: u64, len: u32, lkey: u32, wr_id: u64) -> Result<(), QpError> {
        self.core.post_recv(addr, len, lkey, wr_id)
    }

    pub fn poll_recv(&self) -> Result<Option<IbvWc>, QpError> {
        self.core.poll_recv()
    }

    pub fn post_recvs(&self, entries: &mut RecvEntries, num: usize) -> Result<(), QpError> {
        self.core.post_recvs(entries, num)
    }

    /// Drains the messages received so far into `entries`.
    pub fn recv_iter<'a>(&'a self, entries: &'a mut RecvEntries) -> Result<RecvIter<'a>, QpError> {
        RecvIter::new(&self.core, entries)
    }

    pub(super) fn core(&self) -> &QpCore {
        &self.core
    }
}

/// Whether the RTR attributes `want` point where `cur` already points.
fn same_peer(cur: &verbs::ModifyAttr, want: &verbs::ModifyAttr) -> bool {
    let (a, b) = (&cur.ah_attr, &want.ah_attr);
    cur.dest_qp_num == want.dest_qp_num
        && a.dlid == b.dlid
        && a.is_global == b.is_global
        && (!a.is_global || a.grh.dgid == b.grh.dgid)
}

#[cfg(all(test, not(feature = "ibverbs")))]
mod tests {
    use super::*;
    use crate::DevIdx;
    use crate::IoCode;
    use crate::Op;
    use crate::RdmaMemoryRegion;
    use crate::RdmaOperation;
    use crate::SimpleAllocator;
    use crate::queue_pair::decode_wr_id;

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Endpoint {
        qp: RcQueuePair,
        mr: RdmaMemoryRegion,
    }

    fn endpoint(dev_id: usize) -> Endpoint {
        endpoint_with(dev_id, QpConfig::default())
    }

    fn endpoint_with(dev_id: usize, config: QpConfig) -> Endpoint {
        let domain = Arc::new(
            RdmaDomain::new(DevIdx {
                dev_id,
                port_id: 1,
            })
            .unwrap(),
        );
        let qp = RcQueuePair::create(domain.clone(), config).unwrap();
        let mr = RdmaMemoryRegion::new(domain, 4096).unwrap();
        qp.bind_local_mr(mr.local_attr().unwrap());
        Endpoint { qp, mr }
    }

    fn connected_pair() -> (Endpoint, Endpoint) {
        let a = endpoint(0);
        let b = endpoint(1);
        a.qp.connect(&b.qp.my_attr()).unwrap();
        b.qp.connect(&a.qp.my_attr()).unwrap();
        a.qp.bind_remote_mr(b.mr.attr().unwrap());
        b.qp.bind_remote_mr(a.mr.attr().unwrap());
        (a, b)
    }

    fn desc(op: RdmaOperation, len: u32, tag: u64) -> ReqDesc {
        ReqDesc {
            op,
            signaled: true,
            len,
            tag,
        }
    }

    #[test]
    fn test_create_reaches_init() {
        let ep = endpoint(0);
        assert_eq!(ep.qp.status(), QpStatus::Init);
        assert!(ep.qp.valid());
        let attr = ep.qp.my_attr();
        assert_eq!(attr.qpn, ep.qp.qp_num() as u64);
        assert_eq!(attr.lid, ep.qp.domain().lid() as u64);
        assert_eq!(attr.psn, ep.qp.config().psn as u64);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (a, b) = connected_pair();
        assert_eq!(a.qp.status(), QpStatus::ReadyToSend);
        assert_eq!(b.qp.status(), QpStatus::ReadyToSend);
        a.qp.connect(&b.qp.my_attr()).unwrap();
        assert_eq!(a.qp.status(), QpStatus::ReadyToSend);
    }

    #[test]
    fn test_connect_to_another_peer_is_rejected() {
        let (a, b) = connected_pair();
        let other = endpoint(1);
        let err = a.qp.connect(&other.qp.my_attr()).unwrap_err();
        assert!(matches!(
            err,
            QpError::AlreadyConnected { qpn, peer } if qpn == a.qp.qp_num() && peer == b.qp.qp_num()
        ));
        // Still wired to the first peer.
        a.qp.connect(&b.qp.my_attr()).unwrap();
    }

    #[test]
    fn test_connect_rejects_unsupported_mtu() {
        let peer = endpoint(1);
        let ep = endpoint_with(
            0,
            QpConfig {
                path_mtu: 1000,
                ..Default::default()
            },
        );
        let err = ep.qp.connect(&peer.qp.my_attr()).unwrap_err();
        assert!(matches!(err, QpError::Modify { to: "RTR", .. }));
        let msg = err.to_string();
        assert!(msg.contains("failed to transition QP to RTR"), "{}", msg);
        assert!(msg.contains("os error 22"), "{}", msg);
        assert_eq!(ep.qp.status(), QpStatus::Init);

        // The device keeps refusing; the queue pair never reaches RTS.
        assert!(matches!(
            ep.qp.connect(&peer.qp.my_attr()),
            Err(QpError::Modify { .. })
        ));
        assert_ne!(ep.qp.status(), QpStatus::ReadyToSend);
    }

    #[test]
    fn test_connect_rejects_wide_qpn() {
        let ep = endpoint(0);
        let mut remote = endpoint(1).qp.my_attr();
        remote.qpn = 1 << 40;
        let err = ep.qp.connect(&remote).unwrap_err();
        assert!(matches!(err, QpError::InvalidAttr("qpn")));
        assert_eq!(ep.qp.status(), QpStatus::Init);
    }

    #[test]
    fn test_write_read_and_tags() {
        let (a, b) = connected_pair();
        let base = a.mr.buffer().addr();
        assert!(a.mr.buffer().write_bytes(0, b"hello rdma"));

        a.qp
            .send_normal(
                &desc(RdmaOperation::Write, 10, 42),
                &ReqPayload {
                    local_addr: base,
                    remote_offset: 128,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(a.qp.progress().pending(), 1);
        let wc = a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(decode_wr_id(wc.wr_id()).0, 42);
        assert_eq!(a.qp.progress().pending(), 0);
        assert_eq!(b.mr.buffer().read_bytes(128, 10).unwrap(), b"hello rdma");

        a.qp
            .send_normal(
                &desc(RdmaOperation::Read, 10, 43),
                &ReqPayload {
                    local_addr: base + 512,
                    remote_offset: 128,
                    ..Default::default()
                },
            )
            .unwrap();
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(a.mr.buffer().read_bytes(512, 10).unwrap(), b"hello rdma");
    }

    #[test]
    fn test_atomics() {
        let (a, b) = connected_pair();
        let base = a.mr.buffer().addr();
        assert!(b.mr.buffer().write_u64(64, 10));

        a.qp
            .send_normal(
                &desc(RdmaOperation::FetchAndAdd, 8, 1),
                &ReqPayload {
                    local_addr: base,
                    remote_offset: 64,
                    compare_add: 5,
                    ..Default::default()
                },
            )
            .unwrap();
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(a.mr.buffer().read_u64(0), Some(10));
        assert_eq!(b.mr.buffer().read_u64(64), Some(15));

        a.qp
            .send_normal(
                &desc(RdmaOperation::CompareAndSwap, 8, 2),
                &ReqPayload {
                    local_addr: base,
                    remote_offset: 64,
                    compare_add: 15,
                    swap: 100,
                    ..Default::default()
                },
            )
            .unwrap();
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(b.mr.buffer().read_u64(64), Some(100));
    }

    #[test]
    fn test_send_recv() {
        let (a, b) = connected_pair();
        let recv = b.mr.local_attr().unwrap();
        b.qp.post_recv(recv.buf, 64, recv.key, 9).unwrap();
        assert!(a.mr.buffer().write_bytes(0, b"two sided"));

        a.qp
            .send_normal(
                &ReqDesc {
                    op: RdmaOperation::SendWithImm,
                    signaled: true,
                    len: 9,
                    tag: 3,
                },
                &ReqPayload {
                    local_addr: a.mr.buffer().addr(),
                    imm_data: Some(0x77),
                    ..Default::default()
                },
            )
            .unwrap();
        a.qp.wait_one_completion(TIMEOUT).unwrap();

        let wc = b.qp.poll_recv().unwrap().unwrap();
        assert!(wc.is_valid());
        assert_eq!(wc.wr_id(), 9);
        assert_eq!(wc.imm_data(), Some(0x77));
        assert_eq!(b.mr.buffer().read_bytes(0, 9).unwrap(), b"two sided");
    }

    #[test]
    fn test_bad_remote_key_is_completion_error() {
        let (a, b) = connected_pair();
        let mut remote = b.mr.attr().unwrap();
        remote.key ^= 0xffff;
        a.qp
            .send_normal_with(
                &desc(RdmaOperation::Write, 8, 5),
                &ReqPayload {
                    local_addr: a.mr.buffer().addr(),
                    ..Default::default()
                },
                a.mr.local_attr().unwrap(),
                remote,
            )
            .unwrap();
        let err = a.qp.wait_one_completion(TIMEOUT).unwrap_err();
        assert!(matches!(
            err,
            QpError::Completion {
                status: verbs::WcStatus::RemAccessErr,
                ..
            }
        ));
        assert_eq!(a.qp.status(), QpStatus::Error);
        assert!(!a.qp.valid());
    }

    #[test]
    fn test_wait_times_out_without_requests() {
        let (a, _b) = connected_pair();
        let err = a
            .qp
            .wait_one_completion(Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.code(), IoCode::Timeout);
    }

    #[test]
    fn test_wait_without_deadline() {
        let (a, b) = connected_pair();
        assert!(a.mr.buffer().write_bytes(0, b"forever"));
        a.qp
            .send_normal(
                &desc(RdmaOperation::Write, 7, 8),
                &ReqPayload {
                    local_addr: a.mr.buffer().addr(),
                    ..Default::default()
                },
            )
            .unwrap();
        let wc = a.qp.wait_one_completion(Duration::MAX).unwrap();
        assert_eq!(decode_wr_id(wc.wr_id()).0, 8);
        assert_eq!(b.mr.buffer().read_bytes(0, 7).unwrap(), b"forever");
    }

    #[test]
    fn test_doorbell_batch() {
        let (a, b) = connected_pair();
        let base = a.mr.buffer().addr();
        let mut batch = DoorbellBatch::new();
        for i in 0..4u64 {
            assert!(a.mr.buffer().write_u64(i as usize * 8, 100 + i));
            assert!(batch.push(
                ReqDesc {
                    op: RdmaOperation::Write,
                    // Only the last request of the batch is signaled.
                    signaled: i == 3,
                    len: 8,
                    tag: i,
                },
                ReqPayload {
                    local_addr: base + i * 8,
                    remote_offset: 1024 + i * 8,
                    ..Default::default()
                },
            ));
        }
        let ids = a.qp.send_doorbell(&batch).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(a.qp.progress().pending(), 1);
        let wc = a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(wc.wr_id(), ids[3]);
        assert_eq!(a.qp.progress().pending(), 0);
        for i in 0..4u64 {
            assert_eq!(b.mr.buffer().read_u64(1024 + i as usize * 8), Some(100 + i));
        }
    }

    #[test]
    fn test_doorbell_batch_stops_and_rolls_back() {
        let (a, _b) = connected_pair();
        let base = a.mr.buffer().addr();
        let write = |offset: u64| ReqPayload {
            local_addr: base,
            remote_offset: offset,
            ..Default::default()
        };
        let mut batch = DoorbellBatch::new();
        batch.push(desc(RdmaOperation::Write, 8, 1), write(0));
        // Past the end of the remote region: errors the queue pair.
        batch.push(desc(RdmaOperation::Write, 8, 2), write(1 << 20));
        batch.push(desc(RdmaOperation::Write, 8, 3), write(8));
        batch.push(desc(RdmaOperation::Write, 8, 4), write(16));

        let err = a.qp.send_doorbell(&batch).unwrap_err();
        assert!(matches!(err, QpError::PartialPost { posted: 2, .. }));
        // The two unposted signaled requests are given back.
        assert_eq!(a.qp.progress().pending(), 2);
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert!(matches!(
            a.qp.wait_one_completion(TIMEOUT),
            Err(QpError::Completion { .. })
        ));
        assert_eq!(a.qp.progress().pending(), 0);
    }

    #[test]
    fn test_op_builder() {
        let (a, b) = connected_pair();
        let local = a.mr.local_attr().unwrap();
        let remote = b.mr.attr().unwrap();
        assert!(b.mr.buffer().write_u64(0xc0, 41));

        let mut op = Op::new();
        op.set_rdma(remote.buf + 0xc0, remote.key).set_read();
        assert!(op.append_sge(local.buf, 8, local.key));
        let wr_id = op.execute(&a.qp, true, 6).unwrap();
        assert_eq!(decode_wr_id(wr_id).0, 6);
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(a.mr.buffer().read_u64(0), Some(41));

        let mut faa = Op::new();
        faa.set_fetch_add(remote.buf + 0xc0, 1, remote.key);
        faa.append_sge(local.buf + 8, 8, local.key);
        faa.execute(&a.qp, true, 7).unwrap();
        a.qp.wait_one_completion(TIMEOUT).unwrap();
        assert_eq!(a.mr.buffer().read_u64(8), Some(41));
        assert_eq!(b.mr.buffer().read_u64(0xc0), Some(42));

        let unbound = Op::new();
        assert!(matches!(
            unbound.execute(&a.qp, true, 0),
            Err(QpError::NoMemoryRegion("local"))
        ));
    }

    #[test]
    fn test_recv_iter_reposts() {
        let (a, b) = connected_pair();
        let mut alloc = SimpleAllocator::new(b.mr.local_attr().unwrap());
        let mut entries = RecvEntries::create(&mut alloc, 4, 64).unwrap();
        b.qp.post_recvs(&mut entries, 4).unwrap();
        assert_eq!(entries.header(), 0);

        // Six sends through a ring of four: the iterator must repost.
        let mut seen = Vec::new();
        for round in 0..2u32 {
            for i in 0..3u32 {
                let n = round * 3 + i;
                assert!(a.mr.buffer().write_u64(0, n as u64));
                a.qp
                    .send_normal(
                        &ReqDesc {
                            op: RdmaOperation::SendWithImm,
                            signaled: true,
                            len: 8,
                            tag: 0,
                        },
                        &ReqPayload {
                            local_addr: a.mr.buffer().addr(),
                            imm_data: Some(n),
                            ..Default::default()
                        },
                    )
                    .unwrap();
                a.qp.wait_one_completion(TIMEOUT).unwrap();
            }
            for msg in b.qp.recv_iter(&mut entries).unwrap() {
                assert_eq!(msg.len, 8);
                let offset = (msg.addr - b.mr.buffer().addr()) as usize;
                assert_eq!(b.mr.buffer().read_u64(offset), msg.imm_data.map(u64::from));
                seen.push(msg.imm_data.unwrap());
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(entries.header(), 2);
    }

    #[test]
    fn test_send_before_connect_fails() {
        let ep = endpoint(0);
        let err = ep
            .qp
            .send_normal(
                &desc(RdmaOperation::Write, 8, 0),
                &ReqPayload {
                    local_addr: ep.mr.buffer().addr(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        // No remote region bound yet.
        assert!(matches!(err, QpError::NoMemoryRegion("remote")));

        ep.qp.bind_remote_mr(ep.mr.attr().unwrap());
        let err = ep
            .qp
            .send_normal(
                &desc(RdmaOperation::Write, 8, 0),
                &ReqPayload {
                    local_addr: ep.mr.buffer().addr(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, QpError::Post(_)));
        assert_eq!(ep.qp.progress().pending(), 0);
    }

    #[test]
    fn test_connect_from_wrong_state() {
        let (a, b) = connected_pair();
        let fresh = endpoint(0);
        // Move a fresh queue pair to RTR by hand, then reject RTR again.
        apply(
            fresh.qp.core.qp,
            &ToRtr::rc(fresh.qp.config(), 1, &b.qp.my_attr()).unwrap(),
        )
        .unwrap();
        let err = apply(
            fresh.qp.core.qp,
            &ToRtr::rc(fresh.qp.config(), 1, &a.qp.my_attr()).unwrap(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            QpError::InvalidTransition {
                from: QpStatus::ReadyToRecv,
                to: QpStatus::ReadyToRecv
            }
        ));
    }
}
