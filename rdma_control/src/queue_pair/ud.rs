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
use super::ToRtr;
use super::ToRts;
use super::apply;
use super::narrow;
use crate::ibverbs_primitives::IbvWc;
use crate::ibverbs_primitives::QpAttr;
use crate::ibverbs_primitives::QpConfig;
use crate::ibverbs_primitives::RdmaOperation;
use crate::ibverbs_primitives::RegAttr;
use crate::rdma_components::RdmaDomain;
use crate::verbs;

/// An unreliable-datagram queue pair.
///
/// It has no fixed peer, so construction drives it straight to RTS and it
/// can send as soon as [`UdQueuePair::create`] returns. Every received
/// datagram is preceded by [`verbs::GRH_SIZE`] bytes of routing header in
/// the receive buffer.
#[derive(Debug)]
pub struct UdQueuePair {
    core: QpCore,
}

impl UdQueuePair {
    pub fn create(domain: Arc<RdmaDomain>, config: QpConfig) -> Result<Self, QpError> {
        let core = QpCore::create(domain, config, verbs::QpType::Ud)?;
        apply(core.qp, &ToInit::ud(&core.config, core.port_num()))?;
        apply(core.qp, &ToRtr::ud())?;
        apply(core.qp, &ToRts::ud(&core.config))?;
        Ok(Self { core })
    }

    /// Attributes a sender needs to address this queue pair, including its
    /// queue key.
    pub fn my_attr(&self) -> QpAttr {
        self.core.attr(self.core.config.qkey)
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

    pub fn bind_local_mr(&self, attr: RegAttr) {
        self.core.bind_local_mr(attr)
    }

    /// Sends one datagram to the queue pair described by `dest`.
    pub fn send_to(
        &self,
        dest: &QpAttr,
        desc: &ReqDesc,
        payload: &ReqPayload,
    ) -> Result<u64, QpError> {
        check_two_sided(desc.op)?;
        self.core.post(desc, payload, None, None, Some(ud_dest(dest)?))
    }

    /// Sends every datagram of `batch` to `dest` with one doorbell.
    pub fn send_doorbell_to(
        &self,
        dest: &QpAttr,
        batch: &DoorbellBatch,
    ) -> Result<Vec<u64>, QpError> {
        for (desc, _) in batch.iter() {
            check_two_sided(desc.op)?;
        }
        self.core.post_batch(batch, Some(ud_dest(dest)?))
    }

    pub fn wait_one_completion(&self, timeout: Duration) -> Result<IbvWc, QpError> {
        self.core.wait_one_completion(timeout)
    }

    /// Posts a receive buffer; it must leave room for the routing header.
    pub fn post_recv(&self, addr: u64, len: u32, lkey: u32, wr_id: u64) -> Result<(), QpError> {
        self.core.post_recv(addr, len, lkey, wr_id)
    }

    pub fn poll_recv(&self) -> Result<Option<IbvWc>, QpError> {
        self.core.poll_recv()
    }

    /// Posts the next `num` entries of `entries`; each must leave room for
    /// the routing header.
    pub fn post_recvs(&self, entries: &mut RecvEntries, num: usize) -> Result<(), QpError> {
        self.core.post_recvs(entries, num)
    }

    /// Drains the datagrams received so far into `entries`.
    pub fn recv_iter<'a>(&'a self, entries: &'a mut RecvEntries) -> Result<RecvIter<'a>, QpError> {
        RecvIter::new(&self.core, entries)
    }
}

fn check_two_sided(op: RdmaOperation) -> Result<(), QpError> {
    match op {
        RdmaOperation::Send | RdmaOperation::SendWithImm => Ok(()),
        op => Err(QpError::InvalidOperation(op)),
    }
}

fn ud_dest(dest: &QpAttr) -> Result<verbs::UdDest, QpError> {
    Ok(verbs::UdDest {
        dlid: narrow(dest.lid, "lid")?,
        remote_qpn: narrow(dest.qpn, "qpn")?,
        remote_qkey: narrow(dest.qkey, "qkey")?,
    })
}
