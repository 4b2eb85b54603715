/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use super::QpError;
use super::RcQueuePair;
use super::Resolved;
use crate::ibverbs_primitives::RdmaOperation;
use crate::verbs;

/// Builder for one one-sided request against a raw remote address, for
/// callers that manage addresses and keys themselves instead of binding
/// regions to the queue pair.
///
/// ```ignore
/// let mut op = Op::new();
/// op.set_rdma(remote.buf + 0xc, remote.key).set_read();
/// op.append_sge(local.buf, 8, local.key);
/// let wr_id = op.execute(&qp, true, 0)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Op {
    op: RdmaOperation,
    remote_addr: u64,
    rkey: u32,
    compare_add: u64,
    swap: u64,
    imm_data: Option<u32>,
    sge: Option<verbs::Sge>,
}

impl Default for Op {
    fn default() -> Self {
        Self::new()
    }
}

impl Op {
    /// A write with no target and no local buffer yet.
    pub fn new() -> Self {
        Self {
            op: RdmaOperation::Write,
            remote_addr: 0,
            rkey: 0,
            compare_add: 0,
            swap: 0,
            imm_data: None,
            sge: None,
        }
    }

    pub fn set_read(&mut self) -> &mut Self {
        self.op = RdmaOperation::Read;
        self
    }

    pub fn set_write(&mut self) -> &mut Self {
        self.op = RdmaOperation::Write;
        self
    }

    /// Remote address and key of a read or write.
    pub fn set_rdma(&mut self, remote_addr: u64, rkey: u32) -> &mut Self {
        self.remote_addr = remote_addr;
        self.rkey = rkey;
        self
    }

    /// Compare-and-swap of the 8 bytes at `remote_addr`.
    pub fn set_cas(&mut self, remote_addr: u64, compare: u64, swap: u64, rkey: u32) -> &mut Self {
        self.set_atomic(remote_addr, compare, swap, rkey);
        self.op = RdmaOperation::CompareAndSwap;
        self
    }

    /// Fetch-and-add of `add` to the 8 bytes at `remote_addr`.
    pub fn set_fetch_add(&mut self, remote_addr: u64, add: u64, rkey: u32) -> &mut Self {
        self.set_atomic(remote_addr, add, 0, rkey);
        self.op = RdmaOperation::FetchAndAdd;
        self
    }

    fn set_atomic(&mut self, remote_addr: u64, compare_add: u64, swap: u64, rkey: u32) {
        self.remote_addr = remote_addr;
        self.rkey = rkey;
        self.compare_add = compare_add;
        self.swap = swap;
        self.imm_data = None;
    }

    /// Carries `imm` with a write, turning it into a write with immediate.
    /// Ignored by reads and atomics.
    pub fn set_imm(&mut self, imm: u32) -> &mut Self {
        self.imm_data = Some(imm);
        self
    }

    /// Sets the local buffer. Returns `false` if one is already set; the
    /// device is opened with a single scatter/gather entry per request.
    pub fn append_sge(&mut self, addr: u64, length: u32, lkey: u32) -> bool {
        if self.sge.is_some() {
            return false;
        }
        self.sge = Some(verbs::Sge { addr, length, lkey });
        true
    }

    fn opcode(&self) -> RdmaOperation {
        match (self.op, self.imm_data) {
            (RdmaOperation::Write, Some(_)) => RdmaOperation::WriteWithImm,
            (op, _) => op,
        }
    }

    /// Posts the request on `qp` and returns its work request id. A
    /// signaled request counts towards the queue pair's progress like any
    /// other.
    pub fn execute(&self, qp: &RcQueuePair, signaled: bool, tag: u64) -> Result<u64, QpError> {
        let sge = self.sge.ok_or(QpError::NoMemoryRegion("local"))?;
        let op = self.opcode();
        let req = Resolved {
            op,
            signaled,
            tag,
            sge,
            remote_addr: self.remote_addr,
            rkey: self.rkey,
            imm_data: if op == RdmaOperation::WriteWithImm {
                self.imm_data
            } else {
                None
            },
            compare_add: self.compare_add,
            swap: self.swap,
            ud: None,
        };
        let ids = qp.core().post_resolved(std::slice::from_ref(&req))?;
        Ok(ids[0])
    }
}
