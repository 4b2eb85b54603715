/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Receive buffers for two-sided messaging.
//!
//! [`RecvEntries`] is a ring of fixed-size buffers carved out of registered
//! memory by a [`RecvAllocator`]. Post it with `post_recvs`, then drain
//! arrivals with a [`RecvIter`], which posts the consumed entries again
//! when it is dropped.
//!
//! ```ignore
//! let mut alloc = SimpleAllocator::new(mr.local_attr()?);
//! let mut entries = RecvEntries::create(&mut alloc, 64, 4096)?;
//! qp.post_recvs(&mut entries, 64)?;
//! for msg in qp.recv_iter(&mut entries)? {
//!     handle(msg.imm_data, msg.addr, msg.len);
//! }
//! ```

use super::QpCore;
use super::QpError;
use crate::ibverbs_primitives::IbvWc;
use crate::ibverbs_primitives::RegAttr;
use crate::verbs;

/// Hands out receive buffers as `(address, local key)`.
pub trait RecvAllocator {
    /// Returns a buffer of `size` bytes, or `None` when memory runs out.
    fn alloc_one(&mut self, size: u32) -> Option<(u64, u32)>;
}

/// Bump allocator over one registered region.
#[derive(Debug, Clone)]
pub struct SimpleAllocator {
    next: u64,
    remaining: u64,
    lkey: u32,
}

impl SimpleAllocator {
    /// `attr` must carry the local key of the region.
    pub fn new(attr: RegAttr) -> Self {
        Self {
            next: attr.buf,
            remaining: attr.size,
            lkey: attr.key,
        }
    }
}

impl RecvAllocator for SimpleAllocator {
    fn alloc_one(&mut self, size: u32) -> Option<(u64, u32)> {
        let size = u64::from(size);
        if self.remaining < size {
            return None;
        }
        let addr = self.next;
        self.next += size;
        self.remaining -= size;
        Some((addr, self.lkey))
    }
}

/// A ring of receive buffers and the position of the next one to post.
#[derive(Debug, Clone)]
pub struct RecvEntries {
    sges: Vec<verbs::Sge>,
    header: usize,
}

impl RecvEntries {
    /// Allocates `entries` buffers of `entry_size` bytes each.
    pub fn create<A: RecvAllocator>(
        alloc: &mut A,
        entries: usize,
        entry_size: u32,
    ) -> Result<Self, QpError> {
        let mut sges = Vec::with_capacity(entries);
        for _ in 0..entries {
            let (addr, lkey) = alloc
                .alloc_one(entry_size)
                .ok_or(QpError::OutOfRecvBuffers(sges.len()))?;
            sges.push(verbs::Sge {
                addr,
                length: entry_size,
                lkey,
            });
        }
        Ok(Self { sges, header: 0 })
    }

    pub fn len(&self) -> usize {
        self.sges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sges.is_empty()
    }

    /// Index of the next entry to post.
    pub fn header(&self) -> usize {
        self.header
    }

    pub(super) fn header_sge(&self) -> verbs::Sge {
        self.sges[self.header]
    }

    pub(super) fn advance(&mut self) {
        self.header = (self.header + 1) % self.sges.len();
    }
}

/// One received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMsg {
    pub imm_data: Option<u32>,
    /// Address of the receive buffer. UD buffers start with
    /// [`verbs::GRH_SIZE`] bytes of routing header.
    pub addr: u64,
    /// Bytes written into the buffer.
    pub len: usize,
}

/// Messages that had arrived when the iterator was created.
///
/// Dropping the iterator posts as many entries as completions it took off
/// the receive queue, so the ring stays full.
pub struct RecvIter<'a> {
    core: &'a QpCore,
    entries: &'a mut RecvEntries,
    wcs: std::vec::IntoIter<IbvWc>,
    polled: usize,
}

impl<'a> RecvIter<'a> {
    pub(super) fn new(core: &'a QpCore, entries: &'a mut RecvEntries) -> Result<Self, QpError> {
        let mut wcs = Vec::new();
        while wcs.len() < entries.len() {
            match core.poll_recv()? {
                Some(wc) => wcs.push(wc),
                None => break,
            }
        }
        let polled = wcs.len();
        Ok(Self {
            core,
            entries,
            wcs: wcs.into_iter(),
            polled,
        })
    }
}

impl Iterator for RecvIter<'_> {
    type Item = RecvMsg;

    fn next(&mut self) -> Option<RecvMsg> {
        for wc in self.wcs.by_ref() {
            if let Some(status) = wc.error() {
                tracing::warn!(
                    "receive 0x{:x} on qp {} completed with {:?}",
                    wc.wr_id(),
                    self.core.qp_num(),
                    status
                );
                continue;
            }
            return Some(RecvMsg {
                imm_data: wc.imm_data(),
                addr: wc.wr_id(),
                len: wc.len(),
            });
        }
        None
    }
}

impl Drop for RecvIter<'_> {
    fn drop(&mut self) {
        if self.polled == 0 {
            return;
        }
        if let Err(e) = self.core.post_recvs(self.entries, self.polled) {
            tracing::warn!(
                "failed to post {} receives on qp {}: {}",
                self.polled,
                self.core.qp_num(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_allocator_bumps_until_full() {
        let mut alloc = SimpleAllocator::new(RegAttr {
            buf: 0x1000,
            size: 96,
            key: 7,
        });
        assert_eq!(alloc.alloc_one(64), Some((0x1000, 7)));
        assert_eq!(alloc.alloc_one(32), Some((0x1040, 7)));
        assert_eq!(alloc.alloc_one(1), None);
    }

    #[test]
    fn test_entries_report_shortfall() {
        let mut alloc = SimpleAllocator::new(RegAttr {
            buf: 0x1000,
            size: 100,
            key: 1,
        });
        let err = RecvEntries::create(&mut alloc, 4, 32).unwrap_err();
        assert!(matches!(err, QpError::OutOfRecvBuffers(3)));
    }

    #[test]
    fn test_entries_ring_wraps() {
        let mut alloc = SimpleAllocator::new(RegAttr {
            buf: 0x1000,
            size: 4096,
            key: 1,
        });
        let mut entries = RecvEntries::create(&mut alloc, 3, 64).unwrap();
        assert_eq!(entries.len(), 3);
        for expected in [0x1000, 0x1040, 0x1080, 0x1000] {
            assert_eq!(entries.header_sge().addr, expected);
            entries.advance();
        }
        assert_eq!(entries.header(), 1);
    }
}
