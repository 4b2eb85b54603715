/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # RDMA Components
//!
//! This module provides the device-level RDMA building blocks every queue
//! pair and memory registration depends on.
//!
//! ## Core Components
//!
//! * `RdmaDomain` - An opened device port: context, protection domain and the
//!   addressing facts (LID, GID) peers need to reach it
//! * `MemoryBuffer` - A page-aligned, zeroed allocation that can be registered
//! * `RdmaMemoryRegion` - A buffer registered with a domain, producing the
//!   `RegAttr` a remote peer uses for one-sided operations
//!
//! ## Ownership
//!
//! Registrations and queue pairs hold an `Arc<RdmaDomain>`, so a domain
//! always outlives everything allocated from it. Dropping the last
//! reference releases the protection domain before the context.

use std::alloc::Layout;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::ibverbs_primitives::DevIdx;
use crate::ibverbs_primitives::Gid;
use crate::ibverbs_primitives::RAddress;
use crate::ibverbs_primitives::RegAttr;
use crate::verbs;

const PAGE_SIZE: usize = 4096;

/// Represents one opened device port.
///
/// `RdmaDomain` owns the device context and the protection domain that
/// queue pairs and memory regions are created in.
///
/// # Fields
///
/// * `context` - Device context
/// * `pd` - Protection domain
/// * `idx` - Which device and port this domain was opened on
/// * `lid` - Local identifier of the port
/// * `gid` - GID at `gid_index` in the port's GID table
pub struct RdmaDomain {
    context: verbs::Context,
    pd: verbs::Pd,
    idx: DevIdx,
    name: String,
    lid: u16,
    gid: Gid,
    gid_index: u8,
}

impl std::fmt::Debug for RdmaDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaDomain")
            .field("name", &self.name)
            .field("idx", &self.idx)
            .field("lid", &self.lid)
            .field("gid", &format!("{}", self.gid))
            .finish()
    }
}

impl Drop for RdmaDomain {
    fn drop(&mut self) {
        if let Err(e) = verbs::dealloc_pd(self.pd) {
            tracing::warn!("failed to deallocate protection domain of {}: {}", self.name, e);
        }
        if let Err(e) = verbs::close_device(self.context) {
            tracing::warn!("failed to close device {}: {}", self.name, e);
        }
    }
}

impl RdmaDomain {
    /// Opens the port named by `idx`, using GID index 0 for routing.
    ///
    /// # Errors
    ///
    /// This function may return errors if:
    /// * The device does not exist
    /// * The port does not exist or is not active
    /// * Protection domain allocation fails
    pub fn new(idx: DevIdx) -> Result<Self, anyhow::Error> {
        Self::with_gid_index(idx, 0)
    }

    /// Opens the port named by `idx`, advertising the GID at `gid_index`.
    pub fn with_gid_index(idx: DevIdx, gid_index: u8) -> Result<Self, anyhow::Error> {
        let name = verbs::get_device_list()
            .get(idx.dev_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("device {} not found", idx.dev_id))?;

        let context = verbs::open_device(idx.dev_id)
            .map_err(|e| anyhow::anyhow!("failed to create context: {}", e))?;

        let opened = (|| -> Result<_, anyhow::Error> {
            let port = verbs::query_port(context, idx.port_id)
                .map_err(|e| anyhow::anyhow!("failed to query port {}: {}", idx.port_id, e))?;
            if port.state != verbs::PortState::Active {
                anyhow::bail!("port {} of {} is not active", idx.port_id, name);
            }
            let gid = verbs::query_gid(context, idx.port_id, gid_index)
                .map_err(|e| anyhow::anyhow!("failed to query gid {}: {}", gid_index, e))?;
            let pd = verbs::alloc_pd(context).map_err(|e| {
                anyhow::anyhow!("failed to create protection domain (PD): {}", e)
            })?;
            Ok((port.lid, Gid::from(gid), pd))
        })();

        let (lid, gid, pd) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(close_err) = verbs::close_device(context) {
                    tracing::warn!("failed to close device {}: {}", name, close_err);
                }
                return Err(e);
            }
        };
        tracing::info!("using RDMA device: {} (port {}, lid 0x{:x})", name, idx.port_id, lid);

        Ok(RdmaDomain {
            context,
            pd,
            idx,
            name,
            lid,
            gid,
            gid_index,
        })
    }

    pub fn idx(&self) -> DevIdx {
        self.idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    /// Link layer address advertised to peers.
    pub fn addr(&self) -> RAddress {
        RAddress::new(self.gid, self.lid as u32)
    }

    pub(crate) fn context(&self) -> verbs::Context {
        self.context
    }

    pub(crate) fn pd(&self) -> verbs::Pd {
        self.pd
    }
}

/// A page-aligned, zero-initialized heap allocation.
///
/// The fabric reads and writes registered buffers on behalf of remote peers
/// at any time, so the buffer only exposes copying accessors and never hands
/// out references into its memory.
pub struct MemoryBuffer {
    ptr: *mut u8,
    layout: Layout,
    len: usize,
}

// SAFETY: MemoryBuffer exclusively owns its allocation and every access
// copies through raw pointers.
unsafe impl Send for MemoryBuffer {}
unsafe impl Sync for MemoryBuffer {}

impl std::fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("addr", &format!("0x{:x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBuffer {
    pub fn new(len: usize) -> Result<Self, anyhow::Error> {
        if len == 0 {
            anyhow::bail!("cannot allocate an empty buffer");
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            anyhow::bail!("failed to allocate {} bytes", len);
        }
        Ok(Self { ptr, layout, len })
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `len` bytes starting at `offset` out of the buffer.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        let mut out = vec![0u8; len];
        // SAFETY: `offset..end` is inside the allocation.
        unsafe {
            std::ptr::copy(self.ptr.add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }

    /// Copies `data` into the buffer at `offset`. Returns `false` when it
    /// does not fit.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> bool {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.len => {
                // SAFETY: `offset..end` is inside the allocation.
                unsafe {
                    std::ptr::copy(data.as_ptr(), self.ptr.add(offset), data.len());
                }
                true
            }
            _ => false,
        }
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.read_bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Some(u64::from_ne_bytes(raw))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> bool {
        self.write_bytes(offset, &value.to_ne_bytes())
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with `layout`.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// A buffer registered with an [`RdmaDomain`].
///
/// Registration happens at construction; a failed registration is a
/// construction error. The registration can later be released with
/// [`RdmaMemoryRegion::deregister`], after which the region reports itself
/// invalid and no longer produces attributes. The buffer itself is freed
/// only after the registration is gone.
pub struct RdmaMemoryRegion {
    buf: MemoryBuffer,
    domain: Arc<RdmaDomain>,
    mr: Mutex<Option<verbs::Mr>>,
}

impl std::fmt::Debug for RdmaMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaMemoryRegion")
            .field("buf", &self.buf)
            .field("domain", &self.domain.name())
            .field("attr", &self.attr())
            .finish()
    }
}

impl RdmaMemoryRegion {
    /// Allocates `size` bytes and registers them with local write, remote
    /// read, remote write and remote atomic access.
    pub fn new(domain: Arc<RdmaDomain>, size: usize) -> Result<Self, anyhow::Error> {
        Self::with_access(
            domain,
            size,
            verbs::AccessFlags::LOCAL_WRITE
                | verbs::AccessFlags::REMOTE_WRITE
                | verbs::AccessFlags::REMOTE_READ
                | verbs::AccessFlags::REMOTE_ATOMIC,
        )
    }

    pub fn with_access(
        domain: Arc<RdmaDomain>,
        size: usize,
        access: verbs::AccessFlags,
    ) -> Result<Self, anyhow::Error> {
        let buf = MemoryBuffer::new(size)?;
        // SAFETY: the registration is released in `deregister` or `drop`,
        // both of which run before `buf` is freed.
        let mr = unsafe { verbs::reg_mr(domain.pd(), buf.addr(), buf.len(), access) }
            .map_err(|e| anyhow::anyhow!("failed to register memory region (MR): {}", e))?;
        tracing::debug!(
            "registered {} bytes at 0x{:x} on {} (rkey 0x{:x})",
            size,
            buf.addr(),
            domain.name(),
            mr.rkey
        );
        Ok(Self {
            buf,
            domain,
            mr: Mutex::new(Some(mr)),
        })
    }

    fn mr(&self) -> Option<verbs::Mr> {
        *self.mr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the region is still registered.
    pub fn valid(&self) -> bool {
        self.mr().is_some()
    }

    /// Remotely usable attributes, carrying the remote key.
    pub fn attr(&self) -> Option<RegAttr> {
        self.mr().map(|mr| RegAttr {
            buf: self.buf.addr(),
            size: self.buf.len() as u64,
            key: mr.rkey,
        })
    }

    /// Locally usable attributes, carrying the local key.
    pub fn local_attr(&self) -> Option<RegAttr> {
        self.mr().map(|mr| RegAttr {
            buf: self.buf.addr(),
            size: self.buf.len() as u64,
            key: mr.lkey,
        })
    }

    pub fn buffer(&self) -> &MemoryBuffer {
        &self.buf
    }

    pub fn domain(&self) -> &Arc<RdmaDomain> {
        &self.domain
    }

    /// Releases the registration. Deregistering twice is a no-op.
    pub fn deregister(&self) -> Result<(), anyhow::Error> {
        let mr = self.mr.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mr) = mr {
            verbs::dereg_mr(mr)
                .map_err(|e| anyhow::anyhow!("failed to deregister memory region: {}", e))?;
        }
        Ok(())
    }
}

impl Drop for RdmaMemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.deregister() {
            tracing::warn!("{}", e);
        }
    }
}
