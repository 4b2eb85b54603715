/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registries exposing local resources to remote peers under numeric ids.
//!
//! Every registry serializes its operations under one mutex. Critical
//! sections only touch the map; validity checks that talk to the device run
//! before the lock is taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use rand::Rng;

use crate::IoCode;
use crate::ibverbs_primitives::RegAttr;
use crate::queue_pair::RcQueuePair;
use crate::rdma_components::RdmaDomain;
use crate::rdma_components::RdmaMemoryRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The id is taken; the existing entry is kept.
    #[error("id {0} is already registered")]
    Duplicate(u64),
    /// The resource failed to set up and cannot be exposed.
    #[error("invalid resource")]
    Invalid,
}

impl RegistryError {
    pub fn code(&self) -> IoCode {
        match self {
            RegistryError::Duplicate(_) => IoCode::NearOk,
            RegistryError::Invalid => IoCode::Err,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeregisterError {
    #[error("id {0} is not registered")]
    NotFound(u64),
    /// The key does not match the one issued at registration. The entry is
    /// left in place.
    #[error("wrong key for id {0}")]
    AuthFailed(u64),
}

impl DeregisterError {
    pub fn code(&self) -> IoCode {
        match self {
            DeregisterError::NotFound(_) => IoCode::NotReady,
            DeregisterError::AuthFailed(_) => IoCode::Err,
        }
    }
}

/// Thread-safe map from id to resource.
#[derive(Debug)]
pub struct Registry<T> {
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `value` under `id` unless `id` is taken.
    pub fn register(&self, id: u64, value: T) -> Result<(), RegistryError> {
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        entries.insert(id, value);
        Ok(())
    }

    pub fn query(&self, id: u64) -> Option<T> {
        self.entries().get(&id).cloned()
    }

    /// Removes and returns the entry under `id`.
    pub fn deregister(&self, id: u64) -> Option<T> {
        self.entries().remove(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Devices the daemon may open queue pairs on, keyed by NIC id.
pub type NicRegistry = Registry<Arc<RdmaDomain>>;

/// Memory regions remote peers may fetch attributes of.
#[derive(Debug, Default)]
pub struct MrRegistry {
    inner: Registry<Arc<RdmaMemoryRegion>>,
}

impl MrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `mr` under `id`. A region that is no longer registered with
    /// its device is rejected as invalid.
    pub fn register(&self, id: u64, mr: Arc<RdmaMemoryRegion>) -> Result<(), RegistryError> {
        if !mr.valid() {
            return Err(RegistryError::Invalid);
        }
        self.inner.register(id, mr)?;
        tracing::debug!("registered memory region {}", id);
        Ok(())
    }

    pub fn query(&self, id: u64) -> Option<Arc<RdmaMemoryRegion>> {
        self.inner.query(id)
    }

    pub fn deregister(&self, id: u64) -> Option<Arc<RdmaMemoryRegion>> {
        self.inner.deregister(id)
    }

    /// Remote attributes of the region under `id`.
    pub fn get_attr_by_id(&self, id: u64) -> Option<RegAttr> {
        self.inner.query(id).and_then(|mr| mr.attr())
    }

    pub fn ids(&self) -> Vec<u64> {
        self.inner.ids()
    }
}

/// Queue pairs remote peers may connect to and tear down.
///
/// Registration mints a random non-zero capability key; only a caller
/// presenting that key can deregister the entry.
#[derive(Debug, Default)]
pub struct QpRegistry {
    inner: Registry<(Arc<RcQueuePair>, u64)>,
}

impl QpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `qp` under `id` and returns its capability key.
    ///
    /// Registering a taken id returns [`RegistryError::Duplicate`], which
    /// callers treat as a soft conflict. A queue pair that failed or went
    /// to the error state is rejected as invalid.
    pub fn register(&self, id: u64, qp: Arc<RcQueuePair>) -> Result<u64, RegistryError> {
        if !qp.valid() {
            return Err(RegistryError::Invalid);
        }
        let key = rand::thread_rng().gen_range(1..=u64::MAX);
        self.inner.register(id, (qp, key))?;
        tracing::debug!("registered qp {}", id);
        Ok(key)
    }

    pub fn query(&self, id: u64) -> Option<Arc<RcQueuePair>> {
        self.inner.query(id).map(|(qp, _)| qp)
    }

    /// The queue pair under `id` along with its key. Only the daemon may
    /// hand keys out.
    pub(crate) fn query_with_key(&self, id: u64) -> Option<(Arc<RcQueuePair>, u64)> {
        self.inner.query(id)
    }

    /// Removes the queue pair under `id` if `key` is the one issued for it.
    pub fn deregister(&self, id: u64, key: u64) -> Result<Arc<RcQueuePair>, DeregisterError> {
        let mut entries = self.inner.entries();
        match entries.get(&id) {
            None => Err(DeregisterError::NotFound(id)),
            Some((_, stored)) if *stored != key => {
                tracing::warn!("rejected deregistration of qp {} with a wrong key", id);
                Err(DeregisterError::AuthFailed(id))
            }
            Some(_) => entries
                .remove(&id)
                .map(|(qp, _)| qp)
                .ok_or(DeregisterError::NotFound(id)),
        }
    }

    pub fn ids(&self) -> Vec<u64> {
        self.inner.ids()
    }
}
