/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Client side of the bootstrap protocol.
//!
//! A [`ConnectManager`] talks to the [`crate::ControlDaemon`] of one remote
//! host. The daemon must be started and its handlers registered before any
//! call; until then every call times out.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rdma_control::ConnectManager;
//!
//! # fn main() -> Result<(), anyhow::Error> {
//! let cm = ConnectManager::new("localhost:1111")?;
//! cm.wait_ready(Duration::from_secs(1), 3)?;
//! let attr = cm.fetch_remote_mr(1)?;
//! println!("remote region at {:#x}, {} bytes", attr.buf, attr.size);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use bytes::Bytes;

use crate::IoCode;
use crate::config;
use crate::ibverbs_primitives::QpConfig;
use crate::ibverbs_primitives::RegAttr;
use crate::proto::CallbackStatus;
use crate::proto::DeleteReply;
use crate::proto::DeleteReq;
use crate::proto::MrReply;
use crate::proto::MrReq;
use crate::proto::RcReply;
use crate::proto::RcReq;
use crate::proto::RpcId;
use crate::queue_pair::QpError;
use crate::queue_pair::RcQueuePair;
use crate::rpc::RpcClient;
use crate::rpc::RpcError;
use crate::wire::dedump;
use crate::wire::dump;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("retry exceeds num: {retries} attempts of {timeout:?} each")]
    RetryExceeded { retries: usize, timeout: Duration },
    #[error("failed to decode {0} reply")]
    Decode(&'static str),
    #[error("remote returned {status:?} for id {id}")]
    Remote { id: u64, status: CallbackStatus },
    #[error("remote returned unknown status {0}")]
    UnknownStatus(u8),
    #[error(transparent)]
    Qp(#[from] QpError),
}

impl ConnectError {
    pub fn code(&self) -> IoCode {
        match self {
            ConnectError::Rpc(e) => e.code(),
            ConnectError::RetryExceeded { .. } => IoCode::Timeout,
            ConnectError::Remote {
                status: CallbackStatus::NotFound,
                ..
            } => IoCode::NotReady,
            ConnectError::Qp(e) => e.code(),
            _ => IoCode::Err,
        }
    }
}

fn check_status(id: u64, status: u8) -> Result<(), ConnectError> {
    match CallbackStatus::try_from(status) {
        Ok(CallbackStatus::Ok) => Ok(()),
        Ok(status) => Err(ConnectError::Remote { id, status }),
        Err(unknown) => Err(ConnectError::UnknownStatus(unknown)),
    }
}

fn decode_mr_reply(id: u64, raw: &[u8]) -> Result<RegAttr, ConnectError> {
    let reply = dedump::<MrReply>(raw).ok_or(ConnectError::Decode("fetch mr"))?;
    check_status(id, reply.status)?;
    Ok(reply.attr)
}

/// A connection to one remote control daemon.
///
/// Calls are issued one at a time; each blocks until its reply arrives or
/// the timeout elapses.
#[derive(Debug)]
pub struct ConnectManager {
    rpc: RpcClient,
    timeout: Duration,
}

impl ConnectManager {
    /// Resolves `addr` (`"host:port"`). Replies are awaited for the
    /// configured RPC timeout.
    pub fn new(addr: &str) -> Result<Self, ConnectError> {
        Ok(Self {
            rpc: RpcClient::new(addr)?,
            timeout: config::global::rpc_timeout(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probes the daemon with heartbeats until one is answered.
    ///
    /// Up to `retry` attempts are made, each waiting `timeout` for its
    /// reply. Only timeouts are retried; any other failure is returned at
    /// once.
    pub fn wait_ready(&self, timeout: Duration, retry: usize) -> Result<(), ConnectError> {
        for attempt in 1..=retry {
            self.rpc.call(RpcId::Heartbeat.into(), b"0")?;
            match self.rpc.receive_reply(timeout) {
                Ok(_) => {
                    tracing::debug!("remote ready after {} heartbeats", attempt);
                    return Ok(());
                }
                Err(e) if e.code() == IoCode::Timeout => {
                    tracing::debug!("heartbeat {} of {} timed out", attempt, retry);
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!("remote not ready after {} heartbeats", retry);
        Err(ConnectError::RetryExceeded {
            retries: retry,
            timeout,
        })
    }

    /// Fetches the attributes of the remote memory region registered under
    /// `id`. An unregistered id fails with [`IoCode::NotReady`].
    pub fn fetch_remote_mr(&self, id: u64) -> Result<RegAttr, ConnectError> {
        self.rpc.call(RpcId::FetchMr.into(), &dump(&MrReq { id }))?;
        let reply = self.rpc.receive_reply(self.timeout)?;
        decode_mr_reply(id, &reply)
    }

    /// Fetches several remote memory regions in one round trip. The outer
    /// result fails only if the batch as a whole does; each id gets its own
    /// result.
    pub fn fetch_remote_mrs(
        &self,
        ids: &[u64],
    ) -> Result<Vec<Result<RegAttr, ConnectError>>, ConnectError> {
        let reqs: Vec<(u8, Bytes)> = ids
            .iter()
            .map(|id| (RpcId::FetchMr.into(), dump(&MrReq { id: *id })))
            .collect();
        let replies = self.rpc.call_batch(&reqs, self.timeout)?;
        Ok(ids
            .iter()
            .zip(replies)
            .map(|(id, reply)| decode_mr_reply(*id, &reply))
            .collect())
    }

    /// Connects `qp` to a remote RC queue pair and returns the key that
    /// authorizes deleting the remote one.
    ///
    /// With `create` set the daemon opens a new queue pair on its NIC
    /// `nic_id` with `config` and registers it under `id`; otherwise the
    /// daemon uses the queue pair already registered under `id`. Either
    /// way the remote side is connected to `qp` first, then `qp` is
    /// connected to the attributes returned. If that last step fails the
    /// remote queue pair is deleted before the error is returned.
    pub fn cc_rc(
        &self,
        id: u64,
        qp: &RcQueuePair,
        nic_id: u64,
        config: &QpConfig,
        create: bool,
    ) -> Result<u64, ConnectError> {
        let req = RcReq {
            id,
            nic_id,
            whether_create: u8::from(create),
            config: *config,
            attr: qp.my_attr(),
        };
        self.rpc.call(RpcId::CreateRc.into(), &dump(&req))?;
        let raw = self.rpc.receive_reply(self.timeout)?;
        let reply = dedump::<RcReply>(&raw).ok_or(ConnectError::Decode("create rc"))?;
        check_status(id, reply.status)?;
        if let Err(e) = qp.connect(&reply.attr) {
            // The remote queue pair points at one that will never come up.
            tracing::warn!("failed to connect qp {} for id {}: {}", qp.qp_num(), id, e);
            if let Err(delete) = self.delete_remote_rc(id, reply.key) {
                tracing::warn!("failed to release remote qp {}: {}", id, delete);
            }
            return Err(e.into());
        }
        tracing::debug!(
            "qp {} connected to remote qp {} (id {})",
            qp.qp_num(),
            reply.attr.qpn,
            id
        );
        Ok(reply.key)
    }

    /// Asks the daemon to tear down the queue pair registered under `id`.
    /// `key` must be the one [`ConnectManager::cc_rc`] returned.
    pub fn delete_remote_rc(&self, id: u64, key: u64) -> Result<(), ConnectError> {
        self.rpc
            .call(RpcId::DeleteRc.into(), &dump(&DeleteReq { id, key }))?;
        let raw = self.rpc.receive_reply(self.timeout)?;
        let reply = dedump::<DeleteReply>(&raw).ok_or(ConnectError::Decode("delete rc"))?;
        check_status(id, reply.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ConnectError::Remote {
                id: 1,
                status: CallbackStatus::NotFound
            }
            .code(),
            IoCode::NotReady
        );
        assert_eq!(
            ConnectError::Remote {
                id: 1,
                status: CallbackStatus::AuthErr
            }
            .code(),
            IoCode::Err
        );
        assert_eq!(
            ConnectError::RetryExceeded {
                retries: 1,
                timeout: Duration::from_millis(1)
            }
            .code(),
            IoCode::Timeout
        );
        assert_eq!(ConnectError::Decode("x").code(), IoCode::Err);
    }

    #[test]
    fn test_decode_mr_reply() {
        let attr = RegAttr {
            buf: 0x1000,
            size: 64,
            key: 9,
        };
        let ok = dump(&MrReply { status: 0, attr });
        assert_eq!(decode_mr_reply(1, &ok).unwrap(), attr);

        let missing = dump(&MrReply {
            status: CallbackStatus::NotFound.into(),
            attr: RegAttr::default(),
        });
        assert_eq!(
            decode_mr_reply(1, &missing).unwrap_err().code(),
            IoCode::NotReady
        );
        assert!(matches!(
            decode_mr_reply(1, &ok[..3]),
            Err(ConnectError::Decode(_))
        ));
        assert!(matches!(
            decode_mr_reply(1, &dump(&MrReply { status: 77, attr })),
            Err(ConnectError::UnknownStatus(77))
        ));
    }
}
