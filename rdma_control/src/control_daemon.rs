/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Server side of the bootstrap protocol.
//!
//! A [`ControlDaemon`] owns the registries through which local memory
//! regions, NICs and queue pairs are exposed to remote peers, and serves
//! the built-in RPCs on a background thread:
//!
//! * `Heartbeat`: answers with an empty reply.
//! * `FetchMr`: [`MrReq`] to [`MrReply`].
//! * `CreateRc`: [`RcReq`] to [`RcReply`], connecting a daemon-side RC queue
//!   pair to the caller's.
//! * `DeleteRc`: [`DeleteReq`] to [`DeleteReply`], authorized by the key
//!   issued by `CreateRc`.
//!
//! Registries and handlers remain usable from other threads while the
//! daemon runs.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;

use crate::IoCode;
use crate::config;
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
use crate::registry::DeregisterError;
use crate::registry::MrRegistry;
use crate::registry::NicRegistry;
use crate::registry::QpRegistry;
use crate::registry::RegistryError;
use crate::rpc::RpcError;
use crate::rpc::RpcFactory;
use crate::rpc::RpcHandler;
use crate::wire::dedump;
use crate::wire::dump;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("control daemon is already started")]
    AlreadyStarted,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("failed to spawn the control daemon thread: {0}")]
    Spawn(#[source] io::Error),
}

impl DaemonError {
    pub fn code(&self) -> IoCode {
        match self {
            DaemonError::Rpc(e) => e.code(),
            _ => IoCode::Err,
        }
    }
}

fn fetch_mr(mrs: &MrRegistry, param: &[u8]) -> Bytes {
    let reply = match dedump::<MrReq>(param) {
        None => MrReply {
            status: CallbackStatus::WrongArg.into(),
            ..Default::default()
        },
        Some(req) => match mrs.get_attr_by_id(req.id) {
            Some(attr) => MrReply {
                status: CallbackStatus::Ok.into(),
                attr,
            },
            None => MrReply {
                status: CallbackStatus::NotFound.into(),
                ..Default::default()
            },
        },
    };
    dump(&reply)
}

fn rc_status(status: CallbackStatus) -> RcReply {
    RcReply {
        status: status.into(),
        ..Default::default()
    }
}

/// Status answering a failed connect. The reply never carries the key.
fn connect_failure(id: u64, e: &QpError) -> RcReply {
    match e {
        QpError::InvalidAttr(_) => {
            tracing::warn!("rejected attributes for qp {}: {}", id, e);
            rc_status(CallbackStatus::WrongArg)
        }
        QpError::AlreadyConnected { .. } => {
            tracing::warn!("qp {} belongs to another requester: {}", id, e);
            rc_status(CallbackStatus::ConnectErr)
        }
        _ => {
            tracing::error!("failed to connect qp {}: {}", id, e);
            rc_status(CallbackStatus::ConnectErr)
        }
    }
}

/// Connects the queue pair registered under `req.id` to the caller. A queue
/// pair already connected to someone else is refused without its key.
fn connect_registered(qps: &QpRegistry, req: &RcReq) -> RcReply {
    let Some((qp, key)) = qps.query_with_key(req.id) else {
        return rc_status(CallbackStatus::NotFound);
    };
    if let Err(e) = qp.connect(&req.attr) {
        return connect_failure(req.id, &e);
    }
    RcReply {
        status: CallbackStatus::Ok.into(),
        attr: qp.my_attr(),
        key,
    }
}

/// Opens a queue pair on NIC `req.nic_id`, connects it to the caller and
/// registers it under `req.id`. A repeated request for an id that already
/// exists is answered from the existing queue pair, but only when it comes
/// from the peer that queue pair is connected to.
fn create_and_connect(nics: &NicRegistry, qps: &QpRegistry, req: &RcReq) -> RcReply {
    if qps.query(req.id).is_some() {
        tracing::debug!("qp {} already exists", req.id);
        return connect_registered(qps, req);
    }
    let Some(nic) = nics.query(req.nic_id) else {
        return rc_status(CallbackStatus::NotFound);
    };
    let qp = match RcQueuePair::create(nic, req.config) {
        Ok(qp) => qp,
        Err(e) => {
            tracing::error!("failed to create qp {}: {}", req.id, e);
            return rc_status(CallbackStatus::Err);
        }
    };
    if let Err(e) = qp.connect(&req.attr) {
        return connect_failure(req.id, &e);
    }
    let attr = qp.my_attr();
    match qps.register(req.id, Arc::new(qp)) {
        Ok(key) => RcReply {
            status: CallbackStatus::Ok.into(),
            attr,
            key,
        },
        // Lost a race with another registration of the same id.
        Err(RegistryError::Duplicate(_)) => connect_registered(qps, req),
        Err(RegistryError::Invalid) => rc_status(CallbackStatus::Err),
    }
}

fn create_rc(nics: &NicRegistry, qps: &QpRegistry, param: &[u8]) -> Bytes {
    let reply = match dedump::<RcReq>(param) {
        None => rc_status(CallbackStatus::WrongArg),
        Some(req) if req.whether_create != 0 => create_and_connect(nics, qps, &req),
        Some(req) => connect_registered(qps, &req),
    };
    dump(&reply)
}

fn delete_rc(qps: &QpRegistry, param: &[u8]) -> Bytes {
    let status = match dedump::<DeleteReq>(param) {
        None => CallbackStatus::WrongArg,
        Some(req) => match qps.deregister(req.id, req.key) {
            Ok(_) => {
                tracing::debug!("deleted qp {}", req.id);
                CallbackStatus::Ok
            }
            Err(DeregisterError::NotFound(_)) => CallbackStatus::NotFound,
            Err(DeregisterError::AuthFailed(_)) => CallbackStatus::AuthErr,
        },
    };
    dump(&DeleteReply {
        status: status.into(),
    })
}

/// Registries plus the RPC responder serving them.
#[derive(Debug)]
pub struct ControlDaemon {
    mrs: Arc<MrRegistry>,
    nics: Arc<NicRegistry>,
    qps: Arc<QpRegistry>,
    factory: Arc<RpcFactory>,
    handler: Option<RpcHandler>,
    port: u16,
}

impl ControlDaemon {
    /// Binds the responder to `port` (0 picks an ephemeral one) and
    /// registers the built-in handlers. Nothing is served until
    /// [`ControlDaemon::start`].
    pub fn new(port: u16) -> Result<Self, DaemonError> {
        let factory = Arc::new(RpcFactory::new());
        let handler = RpcHandler::with_factory(port, factory.clone())?;
        let port = handler.local_port()?;
        let daemon = Self {
            mrs: Arc::new(MrRegistry::new()),
            nics: Arc::new(NicRegistry::new()),
            qps: Arc::new(QpRegistry::new()),
            factory,
            handler: Some(handler),
            port,
        };
        daemon.register_builtin_handlers();
        Ok(daemon)
    }

    fn register_builtin_handlers(&self) {
        self.factory
            .register_handler(RpcId::Heartbeat.into(), |_| Ok(Bytes::new()));

        let mrs = self.mrs.clone();
        self.factory
            .register_handler(RpcId::FetchMr.into(), move |param| Ok(fetch_mr(&mrs, param)));

        let nics = self.nics.clone();
        let qps = self.qps.clone();
        self.factory.register_handler(RpcId::CreateRc.into(), move |param| {
            Ok(create_rc(&nics, &qps, param))
        });

        let qps = self.qps.clone();
        self.factory
            .register_handler(RpcId::DeleteRc.into(), move |param| Ok(delete_rc(&qps, param)));
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn mrs(&self) -> &Arc<MrRegistry> {
        &self.mrs
    }

    pub fn nics(&self) -> &Arc<NicRegistry> {
        &self.nics
    }

    pub fn qps(&self) -> &Arc<QpRegistry> {
        &self.qps
    }

    /// Registers an application handler. Returns `false` if `id` is taken,
    /// including by the built-in handlers.
    pub fn register_handler<F>(&self, id: u8, handler: F) -> bool
    where
        F: Fn(&[u8]) -> Result<Bytes, anyhow::Error> + Send + Sync + 'static,
    {
        self.factory.register_handler(id, handler)
    }

    /// Starts serving on a background thread.
    ///
    /// The thread polls without blocking. After a sweep that served nothing
    /// it sleeps for the configured idle backoff, if any. The daemon can be
    /// started once.
    pub fn start(&mut self) -> Result<DaemonHandle, DaemonError> {
        let mut handler = self.handler.take().ok_or(DaemonError::AlreadyStarted)?;
        let backoff = config::global::daemon_idle_backoff();
        let running = Arc::new(AtomicBool::new(true));
        let port = self.port;

        let flag = running.clone();
        let spawned = thread::Builder::new()
            .name(format!("rdma-control-{}", port))
            .spawn(move || {
                let mut total = 0;
                while flag.load(Ordering::Acquire) {
                    let served = handler.run_one_event_loop();
                    total += served;
                    if served == 0 {
                        if let Some(backoff) = backoff {
                            thread::sleep(backoff);
                        }
                    }
                }
                tracing::info!(
                    "control daemon on port {} stopped after serving {} calls",
                    port,
                    total
                );
                total
            });
        let thread = spawned.map_err(DaemonError::Spawn)?;
        tracing::info!(
            "control daemon serving on port {} (idle backoff {:?})",
            port,
            backoff.unwrap_or(Duration::ZERO)
        );
        Ok(DaemonHandle {
            running,
            thread: Some(thread),
            port,
        })
    }
}

/// A running daemon thread. Dropping the handle stops it.
#[derive(Debug)]
pub struct DaemonHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<usize>>,
    port: u16,
}

impl DaemonHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the thread to exit and joins it. Returns the number of
    /// calls served.
    pub fn stop(mut self) -> usize {
        self.shutdown()
    }

    fn shutdown(&mut self) -> usize {
        self.running.store(false, Ordering::Release);
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(total)) => total,
            Some(Err(_)) => {
                tracing::error!("control daemon thread on port {} panicked", self.port);
                0
            }
            None => 0,
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, not(feature = "ibverbs")))]
mod tests {
    use super::*;
    use crate::DevIdx;
    use crate::QpConfig;
    use crate::RdmaDomain;
    use crate::RdmaMemoryRegion;

    fn domain(dev_id: usize) -> Arc<RdmaDomain> {
        Arc::new(
            RdmaDomain::new(DevIdx {
                dev_id,
                port_id: 1,
            })
            .unwrap(),
        )
    }

    fn rc_reply(raw: &[u8]) -> RcReply {
        dedump::<RcReply>(raw).unwrap()
    }

    #[test]
    fn test_fetch_mr_statuses() {
        let mrs = MrRegistry::new();
        let mr = Arc::new(RdmaMemoryRegion::new(domain(0), 128).unwrap());
        mrs.register(4, mr.clone()).unwrap();

        let found = dedump::<MrReply>(&fetch_mr(&mrs, &dump(&MrReq { id: 4 }))).unwrap();
        assert_eq!(found.status, u8::from(CallbackStatus::Ok));
        assert_eq!(Some(found.attr), mr.attr());

        let missing = dedump::<MrReply>(&fetch_mr(&mrs, &dump(&MrReq { id: 5 }))).unwrap();
        assert_eq!(missing.status, u8::from(CallbackStatus::NotFound));

        let garbage = dedump::<MrReply>(&fetch_mr(&mrs, b"xy")).unwrap();
        assert_eq!(garbage.status, u8::from(CallbackStatus::WrongArg));
    }

    #[test]
    fn test_create_rc_on_unknown_nic() {
        let nics = NicRegistry::new();
        let qps = QpRegistry::new();
        let client = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let req = RcReq {
            id: 1,
            nic_id: 42,
            whether_create: 1,
            config: QpConfig::default(),
            attr: client.my_attr(),
        };
        let reply = rc_reply(&create_rc(&nics, &qps, &dump(&req)));
        assert_eq!(reply.status, u8::from(CallbackStatus::NotFound));
        assert!(qps.ids().is_empty());
    }

    #[test]
    fn test_create_rc_is_idempotent() {
        let nics = NicRegistry::new();
        nics.register(0, domain(1)).unwrap();
        let qps = QpRegistry::new();
        let client = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let req = RcReq {
            id: 9,
            nic_id: 0,
            whether_create: 1,
            config: QpConfig::default(),
            attr: client.my_attr(),
        };

        let first = rc_reply(&create_rc(&nics, &qps, &dump(&req)));
        assert_eq!(first.status, u8::from(CallbackStatus::Ok));
        assert_ne!(first.key, 0);
        let again = rc_reply(&create_rc(&nics, &qps, &dump(&req)));
        assert_eq!(again.status, u8::from(CallbackStatus::Ok));
        assert_eq!(again.key, first.key);
        assert_eq!(again.attr.qpn, first.attr.qpn);
        assert_eq!(qps.ids(), vec![9]);
    }

    #[test]
    fn test_create_rc_refuses_other_requester() {
        let nics = NicRegistry::new();
        nics.register(0, domain(1)).unwrap();
        let qps = QpRegistry::new();
        let owner = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let intruder = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let req = |attr| RcReq {
            id: 9,
            nic_id: 0,
            whether_create: 1,
            config: QpConfig::default(),
            attr,
        };

        let first = rc_reply(&create_rc(&nics, &qps, &dump(&req(owner.my_attr()))));
        assert_eq!(first.status, u8::from(CallbackStatus::Ok));

        for whether_create in [1, 0] {
            let other = RcReq {
                whether_create,
                ..req(intruder.my_attr())
            };
            let reply = rc_reply(&create_rc(&nics, &qps, &dump(&other)));
            assert_eq!(reply.status, u8::from(CallbackStatus::ConnectErr));
            assert_eq!(reply.key, 0);
        }
        assert_eq!(qps.query_with_key(9).unwrap().1, first.key);
    }

    #[test]
    fn test_create_rc_rejects_wide_attr() {
        let nics = NicRegistry::new();
        nics.register(0, domain(1)).unwrap();
        let qps = QpRegistry::new();
        let client = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let mut attr = client.my_attr();
        attr.qpn = 1 << 40;
        let req = RcReq {
            id: 2,
            nic_id: 0,
            whether_create: 1,
            config: QpConfig::default(),
            attr,
        };
        let reply = rc_reply(&create_rc(&nics, &qps, &dump(&req)));
        assert_eq!(reply.status, u8::from(CallbackStatus::WrongArg));
        assert_eq!(reply.key, 0);
        assert!(qps.ids().is_empty());
    }

    #[test]
    fn test_create_rc_reports_failed_transition() {
        let nics = NicRegistry::new();
        nics.register(0, domain(1)).unwrap();
        let qps = QpRegistry::new();
        let client = RcQueuePair::create(domain(0), QpConfig::default()).unwrap();
        let req = RcReq {
            id: 3,
            nic_id: 0,
            whether_create: 1,
            config: QpConfig {
                path_mtu: 1000,
                ..Default::default()
            },
            attr: client.my_attr(),
        };
        let reply = rc_reply(&create_rc(&nics, &qps, &dump(&req)));
        assert_eq!(reply.status, u8::from(CallbackStatus::ConnectErr));
        assert_eq!(reply.key, 0);
        assert!(qps.ids().is_empty());
    }

    #[test]
    fn test_delete_rc_statuses() {
        let qps = QpRegistry::new();
        let qp = Arc::new(RcQueuePair::create(domain(0), QpConfig::default()).unwrap());
        let key = qps.register(3, qp).unwrap();
        let status = |id, key| {
            dedump::<DeleteReply>(&delete_rc(&qps, &dump(&DeleteReq { id, key })))
                .unwrap()
                .status
        };

        assert_eq!(
            status(3, key.wrapping_add(1)),
            u8::from(CallbackStatus::AuthErr)
        );
        assert_eq!(status(3, key), u8::from(CallbackStatus::Ok));
        assert_eq!(status(3, key), u8::from(CallbackStatus::NotFound));
        let garbage = dedump::<DeleteReply>(&delete_rc(&qps, b"")).unwrap();
        assert_eq!(garbage.status, u8::from(CallbackStatus::WrongArg));
    }

    #[test]
    fn test_start_once() {
        let mut daemon = ControlDaemon::new(0).unwrap();
        assert_ne!(daemon.port(), 0);
        assert!(!daemon.register_handler(RpcId::FetchMr.into(), |_| Ok(Bytes::new())));
        let handle = daemon.start().unwrap();
        assert!(handle.is_running());
        assert!(matches!(daemon.start(), Err(DaemonError::AlreadyStarted)));
        assert_eq!(handle.stop(), 0);
    }
}
