/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use crate::ConnectManager;
use crate::ControlDaemon;
use crate::DaemonHandle;
use crate::DevIdx;
use crate::RdmaDomain;

/// Set up a tracing subscriber with a filter, so we can print tracing logs
/// with >= level while running tests.
///
/// Only the first call in a test binary installs the subscriber; later calls
/// are no-ops.
pub fn set_tracing_env_filter(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level.as_str()))
        .with_test_writer()
        .try_init();
}

/// Returns a UDP port that was free a moment ago.
pub fn free_udp_port() -> Result<u16, anyhow::Error> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

pub fn open_domain(dev_id: usize) -> Result<Arc<RdmaDomain>, anyhow::Error> {
    Ok(Arc::new(RdmaDomain::new(DevIdx { dev_id, port_id: 1 })?))
}

/// A started daemon and a connect manager pointed at it.
pub struct DaemonEnv {
    pub daemon: ControlDaemon,
    pub handle: DaemonHandle,
    pub cm: ConnectManager,
}

impl DaemonEnv {
    pub fn setup() -> Result<Self, anyhow::Error> {
        set_tracing_env_filter(Level::INFO);
        let mut daemon = ControlDaemon::new(free_udp_port()?)?;
        let handle = daemon.start()?;
        let cm = connect_to(daemon.port())?;
        Ok(Self { daemon, handle, cm })
    }

    /// Another connect manager for the same daemon, on its own socket.
    pub fn client(&self) -> Result<ConnectManager, anyhow::Error> {
        connect_to(self.daemon.port())
    }
}

fn connect_to(port: u16) -> Result<ConnectManager, anyhow::Error> {
    Ok(ConnectManager::new(&format!("localhost:{}", port))?.with_timeout(Duration::from_secs(2)))
}
