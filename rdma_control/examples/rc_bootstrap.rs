/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bootstraps an RC connection through a control daemon and writes over it.
//!
//! Both sides run in this process on the soft fabric: the server exposes a
//! NIC and a memory region through its daemon, the client asks the daemon to
//! create a queue pair for it, connects its own, and writes into the
//! server's region.
//!
//! ```text
//! cargo run --example rc_bootstrap -- [port]
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rdma_control::ConnectManager;
use rdma_control::ControlDaemon;
use rdma_control::DevIdx;
use rdma_control::QpConfig;
use rdma_control::RcQueuePair;
use rdma_control::RdmaDomain;
use rdma_control::RdmaMemoryRegion;
use rdma_control::RdmaOperation;
use rdma_control::ReqDesc;
use rdma_control::ReqPayload;

const MR_ID: u64 = 1;
const QP_ID: u64 = 2;
const NIC_ID: u64 = 0;

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("port must be a number")?,
        None => 8888,
    };

    // Server.
    let server_nic = Arc::new(RdmaDomain::new(DevIdx {
        dev_id: 1,
        port_id: 1,
    })?);
    let server_mr = Arc::new(RdmaMemoryRegion::new(server_nic.clone(), 4096)?);
    let mut daemon = ControlDaemon::new(port)?;
    daemon.nics().register(NIC_ID, server_nic)?;
    daemon.mrs().register(MR_ID, server_mr.clone())?;
    let handle = daemon.start()?;

    // Client.
    let client_nic = Arc::new(RdmaDomain::new(DevIdx {
        dev_id: 0,
        port_id: 1,
    })?);
    let cm = ConnectManager::new(&format!("localhost:{}", port))?;
    cm.wait_ready(Duration::from_secs(1), 3)
        .context("cm connect to server timeout")?;

    let qp = RcQueuePair::create(client_nic.clone(), QpConfig::default())?;
    let key = cm.cc_rc(QP_ID, &qp, NIC_ID, &QpConfig::default(), true)?;
    let remote = cm.fetch_remote_mr(MR_ID)?;
    tracing::info!("connected qp {} to the server; remote region {:?}", qp.qp_num(), remote);

    let local = RdmaMemoryRegion::new(client_nic, 4096)?;
    qp.bind_local_mr(local.local_attr().context("local region deregistered")?);
    qp.bind_remote_mr(remote);

    let msg = b"hello from the client";
    local.buffer().write_bytes(0, msg);
    qp.send_normal(
        &ReqDesc {
            op: RdmaOperation::Write,
            signaled: true,
            len: msg.len() as u32,
            tag: 0,
        },
        &ReqPayload {
            local_addr: local.buffer().addr(),
            ..Default::default()
        },
    )?;
    qp.wait_one_completion(Duration::from_secs(1))?;
    let written = server_mr
        .buffer()
        .read_bytes(0, msg.len())
        .context("read past the server region")?;
    tracing::info!("server region now holds {:?}", String::from_utf8_lossy(&written));

    cm.delete_remote_rc(QP_ID, key)?;
    let served = handle.stop();
    tracing::info!("daemon served {} calls", served);
    Ok(())
}
