/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/*
 * Sections of code adapted from
 * Copyright (c) 2016 Jon Gjengset under MIT License (MIT)
*/

//! This file contains primitive data structures for interacting with ibverbs.
//!
//! Primitives:
//! - `Gid`, `RAddress`: link layer addressing of a port.
//! - `DevIdx`: a (device, port) pair naming one NIC port on this host.
//! - `RdmaDevice`, `RdmaPort`: what the verbs provider reports about a device.
//! - `QpConfig`: verbs parameters of a queue pair. It crosses the wire when a
//!   client asks a remote daemon to create a queue pair on its behalf.
//! - `QpAttr`: everything a peer needs to drive its queue pair into RTR
//!   against ours.
//! - `RegAttr`: the `(address, size, key)` triple of a memory registration.
//! - `RdmaOperation`: the opcode of a posted work request.
//! - `IbvWc`: wrapper around a work completion.
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::verbs;

#[derive(
    Default,
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    serde::Serialize,
    serde::Deserialize
)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    pub fn subnet_prefix(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.raw[..8]);
        u64::from_be_bytes(prefix)
    }

    pub fn interface_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.raw[8..]);
        u64::from_be_bytes(id)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Self { raw }
    }
}

impl From<RAddress> for Gid {
    fn from(addr: RAddress) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&addr.subnet_prefix.to_be_bytes());
        raw[8..].copy_from_slice(&addr.interface_id.to_be_bytes());
        Self { raw }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_gid(&self.raw))
    }
}

/// Link layer address of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RAddress {
    pub subnet_prefix: u64,
    pub interface_id: u64,
    pub local_id: u32,
}

impl_wire!(RAddress {
    subnet_prefix: u64,
    interface_id: u64,
    local_id: u32,
});

impl RAddress {
    pub fn new(gid: Gid, local_id: u32) -> Self {
        Self {
            subnet_prefix: gid.subnet_prefix(),
            interface_id: gid.interface_id(),
            local_id,
        }
    }

    pub fn gid(&self) -> Gid {
        Gid::from(*self)
    }
}

/// Identifies one port of one device on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevIdx {
    pub dev_id: usize,
    pub port_id: u8,
}

impl fmt::Display for DevIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{dev_id: {}, port_id: {}}}", self.dev_id, self.port_id)
    }
}

/// Represents the verbs parameters of one queue pair.
///
/// The same struct configures RC and UD queue pairs; UD ignores the
/// connection-oriented fields. It is a wire struct so that a client can
/// describe the queue pair it wants a remote daemon to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpConfig {
    /// `access_flags` - Access permitted to the remote side (`verbs::AccessFlags` bits).
    pub access_flags: u32,
    /// `max_send_size` - Maximum outstanding send work requests; sizes the send completion queue.
    pub max_send_size: u32,
    /// `max_recv_size` - Maximum outstanding receive work requests.
    pub max_recv_size: u32,
    /// `max_rd_atomic` - Outstanding RDMA reads and atomics this side may issue.
    pub max_rd_atomic: u8,
    /// `max_dest_rd_atomic` - Outstanding RDMA reads and atomics this side accepts.
    pub max_dest_rd_atomic: u8,
    /// `psn` - Starting packet sequence number.
    pub psn: u32,
    /// `timeout` - Local ack timeout, 4.096 us * 2^timeout.
    pub timeout: u8,
    /// `retry_count` - Transport retries before reporting an error.
    pub retry_count: u8,
    /// `rnr_retry` - Receiver-not-ready retries before reporting an error.
    pub rnr_retry: u8,
    /// `min_rnr_timer` - Minimum RNR NAK timer.
    pub min_rnr_timer: u8,
    /// `path_mtu` - Path MTU in bytes.
    pub path_mtu: u32,
    /// `qkey` - Queue key of a UD queue pair.
    pub qkey: u32,
    /// `pkey_index` - Partition key index.
    pub pkey_index: u16,
    /// `gid_index` - Source GID index used when routing with a GRH.
    pub gid_index: u8,
}

impl_wire!(QpConfig {
    access_flags: u32,
    max_send_size: u32,
    max_recv_size: u32,
    max_rd_atomic: u8,
    max_dest_rd_atomic: u8,
    psn: u32,
    timeout: u8,
    retry_count: u8,
    rnr_retry: u8,
    min_rnr_timer: u8,
    path_mtu: u32,
    qkey: u32,
    pkey_index: u16,
    gid_index: u8,
});

/// Default queue pair parameters below are based on common values from
/// rdma-core examples.
impl Default for QpConfig {
    fn default() -> Self {
        let access = verbs::AccessFlags::LOCAL_WRITE
            | verbs::AccessFlags::REMOTE_WRITE
            | verbs::AccessFlags::REMOTE_READ
            | verbs::AccessFlags::REMOTE_ATOMIC;
        Self {
            access_flags: access.0,
            max_send_size: 128,
            max_recv_size: 2048,
            max_rd_atomic: 16,
            max_dest_rd_atomic: 16,
            psn: rand::random::<u32>() & 0xffffff,
            timeout: 14, // 4.096 us * 2^14 = ~67 ms
            retry_count: 7,
            rnr_retry: 7,
            min_rnr_timer: 12,
            path_mtu: 4096,
            qkey: 0x111111,
            pkey_index: 0,
            gid_index: 0,
        }
    }
}

impl QpConfig {
    pub fn access(&self) -> verbs::AccessFlags {
        verbs::AccessFlags(self.access_flags)
    }

    pub fn set_access_flags(mut self, flags: verbs::AccessFlags) -> Self {
        self.access_flags = flags.0;
        self
    }

    pub fn set_max_send(mut self, size: u32) -> Self {
        self.max_send_size = size;
        self
    }

    pub fn set_max_recv(mut self, size: u32) -> Self {
        self.max_recv_size = size;
        self
    }

    pub fn set_psn(mut self, psn: u32) -> Self {
        self.psn = psn & 0xffffff;
        self
    }

    pub fn set_qkey(mut self, qkey: u32) -> Self {
        self.qkey = qkey;
        self
    }
}

impl fmt::Display for QpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QpConfig {{ access_flags: 0x{:x}, max_send_size: {}, max_recv_size: {}, max_rd_atomic: {}, max_dest_rd_atomic: {}, psn: 0x{:x}, timeout: {}, retry_count: {}, rnr_retry: {}, min_rnr_timer: {}, path_mtu: {}, qkey: 0x{:x}, pkey_index: {}, gid_index: {} }}",
            self.access_flags,
            self.max_send_size,
            self.max_recv_size,
            self.max_rd_atomic,
            self.max_dest_rd_atomic,
            self.psn,
            self.timeout,
            self.retry_count,
            self.rnr_retry,
            self.min_rnr_timer,
            self.path_mtu,
            self.qkey,
            self.pkey_index,
            self.gid_index,
        )
    }
}

/// Contains information needed to establish a queue pair with a remote
/// endpoint. Captured once from a live queue pair and exchanged verbatim.
#[derive(Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpAttr {
    /// `addr` - Link layer address of the port the queue pair lives on
    pub addr: RAddress,
    /// `lid` - Local Identifier, used for addressing in InfiniBand subnet
    pub lid: u64,
    /// `psn` - Packet Sequence Number the queue pair starts sending with
    pub psn: u64,
    /// `port_id` - Physical port number
    pub port_id: u64,
    /// `qpn` - Queue Pair Number
    pub qpn: u64,
    /// `qkey` - Queue key, meaningful for UD only
    pub qkey: u64,
}

impl_wire!(QpAttr {
    addr: RAddress,
    lid: u64,
    psn: u64,
    port_id: u64,
    qpn: u64,
    qkey: u64,
});

impl fmt::Debug for QpAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QpAttr {{ qpn: {}, lid: {}, gid: {}, psn: 0x{:x}, port_id: {}, qkey: 0x{:x} }}",
            self.qpn,
            self.lid,
            self.addr.gid(),
            self.psn,
            self.port_id,
            self.qkey
        )
    }
}

/// The remotely usable description of a memory registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegAttr {
    /// `buf` - Virtual address of the first registered byte
    pub buf: u64,
    /// `size` - Registered length in bytes
    pub size: u64,
    /// `key` - Remote key (or local key, for a local binding)
    pub key: u32,
}

impl_wire!(RegAttr {
    buf: u64,
    size: u64,
    key: u32,
});

/// Represents an RDMA device in the system.
///
/// # Examples
///
/// ```
/// use rdma_control::get_all_devices;
///
/// let devices = get_all_devices();
/// if let Some(device) = devices.first() {
///     let device_name = device.name();
///     let guid = device.node_guid();
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaDevice {
    /// `name` - The name of the RDMA device (e.g., "rxe0").
    name: String,
    /// `dev_id` - Index of the device in the provider's device list.
    dev_id: usize,
    /// `node_guid` - Node GUID (Globally Unique Identifier) of the device.
    node_guid: u64,
    /// `ports` - Vector of ports available on this device.
    ports: Vec<RdmaPort>,
    /// `max_qp` - Maximum number of queue pairs supported.
    max_qp: u32,
    /// `max_qp_wr` - Maximum outstanding work requests per queue.
    max_qp_wr: u32,
}

impl RdmaDevice {
    pub fn name(&self) -> &String {
        &self.name
    }

    pub fn dev_id(&self) -> usize {
        self.dev_id
    }

    pub fn node_guid(&self) -> u64 {
        self.node_guid
    }

    pub fn ports(&self) -> &Vec<RdmaPort> {
        &self.ports
    }

    pub fn max_qp(&self) -> u32 {
        self.max_qp
    }

    pub fn max_qp_wr(&self) -> u32 {
        self.max_qp_wr
    }

    /// Returns the first device reported by the provider.
    pub fn first_available() -> Option<RdmaDevice> {
        get_all_devices().into_iter().next()
    }
}

/// Information about one port of an RDMA device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaPort {
    /// `port_num` - Port number (starting from 1)
    port_num: u8,
    /// `state` - Port state, e.g. "Active"
    state: String,
    /// `lid` - Local Identifier
    lid: u16,
    /// `gid` - Formatted GID at index 0
    gid: String,
    /// `active_mtu` - Active MTU in bytes
    active_mtu: u32,
}

impl RdmaPort {
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn is_active(&self) -> bool {
        self.state == "Active"
    }
}

impl fmt::Display for RdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "\tDevice ID:\t{}", self.dev_id)?;
        writeln!(f, "\tNode GUID:\t0x{:016x}", self.node_guid)?;
        writeln!(f, "\tMax QP:\t\t{}", self.max_qp)?;
        writeln!(f, "\tMax QP WR:\t{}", self.max_qp_wr)?;
        for port in &self.ports {
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl fmt::Display for RdmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tPort {}:", self.port_num)?;
        writeln!(f, "\t\tState:\t\t{}", self.state)?;
        writeln!(f, "\t\tLID:\t\t0x{:x}", self.lid)?;
        writeln!(f, "\t\tGID:\t\t{}", self.gid)?;
        writeln!(f, "\t\tActive MTU:\t{}", self.active_mtu)
    }
}

/// Formats a GID (Global Identifier) into a human-readable string.
///
/// # Arguments
///
/// * `gid` - A reference to a 16-byte array representing the GID.
///
/// # Returns
///
/// A formatted string representation of the GID.
pub fn format_gid(gid: &[u8; 16]) -> String {
    gid.chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Returns the names of all devices, in device id order.
pub fn query_dev_names() -> Vec<String> {
    verbs::get_device_list()
}

/// Returns every (device, port) pair on this host.
pub fn query_dev_idxs() -> Vec<DevIdx> {
    get_all_devices()
        .iter()
        .flat_map(|device| {
            device.ports().iter().map(|port| DevIdx {
                dev_id: device.dev_id(),
                port_id: port.port_num(),
            })
        })
        .collect()
}

/// Retrieves information about all available RDMA devices in the system.
///
/// Returns an empty vector if no devices are found. Devices that fail to
/// open are skipped with a warning.
pub fn get_all_devices() -> Vec<RdmaDevice> {
    let mut devices = Vec::new();
    for dev_id in 0..verbs::get_device_list().len() {
        match query_one_device(dev_id) {
            Ok(device) => devices.push(device),
            Err(e) => tracing::warn!("failed to query device {}: {}", dev_id, e),
        }
    }
    devices
}

fn query_one_device(dev_id: usize) -> Result<RdmaDevice, std::io::Error> {
    let attr = verbs::query_device(dev_id)?;
    let context = verbs::open_device(dev_id)?;
    let mut ports = Vec::new();
    let mut result = Ok(());
    for port_num in 1..=attr.phys_port_cnt {
        let port = verbs::query_port(context, port_num).and_then(|port_attr| {
            let gid = verbs::query_gid(context, port_num, 0)?;
            Ok(RdmaPort {
                port_num,
                state: match port_attr.state {
                    verbs::PortState::Active => "Active".to_string(),
                    verbs::PortState::Down => "Down".to_string(),
                },
                lid: port_attr.lid,
                gid: format_gid(&gid),
                active_mtu: port_attr.active_mtu,
            })
        });
        match port {
            Ok(port) => ports.push(port),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    verbs::close_device(context)?;
    result?;
    Ok(RdmaDevice {
        name: attr.name,
        dev_id,
        node_guid: attr.node_guid,
        ports,
        max_qp: attr.max_qp,
        max_qp_wr: attr.max_qp_wr,
    })
}

/// Represents the type of a posted work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RdmaOperation {
    /// RDMA write operations
    Write,
    WriteWithImm,
    /// RDMA read operation
    Read,
    /// Two-sided send, consuming a receive posted by the peer
    Send,
    SendWithImm,
    /// 8-byte remote atomics
    CompareAndSwap,
    FetchAndAdd,
}

impl From<RdmaOperation> for verbs::WrOpcode {
    fn from(op: RdmaOperation) -> Self {
        match op {
            RdmaOperation::Write => verbs::WrOpcode::RdmaWrite,
            RdmaOperation::WriteWithImm => verbs::WrOpcode::RdmaWriteWithImm,
            RdmaOperation::Read => verbs::WrOpcode::RdmaRead,
            RdmaOperation::Send => verbs::WrOpcode::Send,
            RdmaOperation::SendWithImm => verbs::WrOpcode::SendWithImm,
            RdmaOperation::CompareAndSwap => verbs::WrOpcode::AtomicCmpAndSwp,
            RdmaOperation::FetchAndAdd => verbs::WrOpcode::AtomicFetchAndAdd,
        }
    }
}

/// Wrapper around a verbs work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbvWc {
    /// `wr_id` - Work Request ID, used to identify the completed operation
    wr_id: u64,
    /// `len` - Length of the data transferred
    len: usize,
    /// `error` - Error status if the operation failed
    error: Option<verbs::WcStatus>,
    /// `opcode` - Type of operation that completed (read, write, etc.)
    opcode: verbs::WcOpcode,
    /// `imm_data` - Immediate data (if any)
    imm_data: Option<u32>,
    /// `qp_num` - Queue Pair Number
    qp_num: u32,
    /// `src_qp` - Source Queue Pair Number
    src_qp: u32,
}

impl From<verbs::Wc> for IbvWc {
    fn from(wc: verbs::Wc) -> Self {
        IbvWc {
            wr_id: wc.wr_id,
            len: wc.byte_len as usize,
            error: (wc.status != verbs::WcStatus::Success).then_some(wc.status),
            opcode: wc.opcode,
            imm_data: wc.imm_data,
            qp_num: wc.qp_num,
            src_qp: wc.src_qp,
        }
    }
}

impl IbvWc {
    /// Returns the Work Request ID associated with this work completion.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether this work completion reports success.
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<verbs::WcStatus> {
        self.error
    }

    pub fn opcode(&self) -> verbs::WcOpcode {
        self.opcode
    }

    pub fn imm_data(&self) -> Option<u32> {
        self.imm_data
    }

    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    pub fn src_qp(&self) -> u32 {
        self.src_qp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Wire;
    use crate::wire::dedump;
    use crate::wire::dump;

    #[test]
    fn test_get_all_devices() {
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let device = &devices[0];
        assert!(!device.name().is_empty(), "device name should not be empty");
        assert!(
            !device.ports().is_empty(),
            "device should have at least one port"
        );
        assert!(device.ports()[0].is_active());
        assert_eq!(query_dev_names().len(), devices.len());
        assert!(query_dev_idxs().contains(&DevIdx {
            dev_id: 0,
            port_id: 1
        }));
    }

    #[test]
    fn test_device_display() {
        if let Some(device) = RdmaDevice::first_available() {
            let display_output = format!("{}", device);
            assert!(
                display_output.contains(device.name()),
                "display should include device name"
            );
            assert!(display_output.contains("Active"));
        }
    }

    #[test]
    fn test_format_gid() {
        let gid = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];

        let formatted = format_gid(&gid);
        assert_eq!(formatted, "1234:5678:9abc:def0:1122:3344:5566:7788");
    }

    #[test]
    fn test_gid_address_conversion() {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[15] = 0x07;
        let gid = Gid::from(raw);
        assert_eq!(gid.subnet_prefix(), 0xfe80_0000_0000_0000);
        assert_eq!(gid.interface_id(), 7);

        let addr = RAddress::new(gid, 0x11);
        assert_eq!(addr.gid(), gid);
        assert_eq!(addr.local_id, 0x11);
    }

    #[test]
    fn test_wire_sizes() {
        assert_eq!(RAddress::SIZE, 20);
        assert_eq!(QpAttr::SIZE, 20 + 5 * 8);
        assert_eq!(RegAttr::SIZE, 20);
        assert_eq!(QpConfig::SIZE, 33);
    }

    #[test]
    fn test_qp_attr_round_trip() {
        let attr = QpAttr {
            addr: RAddress {
                subnet_prefix: 1,
                interface_id: 2,
                local_id: 3,
            },
            lid: 4,
            psn: 5,
            port_id: 1,
            qpn: 0x100,
            qkey: 0,
        };
        assert_eq!(dedump::<QpAttr>(&dump(&attr)), Some(attr));
        let debug_str = format!("{:?}", attr);
        assert!(debug_str.contains("qpn: 256"));
        assert!(debug_str.contains("psn: 0x5"));
    }

    #[test]
    fn test_qp_config_defaults() {
        let config = QpConfig::default();
        assert!(config.psn <= 0xffffff);
        assert!(config.access().contains(verbs::AccessFlags::REMOTE_WRITE));
        assert_eq!(dedump::<QpConfig>(&dump(&config)), Some(config));
        assert_eq!(QpConfig::default().set_psn(0x1234_5678).psn, 0x34_5678);
    }

    #[test]
    fn test_rdma_operation_conversion() {
        assert_eq!(
            verbs::WrOpcode::RdmaWrite,
            verbs::WrOpcode::from(RdmaOperation::Write)
        );
        assert_eq!(
            verbs::WrOpcode::RdmaRead,
            verbs::WrOpcode::from(RdmaOperation::Read)
        );
        assert_eq!(
            verbs::WrOpcode::AtomicCmpAndSwp,
            verbs::WrOpcode::from(RdmaOperation::CompareAndSwap)
        );
    }

    #[test]
    fn test_ibv_wc() {
        let wc = verbs::Wc {
            wr_id: 42,
            status: verbs::WcStatus::Success,
            opcode: verbs::WcOpcode::RdmaWrite,
            byte_len: 8,
            imm_data: None,
            qp_num: 0x100,
            src_qp: 0,
            slid: 0,
        };
        let ibv_wc = IbvWc::from(wc);
        assert_eq!(ibv_wc.wr_id(), 42);
        assert!(ibv_wc.is_valid());

        let failed = IbvWc::from(verbs::Wc {
            status: verbs::WcStatus::RemAccessErr,
            ..wc
        });
        assert!(!failed.is_valid());
        assert_eq!(failed.error(), Some(verbs::WcStatus::RemAccessErr));
    }
}
