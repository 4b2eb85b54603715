/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Datagram channels used before any RDMA path exists.
//!
//! A [`SendChannel`] talks to one destination and waits for replies on its
//! own ephemeral port. A [`RecvChannel`] listens on a fixed port and keeps at
//! most one received message buffered together with its sender, so that
//! the message can be answered with [`RecvChannel::reply_cur`].
//!
//! Neither channel is internally synchronized; each is owned by a single
//! caller.
//!
//! Timeouts are `Duration`s with microsecond resolution; `Duration::MAX`
//! waits without a deadline.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;

use crate::IoCode;
use crate::multi_msg::MAX_MSG_SZ;

/// Errors that occur while using a channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to resolve {addr}: {reason}")]
    Resolve { addr: String, reason: String },
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no message within {0:?}")]
    Timeout(Duration),
    #[error("message of {0} bytes exceeds the {MAX_MSG_SZ} byte limit")]
    TooLarge(usize),
    #[error("no current message to reply to")]
    NoMessage,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn code(&self) -> IoCode {
        match self {
            ChannelError::Timeout(_) => IoCode::Timeout,
            _ => IoCode::Err,
        }
    }
}

static NAME_CACHE: LazyLock<Mutex<HashMap<String, SocketAddr>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Resolves `"host:port"` to an IPv4 socket address. Results are cached
/// for the lifetime of the process.
pub fn resolve(addr: &str) -> Result<SocketAddr, ChannelError> {
    if let Some(cached) = NAME_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(addr)
    {
        return Ok(*cached);
    }
    let resolved = addr
        .to_socket_addrs()
        .map_err(|e| ChannelError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ChannelError::Resolve {
            addr: addr.to_string(),
            reason: "no IPv4 address".to_string(),
        })?;
    NAME_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(addr.to_string(), resolved);
    Ok(resolved)
}

fn udp_socket(port: u16) -> Result<UdpSocket, ChannelError> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket
        .bind(&addr.into())
        .map_err(|source| ChannelError::Bind { port, source })?;
    Ok(socket.into())
}

/// Waits until `socket` is readable or `timeout` elapses. Returns whether it
/// became readable.
fn wait_readable(socket: &UdpSocket, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let wait_ms = match deadline {
            None => -1,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                i32::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(i32::MAX)
            }
        };
        let mut fd = libc::pollfd {
            fd: socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: `fd` is a valid pollfd and the count matches.
        let ret = unsafe { libc::poll(&mut fd, 1, wait_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

/// Performs one receive after waiting up to `timeout` for readiness.
fn recv_one(socket: &UdpSocket, timeout: Duration) -> Result<(Bytes, SocketAddr), ChannelError> {
    if !wait_readable(socket, timeout)? {
        return Err(ChannelError::Timeout(timeout));
    }
    let mut buf = vec![0u8; MAX_MSG_SZ];
    match socket.recv_from(&mut buf) {
        Ok((n, from)) => {
            buf.truncate(n);
            Ok((Bytes::from(buf), from))
        }
        // Readable but already drained, e.g. a datagram dropped for a bad
        // checksum.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ChannelError::Timeout(timeout)),
        Err(e) => Err(e.into()),
    }
}

/// A channel to one destination.
#[derive(Debug)]
pub struct SendChannel {
    socket: UdpSocket,
    dest: SocketAddr,
}

impl SendChannel {
    /// Resolves `addr` and opens a non-blocking socket for it. No
    /// handshake takes place; the destination is only recorded.
    pub fn create(addr: &str) -> Result<Self, ChannelError> {
        let dest = resolve(addr)?;
        let socket = udp_socket(0)?;
        Ok(Self { socket, dest })
    }

    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    pub fn send(&self, msg: &[u8]) -> Result<(), ChannelError> {
        if msg.len() > MAX_MSG_SZ {
            return Err(ChannelError::TooLarge(msg.len()));
        }
        self.socket.send_to(msg, self.dest)?;
        Ok(())
    }

    /// Waits up to `timeout` for one datagram.
    pub fn recv(&self, timeout: Duration) -> Result<Bytes, ChannelError> {
        recv_one(&self.socket, timeout).map(|(msg, _)| msg)
    }

    /// Discards every datagram that is already buffered, e.g. late replies
    /// to calls that timed out. Returns how many were discarded.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while recv_one(&self.socket, Duration::ZERO).is_ok() {
            count += 1;
        }
        count
    }
}

/// A listening channel holding at most one unconsumed message.
#[derive(Debug)]
pub struct RecvChannel {
    socket: UdpSocket,
    cur: Option<(Bytes, SocketAddr)>,
}

impl RecvChannel {
    /// Binds `0.0.0.0:port`. Port 0 picks an ephemeral port.
    pub fn create(port: u16) -> Result<Self, ChannelError> {
        Ok(Self {
            socket: udp_socket(port)?,
            cur: None,
        })
    }

    pub fn local_port(&self) -> Result<u16, ChannelError> {
        Ok(self.socket.local_addr()?.port())
    }

    fn fetch(&mut self, timeout: Duration) {
        match recv_one(&self.socket, timeout) {
            Ok(msg) => self.cur = Some(msg),
            Err(ChannelError::Timeout(_)) => {}
            Err(e) => tracing::debug!("receive failed: {}", e),
        }
    }

    /// Receives one message, waiting up to `timeout`, unless one is already
    /// buffered.
    pub fn start(&mut self, timeout: Duration) {
        if self.cur.is_none() {
            self.fetch(timeout);
        }
    }

    pub fn has_msg(&self) -> bool {
        self.cur.is_some()
    }

    pub fn cur(&self) -> Option<&Bytes> {
        self.cur.as_ref().map(|(msg, _)| msg)
    }

    /// Sender of the current message.
    pub fn cur_from(&self) -> Option<SocketAddr> {
        self.cur.as_ref().map(|(_, from)| *from)
    }

    /// Drops the current message and fetches the next one without waiting.
    pub fn next(&mut self) {
        self.cur = None;
        self.fetch(Duration::ZERO);
    }

    /// Sends `reply` to the sender of the current message.
    pub fn reply_cur(&self, reply: &[u8]) -> Result<(), ChannelError> {
        let (_, from) = self.cur.as_ref().ok_or(ChannelError::NoMessage)?;
        if reply.len() > MAX_MSG_SZ {
            return Err(ChannelError::TooLarge(reply.len()));
        }
        self.socket.send_to(reply, from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let addr = resolve("localhost:8888").unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8888);
        // Served from the cache the second time.
        assert_eq!(resolve("localhost:8888").unwrap(), addr);
        assert!(matches!(
            resolve("no port here"),
            Err(ChannelError::Resolve { .. })
        ));
    }

    #[test]
    fn test_send_recv_reply() {
        let mut server = RecvChannel::create(0).unwrap();
        let port = server.local_port().unwrap();
        let client = SendChannel::create(&format!("127.0.0.1:{}", port)).unwrap();

        server.start(Duration::ZERO);
        assert!(!server.has_msg());
        assert!(matches!(server.reply_cur(b"x"), Err(ChannelError::NoMessage)));

        client.send(b"first").unwrap();
        client.send(b"second").unwrap();
        server.start(Duration::from_secs(1));
        assert_eq!(server.cur().map(|m| &m[..]), Some(&b"first"[..]));
        // start() keeps an unconsumed message.
        server.start(Duration::ZERO);
        assert_eq!(server.cur().map(|m| &m[..]), Some(&b"first"[..]));
        server.reply_cur(b"ack").unwrap();

        let mut seen = None;
        for _ in 0..100 {
            server.next();
            if server.has_msg() {
                seen = server.cur().cloned();
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(seen.as_deref(), Some(&b"second"[..]));

        assert_eq!(&client.recv(Duration::from_secs(1)).unwrap()[..], b"ack");
        assert_eq!(client.drain(), 0);
    }

    #[test]
    fn test_recv_timeout() {
        let server = RecvChannel::create(0).unwrap();
        let port = server.local_port().unwrap();
        let client = SendChannel::create(&format!("127.0.0.1:{}", port)).unwrap();
        let start = Instant::now();
        let err = client.recv(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.code(), IoCode::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_bind_conflict() {
        let server = RecvChannel::create(0).unwrap();
        let port = server.local_port().unwrap();
        assert!(matches!(
            RecvChannel::create(port),
            Err(ChannelError::Bind { .. })
        ));
    }

    #[test]
    fn test_too_large() {
        let client = SendChannel::create("127.0.0.1:9").unwrap();
        let msg = vec![0u8; MAX_MSG_SZ + 1];
        assert!(matches!(
            client.send(&msg),
            Err(ChannelError::TooLarge(n)) if n == MAX_MSG_SZ + 1
        ));
    }
}
