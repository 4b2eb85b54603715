/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A small RPC layer over the bootstrap channels.
//!
//! [`RpcClient`] issues one call at a time and blocks on its reply.
//! [`RpcHandler`] serves calls from a [`RecvChannel`]: every buffered call is
//! dispatched to the handler registered for its id and answered, and a call
//! that cannot be decoded or whose handler fails is answered with
//! [`CallStatus::Nop`] without affecting the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use bytes::Bytes;

use crate::IoCode;
use crate::channel::ChannelError;
use crate::channel::RecvChannel;
use crate::channel::SendChannel;
use crate::multi_msg::MAX_MSG_SZ;
use crate::multi_msg::MultiMessage;
use crate::proto::CallStatus;
use crate::proto::ProtoError;
use crate::proto::RpcId;
use crate::proto::decode_replies;
use crate::proto::decode_requests;
use crate::proto::encode_replies;
use crate::proto::encode_requests;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("msg too large: {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("call was not served")]
    Nop,
    #[error("wrong reply: {0}")]
    WrongReply(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl RpcError {
    pub fn code(&self) -> IoCode {
        match self {
            RpcError::Channel(e) => e.code(),
            _ => IoCode::Err,
        }
    }
}

/// Encodes a call or reply: a one-byte head followed by the body.
fn frame(head: u8, body: &[u8]) -> Option<Bytes> {
    let mut msg = MultiMessage::new();
    if msg.append(&[head]) && msg.append(body) {
        Some(msg.to_bytes())
    } else {
        None
    }
}

/// Splits a frame into its head byte and body. A frame with only a head
/// has no body.
fn unframe(raw: &[u8]) -> Option<(u8, Option<Bytes>)> {
    let msg = MultiMessage::from_bytes(raw)?;
    let head = msg.query_one(0).filter(|head| head.len() == 1)?[0];
    Some((head, msg.query_one(1)))
}

/// The calling side of the protocol.
#[derive(Debug)]
pub struct RpcClient {
    channel: SendChannel,
}

impl RpcClient {
    pub fn new(addr: &str) -> Result<Self, RpcError> {
        Ok(Self {
            channel: SendChannel::create(addr)?,
        })
    }

    /// Sends call `id` with `param`. The parameter must fit one message
    /// entry.
    ///
    /// Replies still buffered from earlier calls that timed out are
    /// discarded first so they are not taken for the reply to this call.
    pub fn call(&self, id: u8, param: &[u8]) -> Result<(), RpcError> {
        let size = 1 + param.len();
        if size > MAX_MSG_SZ {
            return Err(RpcError::TooLarge(size));
        }
        let msg = frame(id, param).ok_or(RpcError::TooLarge(size))?;
        let stale = self.channel.drain();
        if stale > 0 {
            tracing::debug!("discarded {} stale replies", stale);
        }
        self.channel.send(&msg)?;
        Ok(())
    }

    /// Waits up to `timeout` for the reply to the last call and returns its
    /// body.
    pub fn receive_reply(&self, timeout: Duration) -> Result<Bytes, RpcError> {
        let raw = self.channel.recv(timeout)?;
        let (status, body) =
            unframe(&raw).ok_or_else(|| RpcError::WrongReply("malformed reply".to_string()))?;
        match CallStatus::try_from(status) {
            Ok(CallStatus::Ok) => Ok(body.unwrap_or_default()),
            Ok(CallStatus::Nop) => Err(RpcError::Nop),
            Ok(CallStatus::WrongReply) | Err(_) => Err(RpcError::WrongReply(format!(
                "unexpected call status {}",
                status
            ))),
        }
    }

    /// Sends up to [`crate::proto::MAX_BATCH_SZ`] requests in one envelope and
    /// returns one reply per request, in order. A request whose handler
    /// failed gets an empty reply.
    pub fn call_batch(
        &self,
        reqs: &[(u8, Bytes)],
        timeout: Duration,
    ) -> Result<Vec<Bytes>, RpcError> {
        let envelope = encode_requests(reqs)?;
        self.call(RpcId::Batch.into(), &envelope)?;
        let reply = self.receive_reply(timeout)?;
        let replies = decode_replies(&reply).map_err(|e| RpcError::WrongReply(e.to_string()))?;
        if replies.len() != reqs.len() {
            return Err(RpcError::WrongReply(format!(
                "expected {} replies, got {}",
                reqs.len(),
                replies.len()
            )));
        }
        Ok(replies)
    }
}

/// A handler maps a call parameter to a reply body.
pub type Handler = Arc<dyn Fn(&[u8]) -> Result<Bytes, anyhow::Error> + Send + Sync>;

/// Handlers by RPC id. Shared between the serving thread and whoever
/// registers handlers.
#[derive(Default)]
pub struct RpcFactory {
    handlers: Mutex<HashMap<u8, Handler>>,
}

impl std::fmt::Debug for RpcFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<u8> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        f.debug_struct("RpcFactory").field("ids", &ids).finish()
    }
}

impl RpcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `id`. Returns `false` without replacing
    /// anything if `id` already has a handler or is reserved for batches.
    pub fn register_handler<F>(&self, id: u8, handler: F) -> bool
    where
        F: Fn(&[u8]) -> Result<Bytes, anyhow::Error> + Send + Sync + 'static,
    {
        if id == u8::from(RpcId::Batch) {
            return false;
        }
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&id) {
            return false;
        }
        handlers.insert(id, Arc::new(handler));
        true
    }

    /// Runs the handler for `id`.
    pub fn call_one(&self, id: u8, param: &[u8]) -> Result<Bytes, anyhow::Error> {
        if id == u8::from(RpcId::Batch) {
            return self.call_batch(param);
        }
        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no handler for rpc {}", id))?;
        handler(param)
    }

    fn call_batch(&self, envelope: &[u8]) -> Result<Bytes, anyhow::Error> {
        let reqs = decode_requests(envelope)?;
        let replies: Vec<Bytes> = reqs
            .iter()
            .map(|(ty, payload)| {
                let result = match u8::try_from(*ty) {
                    Ok(id) if id != u8::from(RpcId::Batch) => self.call_one(id, payload),
                    _ => Err(anyhow::anyhow!("invalid batched rpc {}", ty)),
                };
                result.unwrap_or_else(|e| {
                    tracing::warn!("batched rpc {} failed: {}", ty, e);
                    Bytes::new()
                })
            })
            .collect();
        Ok(encode_replies(&replies)?)
    }
}

/// The serving side of the protocol.
#[derive(Debug)]
pub struct RpcHandler {
    channel: RecvChannel,
    factory: Arc<RpcFactory>,
}

impl RpcHandler {
    /// Listens on `port` with no handlers registered.
    pub fn new(port: u16) -> Result<Self, RpcError> {
        Self::with_factory(port, Arc::new(RpcFactory::new()))
    }

    pub fn with_factory(port: u16, factory: Arc<RpcFactory>) -> Result<Self, RpcError> {
        Ok(Self {
            channel: RecvChannel::create(port)?,
            factory,
        })
    }

    pub fn local_port(&self) -> Result<u16, RpcError> {
        Ok(self.channel.local_port()?)
    }

    pub fn factory(&self) -> &Arc<RpcFactory> {
        &self.factory
    }

    pub fn register_handler<F>(&self, id: u8, handler: F) -> bool
    where
        F: Fn(&[u8]) -> Result<Bytes, anyhow::Error> + Send + Sync + 'static,
    {
        self.factory.register_handler(id, handler)
    }

    /// Serves every call that is already buffered, without waiting, and
    /// returns how many were served.
    pub fn run_one_event_loop(&mut self) -> usize {
        let mut count = 0;
        self.channel.start(Duration::ZERO);
        while self.channel.has_msg() {
            self.serve_cur();
            count += 1;
            self.channel.next();
        }
        count
    }

    fn serve_cur(&self) {
        let Some(msg) = self.channel.cur() else {
            return;
        };
        let reply = match self.dispatch(msg) {
            Ok(body) => frame(CallStatus::Ok as u8, &body).unwrap_or_else(|| {
                tracing::warn!("reply of {} bytes does not fit a message", body.len());
                nop_reply()
            }),
            Err(e) => {
                tracing::warn!(
                    "failed to serve call from {:?}: {}",
                    self.channel.cur_from(),
                    e
                );
                nop_reply()
            }
        };
        if let Err(e) = self.channel.reply_cur(&reply) {
            tracing::warn!("failed to send reply: {}", e);
        }
    }

    fn dispatch(&self, msg: &[u8]) -> Result<Bytes, anyhow::Error> {
        let (id, param) = unframe(msg).ok_or_else(|| anyhow::anyhow!("malformed call"))?;
        let param = param.ok_or_else(|| anyhow::anyhow!("call {} has no parameter", id))?;
        tracing::debug!("serving rpc {} with {} byte parameter", id, param.len());
        self.factory.call_one(id, &param)
    }
}

fn nop_reply() -> Bytes {
    let mut msg = MultiMessage::new();
    msg.append(&[CallStatus::Nop as u8]);
    msg.to_bytes()
}
