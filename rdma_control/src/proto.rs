/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages of the bootstrap protocol.
//!
//! An RPC call is a [`crate::multi_msg::MultiMessage`] with two entries, the
//! one-byte [`RpcId`] followed by the parameter struct. A reply mirrors it
//! with a one-byte [`CallStatus`] followed by the reply struct.
//!
//! Up to [`MAX_BATCH_SZ`] requests can travel together under
//! [`RpcId::Batch`] inside a request envelope:
//!
//! ```text
//! | ReqHeader { elems: [{ty: u16, payload: u16}; 4], total_reqs: u8 } | payload 0 | payload 1 | ...
//! | ReplyHeader { reply_sizes: [u16; 4], total_replies: u8 }           | reply 0   | reply 1   | ...
//! ```

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::IoCode;
use crate::ibverbs_primitives::QpAttr;
use crate::ibverbs_primitives::QpConfig;
use crate::ibverbs_primitives::RegAttr;
use crate::wire::Wire;

/// Maximum number of requests in one envelope.
pub const MAX_BATCH_SZ: usize = 4;

/// Reserved RPC ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RpcId {
    Heartbeat = 0,
    FetchMr = 1,
    CreateRc = 2,
    DeleteRc = 3,
    /// A request envelope carrying several requests.
    Batch = 4,
}

impl TryFrom<u8> for RpcId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(RpcId::Heartbeat),
            1 => Ok(RpcId::FetchMr),
            2 => Ok(RpcId::CreateRc),
            3 => Ok(RpcId::DeleteRc),
            4 => Ok(RpcId::Batch),
            other => Err(other),
        }
    }
}

impl From<RpcId> for u8 {
    fn from(id: RpcId) -> u8 {
        id as u8
    }
}

/// Transport-level outcome of one call, prefixed to every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallStatus {
    Ok = 0,
    /// The responder could not decode the call or the handler failed.
    Nop = 1,
    WrongReply = 2,
}

impl TryFrom<u8> for CallStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(CallStatus::Ok),
            1 => Ok(CallStatus::Nop),
            2 => Ok(CallStatus::WrongReply),
            other => Err(other),
        }
    }
}

/// Application-level outcome carried in reply structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallbackStatus {
    Ok = 0,
    Err = 1,
    NotFound = 2,
    WrongArg = 3,
    ConnectErr = 4,
    AuthErr = 5,
}

impl TryFrom<u8> for CallbackStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(CallbackStatus::Ok),
            1 => Ok(CallbackStatus::Err),
            2 => Ok(CallbackStatus::NotFound),
            3 => Ok(CallbackStatus::WrongArg),
            4 => Ok(CallbackStatus::ConnectErr),
            5 => Ok(CallbackStatus::AuthErr),
            other => Err(other),
        }
    }
}

impl From<CallbackStatus> for u8 {
    fn from(status: CallbackStatus) -> u8 {
        status as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("an envelope holds at most {MAX_BATCH_SZ} entries, got {0}")]
    TooManyEntries(usize),
    #[error("entry of {0} bytes does not fit a length field")]
    EntryTooLarge(usize),
    #[error("buffer of {got} bytes is shorter than the {needed} bytes it declares")]
    Truncated { needed: usize, got: usize },
}

impl ProtoError {
    pub fn code(&self) -> IoCode {
        IoCode::Err
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReqElem {
    ty: u16,
    payload: u16,
}

impl_wire!(ReqElem { ty: u16, payload: u16 });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqHeader {
    elems: [ReqElem; MAX_BATCH_SZ],
    total_reqs: u8,
}

impl_wire!(ReqHeader {
    elems: [ReqElem; MAX_BATCH_SZ],
    total_reqs: u8,
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyHeader {
    reply_sizes: [u16; MAX_BATCH_SZ],
    total_replies: u8,
}

impl_wire!(ReplyHeader {
    reply_sizes: [u16; MAX_BATCH_SZ],
    total_replies: u8,
});

fn entry_len(len: usize) -> Result<u16, ProtoError> {
    u16::try_from(len).map_err(|_| ProtoError::EntryTooLarge(len))
}

/// Splits `body` into consecutive slices of the given lengths.
fn split_body(body: &[u8], lens: &[usize]) -> Result<Vec<Bytes>, ProtoError> {
    let needed: usize = lens.iter().sum();
    if needed > body.len() {
        return Err(ProtoError::Truncated {
            needed,
            got: body.len(),
        });
    }
    let mut offset = 0;
    Ok(lens
        .iter()
        .map(|len| {
            let slice = Bytes::copy_from_slice(&body[offset..offset + len]);
            offset += len;
            slice
        })
        .collect())
}

/// Encodes `(type, payload)` requests into a request envelope.
pub fn encode_requests(reqs: &[(u8, Bytes)]) -> Result<Bytes, ProtoError> {
    if reqs.len() > MAX_BATCH_SZ {
        return Err(ProtoError::TooManyEntries(reqs.len()));
    }
    let mut header = ReqHeader {
        total_reqs: reqs.len() as u8,
        ..Default::default()
    };
    for (elem, (ty, payload)) in header.elems.iter_mut().zip(reqs) {
        *elem = ReqElem {
            ty: *ty as u16,
            payload: entry_len(payload.len())?,
        };
    }
    let mut buf = BytesMut::with_capacity(ReqHeader::SIZE);
    header.encode(&mut buf);
    for (_, payload) in reqs {
        buf.put_slice(payload);
    }
    Ok(buf.freeze())
}

/// Decodes a request envelope. Declared lengths are checked against the
/// buffer; trailing bytes are ignored.
pub fn decode_requests(buf: &[u8]) -> Result<Vec<(u16, Bytes)>, ProtoError> {
    let header = crate::wire::dedump::<ReqHeader>(buf).ok_or(ProtoError::Truncated {
        needed: ReqHeader::SIZE,
        got: buf.len(),
    })?;
    let total = header.total_reqs as usize;
    if total > MAX_BATCH_SZ {
        return Err(ProtoError::TooManyEntries(total));
    }
    let elems = &header.elems[..total];
    let lens: Vec<usize> = elems.iter().map(|e| e.payload as usize).collect();
    let payloads = split_body(&buf[ReqHeader::SIZE..], &lens)?;
    Ok(elems.iter().map(|e| e.ty).zip(payloads).collect())
}

/// Encodes one reply per request into a reply envelope.
pub fn encode_replies(replies: &[Bytes]) -> Result<Bytes, ProtoError> {
    if replies.len() > MAX_BATCH_SZ {
        return Err(ProtoError::TooManyEntries(replies.len()));
    }
    let mut header = ReplyHeader {
        total_replies: replies.len() as u8,
        ..Default::default()
    };
    for (size, reply) in header.reply_sizes.iter_mut().zip(replies) {
        *size = entry_len(reply.len())?;
    }
    let mut buf = BytesMut::with_capacity(ReplyHeader::SIZE);
    header.encode(&mut buf);
    for reply in replies {
        buf.put_slice(reply);
    }
    Ok(buf.freeze())
}

pub fn decode_replies(buf: &[u8]) -> Result<Vec<Bytes>, ProtoError> {
    let header = crate::wire::dedump::<ReplyHeader>(buf).ok_or(ProtoError::Truncated {
        needed: ReplyHeader::SIZE,
        got: buf.len(),
    })?;
    let total = header.total_replies as usize;
    if total > MAX_BATCH_SZ {
        return Err(ProtoError::TooManyEntries(total));
    }
    let lens: Vec<usize> = header.reply_sizes[..total]
        .iter()
        .map(|s| *s as usize)
        .collect();
    split_body(&buf[ReplyHeader::SIZE..], &lens)
}

/// Asks for the attributes of the memory region registered under `id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MrReq {
    pub id: u64,
}

impl_wire!(MrReq { id: u64 });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MrReply {
    pub status: u8,
    pub attr: RegAttr,
}

impl_wire!(MrReply {
    status: u8,
    attr: RegAttr,
});

/// Asks the daemon to connect a queue pair to `attr`.
///
/// With `whether_create == 0` the queue pair pre-registered under `id` is
/// used. Otherwise the daemon creates one on the NIC registered under
/// `nic_id` with `config` and registers it under `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcReq {
    pub id: u64,
    pub nic_id: u64,
    pub whether_create: u8,
    pub config: QpConfig,
    pub attr: QpAttr,
}

impl_wire!(RcReq {
    id: u64,
    nic_id: u64,
    whether_create: u8,
    config: QpConfig,
    attr: QpAttr,
});

/// The daemon-side queue pair's attributes and the key that authorizes
/// deleting it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcReply {
    pub status: u8,
    pub attr: QpAttr,
    pub key: u64,
}

impl_wire!(RcReply {
    status: u8,
    attr: QpAttr,
    key: u64,
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReq {
    pub id: u64,
    pub key: u64,
}

impl_wire!(DeleteReq { id: u64, key: u64 });

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteReply {
    pub status: u8,
}

impl_wire!(DeleteReply { status: u8 });

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::dedump;
    use crate::wire::dump;

    #[test]
    fn test_header_sizes() {
        assert_eq!(ReqHeader::SIZE, MAX_BATCH_SZ * 4 + 1);
        assert_eq!(ReplyHeader::SIZE, MAX_BATCH_SZ * 2 + 1);
        assert_eq!(MrReq::SIZE, 8);
        assert_eq!(MrReply::SIZE, 1 + RegAttr::SIZE);
        assert_eq!(RcReq::SIZE, 8 + 8 + 1 + QpConfig::SIZE + QpAttr::SIZE);
        assert_eq!(RcReply::SIZE, 1 + QpAttr::SIZE + 8);
        assert_eq!(DeleteReq::SIZE, 16);
    }

    #[test]
    fn test_request_envelope_layout() {
        let encoded = encode_requests(&[
            (RpcId::FetchMr.into(), Bytes::from_static(b"abc")),
            (RpcId::Heartbeat.into(), Bytes::new()),
        ])
        .unwrap();
        assert_eq!(encoded.len(), ReqHeader::SIZE + 3);
        // elems[0] = {ty: 1, payload: 3}, elems[1] = {ty: 0, payload: 0}
        assert_eq!(&encoded[..8], &[1, 0, 3, 0, 0, 0, 0, 0]);
        assert_eq!(encoded[ReqHeader::SIZE - 1], 2);
        assert_eq!(&encoded[ReqHeader::SIZE..], b"abc");

        let decoded = decode_requests(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], (1, Bytes::from_static(b"abc")));
        assert_eq!(decoded[1], (0, Bytes::new()));
    }

    #[test]
    fn test_request_envelope_limits() {
        let reqs: Vec<(u8, Bytes)> = (0..=MAX_BATCH_SZ as u8).map(|i| (i, Bytes::new())).collect();
        assert_eq!(
            encode_requests(&reqs),
            Err(ProtoError::TooManyEntries(MAX_BATCH_SZ + 1))
        );

        let encoded = encode_requests(&[(1, Bytes::from_static(b"abcdef"))]).unwrap();
        assert!(matches!(
            decode_requests(&encoded[..encoded.len() - 2]),
            Err(ProtoError::Truncated { needed: 6, got: 4 })
        ));
        assert!(decode_requests(&encoded[..3]).is_err());

        let mut bad = encoded.to_vec();
        bad[ReqHeader::SIZE - 1] = 9;
        assert_eq!(decode_requests(&bad), Err(ProtoError::TooManyEntries(9)));
    }

    #[test]
    fn test_reply_envelope() {
        let replies = vec![Bytes::from_static(b"one"), Bytes::new(), Bytes::from_static(b"3")];
        let encoded = encode_replies(&replies).unwrap();
        assert_eq!(&encoded[..2], &[3, 0]);
        assert_eq!(decode_replies(&encoded).unwrap(), replies);

        // A declared size larger than the remaining buffer is a decode error.
        let mut bad = encoded.to_vec();
        bad[0] = 200;
        assert!(matches!(
            decode_replies(&bad),
            Err(ProtoError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ids_and_statuses() {
        assert_eq!(RpcId::try_from(3), Ok(RpcId::DeleteRc));
        assert_eq!(RpcId::try_from(42), Err(42));
        assert_eq!(CallStatus::try_from(1), Ok(CallStatus::Nop));
        assert_eq!(CallbackStatus::try_from(5), Ok(CallbackStatus::AuthErr));
        assert_eq!(u8::from(CallbackStatus::NotFound), 2);
    }

    #[test]
    fn test_rc_req_round_trip() {
        let req = RcReq {
            id: 73,
            nic_id: 0,
            whether_create: 1,
            config: QpConfig::default(),
            attr: QpAttr {
                qpn: 0x123,
                lid: 0x10,
                ..Default::default()
            },
        };
        let bytes = dump(&req);
        assert_eq!(bytes.len(), RcReq::SIZE);
        assert_eq!(&bytes[..8], &73u64.to_le_bytes());
        assert_eq!(dedump::<RcReq>(&bytes), Some(req));
        assert_eq!(dedump::<RcReq>(&bytes[..RcReq::SIZE - 1]), None);
    }
}
