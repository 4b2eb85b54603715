/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Packs several small messages into one datagram.
//!
//! Layout of an encoded buffer:
//!
//! ```text
//! | num: u8 | entries: [{sz: u8, offset: u16}; MAX_MULTI_MSG] | payload ... |
//! ```
//!
//! `offset` is measured from the start of the whole buffer, so entry `i`
//! occupies `buf[offset..offset + sz]`.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::wire::Wire;

/// Maximum number of messages one [`MultiMessage`] can carry.
pub const MAX_MULTI_MSG: usize = 8;

/// Maximum size of any datagram exchanged on a bootstrap channel.
pub const MAX_MSG_SZ: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MultiEntry {
    sz: u8,
    offset: u16,
}

impl_wire!(MultiEntry { sz: u8, offset: u16 });

impl MultiEntry {
    fn max_entry_sz() -> usize {
        u8::MAX as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MultiHeader {
    num: u8,
    entries: [MultiEntry; MAX_MULTI_MSG],
}

impl_wire!(MultiHeader {
    num: u8,
    entries: [MultiEntry; MAX_MULTI_MSG],
});

/// A batch of up to [`MAX_MULTI_MSG`] byte strings encoded in one buffer of
/// at most [`MAX_MSG_SZ`] bytes.
#[derive(Debug, Clone)]
pub struct MultiMessage {
    header: MultiHeader,
    payload: BytesMut,
}

impl Default for MultiMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiMessage {
    /// Size of the fixed header preceding the payload.
    pub const HEADER_SIZE: usize = MultiHeader::SIZE;

    pub fn new() -> Self {
        Self {
            header: MultiHeader::default(),
            payload: BytesMut::new(),
        }
    }

    /// Number of messages appended so far.
    pub fn num_msg(&self) -> usize {
        self.header.num as usize
    }

    /// Encoded size of the buffer so far.
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Appends `msg` as the next entry.
    ///
    /// Returns `false` and leaves the message untouched if the entry does
    /// not fit: either all entries are used, the entry exceeds the
    /// per-entry size limit, or the encoded buffer would grow past
    /// [`MAX_MSG_SZ`].
    pub fn append(&mut self, msg: &[u8]) -> bool {
        let idx = self.num_msg();
        if idx >= MAX_MULTI_MSG
            || msg.len() > MultiEntry::max_entry_sz()
            || self.encoded_len() + msg.len() > MAX_MSG_SZ
        {
            return false;
        }
        self.header.entries[idx] = MultiEntry {
            sz: msg.len() as u8,
            offset: self.encoded_len() as u16,
        };
        self.header.num += 1;
        self.payload.put_slice(msg);
        true
    }

    /// Returns a copy of the entry at `idx`, if present.
    pub fn query_one(&self, idx: usize) -> Option<Bytes> {
        if idx >= self.num_msg() {
            return None;
        }
        let entry = self.header.entries[idx];
        let start = entry.offset as usize - Self::HEADER_SIZE;
        let end = start + entry.sz as usize;
        self.payload
            .get(start..end)
            .map(Bytes::copy_from_slice)
    }

    /// Iterates over the entries in append order.
    pub fn iter(&self) -> impl Iterator<Item = Bytes> + '_ {
        (0..self.num_msg()).filter_map(move |idx| self.query_one(idx))
    }

    /// Encodes the header followed by the payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a buffer produced by [`MultiMessage::to_bytes`].
    ///
    /// Returns `None` if the buffer is too short for its header, declares
    /// more entries than allowed, or has an entry whose offset and size
    /// point outside the buffer or out of order.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() > MAX_MSG_SZ {
            return None;
        }
        let header = crate::wire::dedump::<MultiHeader>(buf)?;
        if header.num as usize > MAX_MULTI_MSG {
            return None;
        }
        let mut expected = Self::HEADER_SIZE;
        for entry in &header.entries[..header.num as usize] {
            let offset = entry.offset as usize;
            let end = offset + entry.sz as usize;
            if offset != expected || end > buf.len() {
                return None;
            }
            expected = end;
        }
        Some(Self {
            header,
            payload: BytesMut::from(&buf[Self::HEADER_SIZE..expected]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(MultiMessage::HEADER_SIZE, 1 + MAX_MULTI_MSG * 3);
        assert_eq!(MultiMessage::new().to_bytes().len(), MultiMessage::HEADER_SIZE);
    }

    #[test]
    fn test_append_and_query() {
        let mut msg = MultiMessage::new();
        assert!(msg.append(b"first"));
        assert!(msg.append(b""));
        assert!(msg.append(b"third one"));
        assert_eq!(msg.num_msg(), 3);
        assert_eq!(msg.query_one(0).as_deref(), Some(&b"first"[..]));
        assert_eq!(msg.query_one(1).as_deref(), Some(&b""[..]));
        assert_eq!(msg.query_one(2).as_deref(), Some(&b"third one"[..]));
        assert_eq!(msg.query_one(3), None);

        let collected: Vec<Bytes> = msg.iter().collect();
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn test_entry_count_budget() {
        let mut msg = MultiMessage::new();
        for i in 0..MAX_MULTI_MSG {
            assert!(msg.append(&[i as u8]));
        }
        let before = msg.to_bytes();
        assert!(!msg.append(b"x"));
        assert_eq!(msg.num_msg(), MAX_MULTI_MSG);
        assert_eq!(msg.to_bytes(), before);
    }

    #[test]
    fn test_byte_budget() {
        let mut msg = MultiMessage::new();
        let chunk = vec![7u8; MultiEntry::max_entry_sz()];
        let mut appended = 0;
        while msg.append(&chunk) {
            appended += 1;
        }
        // 8 entries of 255 bytes fit well within 4096, so the count budget
        // is the binding one here.
        assert_eq!(appended, MAX_MULTI_MSG);

        let mut msg = MultiMessage::new();
        assert!(!msg.append(&vec![0u8; MultiEntry::max_entry_sz() + 1]));
        assert_eq!(msg.num_msg(), 0);
        assert_eq!(msg.encoded_len(), MultiMessage::HEADER_SIZE);
    }

    #[test]
    fn test_offsets_increase() {
        let mut msg = MultiMessage::new();
        assert!(msg.append(b"ab"));
        assert!(msg.append(b"cde"));
        assert!(msg.append(b"f"));
        let offsets: Vec<u16> = msg.header.entries[..3].iter().map(|e| e.offset).collect();
        assert_eq!(
            offsets,
            vec![
                MultiMessage::HEADER_SIZE as u16,
                MultiMessage::HEADER_SIZE as u16 + 2,
                MultiMessage::HEADER_SIZE as u16 + 5,
            ]
        );
    }

    #[test]
    fn test_from_bytes() {
        let mut msg = MultiMessage::new();
        assert!(msg.append(b"rpc"));
        assert!(msg.append(b"parameter"));
        let decoded = MultiMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded.num_msg(), 2);
        assert_eq!(decoded.query_one(1).as_deref(), Some(&b"parameter"[..]));
    }

    #[test]
    fn test_from_bytes_rejects_malformed() {
        assert!(MultiMessage::from_bytes(&[0u8; 3]).is_none());

        let mut msg = MultiMessage::new();
        assert!(msg.append(b"abcdef"));
        let bytes = msg.to_bytes();
        // Truncated payload.
        assert!(MultiMessage::from_bytes(&bytes[..bytes.len() - 1]).is_none());

        // Too many entries.
        let mut bad = bytes.to_vec();
        bad[0] = (MAX_MULTI_MSG + 1) as u8;
        assert!(MultiMessage::from_bytes(&bad).is_none());
    }
}
