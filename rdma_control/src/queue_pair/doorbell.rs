/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use super::ReqDesc;
use super::ReqPayload;
use crate::verbs::MAX_DOORBELL;

/// Requests gathered to be posted with a single doorbell.
///
/// Holds at most [`MAX_DOORBELL`] requests. Post it with
/// [`RcQueuePair::send_doorbell`](super::RcQueuePair::send_doorbell) or
/// [`UdQueuePair::send_doorbell_to`](super::UdQueuePair::send_doorbell_to);
/// the batch can be reused afterwards.
#[derive(Debug, Clone)]
pub struct DoorbellBatch {
    reqs: Vec<(ReqDesc, ReqPayload)>,
}

impl Default for DoorbellBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl DoorbellBatch {
    pub fn new() -> Self {
        Self {
            reqs: Vec::with_capacity(MAX_DOORBELL),
        }
    }

    /// Appends one request. Returns `false`, leaving the batch unchanged,
    /// when it already holds [`MAX_DOORBELL`] requests.
    pub fn push(&mut self, desc: ReqDesc, payload: ReqPayload) -> bool {
        if self.is_full() {
            return false;
        }
        self.reqs.push((desc, payload));
        true
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.reqs.len() >= MAX_DOORBELL
    }

    pub fn clear(&mut self) {
        self.reqs.clear();
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &(ReqDesc, ReqPayload)> {
        self.reqs.iter()
    }
}
