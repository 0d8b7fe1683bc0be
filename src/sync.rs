// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The replica-side protocol state machine.
//!
//! `ClientSync` keeps a local buffer convergent with the authoritative
//! session. Local edits apply optimistically and queue in the outbox until
//! the server acknowledges them; inbound server operations are folded through
//! the outbox before they touch the buffer, and the outbox is rewritten onto
//! the new base in the same pass.
//!
//! Sending is pipelined: every local edit is handed to the transport right
//! away, so several operations can be in flight. The server tolerates this
//! because each frame carries the replica's base sequence number, and the
//! outbox rewrite keeps later in-flight operations consistent with whatever
//! the server interleaved before them.
//!
//! This type is sync and does no I/O; the transport wrapper in
//! [`crate::client`] drives it.

use crate::ot;
use crate::rope::Rope;
use crate::types::{ClientId, Operation, ServerOperation};
use std::collections::VecDeque;
use tracing::debug;

pub struct ClientSync {
    client_id: ClientId,
    /// Highest server sequence number observed, via op frames or acks.
    base_server_seq: u64,
    next_client_seq: u64,
    /// Locally applied operations the server has not acknowledged yet, in
    /// client-sequence order.
    outbox: VecDeque<Operation>,
    buffer: Rope,
}

impl ClientSync {
    /// Start a replica from the `(seq, snapshot)` pair of a `joined` frame.
    pub fn new(client_id: ClientId, snapshot: &str, base_server_seq: u64) -> Self {
        Self {
            client_id,
            base_server_seq,
            next_client_seq: 0,
            outbox: VecDeque::new(),
            buffer: Rope::new(snapshot),
        }
    }

    /// Author a local insert: applied to the buffer immediately, queued in
    /// the outbox, returned for sending.
    pub fn insert(&mut self, pos: u32, text: &str) -> Operation {
        let pos = pos.min(self.buffer.len());
        let op = Operation::Insert {
            pos,
            text: text.to_string(),
            client_id: self.client_id.clone(),
            client_seq: self.next_client_seq,
        };
        self.next_client_seq += 1;
        op.apply_to(&mut self.buffer)
            .expect("A clamped local insert always applies");
        self.outbox.push_back(op.clone());
        op
    }

    /// Author a local delete, analogous to [`Self::insert`].
    pub fn delete(&mut self, pos: u32, len: u32) -> Operation {
        let pos = pos.min(self.buffer.len());
        let len = len.min(self.buffer.len() - pos);
        let op = Operation::Delete {
            pos,
            len,
            client_id: self.client_id.clone(),
            client_seq: self.next_client_seq,
        };
        self.next_client_seq += 1;
        op.apply_to(&mut self.buffer)
            .expect("A clamped local delete always applies");
        self.outbox.push_back(op.clone());
        op
    }

    /// Take in one operation from the server's broadcast stream.
    ///
    /// Our own operations come back only as acks, but a server that echoes
    /// them anyway is tolerated: they are recognized by client id and
    /// skipped. Everyone else's operations are rebased past the outbox,
    /// applied, and returned so a UI can re-render the affected range.
    pub fn handle_server_op(&mut self, sop: &ServerOperation) -> Option<Operation> {
        self.base_server_seq = self.base_server_seq.max(sop.server_seq);
        if sop.operation.client_id() == &self.client_id {
            return None;
        }

        let queue = self.outbox.make_contiguous();
        let (rebased, rewritten) = ot::transform_through(&sop.operation, queue);
        debug!(
            "Rebased inbound op past {} unacknowledged local ops",
            self.outbox.len()
        );
        rebased
            .apply_to(&mut self.buffer)
            .expect("A rebased server operation must fit the local buffer");
        self.outbox = rewritten.into();
        Some(rebased)
    }

    /// The server acknowledged everything up to `client_seq`; drop it from
    /// the outbox.
    pub fn handle_ack(&mut self, client_seq: u64, server_seq: u64) {
        self.base_server_seq = self.base_server_seq.max(server_seq);
        while let Some(front) = self.outbox.front() {
            if front.client_seq() <= client_seq {
                self.outbox.pop_front();
            } else {
                break;
            }
        }
    }

    /// Adopt a fresh snapshot after a reconnect. Unacknowledged local edits
    /// cannot be replayed against the new base and are dropped; the number of
    /// dropped operations is returned so the caller can report the loss.
    /// Client sequence numbers keep counting up — the server may remember us
    /// under the same id.
    pub fn rejoin(&mut self, snapshot: &str, server_seq: u64) -> usize {
        let lost = self.outbox.len();
        self.outbox.clear();
        self.buffer = Rope::new(snapshot);
        self.base_server_seq = server_seq;
        lost
    }

    #[must_use]
    pub fn content(&self) -> String {
        self.buffer.to_string()
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[must_use]
    pub fn base_server_seq(&self) -> u64 {
        self.base_server_seq
    }

    /// Operations still awaiting acknowledgement, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.outbox.iter()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }
}
