// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The authoritative state of one shared document.
//!
//! To keep the code testable and sync, the functions here just *calculate*
//! the frames each event produces; the actual sending happens in the server,
//! which owns one of these per document and drives it from its mailbox.
//!
//! Convergence hinges on one bookkeeping trick: per client we keep the queue
//! of operations that were applied here but that the client had not yet seen
//! when it last spoke (`unseen`). An incoming operation from that client is
//! folded through this queue before it touches the rope, and the queue is
//! rewritten past the incoming operation — mirroring exactly what the client
//! does with its own outbox. Both sides walk the same grid of transform
//! squares, so they end up in the same document.

use crate::ot;
use crate::protocol::{ClientInfo, CursorPayload, ServerMessage};
use crate::rope::Rope;
use crate::types::{ClientId, Operation, ServerOperation};
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Colors handed out to joining clients, round robin.
const COLOR_PALETTE: &[&str] = &[
    "#e6194b", "#3cb44b", "#f5a623", "#4363d8", "#911eb4", "#46b5b0", "#f032e6", "#8a6d3b",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("client {0} has not joined this document")]
    UnknownClient(ClientId),
}

#[derive(Debug)]
struct ClientState {
    name: String,
    color: String,
    /// Highest client sequence number we have acknowledged.
    last_acked_client_seq: Option<u64>,
    /// Highest server sequence number the client has confirmed seeing.
    base_floor: u64,
    /// Operations applied since `base_floor` that this client did not author,
    /// kept rebased past the client's own in-flight operations.
    unseen: Vec<ServerOperation>,
}

/// Frames produced by a join, routed by the caller.
pub struct JoinOutcome {
    pub client_id: ClientId,
    /// To the joining client: the atomic (seq, snapshot, roster) bundle.
    pub response: ServerMessage,
    /// To everyone else.
    pub announcement: ServerMessage,
}

/// Frames produced by applying an operation.
#[derive(Debug)]
pub struct ApplyOutcome {
    /// To the originator.
    pub ack: ServerMessage,
    /// To everyone else.
    pub broadcast: ServerMessage,
}

/// Rope, log, sequence counter and roster of one document.
pub struct DocumentSession {
    rope: Rope,
    server_seq: u64,
    ops: Vec<ServerOperation>,
    clients: HashMap<ClientId, ClientState>,
    colors_handed_out: usize,
}

impl DocumentSession {
    pub fn new(initial_text: &str) -> Self {
        Self {
            rope: Rope::new(initial_text),
            server_seq: 0,
            ops: Vec::new(),
            clients: HashMap::new(),
            colors_handed_out: 0,
        }
    }

    /// Add a client to the roster. A client re-joining under its old id keeps
    /// its color; its rebase bookkeeping starts over from the fresh snapshot.
    pub fn join(&mut self, requested_id: Option<ClientId>, name: &str) -> JoinOutcome {
        let client_id = requested_id.unwrap_or_else(|| self.mint_client_id());

        let color = if let Some(existing) = self.clients.get(&client_id) {
            debug!("Client {client_id} re-joined, keeping its color");
            existing.color.clone()
        } else {
            let color = COLOR_PALETTE[self.colors_handed_out % COLOR_PALETTE.len()];
            self.colors_handed_out += 1;
            color.to_string()
        };

        self.clients.insert(
            client_id.clone(),
            ClientState {
                name: name.to_string(),
                color: color.clone(),
                last_acked_client_seq: None,
                base_floor: self.server_seq,
                unseen: Vec::new(),
            },
        );

        // Sequence number and snapshot are read back-to-back while we have
        // exclusive access, so they always describe the same state.
        JoinOutcome {
            client_id: client_id.clone(),
            response: ServerMessage::Joined {
                client_id: client_id.clone(),
                seq: self.server_seq,
                doc: self.rope.to_string(),
                clients: self.roster(),
            },
            announcement: ServerMessage::Join {
                client_id,
                client_name: name.to_string(),
                color,
            },
        }
    }

    /// Apply one operation: rebase it past everything its author hadn't seen,
    /// clamp it into the current bounds, mutate the rope, stamp and log it.
    ///
    /// Out-of-bounds positions are clamped rather than rejected; an operation
    /// clamped down to zero width is still stamped and broadcast, so sequence
    /// numbers and acknowledgements stay linear.
    pub fn apply(
        &mut self,
        client_id: &ClientId,
        op: Operation,
        base_seq: Option<u64>,
    ) -> Result<ApplyOutcome, SessionError> {
        let client_seq = op.client_seq();

        let rebased = {
            let state = self
                .clients
                .get_mut(client_id)
                .ok_or_else(|| SessionError::UnknownClient(client_id.clone()))?;

            if state
                .last_acked_client_seq
                .is_some_and(|last| client_seq <= last)
            {
                warn!("Client {client_id} reused client_seq {client_seq}; applying it anyway");
            }

            // Absent base information means "against the latest state".
            let base = base_seq
                .unwrap_or(self.server_seq)
                .min(self.server_seq)
                .max(state.base_floor);
            state.base_floor = base;
            state.unseen.retain(|sop| sop.server_seq > base);

            if state.unseen.len() > 50 {
                warn!(
                    "Client {client_id} is {} operations behind, it might have trouble catching up?",
                    state.unseen.len()
                );
            }

            let queue: Vec<Operation> = state
                .unseen
                .iter()
                .map(|sop| sop.operation.clone())
                .collect();
            let (rebased, rewritten) = ot::transform_through(&op, &queue);
            for (slot, rewritten_op) in state.unseen.iter_mut().zip(rewritten) {
                slot.operation = rewritten_op;
            }
            state.last_acked_client_seq = Some(client_seq);
            rebased
        };

        let doc_len = self.rope.len();
        let clamped = rebased.clone().clamp_to(doc_len);
        if clamped != rebased {
            warn!("Clamped out-of-bounds operation from {client_id} into 0..={doc_len}");
        }
        clamped
            .apply_to(&mut self.rope)
            .expect("A clamped operation always applies");

        self.server_seq += 1;
        let stamped = ServerOperation::new(clamped, self.server_seq);
        self.ops.push(stamped.clone());

        for (id, other) in &mut self.clients {
            if id != client_id {
                other.unseen.push(stamped.clone());
            }
        }

        Ok(ApplyOutcome {
            ack: ServerMessage::Ack {
                client_seq,
                server_seq: self.server_seq,
            },
            broadcast: ServerMessage::Op {
                operation: stamped,
                server_seq: self.server_seq,
            },
        })
    }

    /// Wrap a cursor payload for fan-out. The payload is not validated or
    /// transformed; it is presence data for the UIs of the other clients.
    pub fn cursor(
        &self,
        client_id: &ClientId,
        payload: CursorPayload,
    ) -> Result<ServerMessage, SessionError> {
        if !self.clients.contains_key(client_id) {
            return Err(SessionError::UnknownClient(client_id.clone()));
        }
        Ok(ServerMessage::Cursor {
            client_id: client_id.clone(),
            payload,
        })
    }

    /// Drop a client from the roster. Returns the frame for the remaining
    /// clients, or `None` if the client was not present.
    pub fn disconnect(&mut self, client_id: &ClientId) -> Option<ServerMessage> {
        self.clients.remove(client_id).map(|_| {
            debug!("Client {client_id} left the document");
            ServerMessage::Disconnect {
                client_id: client_id.clone(),
            }
        })
    }

    /// An empty session is eligible for reclamation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    #[must_use]
    pub fn content(&self) -> String {
        self.rope.to_string()
    }

    #[must_use]
    pub fn server_seq(&self) -> u64 {
        self.server_seq
    }

    #[must_use]
    pub fn ops(&self) -> &[ServerOperation] {
        &self.ops
    }

    #[must_use]
    pub fn roster(&self) -> Vec<ClientInfo> {
        let mut roster: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|(id, state)| ClientInfo {
                id: id.clone(),
                name: state.name.clone(),
                color: state.color.clone(),
            })
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    fn mint_client_id(&self) -> ClientId {
        loop {
            let id = ClientId::new(format!("client-{:08x}", rand::thread_rng().gen::<u32>()));
            if !self.clients.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use tracing_test::traced_test;

    fn session_with(text: &str, clients: &[&str]) -> DocumentSession {
        let mut session = DocumentSession::new(text);
        for name in clients {
            session.join(Some(ClientId::from(*name)), name);
        }
        session
    }

    mod joining {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn join_bundles_seq_snapshot_and_roster() {
            let mut session = session_with("hello", &["A"]);
            session
                .apply(&ClientId::from("A"), insert("A", 0, 5, "!"), Some(0))
                .unwrap();

            let outcome = session.join(Some(ClientId::from("B")), "Berta");
            let ServerMessage::Joined {
                client_id,
                seq,
                doc,
                clients,
            } = outcome.response
            else {
                panic!("expected a joined frame");
            };
            assert_eq!(client_id, ClientId::from("B"));
            assert_eq!(seq, 1);
            assert_eq!(doc, "hello!");
            assert_eq!(clients.len(), 2);
        }

        #[test]
        fn minted_ids_are_opaque_and_fresh() {
            let mut session = DocumentSession::new("");
            let a = session.join(None, "Ada").client_id;
            let b = session.join(None, "Bob").client_id;
            assert_ne!(a, b);
            assert!(a.as_str().starts_with("client-"));
        }

        #[test]
        fn rejoining_keeps_the_color() {
            let mut session = DocumentSession::new("");
            let first = session.join(Some(ClientId::from("A")), "Ada");
            let ServerMessage::Join { color, .. } = first.announcement else {
                panic!("expected a join announcement");
            };

            let again = session.join(Some(ClientId::from("A")), "Ada");
            let ServerMessage::Join { color: second, .. } = again.announcement else {
                panic!("expected a join announcement");
            };
            assert_eq!(color, second);
        }

        #[test]
        fn colors_are_deterministic_per_join_order() {
            let one = session_with("", &["A", "B"]);
            let two = session_with("", &["A", "B"]);
            assert_eq!(one.roster(), two.roster());
            assert_ne!(
                one.roster()[0].color, one.roster()[1].color,
                "neighbors should be distinguishable"
            );
        }
    }

    mod applying {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn seq_advances_by_one_and_stamps_the_log() {
            let mut session = session_with("", &["A"]);
            let a = ClientId::from("A");
            for i in 0..5 {
                session
                    .apply(&a, insert("A", i, 0, "x"), Some(i))
                    .unwrap();
            }
            assert_eq!(session.server_seq(), 5);
            for (k, sop) in session.ops().iter().enumerate() {
                assert_eq!(sop.server_seq, k as u64 + 1);
            }
        }

        #[test]
        fn ack_goes_to_the_author_and_the_op_to_the_rest() {
            let mut session = session_with("hi", &["A", "B"]);
            let outcome = session
                .apply(&ClientId::from("A"), insert("A", 7, 2, "!"), Some(0))
                .unwrap();
            assert_eq!(
                outcome.ack,
                ServerMessage::Ack {
                    client_seq: 7,
                    server_seq: 1
                }
            );
            assert_eq!(
                outcome.broadcast,
                ServerMessage::Op {
                    operation: server_op(insert("A", 7, 2, "!"), 1),
                    server_seq: 1,
                }
            );
        }

        #[test]
        fn unknown_clients_are_rejected_without_advancing_seq() {
            let mut session = session_with("hi", &["A"]);
            let err = session
                .apply(&ClientId::from("Z"), insert("Z", 0, 0, "x"), None)
                .unwrap_err();
            assert_eq!(err, SessionError::UnknownClient(ClientId::from("Z")));
            assert_eq!(session.server_seq(), 0);
        }

        #[test]
        fn out_of_bounds_positions_clamp() {
            let mut session = session_with("abc", &["A"]);
            session
                .apply(&ClientId::from("A"), insert("A", 0, 99, "!"), Some(0))
                .unwrap();
            assert_eq!(session.content(), "abc!");
        }

        #[traced_test]
        #[test]
        fn a_clamped_away_op_is_still_stamped_and_broadcast() {
            let mut session = session_with("abc", &["A"]);
            let outcome = session
                .apply(&ClientId::from("A"), delete("A", 0, 99, 7), Some(0))
                .unwrap();
            assert_eq!(session.content(), "abc");
            assert_eq!(session.server_seq(), 1);
            let ServerMessage::Op { operation, .. } = outcome.broadcast else {
                panic!("expected an op frame");
            };
            assert!(operation.operation.is_noop());
            assert_eq!(operation.server_seq, 1);
            assert!(logs_contain("Clamped out-of-bounds operation"));
        }
    }

    mod rebasing_stale_operations {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn concurrent_delete_is_shifted_past_an_unseen_insert() {
            let mut session = session_with("abcd", &["A", "B"]);
            // A prepends while B concurrently deletes "c", both from seq 0.
            session
                .apply(&ClientId::from("A"), insert("A", 0, 0, "X"), Some(0))
                .unwrap();
            session
                .apply(&ClientId::from("B"), delete("B", 0, 2, 1), Some(0))
                .unwrap();
            assert_eq!(session.content(), "Xabd");
        }

        #[test]
        fn co_located_inserts_order_by_client_id_regardless_of_arrival() {
            for first in ["A", "B"] {
                let mut session = session_with("hello", &["A", "B"]);
                let second = if first == "A" { "B" } else { "A" };
                let text_of = |id: &str| if id == "A" { " world" } else { "!" };

                session
                    .apply(
                        &ClientId::from(first),
                        insert(first, 0, 5, text_of(first)),
                        Some(0),
                    )
                    .unwrap();
                session
                    .apply(
                        &ClientId::from(second),
                        insert(second, 0, 5, text_of(second)),
                        Some(0),
                    )
                    .unwrap();

                // The smaller client id goes first in the document.
                assert_eq!(session.content(), "hello world!");
            }
        }

        #[test]
        fn overlapping_stale_deletes_remove_the_union() {
            let mut session = session_with("abcdefgh", &["A", "B"]);
            session
                .apply(&ClientId::from("A"), delete("A", 0, 2, 3), Some(0))
                .unwrap();
            session
                .apply(&ClientId::from("B"), delete("B", 0, 3, 3), Some(0))
                .unwrap();
            assert_eq!(session.content(), "abgh");
        }

        #[test]
        fn the_unseen_queue_drains_once_a_client_catches_up() {
            let mut session = session_with("base", &["A", "B"]);
            session
                .apply(&ClientId::from("A"), insert("A", 0, 4, "!"), Some(0))
                .unwrap();
            // B speaks with a base that covers A's operation: no rebase.
            session
                .apply(&ClientId::from("B"), insert("B", 0, 5, "?"), Some(1))
                .unwrap();
            assert_eq!(session.content(), "base!?");
        }

        #[test]
        fn an_interleaved_exchange_converges_with_the_pairwise_law() {
            // A and B alternate edits, each always one server op behind.
            let mut session = session_with("hello world", &["A", "B"]);
            session
                .apply(&ClientId::from("A"), delete("A", 0, 6, 5), Some(0))
                .unwrap();
            session
                .apply(
                    &ClientId::from("B"),
                    insert("B", 0, 6, "beautiful "),
                    Some(0),
                )
                .unwrap();
            assert_eq!(session.content(), "hello beautiful ");
        }
    }

    mod roster_lifecycle {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn disconnect_announces_and_empties() {
            let mut session = session_with("", &["A", "B"]);
            let frame = session.disconnect(&ClientId::from("A")).unwrap();
            assert_eq!(
                frame,
                ServerMessage::Disconnect {
                    client_id: ClientId::from("A")
                }
            );
            assert!(!session.is_empty());
            assert!(session.disconnect(&ClientId::from("A")).is_none());
            session.disconnect(&ClientId::from("B")).unwrap();
            assert!(session.is_empty());
        }

        #[test]
        fn cursor_frames_pass_through_for_known_clients() {
            let session = session_with("", &["A"]);
            let mut payload = CursorPayload::new();
            payload.insert("anchor".to_string(), serde_json::json!(3));

            let frame = session.cursor(&ClientId::from("A"), payload.clone()).unwrap();
            assert_eq!(
                frame,
                ServerMessage::Cursor {
                    client_id: ClientId::from("A"),
                    payload
                }
            );

            let err = session
                .cursor(&ClientId::from("Z"), CursorPayload::new())
                .unwrap_err();
            assert_eq!(err, SessionError::UnknownClient(ClientId::from("Z")));
        }
    }
}
