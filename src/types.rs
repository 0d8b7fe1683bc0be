// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::rope::{Rope, RopeError};
use derive_more::{Deref, Display};
use serde::{Deserialize, Serialize};

/// Stable, opaque identifier for a client.
///
/// The lexicographic ordering of client ids is load-bearing: it decides which
/// of two co-located concurrent inserts goes first. Server and replicas must
/// compare ids the same way, which they do by sharing this type.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deref, Serialize, Deserialize,
)]
#[must_use]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Name of a shared document, as sent by clients in every frame.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deref, Serialize, Deserialize,
)]
#[must_use]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An edit as authored by a client, positioned against the document state the
/// client saw at the time ("its base"). Positions count Unicode code points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Insert {
        pos: u32,
        text: String,
        client_id: ClientId,
        client_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        pos: u32,
        len: u32,
        client_id: ClientId,
        client_seq: u64,
    },
}

impl Operation {
    #[must_use]
    pub fn pos(&self) -> u32 {
        match self {
            Self::Insert { pos, .. } | Self::Delete { pos, .. } => *pos,
        }
    }

    /// One past the last position this operation touches in its base document.
    #[must_use]
    pub fn end(&self) -> u32 {
        match self {
            Self::Insert { pos, .. } => *pos,
            Self::Delete { pos, len, .. } => pos.saturating_add(*len),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        match self {
            Self::Insert { client_id, .. } | Self::Delete { client_id, .. } => client_id,
        }
    }

    #[must_use]
    pub fn client_seq(&self) -> u64 {
        match self {
            Self::Insert { client_seq, .. } | Self::Delete { client_seq, .. } => *client_seq,
        }
    }

    /// Number of code points this operation adds (insert) or removes (delete).
    #[must_use]
    pub fn payload_len(&self) -> u32 {
        match self {
            Self::Insert { text, .. } => text.chars().count() as u32,
            Self::Delete { len, .. } => *len,
        }
    }

    /// Zero-width operations are accepted everywhere and apply as no-ops.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.payload_len() == 0
    }

    /// Force the operation into the bounds of a document of `doc_len` code
    /// points: the position clamps into `[0, doc_len]` and a delete length
    /// shrinks to fit. The result always applies cleanly.
    pub fn clamp_to(self, doc_len: u32) -> Self {
        match self {
            Self::Insert {
                pos,
                text,
                client_id,
                client_seq,
            } => Self::Insert {
                pos: pos.min(doc_len),
                text,
                client_id,
                client_seq,
            },
            Self::Delete {
                pos,
                len,
                client_id,
                client_seq,
            } => {
                let pos = pos.min(doc_len);
                Self::Delete {
                    pos,
                    len: len.min(doc_len - pos),
                    client_id,
                    client_seq,
                }
            }
        }
    }

    pub fn apply_to(&self, rope: &mut Rope) -> Result<(), RopeError> {
        match self {
            Self::Insert { pos, text, .. } => rope.insert(*pos, text),
            Self::Delete { pos, len, .. } => rope.delete(*pos, *len),
        }
    }
}

/// An [`Operation`] after the authoritative session has applied it and
/// assigned its place in the document's linear history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct ServerOperation {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(rename = "serverSeq")]
    pub server_seq: u64,
}

impl ServerOperation {
    pub fn new(operation: Operation, server_seq: u64) -> Self {
        Self {
            operation,
            server_seq,
        }
    }
}

pub mod factories {
    use super::{ClientId, Operation, ServerOperation};

    pub fn insert(client: &str, client_seq: u64, pos: u32, text: &str) -> Operation {
        Operation::Insert {
            pos,
            text: text.to_string(),
            client_id: ClientId::from(client),
            client_seq,
        }
    }

    pub fn delete(client: &str, client_seq: u64, pos: u32, len: u32) -> Operation {
        Operation::Delete {
            pos,
            len,
            client_id: ClientId::from(client),
            client_seq,
        }
    }

    pub fn server_op(operation: Operation, server_seq: u64) -> ServerOperation {
        ServerOperation::new(operation, server_seq)
    }
}
