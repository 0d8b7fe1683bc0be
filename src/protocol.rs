// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The frame protocol spoken between clients and the server.
//!
//! Frames are UTF-8 JSON objects, one per line, each tagged with a `type`
//! field. Cursor frames carry an opaque payload that the server fans out
//! without looking inside.

use crate::types::{ClientId, DocId, Operation, ServerOperation};
use serde::{Deserialize, Serialize};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

/// Cursor frames are presence data for the UI; the sync engine treats them as
/// a bag of JSON it never validates or transforms.
pub type CursorPayload = serde_json::Map<String, serde_json::Value>;

/// Everything a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        doc_id: DocId,
        client_name: String,
        /// Present when a client reconnects and wants to keep its identity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<ClientId>,
    },
    #[serde(rename_all = "camelCase")]
    Op {
        doc_id: DocId,
        operation: Operation,
        /// Highest server sequence number the sender had observed when it
        /// authored the operation. The session rebases the operation past
        /// everything later than this. Absent means "against the latest
        /// state" — such a client only converges while its edits never race
        /// with someone else's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_seq: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        doc_id: DocId,
        client_id: ClientId,
        #[serde(flatten)]
        payload: CursorPayload,
    },
}

impl ClientMessage {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Roster entry as shown to clients in a `joined` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub name: String,
    pub color: String,
}

/// Everything the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Direct answer to a `join`: the assigned id plus an atomic
    /// (sequence number, document snapshot) pair to base the replica on.
    #[serde(rename_all = "camelCase")]
    Joined {
        client_id: ClientId,
        seq: u64,
        doc: String,
        clients: Vec<ClientInfo>,
    },
    /// Someone else joined the document.
    #[serde(rename_all = "camelCase")]
    Join {
        client_id: ClientId,
        client_name: String,
        color: String,
    },
    /// An operation someone else authored, stamped with its log position.
    #[serde(rename_all = "camelCase")]
    Op {
        operation: ServerOperation,
        server_seq: u64,
    },
    /// The server applied one of our own operations.
    #[serde(rename_all = "camelCase")]
    Ack { client_seq: u64, server_seq: u64 },
    #[serde(rename_all = "camelCase")]
    Cursor {
        client_id: ClientId,
        #[serde(flatten)]
        payload: CursorPayload,
    },
    /// Someone else left the document.
    #[serde(rename_all = "camelCase")]
    Disconnect { client_id: ClientId },
    Error { message: String },
}

impl ServerMessage {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Newline-delimited JSON encoder for either direction. Reads go through a
/// plain `LinesCodec`; parsing happens where the context for error replies is.
pub struct MessageCodec;

impl Encoder<ServerMessage> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: ServerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&item)?;
        dst.extend_from_slice(format!("{payload}\n").as_bytes());
        Ok(())
    }
}

impl Encoder<ClientMessage> for MessageCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: ClientMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&item)?;
        dst.extend_from_slice(format!("{payload}\n").as_bytes());
        Ok(())
    }
}
