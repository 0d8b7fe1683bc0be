// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A connected replica: [`crate::sync::ClientSync`] plus the socket.
//!
//! This is what the `cowrite client` subcommand and the end-to-end tests
//! drive. Local edits go out pipelined; inbound frames mutate the replica
//! and surface as [`ClientEvent`]s. On transport loss the client reconnects
//! with capped exponential backoff and adopts the fresh snapshot — any
//! still-unacknowledged local edits are lost and reported, not silently
//! replayed against a base they were never written for.

use crate::protocol::{ClientInfo, ClientMessage, CursorPayload, MessageCodec, ServerMessage};
use crate::sync::ClientSync;
use crate::types::{ClientId, DocId, Operation};
use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the surrounding application gets to see of the protocol.
#[derive(Debug)]
pub enum ClientEvent {
    /// Someone else's operation was applied to the local buffer.
    RemoteEdit(Operation),
    /// The server acknowledged one of our operations.
    Acked { client_seq: u64, server_seq: u64 },
    PeerJoined {
        client_id: ClientId,
        name: String,
        color: String,
    },
    PeerLeft {
        client_id: ClientId,
    },
    Cursor {
        client_id: ClientId,
        payload: CursorPayload,
    },
    /// The connection came back after a transport loss. `lost_edits` local
    /// operations could not be carried over to the fresh snapshot.
    Rejoined { lost_edits: usize },
    ServerError {
        message: String,
    },
}

type Reader = FramedRead<OwnedReadHalf, LinesCodec>;
type Writer = FramedWrite<OwnedWriteHalf, MessageCodec>;

struct Handshake {
    reader: Reader,
    writer: Writer,
    client_id: ClientId,
    seq: u64,
    doc: String,
    roster: Vec<ClientInfo>,
}

pub struct Client {
    addr: String,
    doc_id: DocId,
    name: String,
    sync: ClientSync,
    reader: Reader,
    writer: Writer,
    roster: Vec<ClientInfo>,
}

impl Client {
    /// Connect, join `doc_id`, and wait for the snapshot. Passing a
    /// `client_id` keeps an identity across reconnects.
    pub async fn connect(
        addr: &str,
        doc_id: DocId,
        name: &str,
        client_id: Option<ClientId>,
    ) -> Result<Self> {
        let handshake = join_document(addr, &doc_id, name, client_id).await?;
        info!(
            "Joined document '{doc_id}' as {} at seq {}",
            handshake.client_id, handshake.seq
        );
        Ok(Self {
            addr: addr.to_string(),
            doc_id,
            name: name.to_string(),
            sync: ClientSync::new(handshake.client_id, &handshake.doc, handshake.seq),
            reader: handshake.reader,
            writer: handshake.writer,
            roster: handshake.roster,
        })
    }

    /// Author and send an insert. Applied locally before the frame is out.
    pub async fn insert(&mut self, pos: u32, text: &str) -> Result<()> {
        let operation = self.sync.insert(pos, text);
        self.send_op(operation).await
    }

    /// Author and send a delete.
    pub async fn delete(&mut self, pos: u32, len: u32) -> Result<()> {
        let operation = self.sync.delete(pos, len);
        self.send_op(operation).await
    }

    async fn send_op(&mut self, operation: Operation) -> Result<()> {
        let message = ClientMessage::Op {
            doc_id: self.doc_id.clone(),
            operation,
            base_seq: Some(self.sync.base_server_seq()),
        };
        self.writer
            .send(message)
            .await
            .context("Failed to send operation")
    }

    /// Share our cursor with the other clients, opaquely.
    pub async fn send_cursor(&mut self, payload: CursorPayload) -> Result<()> {
        let message = ClientMessage::Cursor {
            doc_id: self.doc_id.clone(),
            client_id: self.sync.client_id().clone(),
            payload,
        };
        self.writer
            .send(message)
            .await
            .context("Failed to send cursor")
    }

    /// Wait for the next protocol event, reconnecting on transport loss.
    pub async fn next_event(&mut self) -> Result<ClientEvent> {
        loop {
            let line = match self.reader.next().await {
                None => {
                    let lost_edits = self.reconnect().await?;
                    return Ok(ClientEvent::Rejoined { lost_edits });
                }
                Some(Err(err)) => {
                    debug!("Transport error, reconnecting: {err:#}");
                    let lost_edits = self.reconnect().await?;
                    return Ok(ClientEvent::Rejoined { lost_edits });
                }
                Some(Ok(line)) => line,
            };

            let message = match ServerMessage::from_json(&line) {
                Ok(message) => message,
                Err(err) => {
                    warn!("Ignoring malformed frame from the server: {err}");
                    continue;
                }
            };

            match message {
                ServerMessage::Joined { .. } => {
                    warn!("Ignoring unexpected joined frame outside a handshake");
                }
                ServerMessage::Join {
                    client_id,
                    client_name,
                    color,
                } => {
                    self.roster.push(ClientInfo {
                        id: client_id.clone(),
                        name: client_name.clone(),
                        color: color.clone(),
                    });
                    return Ok(ClientEvent::PeerJoined {
                        client_id,
                        name: client_name,
                        color,
                    });
                }
                ServerMessage::Op { operation, .. } => {
                    if let Some(applied) = self.sync.handle_server_op(&operation) {
                        return Ok(ClientEvent::RemoteEdit(applied));
                    }
                    // Our own operation echoed back; already applied locally.
                }
                ServerMessage::Ack {
                    client_seq,
                    server_seq,
                } => {
                    self.sync.handle_ack(client_seq, server_seq);
                    return Ok(ClientEvent::Acked {
                        client_seq,
                        server_seq,
                    });
                }
                ServerMessage::Cursor { client_id, payload } => {
                    return Ok(ClientEvent::Cursor { client_id, payload });
                }
                ServerMessage::Disconnect { client_id } => {
                    self.roster.retain(|info| info.id != client_id);
                    return Ok(ClientEvent::PeerLeft { client_id });
                }
                ServerMessage::Error { message } => {
                    return Ok(ClientEvent::ServerError { message });
                }
            }
        }
    }

    /// Re-join under our old id with capped exponential backoff. Returns how
    /// many unacknowledged local edits had to be dropped.
    async fn reconnect(&mut self) -> Result<usize> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            info!("Lost the server, retrying in {backoff:?}");
            sleep(backoff).await;
            match join_document(
                &self.addr,
                &self.doc_id,
                &self.name,
                Some(self.sync.client_id().clone()),
            )
            .await
            {
                Ok(handshake) => {
                    if &handshake.client_id != self.sync.client_id() {
                        warn!(
                            "Server re-assigned us id {}, keeping our local one",
                            handshake.client_id
                        );
                    }
                    let lost = self.sync.rejoin(&handshake.doc, handshake.seq);
                    if lost > 0 {
                        warn!("{lost} unacknowledged local edits were lost in the reconnect");
                    }
                    self.reader = handshake.reader;
                    self.writer = handshake.writer;
                    self.roster = handshake.roster;
                    return Ok(lost);
                }
                Err(err) => {
                    debug!("Reconnect attempt failed: {err:#}");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    #[must_use]
    pub fn content(&self) -> String {
        self.sync.content()
    }

    pub fn client_id(&self) -> &ClientId {
        self.sync.client_id()
    }

    #[must_use]
    pub fn roster(&self) -> &[ClientInfo] {
        &self.roster
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.sync.has_pending()
    }
}

async fn join_document(
    addr: &str,
    doc_id: &DocId,
    name: &str,
    client_id: Option<ClientId>,
) -> Result<Handshake> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {addr}"))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, MessageCodec);

    writer
        .send(ClientMessage::Join {
            doc_id: doc_id.clone(),
            client_name: name.to_string(),
            client_id,
        })
        .await
        .context("Failed to send join")?;

    let line = reader
        .next()
        .await
        .context("Server closed the connection during the handshake")?
        .context("Failed to read the join response")?;
    match ServerMessage::from_json(&line).context("Malformed join response")? {
        ServerMessage::Joined {
            client_id,
            seq,
            doc,
            clients,
        } => Ok(Handshake {
            reader,
            writer,
            client_id,
            seq,
            doc,
            roster: clients,
        }),
        ServerMessage::Error { message } => bail!("Server rejected the join: {message}"),
        other => bail!("Expected a joined frame, got: {other:?}"),
    }
}
