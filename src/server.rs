// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The network-facing half of the server.
//!
//! Every document session lives in its own task and is driven through an
//! mpsc mailbox, so all mutations of a document are serialized without
//! locks. Connection tasks parse frames and forward them as
//! [`SessionCommand`]s; outgoing frames are enqueued onto bounded per-client
//! channels inside the session task and written to the sockets by dedicated
//! writer tasks, so a slow client can never stall a document.

use crate::protocol::{ClientMessage, CursorPayload, MessageCodec, ServerMessage};
use crate::session::DocumentSession;
use crate::types::{ClientId, DocId, Operation};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

/// Outgoing frames a client has not picked up yet. When this overflows the
/// client is considered too slow and is disconnected.
const OUTBOUND_QUEUE_SIZE: usize = 256;
/// A connection that sends nothing for this long is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// A single frame that cannot be written within this deadline closes the
/// connection.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const MAILBOX_SIZE: usize = 16;

type OutboundSender = mpsc::Sender<ServerMessage>;

// These messages are sent to the task that owns a document session.
pub enum SessionCommand {
    Join {
        requested_id: Option<ClientId>,
        name: String,
        outbound: OutboundSender,
        response_tx: oneshot::Sender<ClientId>,
    },
    Op {
        client_id: ClientId,
        operation: Operation,
        base_seq: Option<u64>,
    },
    Cursor {
        client_id: ClientId,
        payload: CursorPayload,
    },
    Disconnect {
        client_id: ClientId,
        /// The closing connection's outbound channel. A disconnect only
        /// counts while this is still the client's registered channel;
        /// otherwise the client has already re-joined over a new connection
        /// and the stale disconnect must not evict it.
        outbound: OutboundSender,
    },
    GetContent {
        response_tx: oneshot::Sender<String>,
    },
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let repr = match self {
            SessionCommand::Join { .. } => "join",
            SessionCommand::Op { .. } => "op",
            SessionCommand::Cursor { .. } => "cursor",
            SessionCommand::Disconnect { .. } => "disconnect",
            SessionCommand::GetContent { .. } => "get content",
        };
        write!(f, "{repr}")
    }
}

struct SessionActor {
    doc_id: DocId,
    session: DocumentSession,
    mailbox: mpsc::Receiver<SessionCommand>,
    outbounds: HashMap<ClientId, OutboundSender>,
}

impl SessionActor {
    async fn run(mut self) {
        while let Some(command) = self.mailbox.recv().await {
            debug!("Handling session command: {command:?}");
            let was_populated = !self.session.is_empty();
            self.handle_command(command);
            if was_populated && self.session.is_empty() {
                debug!(
                    "Last client left document '{}', reclaiming the session",
                    self.doc_id
                );
                break;
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                requested_id,
                name,
                outbound,
                response_tx,
            } => {
                let outcome = self.session.join(requested_id, &name);
                self.outbounds.insert(outcome.client_id.clone(), outbound);
                let _ = response_tx.send(outcome.client_id.clone());
                // The joined frame goes through the client's own queue, so it
                // is ordered before any op broadcast that follows.
                self.send_to(&outcome.client_id, outcome.response);
                self.broadcast_except(&outcome.client_id, outcome.announcement);
            }
            SessionCommand::Op {
                client_id,
                operation,
                base_seq,
            } => match self.session.apply(&client_id, operation, base_seq) {
                Ok(outcome) => {
                    self.send_to(&client_id, outcome.ack);
                    self.broadcast_except(&client_id, outcome.broadcast);
                }
                Err(err) => {
                    warn!("Rejecting operation on '{}': {err}", self.doc_id);
                    self.send_to(&client_id, ServerMessage::error(err.to_string()));
                }
            },
            SessionCommand::Cursor { client_id, payload } => {
                match self.session.cursor(&client_id, payload) {
                    Ok(frame) => self.broadcast_except(&client_id, frame),
                    Err(err) => self.send_to(&client_id, ServerMessage::error(err.to_string())),
                }
            }
            SessionCommand::Disconnect {
                client_id,
                outbound,
            } => {
                let still_current = self
                    .outbounds
                    .get(&client_id)
                    .is_some_and(|tx| tx.same_channel(&outbound));
                if still_current {
                    self.drop_client(&client_id);
                }
            }
            SessionCommand::GetContent { response_tx } => {
                let _ = response_tx.send(self.session.content());
            }
        }
    }

    /// Non-blocking enqueue. Overflow means the client is not draining its
    /// socket; it gets disconnected rather than letting its backlog grow.
    fn send_to(&mut self, client_id: &ClientId, message: ServerMessage) {
        let Some(tx) = self.outbounds.get(client_id) else {
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Client {client_id} cannot keep up with '{}', disconnecting it",
                    self.doc_id
                );
                self.drop_client(client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Client {client_id} is gone, cleaning it up");
                self.drop_client(client_id);
            }
        }
    }

    fn broadcast_except(&mut self, except: &ClientId, message: ServerMessage) {
        let recipients: Vec<ClientId> = self
            .outbounds
            .keys()
            .filter(|id| *id != except)
            .cloned()
            .collect();
        for id in recipients {
            self.send_to(&id, message.clone());
        }
    }

    fn drop_client(&mut self, client_id: &ClientId) {
        self.outbounds.remove(client_id);
        if let Some(frame) = self.session.disconnect(client_id) {
            self.broadcast_except(client_id, frame);
        }
    }
}

/// Cheap cloneable address of a session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    #[must_use]
    pub fn spawn(doc_id: DocId) -> Self {
        let (tx, mailbox) = mpsc::channel(MAILBOX_SIZE);
        let actor = SessionActor {
            doc_id,
            session: DocumentSession::new(""),
            mailbox,
            outbounds: HashMap::new(),
        };
        tokio::spawn(actor.run());
        Self { tx }
    }

    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .context("Session task has shut down")
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Snapshot of the document between applies, for tests and diagnostics.
    pub async fn content(&self) -> Result<String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SessionCommand::GetContent { response_tx }).await?;
        response_rx
            .await
            .context("Session task dropped the content request")
    }
}

/// Process-wide map of live documents. Lookups hold the lock only long
/// enough to clone a handle; everything else happens inside the session
/// tasks.
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<DocId, SessionHandle>>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, doc_id: &DocId) -> SessionHandle {
        let mut sessions = self.sessions.lock().expect("Registry lock is poisoned");
        sessions.retain(|_, handle| !handle.is_closed());
        sessions
            .entry(doc_id.clone())
            .or_insert_with(|| {
                info!("Creating session for document '{doc_id}'");
                SessionHandle::spawn(doc_id.clone())
            })
            .clone()
    }
}

/// Bind the port and serve forever.
pub async fn listen(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind TCP port {port}"))?;
    info!("Listening on TCP port {port}");
    serve(listener).await
}

/// Accept loop over an already-bound listener (tests bind port 0).
pub async fn serve(listener: TcpListener) -> Result<()> {
    let registry = Registry::new();
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            error!("Error accepting connection.");
            continue;
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            debug!("Connection from {addr}");
            match handle_connection(stream, registry).await {
                Ok(()) => debug!("Connection from {addr} closed"),
                Err(err) => debug!("Connection from {addr} ended: {err:#}"),
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, registry: Registry) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LinesCodec::new());
    let mut writer = FramedWrite::new(write_half, MessageCodec);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_SIZE);

    // All writes happen here, outside every session's critical section.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match timeout(WRITE_DEADLINE, writer.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!("Failed to write to client: {err:#}");
                    break;
                }
                Err(_) => {
                    warn!("Write deadline exceeded, dropping the connection");
                    break;
                }
            }
        }
    });

    // The documents this connection has joined, and as whom.
    let mut joined: HashMap<DocId, (ClientId, SessionHandle)> = HashMap::new();

    let result = read_loop(&mut reader, &registry, &outbound_tx, &mut joined).await;

    for (client_id, handle) in joined.into_values() {
        let _ = handle
            .send(SessionCommand::Disconnect {
                client_id,
                outbound: outbound_tx.clone(),
            })
            .await;
    }
    writer_task.abort();
    result
}

async fn read_loop(
    reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>,
    registry: &Registry,
    outbound_tx: &OutboundSender,
    joined: &mut HashMap<DocId, (ClientId, SessionHandle)>,
) -> Result<()> {
    loop {
        let line = match timeout(IDLE_TIMEOUT, reader.next()).await {
            Err(_) => {
                debug!("Client was idle for too long, closing the connection");
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Ok(Some(Err(err))) => return Err(err).context("Failed to read frame"),
            Ok(Some(Ok(line))) => line,
        };

        let message = match ClientMessage::from_json(&line) {
            Ok(message) => message,
            Err(err) => {
                debug!("Malformed frame from client: {err}");
                let _ = outbound_tx
                    .send(ServerMessage::error(format!("Malformed frame: {err}")))
                    .await;
                continue;
            }
        };

        dispatch(message, registry, outbound_tx, joined).await?;
    }
}

async fn dispatch(
    message: ClientMessage,
    registry: &Registry,
    outbound_tx: &OutboundSender,
    joined: &mut HashMap<DocId, (ClientId, SessionHandle)>,
) -> Result<()> {
    match message {
        ClientMessage::Join {
            doc_id,
            client_name,
            client_id,
        } => {
            let handle = registry.get_or_create(&doc_id);
            let (response_tx, response_rx) = oneshot::channel();
            handle
                .send(SessionCommand::Join {
                    requested_id: client_id,
                    name: client_name,
                    outbound: outbound_tx.clone(),
                    response_tx,
                })
                .await?;
            let assigned = response_rx
                .await
                .context("Session dropped the join request")?;
            joined.insert(doc_id, (assigned, handle));
        }
        ClientMessage::Op {
            doc_id,
            operation,
            base_seq,
        } => {
            let Some((client_id, handle)) = joined.get(&doc_id) else {
                let _ = outbound_tx
                    .send(ServerMessage::error(format!(
                        "Not joined to document '{doc_id}'"
                    )))
                    .await;
                return Ok(());
            };
            if operation.client_id() != client_id {
                let _ = outbound_tx
                    .send(ServerMessage::error(
                        "Operation client id does not match the connection",
                    ))
                    .await;
                return Ok(());
            }
            handle
                .send(SessionCommand::Op {
                    client_id: client_id.clone(),
                    operation,
                    base_seq,
                })
                .await?;
        }
        ClientMessage::Cursor {
            doc_id, payload, ..
        } => {
            let Some((client_id, handle)) = joined.get(&doc_id) else {
                let _ = outbound_tx
                    .send(ServerMessage::error(format!(
                        "Not joined to document '{doc_id}'"
                    )))
                    .await;
                return Ok(());
            };
            handle
                .send(SessionCommand::Cursor {
                    client_id: client_id.clone(),
                    payload,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use pretty_assertions::assert_eq;

    async fn join(
        handle: &SessionHandle,
        id: &str,
    ) -> (ClientId, mpsc::Receiver<ServerMessage>, OutboundSender) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (response_tx, response_rx) = oneshot::channel();
        handle
            .send(SessionCommand::Join {
                requested_id: Some(ClientId::from(id)),
                name: id.to_string(),
                outbound: outbound_tx.clone(),
                response_tx,
            })
            .await
            .unwrap();
        (response_rx.await.unwrap(), outbound_rx, outbound_tx)
    }

    #[tokio::test]
    async fn join_apply_and_broadcast_flow() {
        let handle = SessionHandle::spawn(DocId::from("doc"));
        let (a, mut a_rx, _a_tx) = join(&handle, "A").await;
        let (_b, mut b_rx, _b_tx) = join(&handle, "B").await;

        let ServerMessage::Joined { seq, doc, .. } = a_rx.recv().await.unwrap() else {
            panic!("expected a joined frame first");
        };
        assert_eq!((seq, doc.as_str()), (0, ""));

        handle
            .send(SessionCommand::Op {
                client_id: a.clone(),
                operation: insert("A", 0, 0, "hi"),
                base_seq: Some(0),
            })
            .await
            .unwrap();

        let ServerMessage::Joined { .. } = b_rx.recv().await.unwrap() else {
            panic!("expected a joined frame first");
        };
        let ServerMessage::Op { operation, .. } = b_rx.recv().await.unwrap() else {
            panic!("expected the broadcast op");
        };
        assert_eq!(operation.operation, insert("A", 0, 0, "hi"));

        // A sees B's arrival, then the ack for its own op — never an echo.
        let ServerMessage::Join { .. } = a_rx.recv().await.unwrap() else {
            panic!("expected B's join announcement");
        };
        let ServerMessage::Ack {
            client_seq,
            server_seq,
        } = a_rx.recv().await.unwrap()
        else {
            panic!("expected an ack");
        };
        assert_eq!((client_seq, server_seq), (0, 1));

        assert_eq!(handle.content().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn session_task_reclaims_itself_when_the_roster_empties() {
        let handle = SessionHandle::spawn(DocId::from("doc"));
        let (a, _a_rx, a_tx) = join(&handle, "A").await;
        handle
            .send(SessionCommand::Disconnect {
                client_id: a,
                outbound: a_tx,
            })
            .await
            .unwrap();

        // The mailbox closes once the task is gone.
        let mut closed = false;
        for _ in 0..50 {
            if handle.is_closed() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed, "session task should shut down");
    }

    #[tokio::test]
    async fn registry_replaces_reclaimed_sessions() {
        let registry = Registry::new();
        let first = registry.get_or_create(&DocId::from("doc"));

        let (a, _a_rx, a_tx) = join(&first, "A").await;
        first
            .send(SessionCommand::Disconnect {
                client_id: a,
                outbound: a_tx,
            })
            .await
            .unwrap();
        for _ in 0..50 {
            if first.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.is_closed());

        let second = registry.get_or_create(&DocId::from("doc"));
        assert!(!second.is_closed());
        assert_eq!(second.content().await.unwrap(), "");
    }

    #[tokio::test]
    async fn disconnect_is_announced_to_the_others() {
        let handle = SessionHandle::spawn(DocId::from("doc"));
        let (a, _a_rx, a_tx) = join(&handle, "A").await;
        let (_b, mut b_rx, _b_tx) = join(&handle, "B").await;

        handle
            .send(SessionCommand::Disconnect {
                client_id: a.clone(),
                outbound: a_tx,
            })
            .await
            .unwrap();

        let ServerMessage::Joined { .. } = b_rx.recv().await.unwrap() else {
            panic!("expected the joined frame first");
        };
        let ServerMessage::Disconnect { client_id } = b_rx.recv().await.unwrap() else {
            panic!("expected the disconnect announcement");
        };
        assert_eq!(client_id, a);
    }
}
