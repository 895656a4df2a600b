// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Logical channel abstraction between nodes.
//!
//! The core never talks to a network directly; it sees channels: a command
//! inbox (request/reply), a peer sync channel carrying
//! responses stamped with the destination's socket identity, and the two
//! publisher channels (which live in [`crate::kvstore`] as broadcast
//! channels). This module defines the seam and ships [`MemoryMesh`], an
//! in-process implementation used by tests and by co-located daemon
//! modules.
//!
//! # Identity model
//!
//! When node A connects to node B it generates a socket identity
//! `"<peer-name>::<counter>"` for the link. Replies to requests A sends on
//! that link come back on A's sync channel tagged with that identity, so A
//! can correlate a response with the peer it asked even across reconnects.
//!
//! # Delivery semantics
//!
//! Sends never block the event loop. A full or disconnected destination
//! fails the send with a [`KvStoreError::Transport`], and recovery is the
//! caller's business (backoff plus periodic full sync). Endpoint resolution
//! happens per send, so connecting to a not-yet-bound URL succeeds and
//! starts delivering once the peer binds, like any lazy connect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{KvStoreError, Result};
use crate::proto::SocketId;

/// A raw message plus the path its answer should take.
#[derive(Debug)]
pub struct Incoming {
    /// Encoded [`crate::proto::KvStoreRequest`].
    pub msg: Vec<u8>,
    pub responder: Responder,
}

/// Response routed back to a full-sync initiator, stamped with the socket
/// identity the initiator assigned to the responding peer.
#[derive(Debug)]
pub struct SyncResponse {
    pub socket_id: SocketId,
    pub payload: Vec<u8>,
}

/// Sink for [`SyncResponse`]s, handed to every outbound link.
pub type ReplySink = mpsc::Sender<SyncResponse>;

/// Where a request's reply goes.
#[derive(Debug)]
pub enum Responder {
    /// Nobody is waiting (one-way message).
    None,
    /// An in-process client awaiting the raw reply bytes.
    Client(oneshot::Sender<Result<Vec<u8>>>),
    /// A peer's sync channel.
    Peer {
        sink: ReplySink,
        socket_id: SocketId,
    },
}

impl Responder {
    /// Deliver a reply. `Ok(None)` is an empty message: clients see it as
    /// empty bytes, peers receive nothing at all.
    pub fn respond(self, reply: Result<Option<Vec<u8>>>) {
        match self {
            Responder::None => {}
            Responder::Client(tx) => {
                let _ = tx.send(reply.map(Option::unwrap_or_default));
            }
            Responder::Peer { sink, socket_id } => {
                let payload = match reply {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return,
                    Err(_) => crate::proto::ACK_ERROR.to_vec(),
                };
                if sink.try_send(SyncResponse { socket_id, payload }).is_err() {
                    debug!("peer sync channel gone, dropping response");
                }
            }
        }
    }
}

/// An outbound link to one peer.
///
/// Dropping a link does not tear anything down on the remote side.
pub trait Link: Send + std::fmt::Debug {
    /// Non-blocking send of an encoded request. Replies come back on the
    /// reply sink the link was connected with.
    fn send(&self, msg: Vec<u8>) -> Result<()>;

    /// One-way send with no reply path, used for flood forwards where any
    /// ack would be discarded anyway.
    fn send_no_reply(&self, msg: Vec<u8>) -> Result<()>;

    fn socket_id(&self) -> &SocketId;

    fn cmd_url(&self) -> &str;
}

/// Connector for outbound peer links.
///
/// Implementations resolve a command URL to a deliverable endpoint. The
/// in-memory implementation is [`MemoryMesh`]; a network transport would
/// bridge the same trait onto sockets.
pub trait PeerTransport: Send + Sync + 'static {
    /// Bind a command inbox at `cmd_url`. Returns the send half (for
    /// in-process clients) and the receive half (for the node's event
    /// loop). Binding an occupied endpoint is a startup error.
    fn bind(
        &self,
        cmd_url: &str,
        capacity: usize,
    ) -> Result<(mpsc::Sender<Incoming>, mpsc::Receiver<Incoming>)>;

    /// Release a binding. Outstanding links to it start failing.
    fn unbind(&self, cmd_url: &str);

    /// Create a link to `cmd_url`. Responses to requests sent on the link
    /// arrive on `reply_sink` stamped with `socket_id`.
    fn connect(&self, cmd_url: &str, socket_id: SocketId, reply_sink: ReplySink) -> Box<dyn Link>;
}

#[derive(Debug, Clone)]
struct MemoryLink {
    mesh: MemoryMesh,
    cmd_url: String,
    socket_id: SocketId,
    reply_sink: ReplySink,
}

impl MemoryLink {
    fn deliver(&self, incoming: Incoming) -> Result<()> {
        let Some(inbox) = self.mesh.lookup(&self.cmd_url) else {
            return Err(KvStoreError::transport(&self.socket_id, "unreachable"));
        };
        inbox.try_send(incoming).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => KvStoreError::transport(&self.socket_id, "full"),
            mpsc::error::TrySendError::Closed(_) => {
                KvStoreError::transport(&self.socket_id, "closed")
            }
        })
    }
}

impl Link for MemoryLink {
    fn send(&self, msg: Vec<u8>) -> Result<()> {
        self.deliver(Incoming {
            msg,
            responder: Responder::Peer {
                sink: self.reply_sink.clone(),
                socket_id: self.socket_id.clone(),
            },
        })
    }

    fn send_no_reply(&self, msg: Vec<u8>) -> Result<()> {
        self.deliver(Incoming {
            msg,
            responder: Responder::None,
        })
    }

    fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    fn cmd_url(&self) -> &str {
        &self.cmd_url
    }
}

/// In-process mesh: a registry mapping command URLs to node inboxes.
///
/// Every node in one process shares a clone of the same mesh. Binding twice
/// on one URL is a startup error, mirroring a failed socket bind.
#[derive(Debug, Clone, Default)]
pub struct MemoryMesh {
    endpoints: Arc<Mutex<HashMap<String, mpsc::Sender<Incoming>>>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a command inbox. Returns the send half (for in-process clients)
    /// and the receive half (for the node's event loop).
    pub fn bind(
        &self,
        cmd_url: &str,
        capacity: usize,
    ) -> Result<(mpsc::Sender<Incoming>, mpsc::Receiver<Incoming>)> {
        let mut endpoints = self.endpoints.lock().expect("mesh registry poisoned");
        // A previous occupant whose receiver is gone is a stale entry from a
        // stopped node, and may be replaced.
        if let Some(existing) = endpoints.get(cmd_url) {
            if !existing.is_closed() {
                return Err(KvStoreError::Config(format!(
                    "cmd_url already bound: {cmd_url}"
                )));
            }
        }
        let (tx, rx) = mpsc::channel(capacity.max(1));
        endpoints.insert(cmd_url.to_string(), tx.clone());
        debug!(cmd_url = %cmd_url, "bound command inbox");
        Ok((tx, rx))
    }

    /// Drop a binding. Outstanding links keep failing with "unreachable".
    pub fn unbind(&self, cmd_url: &str) {
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .remove(cmd_url);
    }

    fn lookup(&self, cmd_url: &str) -> Option<mpsc::Sender<Incoming>> {
        self.endpoints
            .lock()
            .expect("mesh registry poisoned")
            .get(cmd_url)
            .cloned()
    }
}

impl PeerTransport for MemoryMesh {
    fn bind(
        &self,
        cmd_url: &str,
        capacity: usize,
    ) -> Result<(mpsc::Sender<Incoming>, mpsc::Receiver<Incoming>)> {
        MemoryMesh::bind(self, cmd_url, capacity)
    }

    fn unbind(&self, cmd_url: &str) {
        MemoryMesh::unbind(self, cmd_url)
    }

    fn connect(&self, cmd_url: &str, socket_id: SocketId, reply_sink: ReplySink) -> Box<dyn Link> {
        if self.lookup(cmd_url).is_none() {
            // Lazy connect: the peer may bind later. Worth a log line.
            warn!(cmd_url = %cmd_url, socket_id = %socket_id, "connecting to unbound endpoint");
        }
        Box::new(MemoryLink {
            mesh: self.clone(),
            cmd_url: cmd_url.to_string(),
            socket_id,
            reply_sink,
        })
    }
}
