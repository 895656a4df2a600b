//! Peer registry: who we talk to and over which link.
//!
//! Every peer carries a [`PeerSpec`] plus a socket identity of the form
//! `"<peer-name>::<counter>"`. The counter bumps on every PEER_ADD batch,
//! so a peer that reconnects gets a fresh identity and responses from a
//! previous incarnation cannot be confused with current ones.
//!
//! Full-sync scheduling state lives with the actor, not here; the registry
//! only answers "who are my peers and how do I reach them".

use std::collections::HashMap;

use tracing::{info, warn};

use crate::proto::{PeerCmdReply, PeerSpec, SocketId};
use crate::transport::{Link, PeerTransport, ReplySink};

/// One registered peer.
#[derive(Debug)]
pub struct PeerEntry {
    pub spec: PeerSpec,
    pub socket_id: SocketId,
    pub link: Box<dyn Link>,
}

/// What [`PeerRegistry::add`] did with the peer, so the caller can run the
/// matching lifecycle steps (dual peer-up, child resets, full sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// True for a brand-new peer or one that came back after a
    /// non-graceful restart.
    pub is_new_peer: bool,
    /// True when a (re)connect happened because the endpoint was new or
    /// changed.
    pub reconnected: bool,
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
    add_counter: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the identity counter. Called once per PEER_ADD batch, before
    /// adding the batch's peers.
    pub fn next_generation(&mut self) {
        self.add_counter += 1;
    }

    /// Add or update a peer, (re)connecting its link as needed.
    pub fn add(
        &mut self,
        peer_name: &str,
        spec: PeerSpec,
        transport: &dyn PeerTransport,
        reply_sink: &ReplySink,
    ) -> AddOutcome {
        let socket_id = format!("{}::{}", peer_name, self.add_counter);

        match self.peers.get_mut(peer_name) {
            Some(entry) => {
                if entry.spec.cmd_url != spec.cmd_url {
                    // Endpoint moved: drop the old link, dial the new one.
                    info!(
                        peer = %peer_name,
                        old_url = %entry.spec.cmd_url,
                        new_url = %spec.cmd_url,
                        "peer endpoint changed, reconnecting"
                    );
                    entry.link = transport.connect(&spec.cmd_url, socket_id.clone(), reply_sink.clone());
                    entry.socket_id = socket_id;
                    entry.spec = spec;
                    AddOutcome {
                        is_new_peer: false,
                        reconnected: true,
                    }
                } else {
                    // Same endpoint re-announced: the peer restarted without
                    // saying goodbye. Treat it as new so parenting and sync
                    // state get rebuilt.
                    warn!(peer = %peer_name, "peer re-added, assuming non-graceful restart");
                    entry.spec = spec;
                    AddOutcome {
                        is_new_peer: true,
                        reconnected: false,
                    }
                }
            }
            None => {
                info!(
                    peer = %peer_name,
                    cmd_url = %spec.cmd_url,
                    supports_flood_optimization = spec.supports_flood_optimization,
                    "adding new peer"
                );
                let link = transport.connect(&spec.cmd_url, socket_id.clone(), reply_sink.clone());
                self.peers.insert(
                    peer_name.to_string(),
                    PeerEntry {
                        spec,
                        socket_id,
                        link,
                    },
                );
                AddOutcome {
                    is_new_peer: true,
                    reconnected: true,
                }
            }
        }
    }

    /// Detach a peer. Returns its entry so the caller can finish cleanup.
    pub fn remove(&mut self, peer_name: &str) -> Option<PeerEntry> {
        let entry = self.peers.remove(peer_name);
        if let Some(entry) = &entry {
            info!(peer = %peer_name, cmd_url = %entry.spec.cmd_url, "detaching peer");
        }
        entry
    }

    pub fn get(&self, peer_name: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_name)
    }

    pub fn contains(&self, peer_name: &str) -> bool {
        self.peers.contains_key(peer_name)
    }

    /// Resolve a socket identity back to the peer that currently owns it.
    /// Identities from older incarnations resolve to nothing.
    pub fn find_by_socket_id(&self, socket_id: &SocketId) -> Option<(&String, &PeerEntry)> {
        self.peers
            .iter()
            .find(|(_, entry)| entry.socket_id == *socket_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerEntry)> {
        self.peers.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.peers.keys()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn dump(&self) -> PeerCmdReply {
        PeerCmdReply {
            peers: self
                .peers
                .iter()
                .map(|(name, entry)| (name.clone(), entry.spec.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryMesh;
    use tokio::sync::mpsc;

    fn spec(url: &str) -> PeerSpec {
        PeerSpec {
            cmd_url: url.to_string(),
            supports_flood_optimization: false,
        }
    }

    fn registry_with_sink() -> (PeerRegistry, MemoryMesh, ReplySink) {
        let (sync_tx, _sync_rx) = mpsc::channel(16);
        // Receiver is dropped; these tests never route responses.
        (PeerRegistry::new(), MemoryMesh::new(), sync_tx)
    }

    #[test]
    fn test_add_new_peer() {
        let (mut registry, mesh, sink) = registry_with_sink();
        registry.next_generation();
        let outcome = registry.add("peer-1", spec("mem://p1/cmd"), &mesh, &sink);

        assert!(outcome.is_new_peer);
        assert!(outcome.reconnected);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("peer-1").unwrap().socket_id, "peer-1::1");
    }

    #[test]
    fn test_readd_same_endpoint_is_restart() {
        let (mut registry, mesh, sink) = registry_with_sink();
        registry.next_generation();
        registry.add("peer-1", spec("mem://p1/cmd"), &mesh, &sink);

        registry.next_generation();
        let outcome = registry.add("peer-1", spec("mem://p1/cmd"), &mesh, &sink);
        assert!(outcome.is_new_peer);
        assert!(!outcome.reconnected);
        // Identity unchanged: the link was not re-dialed.
        assert_eq!(registry.get("peer-1").unwrap().socket_id, "peer-1::1");
    }

    #[test]
    fn test_endpoint_change_reconnects_with_new_identity() {
        let (mut registry, mesh, sink) = registry_with_sink();
        registry.next_generation();
        registry.add("peer-1", spec("mem://old/cmd"), &mesh, &sink);

        registry.next_generation();
        let outcome = registry.add("peer-1", spec("mem://new/cmd"), &mesh, &sink);
        assert!(!outcome.is_new_peer);
        assert!(outcome.reconnected);

        let entry = registry.get("peer-1").unwrap();
        assert_eq!(entry.socket_id, "peer-1::2");
        assert_eq!(entry.spec.cmd_url, "mem://new/cmd");
        assert_eq!(entry.link.cmd_url(), "mem://new/cmd");
    }

    #[test]
    fn test_find_by_socket_id() {
        let (mut registry, mesh, sink) = registry_with_sink();
        registry.next_generation();
        registry.add("peer-1", spec("mem://p1/cmd"), &mesh, &sink);

        let (name, _) = registry.find_by_socket_id(&"peer-1::1".to_string()).unwrap();
        assert_eq!(name, "peer-1");
        assert!(registry.find_by_socket_id(&"peer-1::9".to_string()).is_none());
    }

    #[test]
    fn test_remove_and_dump() {
        let (mut registry, mesh, sink) = registry_with_sink();
        registry.next_generation();
        registry.add("peer-1", spec("mem://p1/cmd"), &mesh, &sink);
        registry.add("peer-2", spec("mem://p2/cmd"), &mesh, &sink);

        let dump = registry.dump();
        assert_eq!(dump.peers.len(), 2);

        assert!(registry.remove("peer-1").is_some());
        assert!(registry.remove("peer-1").is_none());
        assert_eq!(registry.dump().peers.len(), 1);
    }
}
