//! Diffusing-update computation electing per-root flood trees.
//!
//! Every flood root spans its own tree over the mesh: each node tracks, per
//! root, its hop distance, its parent (nexthop) towards the root, and the
//! set of peers that picked it as their parent. Flooding along
//! `parent + children` instead of all peers is what keeps dense meshes from
//! drowning in duplicate publications.
//!
//! The module is a pure state machine: inputs are peer up/down events and
//! [`DualMessage`]s, outputs are [`DualOutput`]s the actor turns into sends
//! and topology commands. No I/O happens here, which is also what makes the
//! computation testable on its own.
//!
//! # Messages
//!
//! - `Update`: distance advertisement. Also how a node learns that a root
//!   exists at all.
//! - `Query` / `Reply`: the diffusing part. A node that loses its route
//!   goes *active*, queries every neighbor, and returns to *passive* once
//!   all of them have answered.
//!
//! Link costs are hop counts: every link costs 1.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, error, info};

use crate::proto::{DualMessage, DualMessageKind, DualMessages, SptInfo};

/// Unreachable distance sentinel.
pub const DISTANCE_INFINITY: i64 = i64::MAX;

/// Hop cost of every mesh link.
const LINK_COST: i64 = 1;

/// Distances at or past this many hops exceed any real mesh diameter and
/// mean the distance-vector exchange is counting through a loop; they are
/// treated as unreachable so the count terminates.
const MAX_HOPS: i64 = 32;

/// Effects the caller must apply after feeding an event in.
#[derive(Debug, Clone, PartialEq)]
pub enum DualOutput {
    /// Send the contained messages to `peer`.
    Send {
        peer: String,
        messages: Vec<DualMessage>,
    },
    /// The parent towards `root_id` changed. The actor reacts by moving its
    /// child registration and re-syncing with the new parent.
    NexthopChange {
        root_id: String,
        old_nexthop: Option<String>,
        new_nexthop: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DualState {
    /// Route settled.
    Passive,
    /// Diffusing computation in flight; replies outstanding.
    Active,
}

/// Per-root route state.
#[derive(Debug)]
struct RootState {
    state: DualState,
    distance: i64,
    nexthop: Option<String>,
    /// Last distance each neighbor reported for this root.
    reported: HashMap<String, i64>,
    /// Peers that registered as our children via FLOOD_TOPO_SET.
    children: BTreeSet<String>,
    /// Neighbors whose replies we are waiting for while active.
    pending_replies: HashSet<String>,
}

impl RootState {
    fn new() -> Self {
        Self {
            state: DualState::Passive,
            distance: DISTANCE_INFINITY,
            nexthop: None,
            reported: HashMap::new(),
            children: BTreeSet::new(),
            pending_replies: HashSet::new(),
        }
    }

    fn local() -> Self {
        Self {
            distance: 0,
            ..Self::new()
        }
    }
}

/// Counter bag surfaced through FLOOD_TOPO_GET.
#[derive(Debug, Default, Clone)]
pub struct DualCounters {
    pub updates_sent: i64,
    pub updates_received: i64,
    pub queries_sent: i64,
    pub queries_received: i64,
    pub replies_sent: i64,
    pub replies_received: i64,
    pub nexthop_changes: i64,
    pub unknown_root_events: i64,
}

impl DualCounters {
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        BTreeMap::from([
            ("dual.updates_sent".to_string(), self.updates_sent),
            ("dual.updates_received".to_string(), self.updates_received),
            ("dual.queries_sent".to_string(), self.queries_sent),
            ("dual.queries_received".to_string(), self.queries_received),
            ("dual.replies_sent".to_string(), self.replies_sent),
            ("dual.replies_received".to_string(), self.replies_received),
            ("dual.nexthop_changes".to_string(), self.nexthop_changes),
            (
                "dual.unknown_root_events".to_string(),
                self.unknown_root_events,
            ),
        ])
    }
}

/// One node's view of every known flood tree.
#[derive(Debug)]
pub struct DualNode {
    node_id: String,
    roots: BTreeMap<String, RootState>,
    /// Up neighbors that participate in the computation, with link cost.
    links: BTreeMap<String, i64>,
    counters: DualCounters,
}

impl DualNode {
    pub fn new(node_id: impl Into<String>, is_root: bool) -> Self {
        let node_id = node_id.into();
        let mut roots = BTreeMap::new();
        if is_root {
            roots.insert(node_id.clone(), RootState::local());
        }
        Self {
            node_id,
            roots,
            links: BTreeMap::new(),
            counters: DualCounters::default(),
        }
    }

    /// A participating neighbor came up. Advertises every known root to it.
    pub fn peer_up(&mut self, peer: &str) -> Vec<DualOutput> {
        if peer == self.node_id {
            error!(peer = %peer, "refusing to add self as dual peer");
            return Vec::new();
        }
        info!(peer = %peer, "dual peer up");
        self.links.insert(peer.to_string(), LINK_COST);

        let mut messages = Vec::new();
        for (root_id, root) in &self.roots {
            messages.push(DualMessage {
                root_id: root_id.clone(),
                distance: root.distance,
                kind: DualMessageKind::Update,
            });
        }

        let mut outputs = Vec::new();
        if !messages.is_empty() {
            self.counters.updates_sent += messages.len() as i64;
            outputs.push(DualOutput::Send {
                peer: peer.to_string(),
                messages,
            });
        }

        // Distance advertisements can race the peer-up; anything this peer
        // already reported becomes usable now.
        let root_ids: Vec<String> = self.roots.keys().cloned().collect();
        for root_id in root_ids {
            outputs.extend(self.sync_route(&root_id));
        }
        outputs
    }

    /// A neighbor went away: drop its link, its reported distances, its
    /// child registrations, and any reply we were waiting on from it.
    pub fn peer_down(&mut self, peer: &str) -> Vec<DualOutput> {
        info!(peer = %peer, "dual peer down");
        self.links.remove(peer);

        let root_ids: Vec<String> = self.roots.keys().cloned().collect();
        let mut outputs = Vec::new();
        for root_id in root_ids {
            if let Some(root) = self.roots.get_mut(&root_id) {
                root.reported.remove(peer);
                root.children.remove(peer);
                if root.pending_replies.remove(peer) && root.pending_replies.is_empty() {
                    root.state = DualState::Passive;
                }
            }
            outputs.extend(self.sync_route(&root_id));
        }
        outputs
    }

    /// Feed a batch of messages received from `from`.
    ///
    /// Messages from a node we have not (yet) linked are absorbed into the
    /// reported-distance table but cannot form a route until the peer comes
    /// up; that keeps message/peer-up ordering races harmless.
    pub fn process_messages(&mut self, from: &str, messages: &DualMessages) -> Vec<DualOutput> {
        let mut outputs = Vec::new();
        for message in &messages.messages {
            match message.kind {
                DualMessageKind::Update => {
                    self.counters.updates_received += 1;
                    outputs.extend(self.handle_update(from, message));
                }
                DualMessageKind::Query => {
                    self.counters.queries_received += 1;
                    outputs.extend(self.handle_query(from, message));
                }
                DualMessageKind::Reply => {
                    self.counters.replies_received += 1;
                    outputs.extend(self.handle_reply(from, message));
                }
            }
        }
        outputs
    }

    fn handle_update(&mut self, from: &str, message: &DualMessage) -> Vec<DualOutput> {
        if message.root_id == self.node_id && !self.roots.contains_key(&self.node_id) {
            // Someone advertises us as a root we never claimed.
            self.counters.unknown_root_events += 1;
            error!(from = %from, "distance advertisement names this node as an unclaimed root");
            return Vec::new();
        }
        // Updates are the discovery mechanism: an unknown root gets state.
        let root = self
            .roots
            .entry(message.root_id.clone())
            .or_insert_with(RootState::new);
        root.reported.insert(from.to_string(), message.distance);
        self.sync_route(&message.root_id)
    }

    fn handle_query(&mut self, from: &str, message: &DualMessage) -> Vec<DualOutput> {
        let Some(root) = self.roots.get_mut(&message.root_id) else {
            self.counters.unknown_root_events += 1;
            error!(root_id = %message.root_id, from = %from, "dual query for unknown root");
            return Vec::new();
        };
        root.reported.insert(from.to_string(), message.distance);

        let mut outputs = self.sync_route(&message.root_id);

        let distance = self
            .roots
            .get(&message.root_id)
            .map(|r| r.distance)
            .unwrap_or(DISTANCE_INFINITY);
        self.counters.replies_sent += 1;
        outputs.push(DualOutput::Send {
            peer: from.to_string(),
            messages: vec![DualMessage {
                root_id: message.root_id.clone(),
                distance,
                kind: DualMessageKind::Reply,
            }],
        });
        outputs
    }

    fn handle_reply(&mut self, from: &str, message: &DualMessage) -> Vec<DualOutput> {
        let Some(root) = self.roots.get_mut(&message.root_id) else {
            self.counters.unknown_root_events += 1;
            error!(root_id = %message.root_id, from = %from, "dual reply for unknown root");
            return Vec::new();
        };
        root.reported.insert(from.to_string(), message.distance);
        if root.pending_replies.remove(from) && root.pending_replies.is_empty() {
            root.state = DualState::Passive;
            debug!(root_id = %message.root_id, "diffusing computation finished");
        }
        self.sync_route(&message.root_id)
    }

    /// Recompute the route for one root and emit whatever changed.
    fn sync_route(&mut self, root_id: &str) -> Vec<DualOutput> {
        let is_self_root = root_id == self.node_id;
        let (new_distance, new_nexthop) = if is_self_root {
            (0, None)
        } else {
            self.best_route(root_id)
        };

        if new_nexthop.as_deref() == Some(self.node_id.as_str()) {
            self.counters.unknown_root_events += 1;
            error!(root_id = %root_id, "computed nexthop equals self, dropping route change");
            return Vec::new();
        }

        let (old_distance, old_nexthop) = {
            let Some(root) = self.roots.get_mut(root_id) else {
                return Vec::new();
            };
            let old = (root.distance, root.nexthop.clone());
            root.distance = new_distance;
            root.nexthop = new_nexthop.clone();
            old
        };

        let distance_changed = new_distance != old_distance;
        let nexthop_changed = new_nexthop != old_nexthop;

        if !distance_changed && !nexthop_changed {
            return Vec::new();
        }

        let mut outputs = Vec::new();

        if nexthop_changed {
            self.counters.nexthop_changes += 1;
            info!(
                root_id = %root_id,
                old = %old_nexthop.as_deref().unwrap_or("none"),
                new = %new_nexthop.as_deref().unwrap_or("none"),
                "dual nexthop change"
            );
            outputs.push(DualOutput::NexthopChange {
                root_id: root_id.to_string(),
                old_nexthop,
                new_nexthop,
            });
        }

        if distance_changed {
            // Tell every participating neighbor about the new distance.
            for peer in self.links.keys() {
                self.counters.updates_sent += 1;
                outputs.push(DualOutput::Send {
                    peer: peer.clone(),
                    messages: vec![DualMessage {
                        root_id: root_id.to_string(),
                        distance: new_distance,
                        kind: DualMessageKind::Update,
                    }],
                });
            }

            // Route lost entirely: go active and ask everyone.
            if new_distance == DISTANCE_INFINITY && old_distance != DISTANCE_INFINITY {
                outputs.extend(self.start_diffusing(root_id));
            }
        }

        outputs
    }

    fn start_diffusing(&mut self, root_id: &str) -> Vec<DualOutput> {
        let peers: Vec<String> = self.links.keys().cloned().collect();
        let Some(root) = self.roots.get_mut(root_id) else {
            return Vec::new();
        };
        if peers.is_empty() {
            root.state = DualState::Passive;
            return Vec::new();
        }

        root.state = DualState::Active;
        root.pending_replies = peers.iter().cloned().collect();
        debug!(root_id = %root_id, peers = peers.len(), "starting diffusing computation");

        peers
            .into_iter()
            .map(|peer| {
                self.counters.queries_sent += 1;
                DualOutput::Send {
                    peer,
                    messages: vec![DualMessage {
                        root_id: root_id.to_string(),
                        distance: DISTANCE_INFINITY,
                        kind: DualMessageKind::Query,
                    }],
                }
            })
            .collect()
    }

    fn best_route(&self, root_id: &str) -> (i64, Option<String>) {
        let Some(root) = self.roots.get(root_id) else {
            return (DISTANCE_INFINITY, None);
        };

        let mut best_distance = DISTANCE_INFINITY;
        let mut best_peer: Option<&String> = None;
        // links is ordered, so ties break on the smallest peer name and the
        // choice is deterministic across recomputations.
        for (peer, cost) in &self.links {
            let via = root
                .reported
                .get(peer)
                .copied()
                .unwrap_or(DISTANCE_INFINITY)
                .saturating_add(*cost);
            let via = if via >= MAX_HOPS { DISTANCE_INFINITY } else { via };
            if via < best_distance {
                best_distance = via;
                best_peer = Some(peer);
            }
        }

        match best_peer {
            Some(peer) if best_distance < DISTANCE_INFINITY => (best_distance, Some(peer.clone())),
            _ => (DISTANCE_INFINITY, None),
        }
    }

    // =========================================================================
    // Child registrations (driven by FLOOD_TOPO_SET)
    // =========================================================================

    pub fn has_root(&self, root_id: &str) -> bool {
        self.roots.contains_key(root_id)
    }

    pub fn add_child(&mut self, root_id: &str, child: &str) -> bool {
        match self.roots.get_mut(root_id) {
            Some(root) => {
                info!(root_id = %root_id, child = %child, "dual child set");
                root.children.insert(child.to_string());
                true
            }
            None => {
                self.counters.unknown_root_events += 1;
                error!(root_id = %root_id, child = %child, "child set for unknown root");
                false
            }
        }
    }

    pub fn remove_child(&mut self, root_id: &str, child: &str) -> bool {
        match self.roots.get_mut(root_id) {
            Some(root) => {
                info!(root_id = %root_id, child = %child, "dual child unset");
                root.children.remove(child);
                true
            }
            None => {
                self.counters.unknown_root_events += 1;
                error!(root_id = %root_id, child = %child, "child unset for unknown root");
                false
            }
        }
    }

    /// Clear `child` from every root's children set.
    pub fn remove_child_all(&mut self, child: &str) {
        info!(child = %child, "dual child unset on all roots");
        for root in self.roots.values_mut() {
            root.children.remove(child);
        }
    }

    // =========================================================================
    // Snapshots for flooding and FLOOD_TOPO_GET
    // =========================================================================

    /// Root id this node stamps on publications it initiates: the smallest
    /// root with a usable route.
    pub fn spt_root_id(&self) -> Option<String> {
        self.roots
            .iter()
            .find(|(_, root)| root.distance != DISTANCE_INFINITY)
            .map(|(root_id, _)| root_id.clone())
    }

    /// Tree neighborhood for `root_id`: parent plus children. Empty when the
    /// root is unknown or unreachable, which callers treat as "flood to
    /// everyone".
    pub fn spt_peers(&self, root_id: Option<&str>) -> BTreeSet<String> {
        let mut peers = BTreeSet::new();
        let Some(root_id) = root_id else {
            return peers;
        };
        let Some(root) = self.roots.get(root_id) else {
            return peers;
        };
        if root.distance == DISTANCE_INFINITY {
            return peers;
        }
        if let Some(nexthop) = &root.nexthop {
            peers.insert(nexthop.clone());
        }
        peers.extend(root.children.iter().cloned());
        peers
    }

    pub fn infos(&self) -> BTreeMap<String, SptInfo> {
        self.roots
            .iter()
            .map(|(root_id, root)| {
                (
                    root_id.clone(),
                    SptInfo {
                        passive: root.state == DualState::Passive,
                        cost: root.distance,
                        parent: root.nexthop.clone(),
                        children: root.children.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn counters(&self) -> &DualCounters {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates_for(outputs: &[DualOutput], peer: &str) -> Vec<DualMessage> {
        outputs
            .iter()
            .filter_map(|o| match o {
                DualOutput::Send { peer: p, messages } if p == peer => Some(messages.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn nexthop_changes(outputs: &[DualOutput]) -> Vec<(String, Option<String>, Option<String>)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                DualOutput::NexthopChange {
                    root_id,
                    old_nexthop,
                    new_nexthop,
                } => Some((root_id.clone(), old_nexthop.clone(), new_nexthop.clone())),
                _ => None,
            })
            .collect()
    }

    /// Deliver Send outputs between two nodes until quiescent.
    fn converge(nodes: &mut BTreeMap<String, DualNode>, mut outputs: Vec<(String, DualOutput)>) {
        let mut guard = 0;
        while let Some((from, output)) = outputs.pop() {
            guard += 1;
            assert!(guard < 10_000, "dual computation did not converge");
            if let DualOutput::Send { peer, messages } = output {
                let batch = DualMessages {
                    src_id: from.clone(),
                    messages,
                };
                if let Some(node) = nodes.get_mut(&peer) {
                    for out in node.process_messages(&from, &batch) {
                        outputs.push((peer.clone(), out));
                    }
                }
            }
        }
    }

    fn linked_pair() -> BTreeMap<String, DualNode> {
        let mut nodes = BTreeMap::new();
        nodes.insert("root".to_string(), DualNode::new("root", true));
        nodes.insert("leaf".to_string(), DualNode::new("leaf", false));

        let mut outputs = Vec::new();
        let root_out = nodes.get_mut("root").unwrap().peer_up("leaf");
        outputs.extend(root_out.into_iter().map(|o| ("root".to_string(), o)));
        let leaf_out = nodes.get_mut("leaf").unwrap().peer_up("root");
        outputs.extend(leaf_out.into_iter().map(|o| ("leaf".to_string(), o)));

        converge(&mut nodes, outputs);
        nodes
    }

    #[test]
    fn test_root_advertises_itself() {
        let mut root = DualNode::new("root", true);
        let outputs = root.peer_up("leaf");
        let msgs = updates_for(&outputs, "leaf");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].root_id, "root");
        assert_eq!(msgs[0].distance, 0);
        assert_eq!(msgs[0].kind, DualMessageKind::Update);
    }

    #[test]
    fn test_leaf_learns_route_to_root() {
        let nodes = linked_pair();
        let leaf = &nodes["leaf"];
        let infos = leaf.infos();
        let info = &infos["root"];
        assert_eq!(info.cost, 1);
        assert_eq!(info.parent.as_deref(), Some("root"));
        assert!(info.passive);
        assert_eq!(leaf.spt_root_id().as_deref(), Some("root"));
    }

    #[test]
    fn test_three_node_line_distances() {
        let mut nodes = BTreeMap::new();
        nodes.insert("a".to_string(), DualNode::new("a", true));
        nodes.insert("b".to_string(), DualNode::new("b", false));
        nodes.insert("c".to_string(), DualNode::new("c", false));

        let mut outputs = Vec::new();
        for (x, y) in [("a", "b"), ("b", "a"), ("b", "c"), ("c", "b")] {
            let out = nodes.get_mut(x).unwrap().peer_up(y);
            outputs.extend(out.into_iter().map(|o| (x.to_string(), o)));
        }
        converge(&mut nodes, outputs);

        assert_eq!(nodes["b"].infos()["a"].cost, 1);
        assert_eq!(nodes["c"].infos()["a"].cost, 2);
        assert_eq!(nodes["c"].infos()["a"].parent.as_deref(), Some("b"));
    }

    #[test]
    fn test_nexthop_change_emitted_once() {
        let mut leaf = DualNode::new("leaf", false);
        leaf.peer_up("root");
        let outputs = leaf.process_messages(
            "root",
            &DualMessages {
                src_id: "root".into(),
                messages: vec![DualMessage {
                    root_id: "root".into(),
                    distance: 0,
                    kind: DualMessageKind::Update,
                }],
            },
        );

        let changes = nexthop_changes(&outputs);
        assert_eq!(
            changes,
            vec![("root".to_string(), None, Some("root".to_string()))]
        );
    }

    #[test]
    fn test_peer_down_goes_active_and_recovers() {
        let mut leaf = DualNode::new("leaf", false);
        leaf.peer_up("root");
        leaf.peer_up("relay");
        leaf.process_messages(
            "root",
            &DualMessages {
                src_id: "root".into(),
                messages: vec![DualMessage {
                    root_id: "root".into(),
                    distance: 0,
                    kind: DualMessageKind::Update,
                }],
            },
        );

        // Lose the only parent: route goes to infinity, queries go out.
        let outputs = leaf.peer_down("root");
        let changes = nexthop_changes(&outputs);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].2, None);
        assert!(!leaf.infos()["root"].passive);
        let queries = updates_for(&outputs, "relay");
        assert!(queries.iter().any(|m| m.kind == DualMessageKind::Query));

        // Relay answers with a route; leaf settles on it.
        let outputs = leaf.process_messages(
            "relay",
            &DualMessages {
                src_id: "relay".into(),
                messages: vec![DualMessage {
                    root_id: "root".into(),
                    distance: 1,
                    kind: DualMessageKind::Reply,
                }],
            },
        );
        assert!(leaf.infos()["root"].passive);
        assert_eq!(leaf.infos()["root"].cost, 2);
        let changes = nexthop_changes(&outputs);
        assert_eq!(changes[0].2.as_deref(), Some("relay"));
    }

    #[test]
    fn test_query_gets_reply() {
        let mut nodes = linked_pair();
        let root = nodes.get_mut("root").unwrap();
        let outputs = root.process_messages(
            "leaf",
            &DualMessages {
                src_id: "leaf".into(),
                messages: vec![DualMessage {
                    root_id: "root".into(),
                    distance: DISTANCE_INFINITY,
                    kind: DualMessageKind::Query,
                }],
            },
        );
        let replies = updates_for(&outputs, "leaf");
        assert!(replies
            .iter()
            .any(|m| m.kind == DualMessageKind::Reply && m.distance == 0));
    }

    #[test]
    fn test_unknown_root_query_is_logged_not_created() {
        let mut node = DualNode::new("leaf", false);
        node.peer_up("peer");
        let outputs = node.process_messages(
            "peer",
            &DualMessages {
                src_id: "peer".into(),
                messages: vec![DualMessage {
                    root_id: "ghost".into(),
                    distance: 3,
                    kind: DualMessageKind::Query,
                }],
            },
        );
        assert!(outputs.is_empty());
        assert!(!node.has_root("ghost"));
        assert_eq!(node.counters().unknown_root_events, 1);
    }

    #[test]
    fn test_children_lifecycle() {
        let mut root = DualNode::new("root", true);
        assert!(root.add_child("root", "leaf"));
        assert!(root.spt_peers(Some("root")).contains("leaf"));

        assert!(root.remove_child("root", "leaf"));
        assert!(root.spt_peers(Some("root")).is_empty());

        // Unknown root: rejected, counted.
        assert!(!root.add_child("ghost", "leaf"));
        assert_eq!(root.counters().unknown_root_events, 1);
    }

    #[test]
    fn test_remove_child_all() {
        let mut node = DualNode::new("root", true);
        node.peer_up("other-root");
        node.process_messages(
            "other-root",
            &DualMessages {
                src_id: "other-root".into(),
                messages: vec![DualMessage {
                    root_id: "other-root".into(),
                    distance: 0,
                    kind: DualMessageKind::Update,
                }],
            },
        );
        node.add_child("root", "leaf");
        node.add_child("other-root", "leaf");

        node.remove_child_all("leaf");
        assert!(node.spt_peers(Some("root")).is_empty());
        assert!(!node.spt_peers(Some("other-root")).contains("leaf"));
    }

    #[test]
    fn test_spt_peers_includes_parent_and_children() {
        let mut nodes = linked_pair();
        let leaf = nodes.get_mut("leaf").unwrap();
        leaf.add_child("root", "downstream");
        let peers = leaf.spt_peers(Some("root"));
        assert!(peers.contains("root"));
        assert!(peers.contains("downstream"));
    }

    #[test]
    fn test_spt_peers_empty_for_unknown_or_none() {
        let node = DualNode::new("leaf", false);
        assert!(node.spt_peers(None).is_empty());
        assert!(node.spt_peers(Some("ghost")).is_empty());
    }

    #[test]
    fn test_spt_root_id_smallest_reachable() {
        let mut node = DualNode::new("b-root", true);
        node.peer_up("peer");
        node.process_messages(
            "peer",
            &DualMessages {
                src_id: "peer".into(),
                messages: vec![DualMessage {
                    root_id: "a-root".into(),
                    distance: 0,
                    kind: DualMessageKind::Update,
                }],
            },
        );
        assert_eq!(node.spt_root_id().as_deref(), Some("a-root"));
    }
}
