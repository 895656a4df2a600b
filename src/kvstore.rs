// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The store actor: one cooperative event loop per node.
//!
//! Every mutation funnels through [`KvStore::run`]: client and peer
//! requests off the command inbox, full-sync responses off the peer sync
//! channel, and the timers (TTL expiry, full-sync retry, rate-limit flush,
//! periodic anti-entropy, counters submit). A merge is fully applied and
//! its consequences (TTL queue, publish, flood) all happen before the next
//! event is looked at, so no intra-node locking exists anywhere.
//!
//! # Data flow
//!
//! ```text
//! client SET ──┐
//!              ├──▶ merge ──▶ delta? ──▶ TTL queue ──▶ publish ──▶ flood
//! peer KEY_SET ┘                │                      (local+global)  │
//!                               └─ empty: count redundant         peers minus
//!                                                                 sender, via
//!                                                                 SPT when on
//! ```
//!
//! Periodically a random peer is picked for a three-way full sync; peers
//! that cannot be reached stay queued behind an exponential backoff.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::KvStoreConfig;
use crate::dual::{DualNode, DualOutput};
use crate::error::{KvStoreError, Result};
use crate::metrics;
use crate::proto::{
    self, Command, DualMessage, DualMessages, FloodTopoSetParams, KeyDumpParams, KeySetParams,
    KvStoreRequest, PeerCmdReply, PeerSpec, Publication, SocketId, SptInfos, Value, ACK_ERROR,
    ACK_SUCCESS,
};
use crate::peer::PeerRegistry;
use crate::resilience::{ExponentialBackoff, FloodLimiter, MAX_BACKOFF};
use crate::store::{self, KvStoreFilters};
use crate::transport::{Incoming, Link as _, PeerTransport, Responder, SyncResponse};
use crate::ttl::{TtlCountdownQueue, TtlEntry};

/// Delay before retrying a flood flush while the token bucket is empty.
const FLOOD_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Keys this close to expiry are dropped from forwarded publications; they
/// would die in flight anyway.
const TTL_FLOOD_THRESHOLD: Duration = Duration::from_millis(500);

/// Capacity of the local and global publisher channels.
const PUBLISHER_CAPACITY: usize = 1_024;

/// Client-side handle to a spawned store.
///
/// Requests are encoded onto the command channel exactly like a peer's
/// would be; the handle decodes the typed reply. Subscriptions hand out
/// broadcast receivers fed by the publisher.
pub struct KvStoreHandle {
    node_id: String,
    cmd_tx: mpsc::Sender<Incoming>,
    local_pub: broadcast::Sender<Publication>,
    global_pub: broadcast::Sender<Publication>,
    shutdown_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl KvStoreHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Send a raw request and wait for the raw reply bytes.
    pub async fn request_raw(&self, request: &KvStoreRequest) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Incoming {
                msg: proto::encode_request(request),
                responder: Responder::Client(tx),
            })
            .await
            .map_err(|_| KvStoreError::Shutdown)?;
        rx.await.map_err(|_| KvStoreError::Shutdown)?
    }

    /// KEY_SET with an acknowledgment.
    pub async fn set_key_vals(&self, key_vals: HashMap<String, Value>) -> Result<()> {
        let request = KvStoreRequest {
            cmd: Some(Command::KeySet),
            key_set_params: Some(KeySetParams {
                key_vals,
                solicit_response: true,
                node_ids: None,
                flood_root_id: None,
            }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        if reply == ACK_SUCCESS {
            Ok(())
        } else {
            Err(KvStoreError::UnexpectedResponse)
        }
    }

    /// Set a single key.
    pub async fn set_key(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut key_vals = HashMap::new();
        key_vals.insert(key.into(), value);
        self.set_key_vals(key_vals).await
    }

    /// KEY_GET: look up specific keys. TTLs reflect remaining time.
    pub async fn get_keys(&self, keys: Vec<String>) -> Result<Publication> {
        let request = KvStoreRequest {
            cmd: Some(Command::KeyGet),
            key_get_params: Some(proto::KeyGetParams { keys }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_publication(&reply)?)
    }

    /// KEY_DUMP with a comma separated prefix filter.
    pub async fn dump_all(&self, prefix: &str) -> Result<Publication> {
        let request = KvStoreRequest {
            cmd: Some(Command::KeyDump),
            key_dump_params: Some(KeyDumpParams {
                prefix: prefix.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_publication(&reply)?)
    }

    /// HASH_DUMP: per-key metadata and fingerprints, no payloads.
    pub async fn dump_hashes(&self, prefix: &str) -> Result<Publication> {
        let request = KvStoreRequest {
            cmd: Some(Command::HashDump),
            key_dump_params: Some(KeyDumpParams {
                prefix: prefix.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_publication(&reply)?)
    }

    /// PEER_ADD: register or update peers, scheduling full syncs with them.
    pub async fn add_peers(&self, peers: HashMap<String, PeerSpec>) -> Result<PeerCmdReply> {
        let request = KvStoreRequest {
            cmd: Some(Command::PeerAdd),
            peer_add_params: Some(proto::PeerAddParams { peers }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_peer_reply(&reply)?)
    }

    /// PEER_DEL: detach peers.
    pub async fn del_peers(&self, peer_names: Vec<String>) -> Result<PeerCmdReply> {
        let request = KvStoreRequest {
            cmd: Some(Command::PeerDel),
            peer_del_params: Some(proto::PeerDelParams { peer_names }),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_peer_reply(&reply)?)
    }

    /// PEER_DUMP: the current peer list.
    pub async fn dump_peers(&self) -> Result<PeerCmdReply> {
        let request = KvStoreRequest {
            cmd: Some(Command::PeerDump),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_peer_reply(&reply)?)
    }

    /// FLOOD_TOPO_GET: spanning-tree state and counters.
    pub async fn flood_topo_get(&self) -> Result<SptInfos> {
        let request = KvStoreRequest {
            cmd: Some(Command::FloodTopoGet),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_spt_infos(&reply)?)
    }

    /// FLOOD_TOPO_SET: set or clear a child registration.
    pub async fn flood_topo_set(&self, params: FloodTopoSetParams) -> Result<()> {
        let request = KvStoreRequest {
            cmd: Some(Command::FloodTopoSet),
            flood_topo_set_params: Some(params),
            ..Default::default()
        };
        self.request_raw(&request).await?;
        Ok(())
    }

    /// COUNTERS_GET: the actor's counter snapshot.
    pub async fn counters(&self) -> Result<BTreeMap<String, i64>> {
        let request = KvStoreRequest {
            cmd: Some(Command::CountersGet),
            ..Default::default()
        };
        let reply = self.request_raw(&request).await?;
        Ok(proto::decode_counters(&reply)?)
    }

    /// Subscribe to publications for co-located consumers (the decision
    /// subsystem).
    pub fn subscribe_local(&self) -> broadcast::Receiver<Publication> {
        self.local_pub.subscribe()
    }

    /// Subscribe to the global publisher (out-of-band observers).
    pub fn subscribe_global(&self) -> broadcast::Receiver<Publication> {
        self.global_pub.subscribe()
    }

    /// Stop the actor and wait for it to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let join = self.join.lock().expect("join handle lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// The store actor. All fields are single-owner; nothing escapes the task.
pub struct KvStore {
    config: KvStoreConfig,
    node_id: String,
    transport: Arc<dyn PeerTransport>,

    store: HashMap<String, Value>,
    filters: Option<KvStoreFilters>,
    ttl_queue: TtlCountdownQueue,
    peers: PeerRegistry,
    dual: DualNode,

    /// Peers queued for a full sync, each behind its own backoff.
    pending_syncs: HashMap<String, ExponentialBackoff>,
    /// Outstanding sync requests by destination identity, for duration
    /// accounting.
    latest_sent_peer_sync: HashMap<SocketId, Instant>,

    flood_limiter: Option<FloodLimiter>,
    /// Keys awaiting a rate-limited flush, grouped by flood root. Values
    /// are re-read from the store at flush time.
    publication_buffer: HashMap<Option<String>, BTreeSet<String>>,

    counters: BTreeMap<String, i64>,
    rng: StdRng,

    cmd_rx: mpsc::Receiver<Incoming>,
    sync_tx: mpsc::Sender<SyncResponse>,
    sync_rx: mpsc::Receiver<SyncResponse>,
    local_pub: broadcast::Sender<Publication>,
    global_pub: broadcast::Sender<Publication>,
    shutdown_rx: watch::Receiver<bool>,

    ttl_deadline: Option<Instant>,
    full_sync_deadline: Option<Instant>,
    flood_flush_deadline: Option<Instant>,
    periodic_sync_deadline: Instant,
    counters_deadline: Instant,
}

impl KvStore {
    /// Validate the config, bind the command channel, and start the actor.
    pub fn spawn(
        config: KvStoreConfig,
        initial_peers: HashMap<String, PeerSpec>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<KvStoreHandle> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = transport.bind(&config.cmd_url, config.high_watermark)?;
        let (sync_tx, sync_rx) = mpsc::channel(config.high_watermark.max(1));
        let (local_pub, _) = broadcast::channel(PUBLISHER_CAPACITY);
        let (global_pub, _) = broadcast::channel(PUBLISHER_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let filters = config.filters.as_ref().map(|f| {
            KvStoreFilters::new(
                f.key_prefixes.clone(),
                f.originator_ids.iter().cloned().collect(),
            )
        });
        let flood_limiter = config.flood_rate.map(FloodLimiter::new);
        let dual = DualNode::new(config.node_id.as_str(), config.is_flood_root);

        let node_id = config.node_id.clone();
        let now = Instant::now();
        let counters_deadline = now + config.monitor_submit_interval();

        info!(
            node_id = %node_id,
            cmd_url = %config.cmd_url,
            peer_count = initial_peers.len(),
            flood_optimization = config.enable_flood_optimization,
            "starting kvstore"
        );

        let mut actor = KvStore {
            node_id: node_id.clone(),
            transport,
            store: HashMap::new(),
            filters,
            ttl_queue: TtlCountdownQueue::new(),
            peers: PeerRegistry::new(),
            dual,
            pending_syncs: HashMap::new(),
            latest_sent_peer_sync: HashMap::new(),
            flood_limiter,
            publication_buffer: HashMap::new(),
            counters: BTreeMap::new(),
            rng: StdRng::from_entropy(),
            cmd_rx,
            sync_tx,
            sync_rx,
            local_pub: local_pub.clone(),
            global_pub: global_pub.clone(),
            shutdown_rx,
            ttl_deadline: None,
            full_sync_deadline: None,
            flood_flush_deadline: None,
            periodic_sync_deadline: now,
            counters_deadline,
            config,
        };

        let join = tokio::spawn(async move {
            if !initial_peers.is_empty() {
                actor.add_peers(initial_peers);
            }
            actor.run().await;
        });

        Ok(KvStoreHandle {
            node_id,
            cmd_tx,
            local_pub,
            global_pub,
            shutdown_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// The event loop. Exits on shutdown or when every command sender is
    /// gone.
    async fn run(&mut self) {
        loop {
            let ttl_at = self.ttl_deadline;
            let full_sync_at = self.full_sync_deadline;
            let flush_at = self.flood_flush_deadline;
            let periodic_at = self.periodic_sync_deadline;
            let counters_at = self.counters_deadline;

            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                maybe_incoming = self.cmd_rx.recv() => {
                    match maybe_incoming {
                        Some(incoming) => self.handle_incoming(incoming),
                        None => break,
                    }
                }
                Some(response) = self.sync_rx.recv() => {
                    self.handle_sync_response(response);
                }
                _ = sleep_until_opt(ttl_at), if ttl_at.is_some() => {
                    self.cleanup_ttl_countdown_queue();
                }
                _ = sleep_until_opt(full_sync_at), if full_sync_at.is_some() => {
                    self.request_full_sync_from_peers();
                }
                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    self.handle_flood_flush_timer();
                }
                _ = sleep_until_opt(Some(periodic_at)) => {
                    self.request_periodic_sync();
                }
                _ = sleep_until_opt(Some(counters_at)) => {
                    self.submit_counters();
                }
            }
        }

        self.transport.unbind(&self.config.cmd_url);
        info!(node_id = %self.node_id, "kvstore stopped");
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    fn handle_incoming(&mut self, incoming: Incoming) {
        let request = match proto::decode_request(&incoming.msg) {
            Ok(request) => request,
            Err(e) => {
                self.bump("kvstore.decode_failures", 1);
                metrics::record_decode_failure();
                error!(error = %e, "failed to decode request, discarding");
                incoming.responder.respond(Err(e.into()));
                return;
            }
        };
        let result = self.process_request(request);
        incoming.responder.respond(result);
    }

    fn process_request(&mut self, request: KvStoreRequest) -> Result<Option<Vec<u8>>> {
        let Some(cmd) = request.cmd else {
            error!("request without a command");
            return Err(KvStoreError::MalformedRequest {
                cmd: "UNKNOWN",
                reason: "missing command",
            });
        };
        trace!(cmd = cmd.as_str(), "processing request");
        metrics::record_command(cmd.as_str());

        match cmd {
            Command::KeySet => {
                self.bump("kvstore.cmd_key_set", 1);
                let Some(mut params) = request.key_set_params else {
                    error!("received KEY_SET without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "KEY_SET",
                        reason: "missing keySetParams",
                    });
                };
                if params.key_vals.is_empty() {
                    error!("malformed KEY_SET request, ignoring");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "KEY_SET",
                        reason: "empty keyVals",
                    });
                }

                // Fingerprint whatever the setter did not.
                for value in params.key_vals.values_mut() {
                    if value.value.is_some() {
                        value.hash = Some(proto::hash_value(
                            value.version,
                            &value.originator_id,
                            value.value.as_deref(),
                        ));
                    }
                }

                let publication = Publication {
                    key_vals: params.key_vals,
                    node_ids: params.node_ids,
                    flood_root_id: params.flood_root_id,
                    ..Default::default()
                };
                self.merge_publication(publication, None);

                if params.solicit_response {
                    Ok(Some(ACK_SUCCESS.to_vec()))
                } else {
                    Ok(None)
                }
            }

            Command::KeyGet => {
                self.bump("kvstore.cmd_key_get", 1);
                let Some(params) = request.key_get_params else {
                    error!("received KEY_GET without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "KEY_GET",
                        reason: "missing keyGetParams",
                    });
                };
                let mut publication = store::get_key_vals(&self.store, &params.keys);
                self.update_publication_ttl(&mut publication, false);
                Ok(Some(proto::encode_publication(&publication)))
            }

            Command::KeyDump => {
                self.bump("kvstore.cmd_key_dump", 1);
                let Some(params) = request.key_dump_params else {
                    error!("received KEY_DUMP without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "KEY_DUMP",
                        reason: "missing keyDumpParams",
                    });
                };
                let filters = KvStoreFilters::from_prefix_string(
                    &params.prefix,
                    params.originator_ids.clone(),
                );
                let mut publication = store::dump_all_with_filters(&self.store, &filters);
                if let Some(hashes) = &params.key_val_hashes {
                    debug!(
                        digest_keys = hashes.len(),
                        "dump requested with peer digest, answering with difference"
                    );
                    publication = store::dump_difference(&publication.key_vals, hashes);
                }
                self.update_publication_ttl(&mut publication, false);
                // We are the sync responder; stamp our flood root.
                publication.flood_root_id = self.dual.spt_root_id();
                Ok(Some(proto::encode_publication(&publication)))
            }

            Command::HashDump => {
                self.bump("kvstore.cmd_hash_dump", 1);
                let Some(params) = request.key_dump_params else {
                    error!("received HASH_DUMP without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "HASH_DUMP",
                        reason: "missing keyDumpParams",
                    });
                };
                let filters =
                    KvStoreFilters::from_prefix_string(&params.prefix, BTreeSet::new());
                let mut publication = store::dump_hash_with_filters(&self.store, &filters);
                self.update_publication_ttl(&mut publication, false);
                Ok(Some(proto::encode_publication(&publication)))
            }

            Command::CountersGet => Ok(Some(proto::encode_counters(&self.get_counters()))),

            Command::PeerAdd => {
                self.bump("kvstore.cmd_peer_add", 1);
                let Some(params) = request.peer_add_params else {
                    error!("received PEER_ADD without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "PEER_ADD",
                        reason: "missing peerAddParams",
                    });
                };
                if params.peers.is_empty() {
                    error!("malformed PEER_ADD request, ignoring");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "PEER_ADD",
                        reason: "empty peers",
                    });
                }
                self.add_peers(params.peers);
                Ok(Some(proto::encode_peer_reply(&self.peers.dump())))
            }

            Command::PeerDel => {
                self.bump("kvstore.cmd_peer_del", 1);
                let Some(params) = request.peer_del_params else {
                    error!("received PEER_DEL without params");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "PEER_DEL",
                        reason: "missing peerDelParams",
                    });
                };
                if params.peer_names.is_empty() {
                    error!("malformed PEER_DEL request, ignoring");
                    return Err(KvStoreError::MalformedRequest {
                        cmd: "PEER_DEL",
                        reason: "empty peerNames",
                    });
                }
                self.del_peers(params.peer_names);
                Ok(Some(proto::encode_peer_reply(&self.peers.dump())))
            }

            Command::PeerDump => {
                self.bump("kvstore.cmd_peer_dump", 1);
                Ok(Some(proto::encode_peer_reply(&self.peers.dump())))
            }

            Command::Dual => {
                let Some(messages) = request.dual_messages else {
                    error!("received DUAL without messages");
                    return Ok(None);
                };
                if messages.messages.is_empty() {
                    error!("received empty DUAL messages");
                    return Ok(None);
                }
                self.bump("kvstore.received_dual_messages", 1);
                metrics::record_dual_messages();
                let src_id = messages.src_id.clone();
                let outputs = self.dual.process_messages(&src_id, &messages);
                self.apply_dual_outputs(outputs);
                Ok(None)
            }

            Command::FloodTopoSet => {
                let Some(params) = request.flood_topo_set_params else {
                    error!("received FLOOD_TOPO_SET without params");
                    return Ok(None);
                };
                self.process_flood_topo_set(params);
                Ok(None)
            }

            Command::FloodTopoGet => Ok(Some(proto::encode_spt_infos(&self.process_flood_topo_get()))),
        }
    }

    // =========================================================================
    // Merge and flood
    // =========================================================================

    /// Merge a received publication, publish and flood the delta, and (as
    /// the last step of a three-way sync) send requested keys back to the
    /// responder. Returns the number of applied updates.
    fn merge_publication(&mut self, rcvd: Publication, sender_id: Option<SocketId>) -> usize {
        self.bump("kvstore.received_publications", 1);
        self.bump("kvstore.received_key_vals", rcvd.key_vals.len() as i64);
        metrics::record_received_publication(rcvd.key_vals.len());

        let need_finalize = sender_id.is_some()
            && rcvd
                .tobe_updated_keys
                .as_ref()
                .map_or(false, |keys| !keys.is_empty());

        // Expired-key publications arrive here with no keyVals at all.
        if rcvd.key_vals.is_empty() && !need_finalize {
            return 0;
        }

        if let Some(node_ids) = &rcvd.node_ids {
            if node_ids.iter().any(|id| *id == self.node_id) {
                self.bump("kvstore.looped_publications", 1);
                metrics::record_looped_publication();
                debug!(trail = ?node_ids, "dropping looped publication");
                return 0;
            }
        }

        let delta = store::merge_key_values(&mut self.store, &rcvd.key_vals, self.filters.as_ref());
        let kv_update_cnt = delta.len();
        self.bump("kvstore.updated_key_vals", kv_update_cnt as i64);
        metrics::record_updated_key_vals(kv_update_cnt);

        let delta_publication = Publication {
            key_vals: delta,
            flood_root_id: rcvd.flood_root_id.clone(),
            node_ids: rcvd.node_ids.clone(),
            ..Default::default()
        };

        self.update_ttl_countdown_queue(&delta_publication);

        if !delta_publication.key_vals.is_empty() {
            self.flood_publication(delta_publication, true, true);
        } else {
            self.bump("kvstore.received_redundant_publications", 1);
            metrics::record_redundant_publication();
        }

        if need_finalize {
            if let (Some(keys), Some(sender)) = (rcvd.tobe_updated_keys, sender_id) {
                self.finalize_full_sync(&keys, &sender);
            }
        }

        kv_update_cnt
    }

    /// Publish locally and forward to the flood peer set.
    ///
    /// `rate_limit = false` bypasses the token bucket (used by the flush
    /// path, which consumed a token already). `set_flood_root = false`
    /// preserves the publication's original root instead of stamping ours.
    fn flood_publication(
        &mut self,
        mut publication: Publication,
        rate_limit: bool,
        set_flood_root: bool,
    ) {
        if rate_limit {
            if let Some(limiter) = &self.flood_limiter {
                if !limiter.try_consume() {
                    self.buffer_publication(publication);
                    if self.flood_flush_deadline.is_none() {
                        self.flood_flush_deadline = Some(Instant::now() + FLOOD_FLUSH_INTERVAL);
                    }
                    return;
                }
            }
        }

        // Anything already buffered goes out first, merged per root.
        if !self.publication_buffer.is_empty() {
            self.buffer_publication(publication);
            self.flood_buffered_updates();
            return;
        }

        self.update_publication_ttl(&mut publication, true);
        if publication.is_empty() {
            return;
        }

        // The last trail entry is whoever handed us this publication; our
        // own id goes on the end for the outgoing copies.
        let sender_id = publication
            .node_ids
            .as_ref()
            .and_then(|ids| ids.last().cloned());
        publication
            .node_ids
            .get_or_insert_with(Vec::new)
            .push(self.node_id.clone());

        let _ = self.local_pub.send(publication.clone());
        let _ = self.global_pub.send(publication.clone());

        // Only value updates travel to peers; pure expiry publications are
        // local knowledge (every store expires on its own clock).
        if publication.key_vals.is_empty() {
            return;
        }

        if set_flood_root && sender_id.is_none() {
            // We are the initiator; stamp the tree we flood along.
            publication.flood_root_id = self.dual.spt_root_id();
        }

        let request = KvStoreRequest {
            cmd: Some(Command::KeySet),
            key_set_params: Some(KeySetParams {
                key_vals: publication.key_vals.clone(),
                solicit_response: false,
                node_ids: publication.node_ids.clone(),
                flood_root_id: publication.flood_root_id.clone(),
            }),
            ..Default::default()
        };
        let bytes = proto::encode_request(&request);
        let key_count = publication.key_vals.len();

        let flood_peers = self.get_flood_peers(publication.flood_root_id.as_deref());
        for peer_name in flood_peers {
            if sender_id.as_deref() == Some(peer_name.as_str()) {
                continue;
            }
            trace!(
                from = %sender_id.as_deref().unwrap_or("n/a"),
                to = %peer_name,
                via = %self.node_id,
                "forwarding publication"
            );

            self.bump("kvstore.sent_publications", 1);
            self.bump("kvstore.sent_key_vals", key_count as i64);
            metrics::record_sent_publication(&peer_name, key_count);

            let (result, socket_id) = match self.peers.get(&peer_name) {
                Some(entry) => (
                    entry.link.send_no_reply(bytes.clone()),
                    entry.socket_id.clone(),
                ),
                None => continue,
            };
            if let Err(e) = result {
                // Common during connection setup; periodic sync recovers it.
                error!(peer = %peer_name, error = %e, "failed to flood publication");
                self.collect_send_failure(&socket_id, &e);
            } else {
                self.bump("kvstore.peers.bytes_sent", bytes.len() as i64);
            }
        }
    }

    /// Peer subset for one flood: SPT neighborhood when the optimization is
    /// on and usable, everyone otherwise. Peers that do not speak the
    /// optimization always receive a copy.
    fn get_flood_peers(&self, root_id: Option<&str>) -> Vec<String> {
        let spt_peers = self.dual.spt_peers(root_id);
        let flood_to_all = !self.config.enable_flood_optimization
            || !self.config.use_flood_optimization
            || spt_peers.is_empty();

        self.peers
            .iter()
            .filter(|(name, entry)| {
                flood_to_all
                    || spt_peers.contains(*name)
                    || !entry.spec.supports_flood_optimization
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn buffer_publication(&mut self, publication: Publication) {
        self.bump("kvstore.rate_limit_suppress", 1);
        self.bump("kvstore.rate_limit_keys", publication.key_vals.len() as i64);
        metrics::record_rate_limit_suppress(publication.key_vals.len());

        let bucket = self
            .publication_buffer
            .entry(publication.flood_root_id.clone())
            .or_default();
        for key in publication.key_vals.keys() {
            bucket.insert(key.clone());
        }
        for key in publication.expired_keys {
            bucket.insert(key);
        }
    }

    /// Emit one merged publication per buffered root. Values are looked up
    /// live; keys that vanished in the meantime flood as expirations.
    fn flood_buffered_updates(&mut self) {
        if self.publication_buffer.is_empty() {
            return;
        }

        let buffer = std::mem::take(&mut self.publication_buffer);
        let mut publications = Vec::new();
        for (flood_root_id, keys) in buffer {
            let mut publication = Publication {
                flood_root_id,
                ..Default::default()
            };
            for key in keys {
                match self.store.get(&key) {
                    Some(value) => {
                        publication.key_vals.insert(key, value.clone());
                    }
                    None => publication.expired_keys.push(key),
                }
            }
            publications.push(publication);
        }

        for publication in publications {
            // Forwarding buffered work, not initiating: keep the root.
            self.flood_publication(publication, false, false);
        }
    }

    fn handle_flood_flush_timer(&mut self) {
        self.flood_flush_deadline = None;
        if let Some(limiter) = &self.flood_limiter {
            if !limiter.try_consume() {
                self.flood_flush_deadline = Some(Instant::now() + FLOOD_FLUSH_INTERVAL);
                return;
            }
        }
        self.flood_buffered_updates();
    }

    // =========================================================================
    // TTL lifecycle
    // =========================================================================

    fn update_ttl_countdown_queue(&mut self, publication: &Publication) {
        let now = Instant::now();
        for (key, value) in &publication.key_vals {
            if value.ttl == proto::TTL_INFINITY {
                continue;
            }
            // A TTL too large to represent as an instant is as good as
            // infinite: no countdown entry.
            let Some(expiry) = now.checked_add(Duration::from_millis(value.ttl.max(0) as u64))
            else {
                continue;
            };
            match self.ttl_deadline {
                Some(current) if expiry >= current => {}
                _ => self.ttl_deadline = Some(expiry),
            }
            self.ttl_queue.push(TtlEntry {
                expiry,
                key: key.clone(),
                version: value.version,
                ttl_version: value.ttl_version,
                originator_id: value.originator_id.clone(),
            });
        }
    }

    fn cleanup_ttl_countdown_queue(&mut self) {
        let now = Instant::now();
        let mut expired_keys = Vec::new();

        while let Some(entry) = self.ttl_queue.pop_expired(now) {
            let still_current = self
                .store
                .get(&entry.key)
                .map_or(false, |value| entry.matches(value));
            if still_current {
                warn!(
                    key = %entry.key,
                    version = entry.version,
                    originator = %entry.originator_id,
                    ttl_version = entry.ttl_version,
                    "KEY_EXPIRE: deleting expired key"
                );
                self.store.remove(&entry.key);
                expired_keys.push(entry.key);
            }
        }

        self.ttl_deadline = self.ttl_queue.next_expiry();

        if expired_keys.is_empty() {
            return;
        }
        self.bump("kvstore.expired_key_vals", expired_keys.len() as i64);
        metrics::record_expired_keys(expired_keys.len());

        let publication = Publication {
            expired_keys,
            ..Default::default()
        };
        self.flood_publication(publication, true, true);
    }

    /// Rewrite each key's TTL to its remaining time minus the per-hop
    /// decrement, dropping keys that would not survive the hop.
    fn update_publication_ttl(&mut self, publication: &mut Publication, remove_about_to_expire: bool) {
        let now = Instant::now();
        let ttl_decrement = self.config.ttl_decrement();
        let mut dropped = Vec::new();

        for entry in self.ttl_queue.iter() {
            let Some(kv) = publication.key_vals.get_mut(&entry.key) else {
                continue;
            };
            if !entry.matches(kv) {
                continue;
            }

            let time_left = entry.expiry.saturating_duration_since(now);
            if time_left <= ttl_decrement
                || (remove_about_to_expire && time_left < TTL_FLOOD_THRESHOLD)
            {
                dropped.push(entry.key.clone());
                continue;
            }

            kv.ttl = (time_left - ttl_decrement).as_millis() as i64;
        }

        for key in dropped {
            publication.key_vals.remove(&key);
        }
    }

    // =========================================================================
    // Peer lifecycle and full sync
    // =========================================================================

    fn add_peers(&mut self, peers: HashMap<String, PeerSpec>) {
        self.peers.next_generation();
        let mut dual_peers_to_add = Vec::new();

        for (peer_name, spec) in peers {
            if peer_name == self.node_id {
                warn!("ignoring attempt to peer with self");
                continue;
            }
            let supports_flood_optimization = spec.supports_flood_optimization;
            if supports_flood_optimization {
                dual_peers_to_add.push(peer_name.clone());
            }

            let outcome =
                self.peers
                    .add(&peer_name, spec, self.transport.as_ref(), &self.sync_tx);

            if outcome.is_new_peer && supports_flood_optimization {
                // Make the peer forget any parenting from our previous
                // incarnation; dual convergence re-establishes it.
                self.send_topo_set_cmd("", &peer_name, false, true);
            }

            debug!(peer = %peer_name, "enqueueing full sync request");
            self.pending_syncs
                .entry(peer_name)
                .or_insert_with(ExponentialBackoff::for_full_sync);
        }

        self.full_sync_deadline = Some(Instant::now());

        if self.config.enable_flood_optimization {
            for peer in dual_peers_to_add {
                let outputs = self.dual.peer_up(&peer);
                self.apply_dual_outputs(outputs);
            }
        }
    }

    fn del_peers(&mut self, peer_names: Vec<String>) {
        let mut dual_peers_to_remove = Vec::new();

        for peer_name in peer_names {
            let Some(entry) = self.peers.remove(&peer_name) else {
                error!(peer = %peer_name, "trying to delete non-existing peer");
                continue;
            };
            if entry.spec.supports_flood_optimization {
                dual_peers_to_remove.push(peer_name.clone());
            }
            self.pending_syncs.remove(&peer_name);
            self.latest_sent_peer_sync.remove(&entry.socket_id);
        }

        if self.config.enable_flood_optimization {
            for peer in dual_peers_to_remove {
                let outputs = self.dual.peer_down(&peer);
                self.apply_dual_outputs(outputs);
            }
        }
    }

    /// Fire KEY_DUMP requests at every pending peer whose backoff allows
    /// it; reschedule for the earliest retry otherwise.
    fn request_full_sync_from_peers(&mut self) {
        self.full_sync_deadline = None;
        let now = Instant::now();
        let mut retry_timeout = MAX_BACKOFF;

        let peer_names: Vec<String> = self.pending_syncs.keys().cloned().collect();
        for peer_name in peer_names {
            match self.pending_syncs.get(&peer_name) {
                Some(backoff) if !backoff.can_try_now(now) => {
                    retry_timeout = retry_timeout.min(backoff.time_remaining(now));
                    continue;
                }
                None => continue,
                _ => {}
            }

            if !self.peers.contains(&peer_name) {
                // Deleted while pending.
                self.pending_syncs.remove(&peer_name);
                continue;
            }

            let mut params = KeyDumpParams::default();
            if let Some(filters) = &self.filters {
                params.prefix = filters.key_prefixes().join(",");
                params.originator_ids = filters.originator_ids().clone();
            }
            params.key_val_hashes = Some(
                store::dump_hash_with_filters(&self.store, &KvStoreFilters::default()).key_vals,
            );
            let request = KvStoreRequest {
                cmd: Some(Command::KeyDump),
                key_dump_params: Some(params),
                ..Default::default()
            };
            let bytes = proto::encode_request(&request);
            let byte_count = bytes.len();

            let (result, socket_id) = match self.peers.get(&peer_name) {
                Some(entry) => (entry.link.send(bytes), entry.socket_id.clone()),
                None => continue,
            };

            match result {
                Ok(()) => {
                    debug!(peer = %peer_name, socket_id = %socket_id, "sent full sync request");
                    self.bump("kvstore.peers.bytes_sent", byte_count as i64);
                    metrics::record_full_sync_request(&peer_name);
                    self.latest_sent_peer_sync.insert(socket_id, now);
                    self.pending_syncs.remove(&peer_name);
                }
                Err(e) => {
                    // Common during initial connection setup; try again.
                    error!(peer = %peer_name, error = %e, "failed to send full sync request");
                    self.collect_send_failure(&socket_id, &e);
                    if let Some(backoff) = self.pending_syncs.get_mut(&peer_name) {
                        backoff.report_error(now);
                        retry_timeout = retry_timeout.min(backoff.time_remaining(now));
                    }
                }
            }
        }

        if !self.pending_syncs.is_empty() {
            warn!(
                pending = self.pending_syncs.len(),
                retry_ms = retry_timeout.as_millis(),
                "peers still require full sync, scheduling retry"
            );
            self.full_sync_deadline = Some(now + retry_timeout);
        }
    }

    /// Periodic anti-entropy: enqueue one random peer for a full sync and
    /// rearm the jittered timer.
    fn request_periodic_sync(&mut self) {
        let base_ms = self.config.db_sync_interval().as_millis() as i64;
        let jitter = if base_ms >= 5 {
            self.rng.gen_range(-(base_ms / 5)..=base_ms / 5)
        } else {
            0
        };
        self.periodic_sync_deadline =
            Instant::now() + Duration::from_millis((base_ms + jitter).max(1) as u64);

        if self.peers.is_empty() {
            return;
        }

        let index = self.rng.gen_range(0..self.peers.len());
        let Some(peer_name) = self.peers.names().nth(index).cloned() else {
            return;
        };

        info!(peer = %peer_name, "requesting periodic full sync");
        self.pending_syncs
            .entry(peer_name)
            .or_insert_with(ExponentialBackoff::for_full_sync);

        if self.full_sync_deadline.is_none() {
            self.full_sync_deadline = Some(Instant::now());
        }
    }

    /// Last leg of the three-way sync: send back the keys the responder
    /// asked for.
    fn finalize_full_sync(&mut self, keys: &[String], sender: &SocketId) {
        if keys.is_empty() {
            return;
        }
        debug!(sender = %sender, keys = keys.len(), "finalizing full sync");

        let mut key_vals = HashMap::new();
        for key in keys {
            if let Some(value) = self.store.get(key) {
                key_vals.insert(key.clone(), value.clone());
            }
        }

        let request = KvStoreRequest {
            cmd: Some(Command::KeySet),
            key_set_params: Some(KeySetParams {
                key_vals,
                solicit_response: false,
                node_ids: None,
                // We initiated the sync; stamp our root.
                flood_root_id: self.dual.spt_root_id(),
            }),
            ..Default::default()
        };
        let bytes = proto::encode_request(&request);
        let byte_count = bytes.len();

        let result = match self.peers.find_by_socket_id(sender) {
            Some((_, entry)) => entry.link.send_no_reply(bytes),
            None => {
                // Sender re-registered or left mid-sync.
                error!(sender = %sender, "cannot finalize full sync, sender is gone");
                return;
            }
        };
        match result {
            Ok(()) => self.bump("kvstore.peers.bytes_sent", byte_count as i64),
            Err(e) => {
                error!(sender = %sender, error = %e, "failed to send full sync finalization");
                self.collect_send_failure(sender, &e);
            }
        }
    }

    /// A message on the peer sync channel: a short ack, or a KEY_DUMP
    /// response to merge.
    fn handle_sync_response(&mut self, response: SyncResponse) {
        let SyncResponse { socket_id, payload } = response;

        if payload.len() < 3 {
            if payload == ACK_ERROR {
                error!(socket_id = %socket_id, "got error ack for sent publication");
                return;
            }
            if payload == ACK_SUCCESS {
                trace!(socket_id = %socket_id, "got ack for sent publication");
                return;
            }
        }

        self.bump("kvstore.peers.bytes_received", payload.len() as i64);

        let publication = match proto::decode_publication(&payload) {
            Ok(publication) => publication,
            Err(e) => {
                self.bump("kvstore.decode_failures", 1);
                metrics::record_decode_failure();
                error!(socket_id = %socket_id, error = %e, "bad response on peer sync channel");
                return;
            }
        };

        let received = publication.key_vals.len();
        let kv_update_cnt = self.merge_publication(publication, Some(socket_id.clone()));
        info!(
            socket_id = %socket_id,
            received,
            updated = kv_update_cnt,
            "sync response merged"
        );

        if let Some(sent_at) = self.latest_sent_peer_sync.remove(&socket_id) {
            let duration = sent_at.elapsed();
            self.bump("kvstore.peer_sync_time_ms", duration.as_millis() as i64);
            metrics::record_sync_duration(&socket_id, duration);
            debug!(socket_id = %socket_id, ms = duration.as_millis(), "full sync round trip");
        }
    }

    // =========================================================================
    // Spanning-tree glue
    // =========================================================================

    fn apply_dual_outputs(&mut self, outputs: Vec<DualOutput>) {
        for output in outputs {
            match output {
                DualOutput::Send { peer, messages } => self.send_dual_messages(&peer, messages),
                DualOutput::NexthopChange {
                    root_id,
                    old_nexthop,
                    new_nexthop,
                } => self.process_nexthop_change(&root_id, old_nexthop, new_nexthop),
            }
        }
    }

    fn send_dual_messages(&mut self, peer_name: &str, messages: Vec<DualMessage>) {
        let request = KvStoreRequest {
            cmd: Some(Command::Dual),
            dual_messages: Some(DualMessages {
                src_id: self.node_id.clone(),
                messages,
            }),
            ..Default::default()
        };
        let bytes = proto::encode_request(&request);

        let (result, socket_id) = match self.peers.get(peer_name) {
            Some(entry) => (entry.link.send_no_reply(bytes), entry.socket_id.clone()),
            None => {
                error!(peer = %peer_name, "cannot send dual messages, peer not registered");
                return;
            }
        };
        if let Err(e) = result {
            error!(peer = %peer_name, error = %e, "failed to send dual messages");
            self.collect_send_failure(&socket_id, &e);
        }
    }

    /// Our parent for `root_id` moved: register with the new one, clear the
    /// old one, and re-sync so nothing flooded during the transition is
    /// lost.
    fn process_nexthop_change(
        &mut self,
        root_id: &str,
        old_nexthop: Option<String>,
        new_nexthop: Option<String>,
    ) {
        info!(
            root_id = %root_id,
            old = %old_nexthop.as_deref().unwrap_or("none"),
            new = %new_nexthop.as_deref().unwrap_or("none"),
            "processing nexthop change"
        );

        if let Some(new_nh) = &new_nexthop {
            if new_nh == &self.node_id {
                error!(root_id = %root_id, "new nexthop is self, refusing");
            } else if !self.peers.contains(new_nh) {
                // Dual believing in a peer the registry lost means the two
                // disagree about neighbor state.
                error!(root_id = %root_id, nexthop = %new_nh, "new nexthop is not a peer");
                self.bump("kvstore.invariant_violations", 1);
            } else {
                self.send_topo_set_cmd(root_id, new_nh, true, false);

                // Sync after the child registration so nothing flooded on
                // the new branch can slip past us.
                info!(peer = %new_nh, "full sync with new spt parent");
                self.pending_syncs
                    .entry(new_nh.clone())
                    .or_insert_with(ExponentialBackoff::for_full_sync);
                if self.full_sync_deadline.is_none() {
                    self.full_sync_deadline = Some(Instant::now());
                }
            }
        }

        if let Some(old_nh) = &old_nexthop {
            if old_nh != &self.node_id && self.peers.contains(old_nh) {
                self.send_topo_set_cmd(root_id, old_nh, false, false);
            }
        }
    }

    fn send_topo_set_cmd(
        &mut self,
        root_id: &str,
        peer_name: &str,
        set_child: bool,
        all_roots: bool,
    ) {
        let request = KvStoreRequest {
            cmd: Some(Command::FloodTopoSet),
            flood_topo_set_params: Some(FloodTopoSetParams {
                root_id: root_id.to_string(),
                src_id: self.node_id.clone(),
                set_child,
                all_roots: all_roots.then_some(true),
            }),
            ..Default::default()
        };
        let bytes = proto::encode_request(&request);

        let (result, socket_id) = match self.peers.get(peer_name) {
            Some(entry) => (entry.link.send_no_reply(bytes), entry.socket_id.clone()),
            None => {
                error!(peer = %peer_name, "cannot send topo-set, peer not registered");
                return;
            }
        };
        if let Err(e) = result {
            error!(
                root_id = %root_id,
                peer = %peer_name,
                set_child,
                error = %e,
                "failed to send topo-set command"
            );
            self.collect_send_failure(&socket_id, &e);
        }
    }

    fn process_flood_topo_set(&mut self, params: FloodTopoSetParams) {
        if params.all_roots == Some(true) && !params.set_child {
            self.dual.remove_child_all(&params.src_id);
            return;
        }
        let applied = if params.set_child {
            self.dual.add_child(&params.root_id, &params.src_id)
        } else {
            self.dual.remove_child(&params.root_id, &params.src_id)
        };
        if !applied {
            self.bump("kvstore.invariant_violations", 1);
        }
    }

    fn process_flood_topo_get(&self) -> SptInfos {
        let flood_root_id = self.dual.spt_root_id();
        SptInfos {
            infos: self.dual.infos(),
            counters: self.dual.counters().to_map(),
            flood_peers: self
                .get_flood_peers(flood_root_id.as_deref())
                .into_iter()
                .collect(),
            flood_root_id,
        }
    }

    // =========================================================================
    // Counters
    // =========================================================================

    fn bump(&mut self, name: &str, delta: i64) {
        *self.counters.entry(name.to_string()).or_default() += delta;
    }

    fn get_counters(&self) -> BTreeMap<String, i64> {
        let mut counters = self.counters.clone();
        counters.insert("kvstore.num_keys".to_string(), self.store.len() as i64);
        counters.insert("kvstore.num_peers".to_string(), self.peers.len() as i64);
        counters.insert(
            "kvstore.pending_full_sync".to_string(),
            self.pending_syncs.len() as i64,
        );
        counters
    }

    fn submit_counters(&mut self) {
        self.counters_deadline = Instant::now() + self.config.monitor_submit_interval();
        metrics::set_num_keys(self.store.len());
        metrics::set_num_peers(self.peers.len());
        metrics::set_pending_full_sync(self.pending_syncs.len());
        trace!("submitted counters");
    }

    fn collect_send_failure(&mut self, socket_id: &SocketId, error: &KvStoreError) {
        let kind = match error {
            KvStoreError::Transport { kind, .. } => kind,
            _ => "other",
        };
        self.bump(&format!("kvstore.send_failure.{socket_id}.{kind}"), 1);
        metrics::record_send_failure(socket_id, kind);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryMesh;

    fn value(version: i64, originator: &str, bytes: &str) -> Value {
        Value::new(
            version,
            originator,
            Some(bytes.as_bytes().to_vec()),
            proto::TTL_INFINITY,
            1,
        )
    }

    async fn spawn_node(mesh: &MemoryMesh, name: &str) -> KvStoreHandle {
        let config = KvStoreConfig::for_testing(name);
        KvStore::spawn(config, HashMap::new(), Arc::new(mesh.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        node.set_key("k", value(1, "node-1", "v1")).await.unwrap();
        let publication = node.get_keys(vec!["k".to_string()]).await.unwrap();
        assert_eq!(
            publication.key_vals["k"].value.as_deref(),
            Some(b"v1".as_slice())
        );

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_key_set_rejected() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        let err = node.set_key_vals(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, KvStoreError::MalformedRequest { .. }));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_params_rejected() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        let request = KvStoreRequest {
            cmd: Some(Command::KeySet),
            ..Default::default()
        };
        let err = node.request_raw(&request).await.unwrap_err();
        assert!(matches!(err, KvStoreError::MalformedRequest { .. }));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_publication_emitted() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;
        let mut updates = node.subscribe_local();

        node.set_key("k", value(2, "node-1", "v2")).await.unwrap();

        let publication = updates.recv().await.unwrap();
        assert_eq!(publication.key_vals["k"].version, 2);
        // Our own id terminates the trail.
        assert_eq!(
            publication.node_ids.as_deref(),
            Some(["node-1".to_string()].as_slice())
        );

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_set_is_redundant() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        node.set_key("k", value(1, "node-1", "v")).await.unwrap();
        node.set_key("k", value(1, "node-1", "v")).await.unwrap();

        let counters = node.counters().await.unwrap();
        assert_eq!(counters["kvstore.received_redundant_publications"], 1);
        assert_eq!(counters["kvstore.num_keys"], 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_cmd_url_fails_startup() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        let config = KvStoreConfig::for_testing("node-1");
        let result = KvStore::spawn(config, HashMap::new(), Arc::new(mesh.clone()));
        assert!(matches!(result, Err(KvStoreError::Config(_))));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_startup() {
        let mesh = MemoryMesh::new();
        let config = KvStoreConfig::default();
        let result = KvStore::spawn(config, HashMap::new(), Arc::new(mesh));
        assert!(matches!(result, Err(KvStoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_peer_dump_roundtrip() {
        let mesh = MemoryMesh::new();
        let node = spawn_node(&mesh, "node-1").await;

        let reply = node.dump_peers().await.unwrap();
        assert!(reply.peers.is_empty());

        let mut peers = HashMap::new();
        peers.insert(
            "node-2".to_string(),
            PeerSpec {
                cmd_url: "mem://node-2/cmd".to_string(),
                supports_flood_optimization: false,
            },
        );
        let reply = node.add_peers(peers).await.unwrap();
        assert!(reply.peers.contains_key("node-2"));

        let reply = node.del_peers(vec!["node-2".to_string()]).await.unwrap();
        assert!(reply.peers.is_empty());

        node.shutdown().await;
    }
}
