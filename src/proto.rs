// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol messages for the replication mesh.
//!
//! Everything that crosses a node boundary is defined here: value records,
//! publications, the tagged [`KvStoreRequest`] command envelope, and the
//! per-command reply records, together with their hand-written CBOR
//! encoders and decoders.
//!
//! Messages are CBOR maps keyed by small integer field tags. Field identity
//! never depends on a name, so fields can be renamed freely and new fields
//! with new tags can be added without breaking older peers: decoders skip
//! tags they do not know. Decoders also reject duplicate tags, missing
//! required fields, indefinite-length items, and trailing bytes, surfacing
//! each case as a distinct [`ProtoDecodeError`].
//!
//! # Value records
//!
//! A [`Value`] carries an optional payload: `value: None` means the message
//! is a TTL refresh for a record the receiver already holds, and must never
//! replace stored bytes. The `hash` fingerprint covers
//! `(version, originator_id, value)` and is recomputed on receipt when
//! absent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Sentinel TTL meaning "never expires".
pub const TTL_INFINITY: i64 = i64::MAX;

/// Stable per-connection identity, derived from `(peer_name, counter)`.
pub type SocketId = String;

/// Positive ack on the sync channel.
pub const ACK_SUCCESS: &[u8] = b"OK";
/// Negative ack on the sync channel.
pub const ACK_ERROR: &[u8] = b"ERR";

/// A single versioned record in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Monotonic per key per originator, starts at 1.
    pub version: i64,

    /// Node id that authored this record.
    pub originator_id: String,

    /// Payload bytes. Absent on TTL-refresh messages.
    pub value: Option<Vec<u8>>,

    /// Remaining lifetime in milliseconds, or [`TTL_INFINITY`].
    pub ttl: i64,

    /// Monotonic within one `(version, originator_id)` incarnation.
    pub ttl_version: i64,

    /// Fingerprint of `(version, originator_id, value)`.
    pub hash: Option<i64>,
}

impl Value {
    /// Build a record with its fingerprint filled in.
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        value: Option<Vec<u8>>,
        ttl: i64,
        ttl_version: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let hash = value
            .as_deref()
            .map(|v| hash_value(version, &originator_id, Some(v)));
        Self {
            version,
            originator_id,
            value,
            ttl,
            ttl_version,
            hash,
        }
    }

    /// Copy of this record with the payload stripped, keeping the metadata
    /// a hash dump advertises.
    pub fn to_hash_only(&self) -> Self {
        Self {
            version: self.version,
            originator_id: self.originator_id.clone(),
            value: None,
            ttl: self.ttl,
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }
}

/// Fingerprint a record. Stable across platforms and restarts so peers can
/// compare digests without exchanging payloads.
pub fn hash_value(version: i64, originator_id: &str, value: Option<&[u8]>) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(version.to_be_bytes());
    hasher.update((originator_id.len() as u64).to_be_bytes());
    hasher.update(originator_id.as_bytes());
    if let Some(bytes) = value {
        hasher.update(bytes);
    }
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(buf)
}

/// A batch of key-value updates flowing through the mesh.
///
/// `node_ids` is the loop-suppression trail: every forwarder appends its own
/// id, and a node that finds itself in the trail drops the publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Publication {
    pub key_vals: HashMap<String, Value>,

    /// Keys removed by TTL expiry.
    pub expired_keys: Vec<String>,

    /// Ordered forwarding trail, most recent sender last.
    pub node_ids: Option<Vec<String>>,

    /// Root of the spanning tree this publication is flooding along.
    pub flood_root_id: Option<String>,

    /// Only on three-way-sync responses: keys the responder wants back.
    pub tobe_updated_keys: Option<Vec<String>>,
}

impl Publication {
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

/// Command discriminant for [`KvStoreRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    KeySet,
    KeyGet,
    KeyDump,
    HashDump,
    CountersGet,
    PeerAdd,
    PeerDel,
    PeerDump,
    Dual,
    FloodTopoSet,
    FloodTopoGet,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::KeySet => "KEY_SET",
            Command::KeyGet => "KEY_GET",
            Command::KeyDump => "KEY_DUMP",
            Command::HashDump => "HASH_DUMP",
            Command::CountersGet => "COUNTERS_GET",
            Command::PeerAdd => "PEER_ADD",
            Command::PeerDel => "PEER_DEL",
            Command::PeerDump => "PEER_DUMP",
            Command::Dual => "DUAL",
            Command::FloodTopoSet => "FLOOD_TOPO_SET",
            Command::FloodTopoGet => "FLOOD_TOPO_GET",
        }
    }

    fn index(self) -> u32 {
        match self {
            Command::KeySet => 1,
            Command::KeyGet => 2,
            Command::KeyDump => 3,
            Command::HashDump => 4,
            Command::CountersGet => 5,
            Command::PeerAdd => 6,
            Command::PeerDel => 7,
            Command::PeerDump => 8,
            Command::Dual => 9,
            Command::FloodTopoSet => 10,
            Command::FloodTopoGet => 11,
        }
    }

    fn from_index(index: u32) -> Option<Self> {
        match index {
            1 => Some(Command::KeySet),
            2 => Some(Command::KeyGet),
            3 => Some(Command::KeyDump),
            4 => Some(Command::HashDump),
            5 => Some(Command::CountersGet),
            6 => Some(Command::PeerAdd),
            7 => Some(Command::PeerDel),
            8 => Some(Command::PeerDump),
            9 => Some(Command::Dual),
            10 => Some(Command::FloodTopoSet),
            11 => Some(Command::FloodTopoGet),
            _ => None,
        }
    }
}

/// The request envelope: a command plus that command's parameter record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvStoreRequest {
    pub cmd: Option<Command>,
    pub key_set_params: Option<KeySetParams>,
    pub key_get_params: Option<KeyGetParams>,
    pub key_dump_params: Option<KeyDumpParams>,
    pub peer_add_params: Option<PeerAddParams>,
    pub peer_del_params: Option<PeerDelParams>,
    pub flood_topo_set_params: Option<FloodTopoSetParams>,
    pub dual_messages: Option<DualMessages>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySetParams {
    pub key_vals: HashMap<String, Value>,

    /// When true the receiver answers with an "OK" ack.
    pub solicit_response: bool,

    /// Forwarding trail carried through the flood.
    pub node_ids: Option<Vec<String>>,

    pub flood_root_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyGetParams {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyDumpParams {
    /// Comma separated key prefixes; empty matches everything.
    pub prefix: String,

    pub originator_ids: BTreeSet<String>,

    /// When present, the responder returns the three-way difference against
    /// this digest instead of a plain dump.
    pub key_val_hashes: Option<HashMap<String, Value>>,
}

/// How to reach a peer and what it supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSpec {
    /// Endpoint of the peer's command channel.
    pub cmd_url: String,

    /// Whether the peer participates in spanning-tree flood reduction.
    pub supports_flood_optimization: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerAddParams {
    pub peers: HashMap<String, PeerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerDelParams {
    pub peer_names: Vec<String>,
}

/// Reply to PEER_ADD / PEER_DEL / PEER_DUMP: the current peer list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerCmdReply {
    pub peers: HashMap<String, PeerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FloodTopoSetParams {
    /// Root the child change applies to; ignored when `all_roots` is set.
    pub root_id: String,

    /// Node requesting the change (the would-be child).
    pub src_id: String,

    pub set_child: bool,

    /// Apply an unset to every root. Used when a peer comes up to clear any
    /// stale parenting from a previous incarnation.
    pub all_roots: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualMessageKind {
    /// Distance advertisement.
    Update,
    /// Diffusing query after a route loss.
    Query,
    /// Answer to a query.
    Reply,
}

impl DualMessageKind {
    fn index(self) -> u32 {
        match self {
            DualMessageKind::Update => 1,
            DualMessageKind::Query => 2,
            DualMessageKind::Reply => 3,
        }
    }

    fn from_index(index: u32) -> Option<Self> {
        match index {
            1 => Some(DualMessageKind::Update),
            2 => Some(DualMessageKind::Query),
            3 => Some(DualMessageKind::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DualMessage {
    pub root_id: String,

    /// Sender's distance to `root_id` in hops.
    pub distance: i64,

    pub kind: DualMessageKind,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DualMessages {
    /// Neighbor the messages originate from.
    pub src_id: String,

    pub messages: Vec<DualMessage>,
}

/// Snapshot of one root's spanning-tree state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SptInfo {
    /// False while a diffusing computation is in flight.
    pub passive: bool,

    /// Hop count to the root.
    pub cost: i64,

    /// Parent towards the root, if any.
    pub parent: Option<String>,

    pub children: BTreeSet<String>,
}

/// Reply to FLOOD_TOPO_GET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SptInfos {
    pub infos: BTreeMap<String, SptInfo>,

    pub counters: BTreeMap<String, i64>,

    /// Root currently used when this node initiates a flood.
    pub flood_root_id: Option<String>,

    /// Peers a publication would be forwarded to right now.
    pub flood_peers: BTreeSet<String>,
}

// =============================================================================
// Errors
// =============================================================================

/// Why a message failed to decode.
#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("duplicate field tag {0}")]
    DuplicateField(u32),
    #[error("unknown {what} index {index}")]
    UnknownIndex { what: &'static str, index: u32 },
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type EncodeError = minicbor::encode::Error<Infallible>;
type Enc<'a> = Encoder<&'a mut Vec<u8>>;

// =============================================================================
// Entry points
// =============================================================================

pub fn encode_request(request: &KvStoreRequest) -> Vec<u8> {
    // Encoding into a Vec cannot fail.
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_request_map(&mut enc, request).expect("infallible encode into Vec");
    buf
}

pub fn decode_request(bytes: &[u8]) -> Result<KvStoreRequest, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let request = decode_request_map(&mut dec)?;
    ensure_no_trailing(&mut dec)?;
    Ok(request)
}

pub fn encode_publication(publication: &Publication) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_publication_map(&mut enc, publication).expect("infallible encode into Vec");
    buf
}

pub fn decode_publication(bytes: &[u8]) -> Result<Publication, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let publication = decode_publication_map(&mut dec)?;
    ensure_no_trailing(&mut dec)?;
    Ok(publication)
}

pub fn encode_peer_reply(reply: &PeerCmdReply) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_peer_reply_map(&mut enc, reply).expect("infallible encode into Vec");
    buf
}

fn encode_peer_reply_map(enc: &mut Enc, reply: &PeerCmdReply) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.u32(0)?;
    encode_peer_map(enc, &reply.peers)
}

pub fn decode_peer_reply(bytes: &[u8]) -> Result<PeerCmdReply, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;
    let mut seen = BTreeSet::new();
    let mut peers = None;
    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => peers = Some(decode_peer_map(&mut dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }
    ensure_no_trailing(&mut dec)?;
    Ok(PeerCmdReply {
        peers: peers.ok_or(ProtoDecodeError::MissingField("peers"))?,
    })
}

pub fn encode_spt_infos(infos: &SptInfos) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_spt_infos_map(&mut enc, infos).expect("infallible encode into Vec");
    buf
}

pub fn decode_spt_infos(bytes: &[u8]) -> Result<SptInfos, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let infos = decode_spt_infos_map(&mut dec)?;
    ensure_no_trailing(&mut dec)?;
    Ok(infos)
}

pub fn encode_counters(counters: &BTreeMap<String, i64>) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_counters_map(&mut enc, counters).expect("infallible encode into Vec");
    buf
}

fn encode_counters_map(enc: &mut Enc, counters: &BTreeMap<String, i64>) -> Result<(), EncodeError> {
    enc.map(counters.len() as u64)?;
    for (name, count) in counters {
        enc.str(name)?;
        enc.i64(*count)?;
    }
    Ok(())
}

pub fn decode_counters(bytes: &[u8]) -> Result<BTreeMap<String, i64>, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec)?;
    let mut counters = BTreeMap::new();
    for _ in 0..map_len {
        let name = dec.str()?.to_string();
        let count = dec.i64()?;
        counters.insert(name, count);
    }
    ensure_no_trailing(&mut dec)?;
    Ok(counters)
}

// =============================================================================
// Shared helpers
// =============================================================================

fn decode_map_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

fn decode_array_len(dec: &mut Decoder) -> Result<u64, ProtoDecodeError> {
    dec.array()?.ok_or(ProtoDecodeError::IndefiniteLength)
}

fn ensure_unique_tag(seen: &mut BTreeSet<u32>, tag: u32) -> Result<(), ProtoDecodeError> {
    if !seen.insert(tag) {
        return Err(ProtoDecodeError::DuplicateField(tag));
    }
    Ok(())
}

fn ensure_no_trailing(dec: &mut Decoder) -> Result<(), ProtoDecodeError> {
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(())
}

fn encode_str_array(enc: &mut Enc, items: &[String]) -> Result<(), EncodeError> {
    enc.array(items.len() as u64)?;
    for item in items {
        enc.str(item)?;
    }
    Ok(())
}

fn decode_str_array(dec: &mut Decoder) -> Result<Vec<String>, ProtoDecodeError> {
    let len = decode_array_len(dec)?;
    let mut items = Vec::new();
    for _ in 0..len {
        items.push(dec.str()?.to_string());
    }
    Ok(items)
}

fn encode_str_set(enc: &mut Enc, items: &BTreeSet<String>) -> Result<(), EncodeError> {
    enc.array(items.len() as u64)?;
    for item in items {
        enc.str(item)?;
    }
    Ok(())
}

fn decode_str_set(dec: &mut Decoder) -> Result<BTreeSet<String>, ProtoDecodeError> {
    let len = decode_array_len(dec)?;
    let mut items = BTreeSet::new();
    for _ in 0..len {
        items.insert(dec.str()?.to_string());
    }
    Ok(items)
}

// =============================================================================
// Value
// =============================================================================

fn encode_value(enc: &mut Enc, value: &Value) -> Result<(), EncodeError> {
    let mut len = 4;
    if value.value.is_some() {
        len += 1;
    }
    if value.hash.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    enc.i64(value.version)?;
    enc.u32(1)?;
    enc.str(&value.originator_id)?;
    if let Some(bytes) = &value.value {
        enc.u32(2)?;
        enc.bytes(bytes)?;
    }
    enc.u32(3)?;
    enc.i64(value.ttl)?;
    enc.u32(4)?;
    enc.i64(value.ttl_version)?;
    if let Some(hash) = value.hash {
        enc.u32(5)?;
        enc.i64(hash)?;
    }
    Ok(())
}

fn decode_value(dec: &mut Decoder) -> Result<Value, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut version = None;
    let mut originator_id = None;
    let mut value = None;
    let mut ttl = None;
    let mut ttl_version = None;
    let mut hash = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => version = Some(dec.i64()?),
            1 => originator_id = Some(dec.str()?.to_string()),
            2 => value = Some(dec.bytes()?.to_vec()),
            3 => ttl = Some(dec.i64()?),
            4 => ttl_version = Some(dec.i64()?),
            5 => hash = Some(dec.i64()?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(Value {
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        originator_id: originator_id.ok_or(ProtoDecodeError::MissingField("originator_id"))?,
        value,
        ttl: ttl.ok_or(ProtoDecodeError::MissingField("ttl"))?,
        ttl_version: ttl_version.ok_or(ProtoDecodeError::MissingField("ttl_version"))?,
        hash,
    })
}

fn encode_key_vals(enc: &mut Enc, key_vals: &HashMap<String, Value>) -> Result<(), EncodeError> {
    enc.map(key_vals.len() as u64)?;
    for (key, value) in key_vals {
        enc.str(key)?;
        encode_value(enc, value)?;
    }
    Ok(())
}

fn decode_key_vals(dec: &mut Decoder) -> Result<HashMap<String, Value>, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut key_vals = HashMap::new();
    for _ in 0..len {
        let key = dec.str()?.to_string();
        let value = decode_value(dec)?;
        key_vals.insert(key, value);
    }
    Ok(key_vals)
}

// =============================================================================
// Publication
// =============================================================================

fn encode_publication_map(enc: &mut Enc, publication: &Publication) -> Result<(), EncodeError> {
    let mut len = 2;
    if publication.node_ids.is_some() {
        len += 1;
    }
    if publication.flood_root_id.is_some() {
        len += 1;
    }
    if publication.tobe_updated_keys.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    encode_key_vals(enc, &publication.key_vals)?;
    enc.u32(1)?;
    encode_str_array(enc, &publication.expired_keys)?;
    if let Some(node_ids) = &publication.node_ids {
        enc.u32(2)?;
        encode_str_array(enc, node_ids)?;
    }
    if let Some(flood_root_id) = &publication.flood_root_id {
        enc.u32(3)?;
        enc.str(flood_root_id)?;
    }
    if let Some(tobe_updated_keys) = &publication.tobe_updated_keys {
        enc.u32(4)?;
        encode_str_array(enc, tobe_updated_keys)?;
    }
    Ok(())
}

fn decode_publication_map(dec: &mut Decoder) -> Result<Publication, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut key_vals = None;
    let mut expired_keys = None;
    let mut node_ids = None;
    let mut flood_root_id = None;
    let mut tobe_updated_keys = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => key_vals = Some(decode_key_vals(dec)?),
            1 => expired_keys = Some(decode_str_array(dec)?),
            2 => node_ids = Some(decode_str_array(dec)?),
            3 => flood_root_id = Some(dec.str()?.to_string()),
            4 => tobe_updated_keys = Some(decode_str_array(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(Publication {
        key_vals: key_vals.ok_or(ProtoDecodeError::MissingField("key_vals"))?,
        expired_keys: expired_keys.ok_or(ProtoDecodeError::MissingField("expired_keys"))?,
        node_ids,
        flood_root_id,
        tobe_updated_keys,
    })
}

// =============================================================================
// Request envelope and per-command params
// =============================================================================

fn encode_request_map(enc: &mut Enc, request: &KvStoreRequest) -> Result<(), EncodeError> {
    let mut len = 0;
    if request.cmd.is_some() {
        len += 1;
    }
    if request.key_set_params.is_some() {
        len += 1;
    }
    if request.key_get_params.is_some() {
        len += 1;
    }
    if request.key_dump_params.is_some() {
        len += 1;
    }
    if request.peer_add_params.is_some() {
        len += 1;
    }
    if request.peer_del_params.is_some() {
        len += 1;
    }
    if request.flood_topo_set_params.is_some() {
        len += 1;
    }
    if request.dual_messages.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    if let Some(cmd) = request.cmd {
        enc.u32(0)?;
        enc.u32(cmd.index())?;
    }
    if let Some(params) = &request.key_set_params {
        enc.u32(1)?;
        encode_key_set_params(enc, params)?;
    }
    if let Some(params) = &request.key_get_params {
        enc.u32(2)?;
        encode_key_get_params(enc, params)?;
    }
    if let Some(params) = &request.key_dump_params {
        enc.u32(3)?;
        encode_key_dump_params(enc, params)?;
    }
    if let Some(params) = &request.peer_add_params {
        enc.u32(4)?;
        enc.map(1)?;
        enc.u32(0)?;
        encode_peer_map(enc, &params.peers)?;
    }
    if let Some(params) = &request.peer_del_params {
        enc.u32(5)?;
        enc.map(1)?;
        enc.u32(0)?;
        encode_str_array(enc, &params.peer_names)?;
    }
    if let Some(params) = &request.flood_topo_set_params {
        enc.u32(6)?;
        encode_flood_topo_set_params(enc, params)?;
    }
    if let Some(messages) = &request.dual_messages {
        enc.u32(7)?;
        encode_dual_messages(enc, messages)?;
    }
    Ok(())
}

fn decode_request_map(dec: &mut Decoder) -> Result<KvStoreRequest, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut request = KvStoreRequest::default();

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => {
                let index = dec.u32()?;
                request.cmd = Some(Command::from_index(index).ok_or(
                    ProtoDecodeError::UnknownIndex {
                        what: "command",
                        index,
                    },
                )?);
            }
            1 => request.key_set_params = Some(decode_key_set_params(dec)?),
            2 => request.key_get_params = Some(decode_key_get_params(dec)?),
            3 => request.key_dump_params = Some(decode_key_dump_params(dec)?),
            4 => request.peer_add_params = Some(decode_peer_add_params(dec)?),
            5 => request.peer_del_params = Some(decode_peer_del_params(dec)?),
            6 => request.flood_topo_set_params = Some(decode_flood_topo_set_params(dec)?),
            7 => request.dual_messages = Some(decode_dual_messages(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(request)
}

fn encode_key_set_params(enc: &mut Enc, params: &KeySetParams) -> Result<(), EncodeError> {
    let mut len = 2;
    if params.node_ids.is_some() {
        len += 1;
    }
    if params.flood_root_id.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    encode_key_vals(enc, &params.key_vals)?;
    enc.u32(1)?;
    enc.bool(params.solicit_response)?;
    if let Some(node_ids) = &params.node_ids {
        enc.u32(2)?;
        encode_str_array(enc, node_ids)?;
    }
    if let Some(flood_root_id) = &params.flood_root_id {
        enc.u32(3)?;
        enc.str(flood_root_id)?;
    }
    Ok(())
}

fn decode_key_set_params(dec: &mut Decoder) -> Result<KeySetParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut key_vals = None;
    let mut solicit_response = None;
    let mut node_ids = None;
    let mut flood_root_id = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => key_vals = Some(decode_key_vals(dec)?),
            1 => solicit_response = Some(dec.bool()?),
            2 => node_ids = Some(decode_str_array(dec)?),
            3 => flood_root_id = Some(dec.str()?.to_string()),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(KeySetParams {
        key_vals: key_vals.ok_or(ProtoDecodeError::MissingField("key_vals"))?,
        solicit_response: solicit_response
            .ok_or(ProtoDecodeError::MissingField("solicit_response"))?,
        node_ids,
        flood_root_id,
    })
}

fn encode_key_get_params(enc: &mut Enc, params: &KeyGetParams) -> Result<(), EncodeError> {
    enc.map(1)?;
    enc.u32(0)?;
    encode_str_array(enc, &params.keys)
}

fn decode_key_get_params(dec: &mut Decoder) -> Result<KeyGetParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut keys = None;
    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => keys = Some(decode_str_array(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(KeyGetParams {
        keys: keys.ok_or(ProtoDecodeError::MissingField("keys"))?,
    })
}

fn encode_key_dump_params(enc: &mut Enc, params: &KeyDumpParams) -> Result<(), EncodeError> {
    let mut len = 2;
    if params.key_val_hashes.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    enc.str(&params.prefix)?;
    enc.u32(1)?;
    encode_str_set(enc, &params.originator_ids)?;
    if let Some(hashes) = &params.key_val_hashes {
        enc.u32(2)?;
        encode_key_vals(enc, hashes)?;
    }
    Ok(())
}

fn decode_key_dump_params(dec: &mut Decoder) -> Result<KeyDumpParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut prefix = None;
    let mut originator_ids = None;
    let mut key_val_hashes = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => prefix = Some(dec.str()?.to_string()),
            1 => originator_ids = Some(decode_str_set(dec)?),
            2 => key_val_hashes = Some(decode_key_vals(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(KeyDumpParams {
        prefix: prefix.ok_or(ProtoDecodeError::MissingField("prefix"))?,
        originator_ids: originator_ids.ok_or(ProtoDecodeError::MissingField("originator_ids"))?,
        key_val_hashes,
    })
}

fn encode_peer_spec(enc: &mut Enc, spec: &PeerSpec) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.u32(0)?;
    enc.str(&spec.cmd_url)?;
    enc.u32(1)?;
    enc.bool(spec.supports_flood_optimization)?;
    Ok(())
}

fn decode_peer_spec(dec: &mut Decoder) -> Result<PeerSpec, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut cmd_url = None;
    let mut supports_flood_optimization = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => cmd_url = Some(dec.str()?.to_string()),
            1 => supports_flood_optimization = Some(dec.bool()?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(PeerSpec {
        cmd_url: cmd_url.ok_or(ProtoDecodeError::MissingField("cmd_url"))?,
        supports_flood_optimization: supports_flood_optimization
            .ok_or(ProtoDecodeError::MissingField("supports_flood_optimization"))?,
    })
}

fn encode_peer_map(enc: &mut Enc, peers: &HashMap<String, PeerSpec>) -> Result<(), EncodeError> {
    enc.map(peers.len() as u64)?;
    for (name, spec) in peers {
        enc.str(name)?;
        encode_peer_spec(enc, spec)?;
    }
    Ok(())
}

fn decode_peer_map(dec: &mut Decoder) -> Result<HashMap<String, PeerSpec>, ProtoDecodeError> {
    let len = decode_map_len(dec)?;
    let mut peers = HashMap::new();
    for _ in 0..len {
        let name = dec.str()?.to_string();
        let spec = decode_peer_spec(dec)?;
        peers.insert(name, spec);
    }
    Ok(peers)
}

fn decode_peer_add_params(dec: &mut Decoder) -> Result<PeerAddParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut peers = None;
    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => peers = Some(decode_peer_map(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(PeerAddParams {
        peers: peers.ok_or(ProtoDecodeError::MissingField("peers"))?,
    })
}

fn decode_peer_del_params(dec: &mut Decoder) -> Result<PeerDelParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut peer_names = None;
    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => peer_names = Some(decode_str_array(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }
    Ok(PeerDelParams {
        peer_names: peer_names.ok_or(ProtoDecodeError::MissingField("peer_names"))?,
    })
}

fn encode_flood_topo_set_params(
    enc: &mut Enc,
    params: &FloodTopoSetParams,
) -> Result<(), EncodeError> {
    let mut len = 3;
    if params.all_roots.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    enc.str(&params.root_id)?;
    enc.u32(1)?;
    enc.str(&params.src_id)?;
    enc.u32(2)?;
    enc.bool(params.set_child)?;
    if let Some(all_roots) = params.all_roots {
        enc.u32(3)?;
        enc.bool(all_roots)?;
    }
    Ok(())
}

fn decode_flood_topo_set_params(
    dec: &mut Decoder,
) -> Result<FloodTopoSetParams, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut root_id = None;
    let mut src_id = None;
    let mut set_child = None;
    let mut all_roots = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => root_id = Some(dec.str()?.to_string()),
            1 => src_id = Some(dec.str()?.to_string()),
            2 => set_child = Some(dec.bool()?),
            3 => all_roots = Some(dec.bool()?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(FloodTopoSetParams {
        root_id: root_id.ok_or(ProtoDecodeError::MissingField("root_id"))?,
        src_id: src_id.ok_or(ProtoDecodeError::MissingField("src_id"))?,
        set_child: set_child.ok_or(ProtoDecodeError::MissingField("set_child"))?,
        all_roots,
    })
}

// =============================================================================
// DUAL messages
// =============================================================================

fn encode_dual_message(enc: &mut Enc, message: &DualMessage) -> Result<(), EncodeError> {
    enc.map(3)?;
    enc.u32(0)?;
    enc.str(&message.root_id)?;
    enc.u32(1)?;
    enc.i64(message.distance)?;
    enc.u32(2)?;
    enc.u32(message.kind.index())?;
    Ok(())
}

fn decode_dual_message(dec: &mut Decoder) -> Result<DualMessage, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut root_id = None;
    let mut distance = None;
    let mut kind = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => root_id = Some(dec.str()?.to_string()),
            1 => distance = Some(dec.i64()?),
            2 => {
                let index = dec.u32()?;
                kind = Some(DualMessageKind::from_index(index).ok_or(
                    ProtoDecodeError::UnknownIndex {
                        what: "dual message kind",
                        index,
                    },
                )?);
            }
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(DualMessage {
        root_id: root_id.ok_or(ProtoDecodeError::MissingField("root_id"))?,
        distance: distance.ok_or(ProtoDecodeError::MissingField("distance"))?,
        kind: kind.ok_or(ProtoDecodeError::MissingField("kind"))?,
    })
}

fn encode_dual_messages(enc: &mut Enc, messages: &DualMessages) -> Result<(), EncodeError> {
    enc.map(2)?;
    enc.u32(0)?;
    enc.str(&messages.src_id)?;
    enc.u32(1)?;
    enc.array(messages.messages.len() as u64)?;
    for message in &messages.messages {
        encode_dual_message(enc, message)?;
    }
    Ok(())
}

fn decode_dual_messages(dec: &mut Decoder) -> Result<DualMessages, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut src_id = None;
    let mut messages = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => src_id = Some(dec.str()?.to_string()),
            1 => {
                let len = decode_array_len(dec)?;
                let mut batch = Vec::new();
                for _ in 0..len {
                    batch.push(decode_dual_message(dec)?);
                }
                messages = Some(batch);
            }
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(DualMessages {
        src_id: src_id.ok_or(ProtoDecodeError::MissingField("src_id"))?,
        messages: messages.ok_or(ProtoDecodeError::MissingField("messages"))?,
    })
}

// =============================================================================
// Spanning-tree snapshots
// =============================================================================

fn encode_spt_info(enc: &mut Enc, info: &SptInfo) -> Result<(), EncodeError> {
    let mut len = 3;
    if info.parent.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    enc.bool(info.passive)?;
    enc.u32(1)?;
    enc.i64(info.cost)?;
    if let Some(parent) = &info.parent {
        enc.u32(2)?;
        enc.str(parent)?;
    }
    enc.u32(3)?;
    encode_str_set(enc, &info.children)?;
    Ok(())
}

fn decode_spt_info(dec: &mut Decoder) -> Result<SptInfo, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut passive = None;
    let mut cost = None;
    let mut parent = None;
    let mut children = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => passive = Some(dec.bool()?),
            1 => cost = Some(dec.i64()?),
            2 => parent = Some(dec.str()?.to_string()),
            3 => children = Some(decode_str_set(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(SptInfo {
        passive: passive.ok_or(ProtoDecodeError::MissingField("passive"))?,
        cost: cost.ok_or(ProtoDecodeError::MissingField("cost"))?,
        parent,
        children: children.ok_or(ProtoDecodeError::MissingField("children"))?,
    })
}

fn encode_spt_infos_map(enc: &mut Enc, infos: &SptInfos) -> Result<(), EncodeError> {
    let mut len = 3;
    if infos.flood_root_id.is_some() {
        len += 1;
    }
    enc.map(len as u64)?;

    enc.u32(0)?;
    enc.map(infos.infos.len() as u64)?;
    for (root_id, info) in &infos.infos {
        enc.str(root_id)?;
        encode_spt_info(enc, info)?;
    }
    enc.u32(1)?;
    enc.map(infos.counters.len() as u64)?;
    for (name, count) in &infos.counters {
        enc.str(name)?;
        enc.i64(*count)?;
    }
    if let Some(flood_root_id) = &infos.flood_root_id {
        enc.u32(2)?;
        enc.str(flood_root_id)?;
    }
    enc.u32(3)?;
    encode_str_set(enc, &infos.flood_peers)?;
    Ok(())
}

fn decode_spt_infos_map(dec: &mut Decoder) -> Result<SptInfos, ProtoDecodeError> {
    let map_len = decode_map_len(dec)?;
    let mut seen = BTreeSet::new();
    let mut infos = None;
    let mut counters = None;
    let mut flood_root_id = None;
    let mut flood_peers = None;

    for _ in 0..map_len {
        let tag = dec.u32()?;
        ensure_unique_tag(&mut seen, tag)?;
        match tag {
            0 => {
                let len = decode_map_len(dec)?;
                let mut by_root = BTreeMap::new();
                for _ in 0..len {
                    let root_id = dec.str()?.to_string();
                    let info = decode_spt_info(dec)?;
                    by_root.insert(root_id, info);
                }
                infos = Some(by_root);
            }
            1 => {
                let len = decode_map_len(dec)?;
                let mut by_name = BTreeMap::new();
                for _ in 0..len {
                    let name = dec.str()?.to_string();
                    let count = dec.i64()?;
                    by_name.insert(name, count);
                }
                counters = Some(by_name);
            }
            2 => flood_root_id = Some(dec.str()?.to_string()),
            3 => flood_peers = Some(decode_str_set(dec)?),
            _ => {
                dec.skip()?;
            }
        }
    }

    Ok(SptInfos {
        infos: infos.ok_or(ProtoDecodeError::MissingField("infos"))?,
        counters: counters.ok_or(ProtoDecodeError::MissingField("counters"))?,
        flood_root_id,
        flood_peers: flood_peers.ok_or(ProtoDecodeError::MissingField("flood_peers"))?,
    })
}
