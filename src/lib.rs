//! # kvmesh
//!
//! The distributed key-value replication core of a link-state routing
//! daemon. Each node runs one [`KvStore`] actor; instances form a peer mesh
//! and converge on a shared key-value map through incremental flooding and
//! periodic three-way anti-entropy syncs. Routing state (adjacencies,
//! prefixes) is published into the store and observed by co-located
//! subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                           KvStore actor                            │
//! │                                                                    │
//! │  cmd inbox ──▶ dispatcher ──▶ merge ──▶ TTL queue ──▶ publisher    │
//! │  (clients,                      │                    (local+global)│
//! │   peers)                        ▼                                  │
//! │  sync chan ──▶ 3-way sync    flood engine ──▶ peer links           │
//! │  timers    ──▶ expiry /         │  ▲                               │
//! │                periodic sync    ▼  │                               │
//! │                             rate limiter + DUAL spanning tree      │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything mutable is owned by the actor task; there is no locking.
//! Convergence rests on one deterministic merge function
//! ([`store::merge_key_values`]): whatever order publications arrive in,
//! every store settles on the same record per key.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use kvmesh::{KvStore, KvStoreConfig, MemoryMesh};
//!
//! #[tokio::main]
//! async fn main() -> kvmesh::Result<()> {
//!     let mesh = MemoryMesh::new();
//!     let config = KvStoreConfig {
//!         node_id: "pod-1".into(),
//!         cmd_url: "mem://pod-1/cmd".into(),
//!         ..Default::default()
//!     };
//!     let node = KvStore::spawn(config, HashMap::new(), Arc::new(mesh))?;
//!
//!     let _updates = node.subscribe_local();
//!     // publish and observe...
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dual;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod proto;
pub mod resilience;
pub mod store;
pub mod transport;
pub mod ttl;

mod kvstore;

// Re-exports for convenience
pub use config::{FilterConfig, FloodRate, KvStoreConfig};
pub use error::{KvStoreError, Result};
pub use kvstore::{KvStore, KvStoreHandle};
pub use proto::{
    Command, KvStoreRequest, PeerSpec, ProtoDecodeError, Publication, SptInfo, SptInfos, Value,
    TTL_INFINITY,
};
pub use transport::{MemoryMesh, PeerTransport};
