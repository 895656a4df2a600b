//! Shared test utilities for integration and chaos tests.
//!
//! Spawns store nodes on one in-memory mesh and wires them into topologies.
//! All tests are pure in-process; no external services are required.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kvmesh::config::KvStoreConfig;
use kvmesh::proto::{PeerSpec, Value, TTL_INFINITY};
use kvmesh::transport::MemoryMesh;
use kvmesh::{KvStore, KvStoreHandle};

pub struct TestNode {
    pub name: String,
    pub cmd_url: String,
    pub handle: KvStoreHandle,
}

impl TestNode {
    /// PeerSpec other nodes use to reach this one.
    pub fn spec(&self, supports_flood_optimization: bool) -> PeerSpec {
        PeerSpec {
            cmd_url: self.cmd_url.clone(),
            supports_flood_optimization,
        }
    }
}

/// Install a test subscriber once; respects RUST_LOG.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawn a node with the test defaults, letting the caller tweak the config.
pub fn spawn_node(
    mesh: &MemoryMesh,
    name: &str,
    tweak: impl FnOnce(&mut KvStoreConfig),
) -> TestNode {
    init_tracing();
    let mut config = KvStoreConfig::for_testing(name);
    tweak(&mut config);
    let cmd_url = config.cmd_url.clone();
    let handle =
        KvStore::spawn(config, HashMap::new(), Arc::new(mesh.clone())).expect("spawn node");
    TestNode {
        name: name.to_string(),
        cmd_url,
        handle,
    }
}

/// Register `b` as a peer of `a` (one direction).
pub async fn connect(a: &TestNode, b: &TestNode, supports_flood_optimization: bool) {
    let mut peers = HashMap::new();
    peers.insert(b.name.clone(), b.spec(supports_flood_optimization));
    a.handle.add_peers(peers).await.expect("add peer");
}

/// Register both directions.
pub async fn connect_both(a: &TestNode, b: &TestNode, supports_flood_optimization: bool) {
    connect(a, b, supports_flood_optimization).await;
    connect(b, a, supports_flood_optimization).await;
}

/// A value record with an infinite TTL.
pub fn value(version: i64, originator: &str, bytes: &str) -> Value {
    Value::new(
        version,
        originator,
        Some(bytes.as_bytes().to_vec()),
        TTL_INFINITY,
        1,
    )
}

/// A value record with a finite TTL in milliseconds.
pub fn value_with_ttl(version: i64, originator: &str, bytes: &str, ttl_ms: i64) -> Value {
    Value::new(version, originator, Some(bytes.as_bytes().to_vec()), ttl_ms, 1)
}

/// Poll `probe` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `node` holds `key` with the expected payload.
pub async fn wait_for_key(node: &TestNode, key: &str, expected: &[u8]) {
    wait_until(&format!("{} to hold {key}", node.name), || async {
        let publication = node
            .handle
            .get_keys(vec![key.to_string()])
            .await
            .expect("get keys");
        publication
            .key_vals
            .get(key)
            .and_then(|v| v.value.as_deref())
            .map_or(false, |bytes| bytes == expected)
    })
    .await;
}
