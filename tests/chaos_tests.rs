// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the mesh survives malformed input, dead peers,
//! restarts, and message storms without panics, deadlocks, or divergence.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{connect_both, spawn_node, value, wait_for_key, wait_until};
use kvmesh::proto::{self, Command, KeySetParams, KvStoreRequest, Value};
use kvmesh::transport::{Link as _, MemoryMesh, PeerTransport as _};
use kvmesh::TTL_INFINITY;

// =============================================================================
// Malformed Input Handling
// =============================================================================

/// Garbage bytes on the wire must never panic the decoder.
#[tokio::test]
async fn corrupted_messages_no_panic() {
    let corrupted_payloads: &[&[u8]] = &[
        &[],
        &[0x00],
        &[0xFF],
        &[0xA1],                   // map header, missing body
        &[0xBF, 0x00],             // indefinite map, truncated
        &[0xA1, 0x00, 0x9F],       // nested truncation
        &[0xDE, 0xAD, 0xBE, 0xEF], // plain garbage
    ];

    for (i, payload) in corrupted_payloads.iter().enumerate() {
        let result = proto::decode_request(payload);
        assert!(
            result.is_err() || matches!(result, Ok(KvStoreRequest { cmd: None, .. })),
            "payload {i} should not decode into a usable request"
        );
        let _ = proto::decode_publication(payload);
    }
}

/// Records with hostile field values are skipped, not fatal.
#[tokio::test]
async fn hostile_records_are_skipped() {
    let mesh = MemoryMesh::new();
    let node = spawn_node(&mesh, "node-a", |_| {});

    let hostile = vec![
        // Zero and negative TTLs are malformed.
        Value::new(1, "evil", Some(b"x".to_vec()), 0, 1),
        Value::new(1, "evil", Some(b"x".to_vec()), -1, 1),
        // Version below anything a setter may use.
        Value::new(0, "evil", Some(b"x".to_vec()), TTL_INFINITY, 1),
        // TTL refresh for a record nobody holds.
        Value::new(1, "evil", None, 5_000, 9),
    ];

    for (i, record) in hostile.into_iter().enumerate() {
        let mut key_vals = HashMap::new();
        key_vals.insert(format!("hostile-{i}"), record);
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
        // The request itself is well-formed; the record just merges to
        // nothing.
        node.handle.request_raw(&request).await.unwrap();
    }

    let counters = node.handle.counters().await.unwrap();
    assert_eq!(counters["kvstore.num_keys"], 0);

    // The store still works afterwards.
    node.handle.set_key("good", value(1, "a", "v")).await.unwrap();
    let lookup = node.handle.get_keys(vec!["good".to_string()]).await.unwrap();
    assert_eq!(lookup.key_vals.len(), 1);

    node.handle.shutdown().await;
}

// =============================================================================
// Dead and Restarting Peers
// =============================================================================

/// A node keeps serving while one of its peers is gone, and the survivor
/// mesh still converges.
#[tokio::test]
async fn dead_peer_does_not_block_the_rest() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});
    let c = spawn_node(&mesh, "node-c", |_| {});
    connect_both(&a, &b, false).await;
    connect_both(&a, &c, false).await;

    // C dies without saying goodbye.
    c.handle.shutdown().await;

    // A's floods to C fail; B must still receive everything.
    for i in 0..5 {
        a.handle
            .set_key(format!("k{i}"), value(1, "a", "v"))
            .await
            .unwrap();
    }
    for i in 0..5 {
        wait_for_key(&b, &format!("k{i}"), b"v").await;
    }

    let counters = a.handle.counters().await.unwrap();
    assert!(
        counters.keys().any(|k| k.starts_with("kvstore.send_failure.")),
        "sends to the dead peer must be counted as failures"
    );

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

/// A restarted peer reconstructs its store from a full sync.
#[tokio::test]
async fn restarted_peer_recovers_state() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});
    connect_both(&a, &b, false).await;

    a.handle.set_key("x", value(3, "a", "vx")).await.unwrap();
    wait_for_key(&b, "x", b"vx").await;

    // B restarts empty on the same endpoint.
    b.handle.shutdown().await;
    let b = spawn_node(&mesh, "node-b", |_| {});
    let lookup = b.handle.get_keys(vec!["x".to_string()]).await.unwrap();
    assert!(lookup.key_vals.is_empty(), "fresh instance starts empty");

    // Re-announcing the peering triggers the recovery sync.
    connect_both(&a, &b, false).await;
    wait_for_key(&b, "x", b"vx").await;

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

/// Opposing writers with the same version converge to one deterministic
/// winner on every node.
#[tokio::test]
async fn concurrent_writers_converge() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});
    connect_both(&a, &b, false).await;

    // Same key, same version, different originators, set on both sides at
    // once.
    let from_a = value(1, "node-a", "from-a");
    let from_b = value(1, "node-b", "from-b");
    let (ra, rb) = tokio::join!(
        a.handle.set_key("contested", from_a),
        b.handle.set_key("contested", from_b),
    );
    ra.unwrap();
    rb.unwrap();

    // Higher originator id wins everywhere.
    wait_for_key(&a, "contested", b"from-b").await;
    wait_for_key(&b, "contested", b"from-b").await;

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

// =============================================================================
// Message Storms
// =============================================================================

/// A burst of writes across a mesh settles with identical stores.
#[tokio::test]
async fn write_storm_converges() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});
    let c = spawn_node(&mesh, "node-c", |_| {});
    connect_both(&a, &b, false).await;
    connect_both(&b, &c, false).await;
    connect_both(&a, &c, false).await;

    for i in 0..30 {
        let writer = match i % 3 {
            0 => &a,
            1 => &b,
            _ => &c,
        };
        writer
            .handle
            .set_key(format!("storm-{i}"), value(1, &writer.name, "v"))
            .await
            .unwrap();
    }

    wait_until("all stores to hold the full storm", || async {
        for node in [&a, &b, &c] {
            let dump = node.handle.dump_all("storm-").await.unwrap();
            if dump.key_vals.len() != 30 {
                return false;
            }
        }
        true
    })
    .await;

    // Byte-for-byte identical stores.
    let dump_a = a.handle.dump_all("").await.unwrap();
    let dump_b = b.handle.dump_all("").await.unwrap();
    let dump_c = c.handle.dump_all("").await.unwrap();
    for (key, val_a) in &dump_a.key_vals {
        assert_eq!(&dump_b.key_vals[key], val_a, "b diverged on {key}");
        assert_eq!(&dump_c.key_vals[key], val_a, "c diverged on {key}");
    }

    for node in [a, b, c] {
        node.handle.shutdown().await;
    }
}

/// Rapid peer add/del cycles leave the registry consistent.
#[tokio::test]
async fn peer_churn_no_corruption() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});

    for _ in 0..10 {
        connect_both(&a, &b, false).await;
        a.handle.del_peers(vec!["node-b".to_string()]).await.unwrap();
    }
    // Final state: attached again.
    connect_both(&a, &b, false).await;

    let peers = a.handle.dump_peers().await.unwrap();
    assert_eq!(peers.peers.len(), 1);

    a.handle.set_key("after-churn", value(1, "a", "v")).await.unwrap();
    wait_for_key(&b, "after-churn", b"v").await;

    a.handle.shutdown().await;
    b.handle.shutdown().await;
}

/// Shutdown mid-traffic neither hangs nor panics.
#[tokio::test]
async fn shutdown_under_load() {
    let mesh = MemoryMesh::new();
    let a = spawn_node(&mesh, "node-a", |_| {});
    let b = spawn_node(&mesh, "node-b", |_| {});
    connect_both(&a, &b, false).await;

    let writer = tokio::spawn({
        let mesh = mesh.clone();
        async move {
            // Independent client hammering A through the mesh.
            let (sync_tx, _sync_rx) = tokio::sync::mpsc::channel(16);
            let link = mesh.connect("mem://node-a/cmd", "chaos-client::1".to_string(), sync_tx);
            for i in 0..1_000 {
                let mut key_vals = HashMap::new();
                key_vals.insert(format!("load-{i}"), value(1, "chaos", "v"));
                let request = KvStoreRequest {
                    cmd: Some(Command::KeySet),
                    key_set_params: Some(KeySetParams {
                        key_vals,
                        solicit_response: false,
                        node_ids: None,
                        flood_root_id: None,
                    }),
                    ..Default::default()
                };
                if link.send_no_reply(proto::encode_request(&request)).is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Shut down while the storm is still running.
    a.handle.shutdown().await;
    b.handle.shutdown().await;
    writer.await.unwrap();
}
