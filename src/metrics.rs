//! Metrics for observability.
//!
//! Exports metrics-facade counters and gauges for the replication core:
//! publication flow, merge outcomes, flood fan-out, sync lifecycle, and
//! peer health. These complement the in-actor counter map served by
//! COUNTERS_GET; the facade is for whatever exporter the daemon installs.
//!
//! All metrics are prefixed with `kvmesh_`; counters end in `_total`.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Record a publication received from a peer or client.
pub fn record_received_publication(key_count: usize) {
    counter!("kvmesh_received_publications_total").increment(1);
    counter!("kvmesh_received_key_vals_total").increment(key_count as u64);
}

/// Record key-value updates applied by a merge.
pub fn record_updated_key_vals(count: usize) {
    counter!("kvmesh_updated_key_vals_total").increment(count as u64);
}

/// Record a publication dropped because our own id was in its trail.
pub fn record_looped_publication() {
    counter!("kvmesh_looped_publications_total").increment(1);
}

/// Record a publication that merged to an empty delta.
pub fn record_redundant_publication() {
    counter!("kvmesh_redundant_publications_total").increment(1);
}

/// Record a publication forwarded to one peer.
pub fn record_sent_publication(peer_id: &str, key_count: usize) {
    counter!("kvmesh_sent_publications_total", "peer_id" => peer_id.to_string()).increment(1);
    counter!("kvmesh_sent_key_vals_total", "peer_id" => peer_id.to_string())
        .increment(key_count as u64);
}

/// Record a failed send, labeled by destination identity and failure class.
pub fn record_send_failure(socket_id: &str, kind: &str) {
    counter!(
        "kvmesh_send_failures_total",
        "socket_id" => socket_id.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record keys removed by TTL expiry.
pub fn record_expired_keys(count: usize) {
    counter!("kvmesh_expired_key_vals_total").increment(count as u64);
}

/// Record a publication buffered by the flood rate limiter.
pub fn record_rate_limit_suppress(key_count: usize) {
    counter!("kvmesh_rate_limit_suppress_total").increment(1);
    counter!("kvmesh_rate_limit_keys_total").increment(key_count as u64);
}

/// Record a full-sync request sent to a peer.
pub fn record_full_sync_request(peer_id: &str) {
    counter!("kvmesh_full_sync_requests_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record the request-to-response time of one full sync.
pub fn record_sync_duration(socket_id: &str, duration: Duration) {
    histogram!("kvmesh_peer_sync_duration_seconds", "socket_id" => socket_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a handled command.
pub fn record_command(cmd: &str) {
    counter!("kvmesh_commands_total", "cmd" => cmd.to_string()).increment(1);
}

/// Record a batch of received DUAL messages.
pub fn record_dual_messages() {
    counter!("kvmesh_dual_messages_total").increment(1);
}

/// Record a message that failed to decode.
pub fn record_decode_failure() {
    counter!("kvmesh_decode_failures_total").increment(1);
}

/// Gauge: number of keys in the store.
pub fn set_num_keys(count: usize) {
    gauge!("kvmesh_num_keys").set(count as f64);
}

/// Gauge: number of registered peers.
pub fn set_num_peers(count: usize) {
    gauge!("kvmesh_num_peers").set(count as f64);
}

/// Gauge: peers with a full sync still pending.
pub fn set_pending_full_sync(count: usize) {
    gauge!("kvmesh_pending_full_sync").set(count as f64);
}
