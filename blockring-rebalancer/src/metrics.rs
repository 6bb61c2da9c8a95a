//! Prometheus metrics for the rebalancer and peer RPC

use crate::rebalancer::TickReport;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names as constants
pub mod names {
    // Rebalance metrics
    pub const TICKS: &str = "blockring_rebalance_ticks_total";
    pub const BLOCKS_EXAMINED: &str = "blockring_rebalance_blocks_examined_total";
    pub const BLOCKS_TRANSFERRED: &str = "blockring_rebalance_blocks_transferred_total";
    pub const BLOCKS_ALREADY_PRESENT: &str = "blockring_rebalance_blocks_already_present_total";
    pub const BLOCKS_DEFERRED: &str = "blockring_rebalance_blocks_deferred_total";
    pub const RESTARTS: &str = "blockring_rebalance_restarts_total";
    pub const PASSES: &str = "blockring_rebalance_passes_total";
    pub const FAILURES: &str = "blockring_rebalance_failures_total";
    pub const RING_VERSION: &str = "blockring_rebalance_ring_version";
    pub const GC_RECLAIMED: &str = "blockring_rebalance_gc_reclaimed_total";

    // RPC metrics
    pub const PEER_ERRORS: &str = "blockring_rpc_peer_errors_total";
    pub const RPC_CALLS: &str = "blockring_rpc_calls_total";
    pub const RPC_SERVED: &str = "blockring_rpc_served_total";
    pub const RPC_ERRORS: &str = "blockring_rpc_errors_total";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::TICKS, "Rebalance ticks run");
    describe_counter!(names::BLOCKS_EXAMINED, "Local blocks examined by the rebalancer");
    describe_counter!(
        names::BLOCKS_TRANSFERRED,
        "Blocks sent to an authorized holder"
    );
    describe_counter!(
        names::BLOCKS_ALREADY_PRESENT,
        "Blocks an authorized holder already had"
    );
    describe_counter!(
        names::BLOCKS_DEFERRED,
        "Blocks left for a later tick after peer failures"
    );
    describe_counter!(names::RESTARTS, "Passes restarted after a ring change");
    describe_counter!(names::PASSES, "Complete passes over a volume");
    describe_counter!(names::FAILURES, "Ticks aborted by a local storage failure");
    describe_gauge!(names::RING_VERSION, "Ring version the current pass is pinned to");
    describe_counter!(names::GC_RECLAIMED, "Blocks deleted by the garbage collector");

    describe_counter!(names::PEER_ERRORS, "Failed calls to a peer");
    describe_counter!(names::RPC_CALLS, "Outgoing peer RPC calls");
    describe_counter!(names::RPC_SERVED, "Peer RPC calls served from the local store");
    describe_counter!(names::RPC_ERRORS, "Peer RPC calls answered with an error");
}

/// Install the Prometheus recorder and serve `/metrics` on `port`
pub fn install_exporter(port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    init_metrics();
    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Record the outcome of one tick
pub fn record_tick(volume: &str, report: &TickReport) {
    let volume = volume.to_string();
    counter!(names::TICKS, "volume" => volume.clone()).increment(1);
    counter!(names::BLOCKS_EXAMINED, "volume" => volume.clone()).increment(report.examined as u64);
    counter!(names::BLOCKS_TRANSFERRED, "volume" => volume.clone())
        .increment(report.transferred as u64);
    counter!(names::BLOCKS_ALREADY_PRESENT, "volume" => volume.clone())
        .increment(report.already_present as u64);
    counter!(names::BLOCKS_DEFERRED, "volume" => volume.clone()).increment(report.deferred as u64);
    if report.restart_required {
        counter!(names::RESTARTS, "volume" => volume.clone()).increment(1);
    }
    if report.exhausted {
        counter!(names::PASSES, "volume" => volume.clone()).increment(1);
    }
    gauge!(names::RING_VERSION, "volume" => volume).set(report.version as f64);
}

/// Record a tick that ended in a local failure
pub fn record_failure(volume: &str) {
    counter!(names::FAILURES, "volume" => volume.to_string()).increment(1);
}
