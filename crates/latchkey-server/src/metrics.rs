// Metrics for the lock server
// Recorded through the metrics facade; no exporter is installed here

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(
        "latchkey_greedy_grants_total",
        "Total number of greedy leases granted"
    );
    describe_counter!(
        "latchkey_recalls_total",
        "Total number of greedy lease recalls sent"
    );
    describe_counter!(
        "latchkey_lease_reclaims_total",
        "Total number of leases reclaimed after an unanswered recall"
    );
    describe_gauge!("latchkey_server_locks", "Current number of live server locks");
    describe_gauge!(
        "latchkey_connected_nodes",
        "Current number of connected client nodes"
    );

    tracing::info!("Metrics initialized");
}

/// Record a greedy lease grant
pub fn record_greedy_grant() {
    counter!("latchkey_greedy_grants_total").increment(1);
}

/// Record a recall sent to a lease holder
pub fn record_recall() {
    counter!("latchkey_recalls_total").increment(1);
}

/// Record a lease reclaimed without the holder's cooperation
pub fn record_lease_reclaim() {
    counter!("latchkey_lease_reclaims_total").increment(1);
}

pub fn set_live_locks(count: f64) {
    gauge!("latchkey_server_locks").set(count);
}

pub fn set_connected_nodes(count: f64) {
    gauge!("latchkey_connected_nodes").set(count);
}
