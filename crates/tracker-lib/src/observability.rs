//! Prometheus metrics for the tracker.
//!
//! Metrics are registered once in a process-wide instance; handles are
//! cheap markers that all point at the same registry.

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

use crate::event::EventKind;
use crate::resources::ResourceKind;

static GLOBAL_METRICS: OnceLock<TrackerMetricsInner> = OnceLock::new();

struct TrackerMetricsInner {
    events_total: IntCounterVec,
    watch_reconnects_total: IntCounterVec,
    watch_refreshes_total: IntCounterVec,
    store_conflicts_total: IntCounter,
    store_retries_total: IntCounter,
    active_watches: IntGauge,
}

impl TrackerMetricsInner {
    fn new() -> Self {
        Self {
            events_total: register_int_counter_vec!(
                "voltrack_events_total",
                "Watch events applied to the store, by resource and event type",
                &["resource", "event"]
            )
            .expect("Failed to register events_total"),

            watch_reconnects_total: register_int_counter_vec!(
                "voltrack_watch_reconnects_total",
                "Watch streams re-opened after EOF or I/O errors",
                &["resource"]
            )
            .expect("Failed to register watch_reconnects_total"),

            watch_refreshes_total: register_int_counter_vec!(
                "voltrack_watch_refreshes_total",
                "Full refreshes forced by a lost feed horizon",
                &["resource"]
            )
            .expect("Failed to register watch_refreshes_total"),

            store_conflicts_total: register_int_counter!(
                "voltrack_store_conflicts_total",
                "Duplicate-key conflicts swallowed during event replay"
            )
            .expect("Failed to register store_conflicts_total"),

            store_retries_total: register_int_counter!(
                "voltrack_store_retries_total",
                "Store transactions retried after lock contention"
            )
            .expect("Failed to register store_retries_total"),

            active_watches: register_int_gauge!(
                "voltrack_active_watches",
                "Number of resource kinds currently being watched"
            )
            .expect("Failed to register active_watches"),
        }
    }
}

/// Handle to the process-wide tracker metrics.
#[derive(Clone)]
pub struct TrackerMetrics {
    _private: (),
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TrackerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TrackerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_event(&self, resource: ResourceKind, event: EventKind) {
        self.inner()
            .events_total
            .with_label_values(&[resource.as_str(), event.as_str()])
            .inc();
    }

    pub fn inc_reconnect(&self, resource: ResourceKind) {
        self.inner()
            .watch_reconnects_total
            .with_label_values(&[resource.as_str()])
            .inc();
    }

    pub fn inc_refresh(&self, resource: ResourceKind) {
        self.inner()
            .watch_refreshes_total
            .with_label_values(&[resource.as_str()])
            .inc();
    }

    pub fn inc_store_conflict(&self) {
        self.inner().store_conflicts_total.inc();
    }

    pub fn inc_store_retry(&self) {
        self.inner().store_retries_total.inc();
    }

    pub fn set_active_watches(&self, count: i64) {
        self.inner().active_watches.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle_is_shared() {
        let a = TrackerMetrics::new();
        let b = TrackerMetrics::new();
        a.inc_store_conflict();
        b.inc_store_retry();
        a.set_active_watches(3);
        a.inc_event(ResourceKind::Pods, EventKind::Added);
        b.inc_reconnect(ResourceKind::PersistentVolumes);
        b.inc_refresh(ResourceKind::PersistentVolumeClaims);
    }
}
