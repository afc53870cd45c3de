//! Global metrics registry and collector definitions.

use std::sync::OnceLock;

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry for all taxon metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total hot-path resolutions by outcome.
    /// Labels: result = "pod" | "service" | "miss"
    pub static ref RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("resolutions_total", "Total endpoint resolutions by outcome")
            .namespace("taxon")
            .subsystem("resolver"),
        &["result"]
    ).expect("failed to create resolutions_total metric");

    /// Total service-to-workload join passes.
    pub static ref MAPPER_RUNS_TOTAL: IntCounter = IntCounter::with_opts(
        Opts::new("mapper_runs_total", "Total service-to-workload mapper passes")
            .namespace("taxon")
            .subsystem("resolver")
    ).expect("failed to create mapper_runs_total metric");

    /// Current entry counts per index, refreshed by the diagnostic dump.
    pub static ref INDEX_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("index_entries", "Current number of entries per resolver index")
            .namespace("taxon")
            .subsystem("resolver"),
        &["index"]
    ).expect("failed to create index_entries metric");

    /// Watch events consumed from the cluster.
    /// Labels: resource = "pod" | "service", event = "apply" | "delete" | "init" | "init_done" | "error"
    pub static ref WATCH_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_events_total", "Total watch events consumed per resource")
            .namespace("taxon")
            .subsystem("k8s"),
        &["resource", "event"]
    ).expect("failed to create watch_events_total metric");
}

/// Registers every collector with [`struct@REGISTRY`]. Idempotent.
pub fn init_registry() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        REGISTRY
            .register(Box::new(RESOLUTIONS_TOTAL.clone()))
            .expect("failed to register resolutions_total");
        REGISTRY
            .register(Box::new(MAPPER_RUNS_TOTAL.clone()))
            .expect("failed to register mapper_runs_total");
        REGISTRY
            .register(Box::new(INDEX_ENTRIES.clone()))
            .expect("failed to register index_entries");
        REGISTRY
            .register(Box::new(WATCH_EVENTS_TOTAL.clone()))
            .expect("failed to register watch_events_total");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_registry_is_idempotent() {
        // A second registration attempt would panic with AlreadyReg.
        init_registry();
        init_registry();
    }

    #[test]
    fn collectors_record_without_registration() {
        RESOLUTIONS_TOTAL.with_label_values(&["miss"]).inc();
        assert!(RESOLUTIONS_TOTAL.with_label_values(&["miss"]).get() >= 1);
    }
}
