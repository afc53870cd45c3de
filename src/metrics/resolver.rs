//! Helper functions for resolver metrics.

use crate::metrics::registry;

/// How a hot-path resolution concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Resolved through the pod indexes.
    Pod,
    /// Resolved through the service-to-workload edge.
    Service,
    Miss,
}

impl AsRef<str> for ResolutionOutcome {
    fn as_ref(&self) -> &str {
        match self {
            ResolutionOutcome::Pod => "pod",
            ResolutionOutcome::Service => "service",
            ResolutionOutcome::Miss => "miss",
        }
    }
}

/// Increment the resolutions counter.
pub fn inc_resolution(outcome: ResolutionOutcome) {
    registry::RESOLUTIONS_TOTAL
        .with_label_values(&[outcome.as_ref()])
        .inc();
}

/// Increment the mapper pass counter.
pub fn inc_mapper_run() {
    registry::MAPPER_RUNS_TOTAL.inc();
}

/// Record the current entry count of one index.
pub fn set_index_entries(index: &str, entries: i64) {
    registry::INDEX_ENTRIES
        .with_label_values(&[index])
        .set(entries);
}
