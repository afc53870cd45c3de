// mapper.rs - Periodic service-to-workload join
//
// A service selects pods by labels; the pod watcher records which labels
// each workload carries. Joining the two yields a direct service ->
// workload edge the resolver can follow when telemetry carries a ClusterIP.
// The join runs off the hot path: once right after both caches sync, then
// on a fixed cadence that bounds staleness.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    k8s::{
        deleter::TimedDeleter,
        workload::{LabelSet, NamespacedName},
    },
    metrics::resolver::inc_mapper_run,
};

/// Default interval between join runs.
pub const DEFAULT_MAPPER_INTERVAL: Duration = Duration::from_secs(90);

pub struct ServiceWorkloadMapper {
    service_selectors: Arc<DashMap<NamespacedName, LabelSet>>,
    workload_labels: Arc<DashMap<NamespacedName, LabelSet>>,
    service_to_workload: Arc<DashMap<NamespacedName, NamespacedName>>,
    interval: Duration,
    deleter: TimedDeleter,
}

impl ServiceWorkloadMapper {
    pub fn new(
        service_selectors: Arc<DashMap<NamespacedName, LabelSet>>,
        workload_labels: Arc<DashMap<NamespacedName, LabelSet>>,
        service_to_workload: Arc<DashMap<NamespacedName, NamespacedName>>,
        interval: Duration,
        deleter: TimedDeleter,
    ) -> Self {
        Self {
            service_selectors,
            workload_labels,
            service_to_workload,
            interval,
            deleter,
        }
    }

    /// One full join pass over every service with selectors.
    ///
    /// Both inputs can mutate mid-iteration; no snapshot is taken because
    /// the next run converges on whatever was missed.
    pub fn map_once(&self) {
        inc_mapper_run();

        for entry in self.service_selectors.iter() {
            let service = entry.key();
            let selectors = entry.value();

            let matches: Vec<NamespacedName> = self
                .workload_labels
                .iter()
                .filter(|workload| {
                    !workload.key().namespace.is_empty()
                        && workload.key().namespace == service.namespace
                        && selectors.is_subset(workload.value())
                })
                .map(|workload| workload.key().clone())
                .collect();

            match matches.as_slice() {
                [workload] => {
                    debug!(
                        event.name = "k8s.mapper.mapped",
                        k8s.service = %service,
                        k8s.workload = %workload,
                        "mapped service to workload"
                    );
                    self.service_to_workload
                        .insert(service.clone(), workload.clone());
                }
                [] => {
                    debug!(
                        event.name = "k8s.mapper.unmatched",
                        k8s.service = %service,
                        "no workload matches the service selectors"
                    );
                    self.deleter
                        .delete_after(&self.service_to_workload, service.clone());
                }
                _ => {
                    // Ambiguous; any previously stored mapping is left in
                    // place rather than guessing between candidates.
                    info!(
                        event.name = "k8s.mapper.ambiguous",
                        k8s.service = %service,
                        k8s.workloads = ?matches.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "multiple workloads match the service selectors; not mapping"
                    );
                }
            }
        }
    }

    /// Runs the first join immediately, then repeats on the interval until
    /// the stop signal.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        self.map_once();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(event.name = "k8s.mapper.stopped", "mapper loop exiting");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => self.map_once(),
            }
        }
    }
}
