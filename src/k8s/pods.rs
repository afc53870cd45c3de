// pods.rs - Pod watch stream consumer
//
// Maintains the pod-side indexes: endpoint -> pod name, pod name -> workload,
// workload -> labels, and the per-workload live pod count. Events for one
// stream are applied serially by the owning task; the indexes themselves are
// concurrent maps because the resolver and the mapper read them from other
// tasks.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{ResourceExt, runtime::watcher};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    k8s::{
        deleter::TimedDeleter,
        workload::{LabelSet, NamespacedName, derive_workload, label_set},
    },
    metrics::k8s::{WatchEventType, WatchResource, inc_watch_event},
};

/// The network shape a pod had when last seen, kept so that the next event
/// for the same pod can be diffed against it.
#[derive(Clone, Debug, Default)]
struct PodSnapshot {
    host_network: bool,
    pod_ip: Option<String>,
    host_endpoints: Vec<String>,
}

impl PodSnapshot {
    fn of(pod: &Pod) -> Self {
        Self {
            host_network: host_network(pod),
            pod_ip: pod_ip(pod),
            host_endpoints: host_endpoints(pod),
        }
    }
}

pub struct PodWatcher {
    ip_to_pod: Arc<DashMap<String, String>>,
    pod_to_workload: Arc<DashMap<String, NamespacedName>>,
    workload_labels: Arc<DashMap<NamespacedName, LabelSet>>,
    /// Live pods per workload. Only this task writes it, so a plain map is
    /// enough; readers see its effects through `workload_labels`.
    workload_pod_count: HashMap<NamespacedName, usize>,
    /// Last-seen network shape by pod name, for update diffing and for
    /// synthesizing deletes across a re-list.
    snapshots: HashMap<String, PodSnapshot>,
    /// Pods seen during an in-progress re-list (`Init`..`InitDone`).
    relist: Option<HashSet<String>>,
    deleter: TimedDeleter,
    synced_tx: watch::Sender<bool>,
}

impl PodWatcher {
    pub fn new(deleter: TimedDeleter) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            ip_to_pod: Arc::new(DashMap::new()),
            pod_to_workload: Arc::new(DashMap::new()),
            workload_labels: Arc::new(DashMap::new()),
            workload_pod_count: HashMap::new(),
            snapshots: HashMap::new(),
            relist: None,
            deleter,
            synced_tx,
        }
    }

    pub fn ip_to_pod(&self) -> Arc<DashMap<String, String>> {
        Arc::clone(&self.ip_to_pod)
    }

    pub fn pod_to_workload(&self) -> Arc<DashMap<String, NamespacedName>> {
        Arc::clone(&self.pod_to_workload)
    }

    pub fn workload_labels(&self) -> Arc<DashMap<NamespacedName, LabelSet>> {
        Arc::clone(&self.workload_labels)
    }

    /// Flips to `true` once the initial list has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Drives the watcher from a pod watch stream until the stop signal.
    pub async fn run<S>(mut self, stream: S, mut shutdown_rx: broadcast::Receiver<()>)
    where
        S: Stream<Item = watcher::Result<watcher::Event<Pod>>>,
    {
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(event.name = "k8s.pod_watcher.stopped", "pod watcher loop exiting");
                    return;
                }
                item = stream.try_next() => match item {
                    Ok(Some(event)) => self.apply(event),
                    Ok(None) => {
                        warn!(
                            event.name = "k8s.pod_watcher.stream_ended",
                            "pod watch stream terminated unexpectedly"
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(
                            event.name = "k8s.pod_watcher.stream_error",
                            error.message = %e,
                            "pod watch stream error; backoff will retry"
                        );
                        inc_watch_event(WatchResource::Pod, WatchEventType::Error);
                    }
                },
            }
        }
    }

    /// Applies one watch event to the indexes.
    pub fn apply(&mut self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) => {
                inc_watch_event(WatchResource::Pod, WatchEventType::Apply);
                self.apply_pod(&pod);
            }
            watcher::Event::Delete(pod) => {
                inc_watch_event(WatchResource::Pod, WatchEventType::Delete);
                self.delete_pod(&pod);
            }
            watcher::Event::Init => {
                inc_watch_event(WatchResource::Pod, WatchEventType::Init);
                self.relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(pod.name_any());
                }
                self.apply_pod(&pod);
            }
            watcher::Event::InitDone => {
                inc_watch_event(WatchResource::Pod, WatchEventType::InitDone);
                self.finish_relist();
                self.synced_tx.send_replace(true);
                info!(event.name = "k8s.pod_watcher.synced", "pod cache synced");
            }
        }
    }

    fn apply_pod(&mut self, pod: &Pod) {
        let name = pod.name_any();
        let snapshot = PodSnapshot::of(pod);

        let previous = self.snapshots.get(&name).cloned();
        match &previous {
            Some(old) => self.update_endpoints(&name, old, &snapshot),
            None => self.add_endpoints(&name, &snapshot),
        }
        let is_add = previous.is_none();

        if let Some(workload) = derive_workload(pod) {
            self.pod_to_workload.insert(name.clone(), workload.clone());

            let labels = label_set(pod.labels());
            if !labels.is_empty() {
                // Last pod wins: divergent labels across pods of one
                // workload overwrite each other here.
                self.workload_labels.insert(workload.clone(), labels);
            }

            if is_add {
                let count = self.workload_pod_count.entry(workload.clone()).or_insert(0);
                *count += 1;
                debug!(
                    event.name = "k8s.pod_watcher.pod_added",
                    k8s.pod.name = %name,
                    k8s.workload = %workload,
                    k8s.workload.pod_count = *count,
                    "tracked pod for workload"
                );
            }
        }

        self.snapshots.insert(name, snapshot);
    }

    /// First sighting of a pod: store its endpoints outright.
    fn add_endpoints(&self, name: &str, snapshot: &PodSnapshot) {
        if snapshot.host_network {
            for endpoint in &snapshot.host_endpoints {
                self.ip_to_pod.insert(endpoint.clone(), name.to_string());
            }
        } else if let Some(ip) = &snapshot.pod_ip {
            self.ip_to_pod.insert(ip.clone(), name.to_string());
        }
    }

    /// A pod changed: reconcile `ip_to_pod` according to how its network
    /// mode moved between host and pod networking.
    fn update_endpoints(&self, name: &str, old: &PodSnapshot, new: &PodSnapshot) {
        match (old.host_network, new.host_network) {
            (true, true) => {
                for endpoint in &old.host_endpoints {
                    if !new.host_endpoints.contains(endpoint) {
                        self.deleter.delete_after(&self.ip_to_pod, endpoint.clone());
                    }
                }
                for endpoint in &new.host_endpoints {
                    if !old.host_endpoints.contains(endpoint) {
                        self.ip_to_pod.insert(endpoint.clone(), name.to_string());
                    }
                }
            }
            (true, false) => {
                for endpoint in &old.host_endpoints {
                    self.deleter.delete_after(&self.ip_to_pod, endpoint.clone());
                }
                if let Some(ip) = &new.pod_ip {
                    self.ip_to_pod.insert(ip.clone(), name.to_string());
                }
            }
            (false, true) => {
                if let Some(ip) = &old.pod_ip {
                    self.deleter.delete_after(&self.ip_to_pod, ip.clone());
                }
                for endpoint in &new.host_endpoints {
                    self.ip_to_pod.insert(endpoint.clone(), name.to_string());
                }
            }
            (false, false) => {
                if old.pod_ip != new.pod_ip {
                    if let Some(ip) = &old.pod_ip {
                        self.deleter.delete_after(&self.ip_to_pod, ip.clone());
                    }
                    if let Some(ip) = &new.pod_ip {
                        self.ip_to_pod.insert(ip.clone(), name.to_string());
                    }
                }
            }
        }
    }

    fn delete_pod(&mut self, pod: &Pod) {
        let name = pod.name_any();
        let snapshot = PodSnapshot::of(pod);
        self.remove_pod(&name, &snapshot);
    }

    fn remove_pod(&mut self, name: &str, snapshot: &PodSnapshot) {
        if snapshot.host_network {
            for endpoint in &snapshot.host_endpoints {
                self.deleter.delete_after(&self.ip_to_pod, endpoint.clone());
            }
        } else if let Some(ip) = &snapshot.pod_ip {
            self.deleter.delete_after(&self.ip_to_pod, ip.clone());
        }

        if let Some(workload) = self.pod_to_workload.get(name).map(|w| w.value().clone()) {
            let remaining = match self.workload_pod_count.get_mut(&workload) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            debug!(
                event.name = "k8s.pod_watcher.pod_removed",
                k8s.pod.name = %name,
                k8s.workload = %workload,
                k8s.workload.pod_count = remaining,
                "untracked pod for workload"
            );
            if remaining == 0 {
                self.workload_pod_count.remove(&workload);
                self.deleter.delete_after(&self.workload_labels, workload);
            }
        }

        self.deleter
            .delete_after(&self.pod_to_workload, name.to_string());
        self.snapshots.remove(name);
    }

    /// A re-list replaced the upstream state. Pods that were known before
    /// but did not reappear were deleted while the watch was down; handle
    /// them as deletes, using the snapshot in place of an event payload.
    fn finish_relist(&mut self) {
        let Some(seen) = self.relist.take() else {
            return;
        };

        let vanished: Vec<(String, PodSnapshot)> = self
            .snapshots
            .iter()
            .filter(|(name, _)| !seen.contains(*name))
            .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
            .collect();

        for (name, snapshot) in vanished {
            debug!(
                event.name = "k8s.pod_watcher.vanished_during_relist",
                k8s.pod.name = %name,
                "pod disappeared across re-list; treating as delete"
            );
            self.remove_pod(&name, &snapshot);
        }
    }
}

fn host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
}

/// One `HostIP:Port` endpoint per declared container host port, for pods on
/// the host network.
fn host_endpoints(pod: &Pod) -> Vec<String> {
    if !host_network(pod) {
        return Vec::new();
    }

    let Some(host_ip) = pod
        .status
        .as_ref()
        .and_then(|status| status.host_ip.as_deref())
        .filter(|ip| !ip.is_empty())
    else {
        return Vec::new();
    };

    let Some(spec) = &pod.spec else {
        return Vec::new();
    };

    spec.containers
        .iter()
        .flat_map(|container| container.ports.iter().flatten())
        .filter_map(|port| match port.host_port {
            Some(host_port) if host_port != 0 => Some(format!("{host_ip}:{host_port}")),
            _ => None,
        })
        .collect()
}
