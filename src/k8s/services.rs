// services.rs - Service watch stream consumer
//
// Maintains ClusterIP -> service and service -> selector label set. Headless
// services (ClusterIP "" or "None") have no routable VIP and are never
// indexed by address. External IPs and ingress hostnames are ignored by
// design; only in-cluster addresses are resolved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::{ResourceExt, runtime::watcher};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    k8s::{
        deleter::TimedDeleter,
        workload::{LabelSet, NamespacedName, label_set},
    },
    metrics::k8s::{WatchEventType, WatchResource, inc_watch_event},
};

pub struct ServiceWatcher {
    ip_to_service: Arc<DashMap<String, NamespacedName>>,
    service_selectors: Arc<DashMap<NamespacedName, LabelSet>>,
    /// Last-seen ClusterIP by service, for synthesizing deletes across a
    /// re-list.
    snapshots: HashMap<NamespacedName, Option<String>>,
    relist: Option<HashSet<NamespacedName>>,
    deleter: TimedDeleter,
    synced_tx: watch::Sender<bool>,
}

impl ServiceWatcher {
    pub fn new(deleter: TimedDeleter) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            ip_to_service: Arc::new(DashMap::new()),
            service_selectors: Arc::new(DashMap::new()),
            snapshots: HashMap::new(),
            relist: None,
            deleter,
            synced_tx,
        }
    }

    pub fn ip_to_service(&self) -> Arc<DashMap<String, NamespacedName>> {
        Arc::clone(&self.ip_to_service)
    }

    pub fn service_selectors(&self) -> Arc<DashMap<NamespacedName, LabelSet>> {
        Arc::clone(&self.service_selectors)
    }

    /// Flips to `true` once the initial list has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Drives the watcher from a service watch stream until the stop signal.
    pub async fn run<S>(mut self, stream: S, mut shutdown_rx: broadcast::Receiver<()>)
    where
        S: Stream<Item = watcher::Result<watcher::Event<Service>>>,
    {
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(
                        event.name = "k8s.service_watcher.stopped",
                        "service watcher loop exiting"
                    );
                    return;
                }
                item = stream.try_next() => match item {
                    Ok(Some(event)) => self.apply(event),
                    Ok(None) => {
                        warn!(
                            event.name = "k8s.service_watcher.stream_ended",
                            "service watch stream terminated unexpectedly"
                        );
                        return;
                    }
                    Err(e) => {
                        warn!(
                            event.name = "k8s.service_watcher.stream_error",
                            error.message = %e,
                            "service watch stream error; backoff will retry"
                        );
                        inc_watch_event(WatchResource::Service, WatchEventType::Error);
                    }
                },
            }
        }
    }

    /// Applies one watch event to the indexes.
    pub fn apply(&mut self, event: watcher::Event<Service>) {
        match event {
            watcher::Event::Apply(service) => {
                inc_watch_event(WatchResource::Service, WatchEventType::Apply);
                self.apply_service(&service);
            }
            watcher::Event::Delete(service) => {
                inc_watch_event(WatchResource::Service, WatchEventType::Delete);
                let key = namespaced_name(&service);
                self.remove_service(&key, cluster_ip(&service).as_deref());
            }
            watcher::Event::Init => {
                inc_watch_event(WatchResource::Service, WatchEventType::Init);
                self.relist = Some(HashSet::new());
            }
            watcher::Event::InitApply(service) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(namespaced_name(&service));
                }
                self.apply_service(&service);
            }
            watcher::Event::InitDone => {
                inc_watch_event(WatchResource::Service, WatchEventType::InitDone);
                self.finish_relist();
                self.synced_tx.send_replace(true);
                info!(
                    event.name = "k8s.service_watcher.synced",
                    "service cache synced"
                );
            }
        }
    }

    fn apply_service(&mut self, service: &Service) {
        let key = namespaced_name(service);
        let ip = cluster_ip(service);

        if let Some(ip) = &ip {
            self.ip_to_service.insert(ip.clone(), key.clone());
        }

        let selectors = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .map(label_set)
            .unwrap_or_default();
        if !selectors.is_empty() {
            self.service_selectors.insert(key.clone(), selectors);
        }

        self.snapshots.insert(key, ip);
    }

    fn remove_service(&mut self, key: &NamespacedName, ip: Option<&str>) {
        if let Some(ip) = ip {
            self.deleter.delete_after(&self.ip_to_service, ip.to_string());
        }
        self.deleter.delete_after(&self.service_selectors, key.clone());
        self.snapshots.remove(key);
    }

    /// Services that did not reappear across a re-list were deleted while
    /// the watch was down.
    fn finish_relist(&mut self) {
        let Some(seen) = self.relist.take() else {
            return;
        };

        let vanished: Vec<(NamespacedName, Option<String>)> = self
            .snapshots
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(key, ip)| (key.clone(), ip.clone()))
            .collect();

        for (key, ip) in vanished {
            debug!(
                event.name = "k8s.service_watcher.vanished_during_relist",
                k8s.service = %key,
                "service disappeared across re-list; treating as delete"
            );
            self.remove_service(&key, ip.as_deref());
        }
    }
}

fn namespaced_name(service: &Service) -> NamespacedName {
    NamespacedName::new(service.name_any(), service.namespace().unwrap_or_default())
}

/// The service's routable VIP, if it has one. Headless services report
/// `"None"`, freshly created ones may report the empty string; neither is a
/// usable address.
fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.clone())
        .filter(|ip| !ip.is_empty() && ip != "None")
}
