// resolver.rs - Resolver facade over the watcher-fed indexes
//
// Owns the lifecycle: builds the cluster client, starts the pod and service
// watchers, waits for their caches to sync, starts the mapper and the
// diagnostic dump loop, and hands out the synchronous lookup used on the
// telemetry hot path. The handle is shared by the trace and the metric
// processor; stopping it is idempotent.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    Api, Client,
    runtime::{WatchStreamExt, watcher},
};
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::{
    conf::Conf,
    health::HealthState,
    k8s::{
        K8sError,
        deleter::TimedDeleter,
        mapper::ServiceWorkloadMapper,
        pods::PodWatcher,
        services::ServiceWatcher,
        workload::{LabelSet, NamespacedName},
    },
    metrics::resolver::{ResolutionOutcome, inc_resolution, set_index_entries},
    shutdown::ShutdownSignal,
};

pub struct IpResolver {
    ip_to_pod: Arc<DashMap<String, String>>,
    pod_to_workload: Arc<DashMap<String, NamespacedName>>,
    workload_labels: Arc<DashMap<NamespacedName, LabelSet>>,
    ip_to_service: Arc<DashMap<String, NamespacedName>>,
    service_selectors: Arc<DashMap<NamespacedName, LabelSet>>,
    service_to_workload: Arc<DashMap<NamespacedName, NamespacedName>>,
    shutdown: ShutdownSignal,
}

impl IpResolver {
    /// Builds the cluster client, starts both watchers, waits for their
    /// caches to sync, then starts the mapper and the dump loop.
    ///
    /// Fatal on client initialization failure and on cache sync timeout;
    /// there is no degraded mode without a synced cache.
    pub async fn start(conf: &Conf, health: HealthState) -> Result<Arc<Self>, K8sError> {
        let client = Client::try_default().await.map_err(K8sError::client_init)?;

        // Replicas starting together would otherwise hit the API server
        // with simultaneous list requests.
        jitter_sleep(conf.startup_jitter).await;

        let deleter = TimedDeleter::new(conf.deletion_delay);
        let shutdown = ShutdownSignal::new();

        let pod_watcher = PodWatcher::new(deleter.clone());
        let mut pods_synced = pod_watcher.synced();
        let service_watcher = ServiceWatcher::new(deleter.clone());
        let mut services_synced = service_watcher.synced();

        let resolver = Arc::new(Self {
            ip_to_pod: pod_watcher.ip_to_pod(),
            pod_to_workload: pod_watcher.pod_to_workload(),
            workload_labels: pod_watcher.workload_labels(),
            ip_to_service: service_watcher.ip_to_service(),
            service_selectors: service_watcher.service_selectors(),
            service_to_workload: Arc::new(DashMap::new()),
            shutdown: shutdown.clone(),
        });

        let pods: Api<Pod> = Api::all(client.clone());
        let pod_stream = watcher(pods, watcher::Config::default()).default_backoff();
        tokio::spawn(pod_watcher.run(pod_stream, shutdown.subscribe()));

        let services: Api<Service> = Api::all(client);
        let service_stream = watcher(services, watcher::Config::default()).default_backoff();
        tokio::spawn(service_watcher.run(service_stream, shutdown.subscribe()));

        wait_for_cache_sync(&mut pods_synced, conf.cache_sync_timeout, "pod").await?;
        wait_for_cache_sync(&mut services_synced, conf.cache_sync_timeout, "service").await?;
        health.k8s_caches_synced.store(true, Ordering::Relaxed);

        let mapper = ServiceWorkloadMapper::new(
            Arc::clone(&resolver.service_selectors),
            Arc::clone(&resolver.workload_labels),
            Arc::clone(&resolver.service_to_workload),
            conf.mapper_interval,
            deleter,
        );
        tokio::spawn(mapper.run(shutdown.subscribe()));

        let dump = Arc::clone(&resolver);
        let dump_interval = conf.dump_interval;
        tokio::spawn(async move { dump.dump_loop(dump_interval).await });

        health.ready_to_process.store(true, Ordering::Relaxed);
        health.startup_complete.store(true, Ordering::Relaxed);
        info!(event.name = "k8s.resolver.started", "ip resolver started");

        Ok(resolver)
    }

    /// Assembles a resolver over externally driven watchers. The watchers'
    /// run loops, the mapper, and the dump loop are not started.
    #[cfg(test)]
    pub(crate) fn from_watchers(
        pod_watcher: &PodWatcher,
        service_watcher: &ServiceWatcher,
        service_to_workload: Arc<DashMap<NamespacedName, NamespacedName>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ip_to_pod: pod_watcher.ip_to_pod(),
            pod_to_workload: pod_watcher.pod_to_workload(),
            workload_labels: pod_watcher.workload_labels(),
            ip_to_service: service_watcher.ip_to_service(),
            service_selectors: service_watcher.service_selectors(),
            service_to_workload,
            shutdown: ShutdownSignal::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn workload_labels(&self) -> Arc<DashMap<NamespacedName, LabelSet>> {
        Arc::clone(&self.workload_labels)
    }

    #[cfg(test)]
    pub(crate) fn service_selectors(&self) -> Arc<DashMap<NamespacedName, LabelSet>> {
        Arc::clone(&self.service_selectors)
    }

    #[cfg(test)]
    pub(crate) fn service_to_workload(&self) -> Arc<DashMap<NamespacedName, NamespacedName>> {
        Arc::clone(&self.service_to_workload)
    }

    /// Resolves an endpoint (`10.1.0.5` or `10.2.0.1:8080`) to a workload.
    ///
    /// Pod endpoints are tried first, then ClusterIPs through the mapped
    /// service edge. Both hops of a path must hit; a half-populated pair of
    /// indexes yields a miss, never a wrong answer.
    pub fn resolve_by_ip(&self, endpoint: &str) -> Option<NamespacedName> {
        if let Some(pod) = self.ip_to_pod.get(endpoint) {
            if let Some(workload) = self.pod_to_workload.get(pod.value()) {
                inc_resolution(ResolutionOutcome::Pod);
                return Some(workload.value().clone());
            }
        }

        if let Some(service) = self.ip_to_service.get(endpoint) {
            if let Some(workload) = self.service_to_workload.get(service.value()) {
                inc_resolution(ResolutionOutcome::Service);
                return Some(workload.value().clone());
            }
        }

        inc_resolution(ResolutionOutcome::Miss);
        None
    }

    /// Closes the shared stop signal. Safe to call from both processors,
    /// any number of times.
    pub fn stop(&self) {
        self.shutdown.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Periodically publishes index sizes and, at trace level, full index
    /// contents. Purely diagnostic.
    async fn dump_loop(&self, interval: Duration) {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(event.name = "k8s.resolver.dump_stopped", "dump loop exiting");
                    return;
                }
                _ = tokio::time::sleep(interval) => self.dump(),
            }
        }
    }

    fn dump(&self) {
        set_index_entries("ip_to_pod", self.ip_to_pod.len() as i64);
        set_index_entries("pod_to_workload", self.pod_to_workload.len() as i64);
        set_index_entries("workload_labels", self.workload_labels.len() as i64);
        set_index_entries("ip_to_service", self.ip_to_service.len() as i64);
        set_index_entries("service_selectors", self.service_selectors.len() as i64);
        set_index_entries("service_to_workload", self.service_to_workload.len() as i64);

        debug!(
            event.name = "k8s.resolver.dump",
            ip_to_pod = self.ip_to_pod.len(),
            pod_to_workload = self.pod_to_workload.len(),
            workload_labels = self.workload_labels.len(),
            ip_to_service = self.ip_to_service.len(),
            service_selectors = self.service_selectors.len(),
            service_to_workload = self.service_to_workload.len(),
            "resolver index sizes"
        );

        for entry in self.ip_to_pod.iter() {
            trace!(event.name = "k8s.resolver.dump.ip_to_pod", key = %entry.key(), value = %entry.value());
        }
        for entry in self.pod_to_workload.iter() {
            trace!(event.name = "k8s.resolver.dump.pod_to_workload", key = %entry.key(), value = %entry.value());
        }
        for entry in self.ip_to_service.iter() {
            trace!(event.name = "k8s.resolver.dump.ip_to_service", key = %entry.key(), value = %entry.value());
        }
        for entry in self.service_to_workload.iter() {
            trace!(event.name = "k8s.resolver.dump.service_to_workload", key = %entry.key(), value = %entry.value());
        }
    }
}

/// Sleeps a uniform random duration in `[0, max)`.
async fn jitter_sleep(max: Duration) {
    if max.is_zero() {
        return;
    }
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..max.as_millis() as u64));
    debug!(
        event.name = "k8s.resolver.jitter",
        jitter_ms = jitter.as_millis() as u64,
        "sleeping startup jitter"
    );
    tokio::time::sleep(jitter).await;
}

async fn wait_for_cache_sync(
    synced: &mut watch::Receiver<bool>,
    timeout: Duration,
    resource: &str,
) -> Result<(), K8sError> {
    match tokio::time::timeout(timeout, synced.wait_for(|synced| *synced)).await {
        Ok(Ok(_)) => {
            info!(
                event.name = "k8s.resolver.cache_synced",
                k8s.resource.name = %resource,
                "watcher cache synced"
            );
            Ok(())
        }
        // Elapsed, or the watcher dropped its sender before syncing.
        _ => Err(K8sError::cache_sync_timeout(resource)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::k8s::{
        mapper::DEFAULT_MAPPER_INTERVAL, pods::tests::deployment_pod,
        services::tests::service,
    };

    use super::*;

    const DELAY: Duration = Duration::from_secs(120);

    /// Advances the paused clock and yields repeatedly so that tasks
    /// `tokio::spawn`-ed onto the current-thread test runtime (including
    /// their own internal timer registration) actually get polled; a
    /// single `yield_now` is not enough to drive a freshly spawned task
    /// through both its registration and its wakeup.
    async fn advance(duration: Duration) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(duration).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    struct Cluster {
        pod_watcher: PodWatcher,
        service_watcher: ServiceWatcher,
        mapper: ServiceWorkloadMapper,
        resolver: Arc<IpResolver>,
    }

    /// A hand-driven cluster: events are applied directly, the mapper runs
    /// on demand.
    fn cluster() -> Cluster {
        let deleter = TimedDeleter::new(DELAY);
        let pod_watcher = PodWatcher::new(deleter.clone());
        let service_watcher = ServiceWatcher::new(deleter.clone());
        let resolver = IpResolver::from_watchers(
            &pod_watcher,
            &service_watcher,
            Arc::new(DashMap::new()),
        );
        let mapper = ServiceWorkloadMapper::new(
            resolver.service_selectors(),
            resolver.workload_labels(),
            resolver.service_to_workload(),
            DEFAULT_MAPPER_INTERVAL,
            deleter,
        );
        Cluster {
            pod_watcher,
            service_watcher,
            mapper,
            resolver,
        }
    }

    #[tokio::test]
    async fn deployment_pod_and_service_both_resolve() {
        let mut c = cluster();

        c.pod_watcher.apply(watcher::Event::Apply(deployment_pod(
            "cart-6d9f7c4b8z-ab3k9",
            "shop",
            "cart-6d9f7c4b8z",
            "10.1.0.5",
        )));
        c.service_watcher.apply(watcher::Event::Apply(service(
            "cart",
            "shop",
            "10.100.0.9",
            &[("app", "cart")],
        )));
        c.mapper.map_once();

        let expected = NamespacedName::new("cart", "shop");
        assert_eq!(c.resolver.resolve_by_ip("10.1.0.5"), Some(expected.clone()));
        assert_eq!(c.resolver.resolve_by_ip("10.100.0.9"), Some(expected));
    }

    #[tokio::test]
    async fn statefulset_pod_resolves() {
        let mut c = cluster();

        let mut pod = deployment_pod("db-0", "prod", "unused", "10.3.0.2");
        pod.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                kind: "StatefulSet".to_string(),
                name: "db".to_string(),
                ..Default::default()
            },
        ]);
        c.pod_watcher.apply(watcher::Event::Apply(pod));

        assert_eq!(
            c.resolver.resolve_by_ip("10.3.0.2"),
            Some(NamespacedName::new("db", "prod"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_pod_resolves_during_the_deletion_window() {
        let mut c = cluster();
        let pod = deployment_pod("cart-6d9f7c4b8z-ab3k9", "shop", "cart-6d9f7c4b8z", "10.1.0.5");
        c.pod_watcher.apply(watcher::Event::Apply(pod.clone()));
        c.pod_watcher.apply(watcher::Event::Delete(pod));

        advance(Duration::from_secs(60)).await;
        assert_eq!(
            c.resolver.resolve_by_ip("10.1.0.5"),
            Some(NamespacedName::new("cart", "shop"))
        );

        advance(DELAY).await;
        assert_eq!(c.resolver.resolve_by_ip("10.1.0.5"), None);
    }

    #[tokio::test]
    async fn unknown_endpoint_is_a_miss() {
        let c = cluster();
        assert_eq!(c.resolver.resolve_by_ip("10.9.9.9"), None);
    }

    #[tokio::test]
    async fn host_network_endpoint_requires_the_port() {
        let mut c = cluster();

        let mut pod = deployment_pod("node-agent-b2kz9", "kube-system", "unused", "");
        pod.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                kind: "DaemonSet".to_string(),
                name: "node-agent".to_string(),
                ..Default::default()
            },
        ]);
        pod.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            host_network: Some(true),
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "main".to_string(),
                ports: Some(vec![k8s_openapi::api::core::v1::ContainerPort {
                    container_port: 8080,
                    host_port: Some(8080),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            host_ip: Some("10.2.0.1".to_string()),
            ..Default::default()
        });
        c.pod_watcher.apply(watcher::Event::Apply(pod));

        assert_eq!(
            c.resolver.resolve_by_ip("10.2.0.1:8080"),
            Some(NamespacedName::new("node-agent", "kube-system"))
        );
        assert_eq!(c.resolver.resolve_by_ip("10.2.0.1"), None);
    }

    #[tokio::test]
    async fn service_ip_misses_until_the_mapper_runs() {
        let mut c = cluster();

        c.pod_watcher.apply(watcher::Event::Apply(deployment_pod(
            "cart-6d9f7c4b8z-ab3k9",
            "shop",
            "cart-6d9f7c4b8z",
            "10.1.0.5",
        )));
        c.service_watcher.apply(watcher::Event::Apply(service(
            "cart",
            "shop",
            "10.100.0.9",
            &[("app", "cart")],
        )));

        // Transient state between watcher updates and the next join: a
        // miss, never a wrong answer.
        assert_eq!(c.resolver.resolve_by_ip("10.100.0.9"), None);

        c.mapper.map_once();
        assert_eq!(
            c.resolver.resolve_by_ip("10.100.0.9"),
            Some(NamespacedName::new("cart", "shop"))
        );
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let c = cluster();
        assert!(!c.resolver.is_stopped());
        c.resolver.stop();
        c.resolver.stop();
        assert!(c.resolver.is_stopped());
    }
}
