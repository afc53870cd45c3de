// processor.rs - Remote-service attribute rewriting
//
// The pipeline-facing stage. For every span and metric data point it reads
// the remote service attribute; when that value looks like an in-cluster
// address it is replaced with the resolved workload name, and the remote
// namespace attribute is set beside it. Resolution failures degrade to a
// sentinel value, never to a dropped record.

use std::{net::IpAddr, sync::Arc};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::{
    k8s::resolver::IpResolver,
    signal::{Attributes, MetricBatch, TraceBatch},
};

/// Attribute read and, on resolution, overwritten with the workload name.
pub const ATTR_REMOTE_SERVICE: &str = "aws.remote.service";
/// Attribute written with the workload's namespace on resolution.
pub const ATTR_REMOTE_NAMESPACE: &str = "aws.remote.namespace";
/// Sentinel written when the attribute is an address but nothing resolves.
pub const UNKNOWN_REMOTE_SERVICE: &str = "UnknownRemoteService";

lazy_static! {
    static ref IP_PORT: Regex = Regex::new(r"^(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)$")
        .expect("ip:port pattern must compile");
}

/// Rewrites remote-service attributes on traces and metrics batches.
///
/// Cloneable and cheap to share; both pipeline stages hold the same
/// resolver handle underneath.
#[derive(Clone)]
pub struct RemoteAttributesProcessor {
    resolver: Arc<IpResolver>,
}

impl RemoteAttributesProcessor {
    pub fn new(resolver: Arc<IpResolver>) -> Self {
        Self { resolver }
    }

    pub fn process_traces(&self, batch: &mut TraceBatch) {
        for span in &mut batch.spans {
            self.enrich(&mut span.attributes, &batch.resource);
        }
    }

    pub fn process_metrics(&self, batch: &mut MetricBatch) {
        for metric in &mut batch.metrics {
            for point in &mut metric.data_points {
                self.enrich(&mut point.attributes, &batch.resource);
            }
        }
    }

    /// Rewrites one attribute bag in place. Always succeeds: a record is
    /// never rejected over a resolution failure.
    ///
    /// The resource attribute bag is part of the processor contract but not
    /// consulted yet.
    pub fn enrich(&self, attributes: &mut Attributes, _resource_attributes: &Attributes) {
        // Absent or non-string values are left untouched.
        let Some(value) = attributes.get_str(ATTR_REMOTE_SERVICE).map(str::to_string) else {
            return;
        };

        let bare_ip = if let Some(ip) = extract_ip_port(&value) {
            // Host-network pods are indexed as ip:port; try the exact
            // endpoint before falling back to the bare address.
            if let Some(workload) = self.resolver.resolve_by_ip(&value) {
                attributes.put(ATTR_REMOTE_SERVICE, workload.name);
                attributes.put(ATTR_REMOTE_NAMESPACE, workload.namespace);
                return;
            }
            Some(ip.to_string())
        } else if is_ip(&value) {
            Some(value)
        } else {
            None
        };

        if let Some(ip) = bare_ip {
            match self.resolver.resolve_by_ip(&ip) {
                Some(workload) => {
                    attributes.put(ATTR_REMOTE_SERVICE, workload.name);
                    attributes.put(ATTR_REMOTE_NAMESPACE, workload.namespace);
                }
                None => {
                    debug!(
                        event.name = "processor.unresolved_remote",
                        net.peer.address = %ip,
                        "no workload found for remote address"
                    );
                    attributes.put(ATTR_REMOTE_SERVICE, UNKNOWN_REMOTE_SERVICE);
                }
            }
        }
    }

    /// Closes the shared resolver. Either pipeline stage may call this on
    /// shutdown; repeated calls are no-ops.
    pub fn stop(&self) {
        self.resolver.stop();
    }
}

fn is_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

/// Splits a strict dotted-quad `IP:port` value, returning the address part.
fn extract_ip_port(value: &str) -> Option<&str> {
    IP_PORT
        .captures(value)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}
