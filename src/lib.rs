//! taxon resolves raw network identifiers observed on outgoing telemetry
//! (pod IPs, `HostIP:Port` pairs, ClusterIPs) into logical Kubernetes
//! workload identities, so downstream consumers can aggregate calls by
//! `cart-service@shop` rather than by ephemeral addresses.
//!
//! The core is [`k8s::resolver::IpResolver`], a continuously-refreshed set
//! of in-memory indexes fed by pod and service watch streams, consulted
//! synchronously by [`processor::RemoteAttributesProcessor`] for every
//! telemetry data point.

pub mod conf;
pub mod error;
pub mod health;
pub mod k8s;
pub mod metrics;
pub mod processor;
pub mod shutdown;
pub mod signal;

pub use error::{Result, TaxonError};
