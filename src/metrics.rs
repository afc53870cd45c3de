//! Prometheus metrics for the resolver and its watchers.
//!
//! Collectors live in a `lazy_static` registry; `registry::init_registry()`
//! registers them once and the health API server exposes them at
//! `/metrics`. Counters work before registration, so instrumented code
//! never has to check whether metrics are enabled.

pub mod k8s;
pub mod registry;
pub mod resolver;
