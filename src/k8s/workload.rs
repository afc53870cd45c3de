// workload.rs - Workload identity derivation from pod metadata
//
// Converts a pod's owner references and name into the identity of the
// controller one level above it (Deployment, StatefulSet, DaemonSet, or a
// bare ReplicaSet). Deployment-managed ReplicaSets are recognized by the
// generated name suffix rather than by a second API lookup.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

/// Characters Kubernetes uses for generated name suffixes. Vowels are
/// excluded upstream to avoid forming words.
/// https://github.com/kubernetes/apimachinery/blob/master/pkg/util/rand/rand.go#L83
const KUBE_SUFFIX_ALPHABET: &str = "bcdfghjklmnpqrstvwxz2456789";

lazy_static! {
    // ReplicaSet name = Deployment name + "-" + 10 generated characters.
    static ref DEPLOYMENT_FROM_REPLICASET: Regex =
        Regex::new(&format!("^(.+)-[{KUBE_SUFFIX_ALPHABET}]{{10}}$"))
            .expect("deployment name pattern must compile");
    // Pod name = ReplicaSet name + "-" + 5 generated characters, for
    // ReplicaSets created directly with a user-chosen name.
    static ref REPLICASET_FROM_POD: Regex =
        Regex::new(&format!("^(.+)-[{KUBE_SUFFIX_ALPHABET}]{{5}}$"))
            .expect("replicaset name pattern must compile");
}

/// A workload or service identity scoped to its namespace.
///
/// Rendered as `name@namespace` in logs; `@` cannot appear in Kubernetes
/// resource names, so the textual form is unambiguous.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub name: String,
    pub namespace: String,
}

impl NamespacedName {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.namespace)
    }
}

/// An unordered set of `key=value` label strings, used both for pod labels
/// and for service selectors so that selector matching is set containment.
pub type LabelSet = HashSet<String>;

/// Flattens a Kubernetes label mapping into a [`LabelSet`].
pub fn label_set(labels: &BTreeMap<String, String>) -> LabelSet {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Extracts the Deployment name from a generated ReplicaSet name.
fn workload_from_replicaset_name(name: &str) -> Option<&str> {
    DEPLOYMENT_FROM_REPLICASET
        .captures(name)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Extracts the ReplicaSet name from a pod launched directly by a
/// user-named ReplicaSet.
fn workload_from_pod_name(name: &str) -> Option<&str> {
    REPLICASET_FROM_POD
        .captures(name)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Derives the workload identity for a pod from its owner references.
///
/// Only one level of ownership is inspected: a Deployment is reached through
/// its ReplicaSet's name pattern, never through a second lookup. Owners of
/// other kinds are skipped, and the first owner that yields a name wins.
pub fn derive_workload(pod: &Pod) -> Option<NamespacedName> {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();

    for owner in pod.owner_references() {
        let name = match owner.kind.as_str() {
            "ReplicaSet" => workload_from_replicaset_name(&owner.name)
                .or_else(|| workload_from_pod_name(&pod_name)),
            "StatefulSet" | "DaemonSet" => Some(owner.name.as_str()),
            _ => None,
        };

        if let Some(name) = name {
            return Some(NamespacedName::new(name, namespace));
        }
    }

    debug!(
        event.name = "k8s.workload.underived",
        k8s.pod.name = %pod_name,
        "no owner reference matched a known workload pattern"
    );
    None
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    use super::*;

    fn pod_with_owners(name: &str, namespace: &str, owners: Vec<OwnerReference>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(owners),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn deployment_suffix_is_stripped() {
        assert_eq!(
            workload_from_replicaset_name("cart-6d9f7c4b8z"),
            Some("cart")
        );
        assert_eq!(
            workload_from_replicaset_name("pet-clinic-frontend-7d9f7c4b8z"),
            Some("pet-clinic-frontend")
        );
    }

    #[test]
    fn names_outside_the_generated_alphabet_do_not_match() {
        // Vowels never appear in generated suffixes.
        assert_eq!(workload_from_replicaset_name("cart-6d9f7c4b8a"), None);
        assert_eq!(workload_from_replicaset_name("cart-6d9f7c4b8e"), None);
        // Wrong suffix length.
        assert_eq!(workload_from_replicaset_name("cart-6d9f7c4"), None);
        assert_eq!(workload_from_replicaset_name("cart"), None);
        // Missing separator.
        assert_eq!(workload_from_replicaset_name("bcdfghjklm"), None);
    }

    #[test]
    fn pod_suffix_is_stripped() {
        assert_eq!(workload_from_pod_name("cart-rs-k9t2x"), Some("cart-rs"));
        // Vowels and excluded digits never appear in generated suffixes.
        assert_eq!(workload_from_pod_name("cart-rs-k9t2e"), None);
        assert_eq!(workload_from_pod_name("cart-rs-k9t13"), None);
        assert_eq!(workload_from_pod_name("cart-rs"), None);
    }

    #[test]
    fn deployment_pod_resolves_to_deployment_name() {
        let pod = pod_with_owners(
            "cart-6d9f7c4b8z-ab3k9",
            "shop",
            vec![owner("ReplicaSet", "cart-6d9f7c4b8z")],
        );
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("cart", "shop"))
        );
    }

    #[test]
    fn bare_replicaset_pod_falls_back_to_pod_name_pattern() {
        // User-named ReplicaSet: the owner name has no generated suffix, but
        // the pod name carries the 5-character one.
        let pod = pod_with_owners("cart-rs-k9t2x", "shop", vec![owner("ReplicaSet", "cart-rs")]);
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("cart-rs", "shop"))
        );
    }

    #[test]
    fn statefulset_and_daemonset_use_owner_name_directly() {
        let pod = pod_with_owners("db-0", "prod", vec![owner("StatefulSet", "db")]);
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("db", "prod"))
        );

        let pod = pod_with_owners("agent-b2kz9", "kube-system", vec![owner("DaemonSet", "agent")]);
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("agent", "kube-system"))
        );
    }

    #[test]
    fn unknown_owner_kinds_are_skipped() {
        let pod = pod_with_owners(
            "db-0",
            "prod",
            vec![owner("Node", "worker-1"), owner("StatefulSet", "db")],
        );
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("db", "prod"))
        );
    }

    #[test]
    fn first_matching_owner_wins() {
        let pod = pod_with_owners(
            "cart-6d9f7c4b8z-ab3k9",
            "shop",
            vec![
                owner("ReplicaSet", "cart-6d9f7c4b8z"),
                owner("StatefulSet", "other"),
            ],
        );
        assert_eq!(
            derive_workload(&pod),
            Some(NamespacedName::new("cart", "shop"))
        );
    }

    #[test]
    fn pod_without_owners_has_no_workload() {
        let pod = pod_with_owners("standalone", "default", Vec::new());
        assert_eq!(derive_workload(&pod), None);
    }

    #[test]
    fn unparseable_replicaset_without_pod_suffix_yields_nothing() {
        let pod = pod_with_owners("cart-rs-extra", "shop", vec![owner("ReplicaSet", "cart-rs")]);
        assert_eq!(derive_workload(&pod), None);
    }

    #[test]
    fn label_set_flattens_to_key_value_pairs() {
        let labels: BTreeMap<String, String> = [
            ("app".to_string(), "cart".to_string()),
            ("tier".to_string(), "web".to_string()),
        ]
        .into();

        let set = label_set(&labels);
        assert_eq!(set.len(), 2);
        assert!(set.contains("app=cart"));
        assert!(set.contains("tier=web"));
    }

    #[test]
    fn namespaced_name_renders_with_separator() {
        let name = NamespacedName::new("cart", "shop");
        assert_eq!(name.to_string(), "cart@shop");
    }
}
