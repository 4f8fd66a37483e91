//! Apply-order policy for build output.
//!
//! Resources are sorted by kind rank, then by group/version/kind string,
//! namespace and name. The rank puts namespaces, access control and schema
//! definitions first and admission webhooks last, which approximates a
//! dependency-safe apply sequence without building an object graph.

use std::cmp::Ordering;

use crate::Resource;

/// Kinds applied first, in this order.
pub const ORDER_FIRST: &[&str] = &[
    "Namespace",
    "ResourceQuota",
    "StorageClass",
    "CustomResourceDefinition",
    "ServiceAccount",
    "PodSecurityPolicy",
    "Role",
    "ClusterRole",
    "RoleBinding",
    "ClusterRoleBinding",
    "ConfigMap",
    "Secret",
    "Endpoints",
    "Service",
    "LimitRange",
    "PriorityClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "Deployment",
    "StatefulSet",
    "CronJob",
    "PodDisruptionBudget",
];

/// Kinds applied last, in this order.
pub const ORDER_LAST: &[&str] = &[
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Rank of a kind: negative for the first list, positive for the last
/// list, zero for everything else.
pub fn kind_rank(kind: &str) -> i32 {
    if let Some(index) = ORDER_FIRST.iter().position(|k| *k == kind) {
        return index as i32 - ORDER_FIRST.len() as i32;
    }
    if let Some(index) = ORDER_LAST.iter().position(|k| *k == kind) {
        return index as i32 + 1;
    }
    0
}

fn compare(a: &Resource, b: &Resource) -> Ordering {
    kind_rank(a.kind())
        .cmp(&kind_rank(b.kind()))
        .then_with(|| a.gvk().to_string().cmp(&b.gvk().to_string()))
        .then_with(|| a.namespace().unwrap_or("").cmp(b.namespace().unwrap_or("")))
        .then_with(|| a.name().cmp(b.name()))
}

/// Sort resources into apply order. The sort is stable.
pub fn sort_legacy(resources: &mut [Resource]) {
    resources.sort_by(compare);
}
