//! Health assessment of applied workloads.
//!
//! Readiness is judged per kind from the object's own status:
//! - Deployment, StatefulSet, ReplicaSet: latest generation observed and
//!   every desired replica ready
//! - DaemonSet: every scheduled pod ready
//! - Job: a `Complete` condition
//! - Namespace: phase `Active` (or unset)
//! - Kustomization: a `Ready` condition that is `True`
//! - anything else: a `Ready` condition, if present, must be `True`
//!
//! Objects that do not exist yet are pending, not failed.

use std::sync::Arc;
use std::time::Duration;

use convoy_manifest::{GroupVersionKind, Resource};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::HealthCheckTarget;
use crate::cluster::{ClusterClient, ClusterError};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health check timed out waiting for: {}", pending.join(", "))]
    Timeout { pending: Vec<String> },

    #[error("health check target {0} has no apiVersion and its kind is unknown")]
    UnknownKind(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Default apiVersion for health check targets that omit it.
fn default_api_version(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" => "apps/v1",
        "Job" | "CronJob" => "batch/v1",
        "Namespace" | "Service" | "ConfigMap" | "Secret" | "ServiceAccount" | "Pod"
        | "PersistentVolumeClaim" => "v1",
        "Kustomization" => "kustomize.convoy.dev/v1beta1",
        _ => return None,
    })
}

/// Whether `resource` reports itself ready.
pub fn is_ready(resource: &Resource) -> bool {
    let int = |path: &[&str]| resource.i64_field(path);
    match resource.kind() {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let generation = int(&["metadata", "generation"]).unwrap_or(0);
            let observed = int(&["status", "observedGeneration"]).unwrap_or(-1);
            let desired = int(&["spec", "replicas"]).unwrap_or(1);
            let ready = int(&["status", "readyReplicas"]).unwrap_or(0);
            observed >= generation && ready >= desired
        }
        "DaemonSet" => {
            let desired = int(&["status", "desiredNumberScheduled"]);
            let ready = int(&["status", "numberReady"]).unwrap_or(0);
            desired.is_some_and(|d| ready >= d)
        }
        "Job" => condition_status(resource, "Complete") == Some("True"),
        "Kustomization" => condition_status(resource, "Ready") == Some("True"),
        "Namespace" => matches!(resource.str_field(&["status", "phase"]), None | Some("Active")),
        _ => condition_status(resource, "Ready").map_or(true, |s| s == "True"),
    }
}

fn condition_status<'a>(resource: &'a Resource, type_: &str) -> Option<&'a str> {
    resource
        .get(&["status", "conditions"])?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))?
        .get("status")
        .and_then(Value::as_str)
}

/// Polls health check targets until all are ready or a deadline passes.
pub struct HealthAssessor {
    client: Arc<dyn ClusterClient>,
    poll_interval: Duration,
}

impl HealthAssessor {
    pub fn new(client: Arc<dyn ClusterClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Wait for every target. Targets without a namespace use `default_namespace`.
    pub async fn wait_ready(
        &self,
        targets: &[HealthCheckTarget],
        default_namespace: &str,
        deadline: Instant,
    ) -> Result<(), HealthError> {
        if targets.is_empty() {
            return Ok(());
        }

        let resolved = targets
            .iter()
            .map(|t| {
                let api_version = match &t.api_version {
                    Some(v) => v.as_str(),
                    None => default_api_version(&t.kind)
                        .ok_or_else(|| HealthError::UnknownKind(format!("{}/{}", t.kind, t.name)))?,
                };
                Ok((
                    GroupVersionKind::from_api_version(api_version, &t.kind),
                    t.namespace.clone().unwrap_or_else(|| default_namespace.to_string()),
                    t.name.clone(),
                ))
            })
            .collect::<Result<Vec<_>, HealthError>>()?;

        loop {
            let mut pending = Vec::new();
            for (gvk, namespace, name) in &resolved {
                match self.client.get(gvk, Some(namespace), name).await? {
                    Some(resource) if is_ready(&resource) => {}
                    _ => pending.push(format!("{}/{}/{}", gvk.kind, namespace, name)),
                }
            }

            if pending.is_empty() {
                info!(targets = resolved.len(), "Health checks passed");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthError::Timeout { pending });
            }
            debug!(pending = ?pending, "Waiting for health checks");
            tokio::time::sleep_until(deadline.min(now + self.poll_interval)).await;
        }
    }
}
