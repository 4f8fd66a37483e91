//! Dependency gate.

use convoy_manifest::Resource;
use tracing::debug;

use crate::api::{self, Kustomization, ObjectKey};
use crate::cluster::{ClusterClient, ClusterError};

/// Result of checking `dependsOn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    Ready,
    NotReady { dependency: ObjectKey, reason: String },
}

/// Check every dependency of `kustomization`, in declaration order.
///
/// A dependency is ready when it exists, reports Ready, has observed its
/// latest generation and has nothing newer in flight. A dependency that
/// does not exist is not ready rather than an error.
pub async fn check_dependencies(
    client: &dyn ClusterClient,
    kustomization: &Kustomization,
) -> Result<DependencyStatus, ClusterError> {
    let gvk = api::gvk();
    for dep in &kustomization.spec.depends_on {
        let key = ObjectKey::new(
            dep.namespace
                .as_deref()
                .unwrap_or(&kustomization.metadata.namespace),
            &dep.name,
        );

        let Some(resource) = client.get(&gvk, Some(&key.namespace), &key.name).await? else {
            return Ok(DependencyStatus::NotReady {
                dependency: key,
                reason: "not found".to_string(),
            });
        };

        if let Some(reason) = not_ready_reason(&resource) {
            debug!(kustomization = %kustomization.key(), dependency = %key, reason = %reason, "Dependency not ready");
            return Ok(DependencyStatus::NotReady {
                dependency: key,
                reason,
            });
        }
    }
    Ok(DependencyStatus::Ready)
}

fn not_ready_reason(resource: &Resource) -> Option<String> {
    let dependency = match Kustomization::from_resource(resource) {
        Ok(k) => k,
        Err(e) => return Some(format!("unreadable: {e}")),
    };
    if !dependency.is_ready() {
        return Some("not ready".to_string());
    }
    if dependency.status.observed_generation != dependency.metadata.generation {
        return Some("latest generation not yet observed".to_string());
    }
    if dependency.status.last_applied_revision != dependency.status.last_attempted_revision {
        return Some("newer revision in progress".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cluster::InMemoryCluster;

    fn kustomization(name: &str, depends_on: serde_json::Value) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "kustomize.convoy.dev/v1beta1",
            "kind": "Kustomization",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {
                "sourceRef": {"kind": "GitRepository", "name": "repo"},
                "interval": "5m",
                "dependsOn": depends_on
            }
        }))
        .unwrap()
    }

    fn ready_status(revision: &str, attempted: &str) -> serde_json::Value {
        json!({
            "observedGeneration": 1,
            "lastAppliedRevision": revision,
            "lastAttemptedRevision": attempted,
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "reason": "ReconciliationSucceeded",
                "message": "",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]
        })
    }

    async fn check(cluster: &InMemoryCluster) -> DependencyStatus {
        let app = cluster
            .get(&api::gvk(), Some("default"), "app")
            .await
            .unwrap()
            .unwrap();
        let app = Kustomization::from_resource(&app).unwrap();
        check_dependencies(cluster, &app).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_dependency_is_not_ready() {
        let cluster = InMemoryCluster::new();
        cluster.put(kustomization("app", json!([{"name": "infra"}]))).unwrap();

        match check(&cluster).await {
            DependencyStatus::NotReady { dependency, reason } => {
                assert_eq!(dependency, ObjectKey::new("default", "infra"));
                assert_eq!(reason, "not found");
            }
            DependencyStatus::Ready => panic!("expected not ready"),
        }
    }

    #[tokio::test]
    async fn test_dependency_must_be_up_to_date() {
        let cluster = InMemoryCluster::new();
        cluster.put(kustomization("app", json!([{"name": "infra"}]))).unwrap();
        cluster.put(kustomization("infra", json!([]))).unwrap();

        cluster
            .set_status(&api::gvk(), Some("default"), "infra", ready_status("main@1", "main@2"))
            .unwrap();
        assert!(matches!(check(&cluster).await, DependencyStatus::NotReady { .. }));

        cluster
            .set_status(&api::gvk(), Some("default"), "infra", ready_status("main@2", "main@2"))
            .unwrap();
        assert_eq!(check(&cluster).await, DependencyStatus::Ready);
    }

    #[tokio::test]
    async fn test_no_dependencies_is_ready() {
        let cluster = InMemoryCluster::new();
        cluster.put(kustomization("app", json!([]))).unwrap();
        assert_eq!(check(&cluster).await, DependencyStatus::Ready);
    }
}
