//! Shared fixtures for controller integration tests.
//!
//! A [`Harness`] owns an in-memory cluster, a local source directory
//! published through a GitRepository object, and a reconciler context wired
//! with the builtin composer and the local fetcher.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use convoy_controller::api::{self, Kustomization, ObjectKey};
use convoy_controller::build::{BuildEngine, Composer};
use convoy_controller::cluster::{ClusterClient, InMemoryCluster};
use convoy_controller::reconciler::{reconcile, Context, Outcome, ReconcilerConfig};
use convoy_controller::source::{ArtifactFetcher, LocalFetcher};
use convoy_manifest::{GroupVersionKind, Resource};
use convoy_reconcile::{BackoffPolicy, RetryTracker};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const NAMESPACE: &str = "default";

pub struct Harness {
    pub cluster: InMemoryCluster,
    pub ctx: Arc<Context>,
    pub source: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(LocalFetcher), RetryTracker::new(5, Duration::from_secs(600)))
    }

    pub fn with(fetcher: Arc<dyn ArtifactFetcher>, retries: RetryTracker) -> Self {
        Self::with_engine(fetcher, Arc::new(Composer), retries)
    }

    pub fn with_engine(
        fetcher: Arc<dyn ArtifactFetcher>,
        engine: Arc<dyn BuildEngine>,
        retries: RetryTracker,
    ) -> Self {
        let cluster = InMemoryCluster::new();
        let config = ReconcilerConfig {
            dependency_requeue: Duration::from_secs(1),
            health_poll_interval: Duration::from_millis(10),
            apply_backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                jitter: 0.0,
            },
            ..ReconcilerConfig::default()
        };
        let ctx = Arc::new(Context::new(
            Arc::new(cluster.clone()),
            fetcher,
            engine,
            config,
            retries,
        ));
        Self {
            cluster,
            ctx,
            source: tempfile::tempdir().expect("source dir"),
        }
    }

    /// Write a file into the source tree.
    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.source.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.source.path().join(relative)).unwrap();
    }

    /// Publish the source tree as `revision` of GitRepository `name`.
    pub fn publish(&self, name: &str, revision: &str) {
        self.publish_with(name, revision, &self.source.path().to_string_lossy(), true);
    }

    pub fn publish_with(&self, name: &str, revision: &str, path: &str, ready: bool) {
        let status = if ready { "True" } else { "False" };
        self.cluster
            .put(resource(json!({
                "apiVersion": "source.convoy.dev/v1beta1",
                "kind": "GitRepository",
                "metadata": {"name": name, "namespace": NAMESPACE},
                "spec": {"url": "https://example.com/repo.git", "interval": "1m"},
                "status": {
                    "artifact": {"url": format!("file://{path}"), "revision": revision},
                    "conditions": [{
                        "type": "Ready",
                        "status": status,
                        "reason": "Succeeded",
                        "message": "",
                        "lastTransitionTime": "2024-01-01T00:00:00Z"
                    }]
                }
            })))
            .unwrap();
    }

    /// Create or replace a Kustomization with `spec` merged over defaults.
    pub fn kustomization(&self, name: &str, spec: Value) {
        let mut full = json!({
            "sourceRef": {"kind": "GitRepository", "name": "repo"},
            "path": "./deploy",
            "interval": "5m",
            "prune": true
        });
        convoy_manifest::merge_patch(&mut full, &spec);
        self.put_kustomization(json!({
            "apiVersion": "kustomize.convoy.dev/v1beta1",
            "kind": "Kustomization",
            "metadata": {"name": name, "namespace": NAMESPACE},
            "spec": full
        }));
    }

    pub fn put_kustomization(&self, value: Value) {
        self.cluster.put(resource(value)).unwrap();
    }

    /// Ask for a reconciliation regardless of revision, as `kubectl annotate` would.
    pub async fn request_reconcile(&self, name: &str, token: &str) {
        let mut current = self
            .cluster
            .get(&api::gvk(), Some(NAMESPACE), name)
            .await
            .unwrap()
            .unwrap();
        current
            .get_or_insert_object(&["metadata", "annotations"])
            .insert(api::REQUESTED_AT_ANNOTATION.into(), json!(token));
        self.cluster.put(current).unwrap();
    }

    pub async fn reconcile(&self, name: &str) -> Outcome {
        reconcile(&self.ctx, &ObjectKey::new(NAMESPACE, name))
            .await
            .expect("reconcile")
    }

    pub async fn status_of(&self, name: &str) -> Kustomization {
        let object = self
            .cluster
            .get(&api::gvk(), Some(NAMESPACE), name)
            .await
            .unwrap()
            .expect("kustomization exists");
        Kustomization::from_resource(&object).unwrap()
    }

    pub async fn get(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Option<Resource> {
        self.cluster
            .get(&GroupVersionKind::from_api_version(api_version, kind), namespace, name)
            .await
            .unwrap()
    }

    pub fn source_path(&self) -> &Path {
        self.source.path()
    }
}

pub fn resource(value: Value) -> Resource {
    Resource::from_value(value).unwrap()
}

/// `Ready` condition as (status, reason).
pub fn ready(kustomization: &Kustomization) -> (String, String) {
    condition(kustomization, "Ready").expect("Ready condition")
}

pub fn condition(kustomization: &Kustomization, type_: &str) -> Option<(String, String)> {
    api::condition::find(&kustomization.status.conditions, type_).map(|c| {
        let status = serde_json::to_value(&c.status).unwrap();
        (status.as_str().unwrap_or_default().to_string(), c.reason.clone())
    })
}

pub fn config_map(name: &str, namespace: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: {namespace}\ndata:\n  key: value\n")
}
