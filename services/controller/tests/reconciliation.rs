//! End-to-end reconciliation against the in-memory cluster.

mod common;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{condition, config_map, ready, Harness, NAMESPACE};
use convoy_controller::api::CHECKSUM_LABEL;
use convoy_controller::build::{BuildEngine, BuildError, Composer};
use convoy_controller::reconciler::Phase;
use convoy_controller::source::{ArtifactFetcher, FetchError, LocalFetcher, SourceSnapshot};
use convoy_manifest::Resource;
use convoy_reconcile::RetryTracker;
use serde_json::json;

const NAMESPACE_YAML: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: test\n";

const SERVICE_ACCOUNT_YAML: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: test
  namespace: test
  labels:
    environment: ${env:=dev}
    region: \"${region}\"
";

fn namespace_sa(h: &Harness) {
    h.write("deploy/namespace.yaml", NAMESPACE_YAML);
    h.write("deploy/service-account.yaml", SERVICE_ACCOUNT_YAML);
    h.publish("repo", "main@sha1:1111");
    h.kustomization(
        "ns-sa",
        json!({"postBuild": {"substitute": {"region": "eu-central-1"}}}),
    );
}

#[tokio::test]
async fn test_namespace_and_service_account_are_applied() {
    let h = Harness::new();
    namespace_sa(&h);

    let outcome = h.reconcile("ns-sa").await;
    assert_eq!(outcome.phase, Phase::Applied);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(300)));

    let sa = h
        .get("v1", "ServiceAccount", Some("test"), "test")
        .await
        .expect("service account applied");
    assert_eq!(sa.label("environment"), Some("dev"));
    assert_eq!(sa.label("region"), Some("eu-central-1"));
    assert_eq!(sa.label("kustomize.convoy.dev/name"), Some("ns-sa"));
    assert_eq!(sa.label("kustomize.convoy.dev/namespace"), Some(NAMESPACE));

    let ks = h.status_of("ns-sa").await;
    assert_eq!(ready(&ks), ("True".to_string(), "ReconciliationSucceeded".to_string()));
    assert_eq!(ks.status.last_applied_revision.as_deref(), Some("main@sha1:1111"));
    assert_eq!(ks.status.last_attempted_revision.as_deref(), Some("main@sha1:1111"));
    assert_eq!(ks.status.observed_generation, ks.metadata.generation);
    assert!(ks.metadata.finalizers.iter().any(|f| f == "finalizers.convoy.dev"));

    let inventory = ks.status.inventory.expect("inventory recorded");
    assert_eq!(sa.label(CHECKSUM_LABEL), Some(inventory.token.as_str()));
}

#[tokio::test]
async fn test_unchanged_revision_is_skipped() {
    let h = Harness::new();
    namespace_sa(&h);
    h.reconcile("ns-sa").await;
    h.cluster.clear_mutations();

    let outcome = h.reconcile("ns-sa").await;
    assert_eq!(outcome.phase, Phase::Applied);
    assert!(h.cluster.mutations().is_empty());
}

#[tokio::test]
async fn test_forced_reconcile_is_idempotent() {
    let h = Harness::new();
    namespace_sa(&h);
    h.reconcile("ns-sa").await;
    let token = h.status_of("ns-sa").await.status.inventory.unwrap().token;

    h.request_reconcile("ns-sa", "2024-05-01T10:00:00Z").await;
    h.cluster.clear_mutations();

    let outcome = h.reconcile("ns-sa").await;
    assert_eq!(outcome.phase, Phase::Applied);
    let changes: Vec<_> = h
        .cluster
        .mutations()
        .into_iter()
        .filter(|m| m.is_resource_change())
        .collect();
    assert!(changes.is_empty(), "unexpected writes: {changes:?}");

    let ks = h.status_of("ns-sa").await;
    assert_eq!(ks.status.inventory.unwrap().token, token);
    assert_eq!(
        ks.status.last_handled_reconcile_at.as_deref(),
        Some("2024-05-01T10:00:00Z")
    );
}

#[tokio::test]
async fn test_new_revision_is_applied() {
    let h = Harness::new();
    namespace_sa(&h);
    h.reconcile("ns-sa").await;

    h.write("deploy/config.yaml", &config_map("settings", "test"));
    h.publish("repo", "main@sha1:2222");
    h.reconcile("ns-sa").await;

    assert!(h.get("v1", "ConfigMap", Some("test"), "settings").await.is_some());
    let ks = h.status_of("ns-sa").await;
    assert_eq!(ks.status.last_applied_revision.as_deref(), Some("main@sha1:2222"));
}

#[tokio::test]
async fn test_schema_and_namespace_are_applied_before_instances() {
    let h = Harness::new();
    h.write(
        "deploy/a-widget.yaml",
        "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n  namespace: shop\n",
    );
    h.write(
        "deploy/b-crd.yaml",
        "\
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  scope: Namespaced
  names:
    kind: Widget
    plural: widgets
",
    );
    h.write("deploy/c-namespace.yaml", "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n");
    h.publish("repo", "main@sha1:1");
    h.kustomization("widgets", json!({"validation": "server"}));

    let outcome = h.reconcile("widgets").await;
    assert_eq!(outcome.phase, Phase::Applied);

    let created: Vec<_> = h
        .cluster
        .mutations()
        .into_iter()
        .filter(|m| m.verb == "create")
        .map(|m| m.id.kind)
        .collect();
    assert_eq!(created, vec!["Namespace", "CustomResourceDefinition", "Widget"]);
}

#[tokio::test]
async fn test_suspended_object_is_untouched() {
    let h = Harness::new();
    namespace_sa(&h);
    h.kustomization("ns-sa", json!({"suspend": true}));
    h.cluster.clear_mutations();

    let outcome = h.reconcile("ns-sa").await;
    assert_eq!(outcome.phase, Phase::Suspended);
    assert_eq!(outcome.requeue_after, None);
    assert!(h.cluster.mutations().is_empty());

    let ks = h.status_of("ns-sa").await;
    assert!(ks.status.conditions.is_empty());
    assert!(ks.metadata.finalizers.is_empty());
}

#[tokio::test]
async fn test_validation_failure_applies_nothing() {
    let h = Harness::new();
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.write("deploy/orphan.yaml", &config_map("orphan", "missing"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({"validation": "server"}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Failed);
    assert!(outcome.requeue_after.is_some());
    assert!(h.get("v1", "ConfigMap", Some("default"), "good").await.is_none());
    assert!(!h.cluster.mutations().iter().any(|m| m.verb == "create"));

    let ks = h.status_of("app").await;
    assert_eq!(ready(&ks), ("False".to_string(), "ValidationFailed".to_string()));
    assert_eq!(ks.status.last_attempted_revision.as_deref(), Some("main@sha1:1"));
    assert_eq!(ks.status.last_applied_revision, None);
}

#[tokio::test]
async fn test_build_failure_is_reported() {
    let h = Harness::new();
    h.write(
        "deploy/kustomization.yaml",
        "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n  - https://example.com/remote.yaml\n",
    );
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Failed);

    let ks = h.status_of("app").await;
    let (status, reason) = ready(&ks);
    assert_eq!((status.as_str(), reason.as_str()), ("False", "BuildFailed"));
    let message = &convoy_controller::api::condition::find(&ks.status.conditions, "Ready")
        .unwrap()
        .message;
    assert!(message.contains("remote resource"), "message: {message}");
}

#[tokio::test]
async fn test_missing_path_is_a_build_failure() {
    let h = Harness::new();
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({"path": "./nowhere"}));

    h.reconcile("app").await;
    let ks = h.status_of("app").await;
    assert_eq!(ready(&ks).1, "BuildFailed");
}

#[tokio::test]
async fn test_source_not_ready_requeues_without_failure() {
    let h = Harness::new();
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish_with("repo", "main@sha1:1", &h.source_path().to_string_lossy(), false);
    h.kustomization("app", json!({"retryInterval": "15s"}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Pending);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(15)));
    assert!(h.status_of("app").await.status.conditions.is_empty());
}

#[tokio::test]
async fn test_missing_source_is_an_artifact_failure() {
    let h = Harness::new();
    h.kustomization("app", json!({"sourceRef": {"kind": "GitRepository", "name": "absent"}}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(ready(&h.status_of("app").await).1, "ArtifactFailed");
}

#[tokio::test]
async fn test_transient_apply_errors_are_retried() {
    let h = Harness::new();
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({}));
    h.cluster.fail_next_applies(2);

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Applied);
    assert!(h.get("v1", "ConfigMap", Some("default"), "good").await.is_some());
}

#[tokio::test]
async fn test_impersonated_identity_is_used_for_apply() {
    let h = Harness::new();
    namespace_sa(&h);
    h.kustomization("ns-sa", json!({"serviceAccountName": "deployer"}));
    let user = "system:serviceaccount:default:deployer";
    h.cluster.deny(user, "ServiceAccount");

    let outcome = h.reconcile("ns-sa").await;
    assert_eq!(outcome.phase, Phase::Failed);

    let ks = h.status_of("ns-sa").await;
    assert_eq!(ready(&ks).1, "ApplyFailed");

    let namespace_writer = h
        .cluster
        .mutations()
        .into_iter()
        .find(|m| m.verb == "create" && m.id.kind == "Namespace")
        .map(|m| m.user);
    assert_eq!(namespace_writer.as_deref(), Some(user));
}

#[tokio::test]
async fn test_health_check_timeout_is_reported() {
    let h = Harness::new();
    h.write("deploy/namespace.yaml", NAMESPACE_YAML);
    h.write(
        "deploy/deployment.yaml",
        "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: test
spec:
  replicas: 1
",
    );
    h.publish("repo", "main@sha1:1");
    h.kustomization(
        "app",
        json!({
            "timeout": "1s",
            "healthChecks": [{"kind": "Deployment", "name": "web", "namespace": "test"}]
        }),
    );

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Failed);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(300)));

    let ks = h.status_of("app").await;
    assert_eq!(ready(&ks).1, "HealthCheckFailed");
    assert_eq!(
        condition(&ks, "Healthy"),
        Some(("False".to_string(), "HealthCheckFailed".to_string()))
    );
    assert_eq!(ks.status.last_applied_revision.as_deref(), Some("main@sha1:1"));

    // Once the workload is ready the next attempt succeeds without rewriting it.
    let deployment = convoy_manifest::GroupVersionKind::from_api_version("apps/v1", "Deployment");
    h.cluster
        .set_status(&deployment, Some("test"), "web", json!({"observedGeneration": 1, "readyReplicas": 1}))
        .unwrap();
    h.cluster.clear_mutations();

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Applied);
    assert!(!h.cluster.mutations().iter().any(|m| m.is_resource_change()));
    let ks = h.status_of("app").await;
    assert_eq!(condition(&ks, "Healthy").unwrap().0, "True");
}

#[tokio::test]
async fn test_unhealthy_revision_is_not_reapplied() {
    let h = Harness::new();
    h.write("deploy/namespace.yaml", NAMESPACE_YAML);
    h.write(
        "deploy/deployment.yaml",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: test\nspec:\n  replicas: 2\n",
    );
    h.publish("repo", "main@sha1:1");
    h.kustomization(
        "app",
        json!({
            "timeout": "1s",
            "healthChecks": [{"kind": "Deployment", "name": "web", "namespace": "test"}]
        }),
    );
    assert_eq!(h.reconcile("app").await.phase, Phase::Failed);

    // A rebuild would now render an empty set and prune the deployment.
    h.remove("deploy/deployment.yaml");
    h.cluster.clear_mutations();

    for _ in 0..2 {
        let outcome = h.reconcile("app").await;
        assert_eq!(outcome.phase, Phase::Failed);
        assert_eq!(outcome.requeue_after, Some(Duration::from_secs(300)));
        assert_eq!(ready(&h.status_of("app").await).1, "HealthCheckFailed");
    }
    assert!(!h.cluster.mutations().iter().any(|m| m.is_resource_change()));
    assert!(h.get("apps/v1", "Deployment", Some("test"), "web").await.is_some());
}

#[tokio::test]
async fn test_substitute_from_config_map() {
    let h = Harness::new();
    h.write(
        "deploy/config.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\n  namespace: default\ndata:\n  cluster: ${cluster_name}\n  region: ${region}\n",
    );
    h.cluster
        .put(common::resource(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cluster-vars", "namespace": "default"},
            "data": {"cluster_name": "prod-1", "region": "us-east-1"}
        })))
        .unwrap();
    h.publish("repo", "main@sha1:1");
    h.kustomization(
        "app",
        json!({"postBuild": {
            "substitute": {"region": "eu-central-1"},
            "substituteFrom": [
                {"kind": "ConfigMap", "name": "cluster-vars"},
                {"kind": "Secret", "name": "absent", "optional": true}
            ]
        }}),
    );

    assert_eq!(h.reconcile("app").await.phase, Phase::Applied);
    let cm = h.get("v1", "ConfigMap", Some("default"), "app").await.unwrap();
    assert_eq!(cm.str_field(&["data", "cluster"]), Some("prod-1"));
    assert_eq!(cm.str_field(&["data", "region"]), Some("eu-central-1"));
}

/// Never finishes in time.
struct SlowFetcher;

#[async_trait]
impl ArtifactFetcher for SlowFetcher {
    async fn fetch(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), FetchError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        LocalFetcher.fetch(snapshot, dest).await
    }
}

#[tokio::test]
async fn test_attempt_timeout_stalls() {
    let h = Harness::with(Arc::new(SlowFetcher), RetryTracker::new(5, Duration::from_secs(600)));
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({"timeout": "50ms"}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Stalled);

    let ks = h.status_of("app").await;
    assert_eq!(ready(&ks).1, "ReconciliationTimeout");
    assert_eq!(
        condition(&ks, "Stalled"),
        Some(("True".to_string(), "ReconciliationTimeout".to_string()))
    );
}

/// Builds with the composer after a delay, recording whether the overlay
/// directory still existed once the delay was over.
struct SlowEngine {
    seen: Arc<Mutex<Vec<bool>>>,
}

impl BuildEngine for SlowEngine {
    fn name(&self) -> &str {
        "slow"
    }

    fn build(&self, dir: &Path) -> Result<Vec<Resource>, BuildError> {
        std::thread::sleep(Duration::from_millis(200));
        self.seen.lock().unwrap().push(dir.exists());
        Composer.build(dir)
    }
}

#[tokio::test]
async fn test_staging_outlives_timed_out_render() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = SlowEngine { seen: Arc::clone(&seen) };
    let h = Harness::with_engine(
        Arc::new(LocalFetcher),
        Arc::new(engine),
        RetryTracker::new(5, Duration::from_secs(600)),
    );
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({"timeout": "50ms"}));

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Stalled);

    // Let the abandoned render run to completion.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let seen = seen.lock().unwrap().clone();
    assert!(!seen.is_empty(), "render never ran");
    assert!(seen.iter().all(|exists| *exists), "staging removed under the render: {seen:?}");
    assert!(h.get("v1", "ConfigMap", Some("default"), "good").await.is_none());
}

#[tokio::test]
async fn test_exhausted_retries_stall_until_success() {
    let h = Harness::with(Arc::new(LocalFetcher), RetryTracker::new(1, Duration::from_secs(600)));
    h.write("deploy/good.yaml", &config_map("good", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({"path": "./nowhere", "retryInterval": "10s"}));

    let first = h.reconcile("app").await;
    assert_eq!(first.phase, Phase::Failed);
    assert!(first.requeue_after.unwrap() <= Duration::from_secs(11));

    let second = h.reconcile("app").await;
    assert_eq!(second.phase, Phase::Stalled);
    assert_eq!(second.requeue_after, Some(Duration::from_secs(300)));
    let ks = h.status_of("app").await;
    assert_eq!(condition(&ks, "Stalled").unwrap().1, "RetriesExhausted");

    h.kustomization("app", json!({"path": "./deploy"}));
    assert_eq!(h.reconcile("app").await.phase, Phase::Applied);
    let ks = h.status_of("app").await;
    assert_eq!(condition(&ks, "Stalled"), None);
}
