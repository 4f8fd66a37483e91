//! Ordering between Kustomizations through `dependsOn`.

mod common;

use std::time::Duration;

use common::{config_map, ready, Harness};
use convoy_controller::api;
use convoy_controller::reconciler::Phase;
use serde_json::json;

fn with_dependency(h: &Harness) {
    h.write("base/a.yaml", &config_map("base", "default"));
    h.write("app/b.yaml", &config_map("app", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("infra", json!({"path": "./base"}));
    h.kustomization(
        "apps",
        json!({"path": "./app", "dependsOn": [{"name": "infra"}]}),
    );
}

#[tokio::test]
async fn test_waits_for_dependency() {
    let h = Harness::new();
    with_dependency(&h);

    let outcome = h.reconcile("apps").await;
    assert_eq!(outcome.phase, Phase::Pending);
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(1)));

    let status = h.status_of("apps").await;
    assert_eq!(ready(&status), ("Unknown".into(), "DependencyNotReady".into()));
    assert!(status.status.last_applied_revision.is_none());
    assert!(h.get("v1", "ConfigMap", Some("default"), "app").await.is_none());

    assert_eq!(h.reconcile("infra").await.phase, Phase::Applied);
    assert_eq!(h.reconcile("apps").await.phase, Phase::Applied);
    assert!(h.get("v1", "ConfigMap", Some("default"), "app").await.is_some());
    assert_eq!(ready(&h.status_of("apps").await).0, "True");
}

#[tokio::test]
async fn test_missing_dependency_blocks() {
    let h = Harness::new();
    h.write("app/b.yaml", &config_map("app", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization(
        "apps",
        json!({"path": "./app", "dependsOn": [{"name": "nowhere"}]}),
    );

    assert_eq!(h.reconcile("apps").await.phase, Phase::Pending);
    let status = h.status_of("apps").await;
    let message = api::condition::find(&status.status.conditions, "Ready")
        .map(|c| c.message.clone())
        .unwrap_or_default();
    assert!(message.contains("nowhere"), "{message}");
}

#[tokio::test]
async fn test_failing_dependency_blocks() {
    let h = Harness::new();
    with_dependency(&h);
    h.kustomization("infra", json!({"path": "./missing"}));

    assert_eq!(h.reconcile("infra").await.phase, Phase::Failed);
    assert_eq!(h.reconcile("apps").await.phase, Phase::Pending);
    assert!(h.get("v1", "ConfigMap", Some("default"), "app").await.is_none());
}

#[tokio::test]
async fn test_dependency_on_older_revision_blocks() {
    let h = Harness::new();
    with_dependency(&h);
    h.reconcile("infra").await;
    h.reconcile("apps").await;

    // infra has not yet caught up with the new revision.
    h.publish("repo", "main@sha1:2");
    h.write("app/c.yaml", &config_map("extra", "default"));
    let mut infra = h.status_of("infra").await;
    infra.status.last_attempted_revision = Some("main@sha1:2".into());
    h.cluster
        .set_status(
            &api::gvk(),
            Some("default"),
            "infra",
            serde_json::to_value(&infra.status).unwrap(),
        )
        .unwrap();

    assert_eq!(h.reconcile("apps").await.phase, Phase::Pending);
    assert!(h.get("v1", "ConfigMap", Some("default"), "extra").await.is_none());
}
