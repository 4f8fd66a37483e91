//! Garbage collection by generation token, and finalization.

mod common;

use common::{config_map, resource, Harness};
use convoy_controller::api::{self, CHECKSUM_LABEL, NAME_LABEL};
use convoy_controller::cluster::ClusterClient;
use convoy_controller::reconciler::Phase;
use serde_json::json;

fn two_config_maps(h: &Harness) {
    h.write("deploy/a.yaml", &config_map("a", "default"));
    h.write("deploy/b.yaml", &config_map("b", "default"));
    h.publish("repo", "main@sha1:1");
}

#[tokio::test]
async fn test_removed_resource_is_pruned() {
    let h = Harness::new();
    two_config_maps(&h);
    h.kustomization("app", json!({}));
    assert_eq!(h.reconcile("app").await.phase, Phase::Applied);

    // Unowned, and owned by another Kustomization.
    h.cluster
        .put(resource(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "manual", "namespace": "default"}
        })))
        .unwrap();
    h.cluster
        .put(resource(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": "neighbour",
                "namespace": "default",
                "labels": {"kustomize.convoy.dev/name": "other", "kustomize.convoy.dev/namespace": "default", "kustomize.convoy.dev/checksum": "stale"}
            }
        })))
        .unwrap();

    h.remove("deploy/b.yaml");
    h.publish("repo", "main@sha1:2");
    h.cluster.clear_mutations();
    assert_eq!(h.reconcile("app").await.phase, Phase::Applied);

    let deleted: Vec<_> = h
        .cluster
        .mutations()
        .into_iter()
        .filter(|m| m.verb == "delete")
        .map(|m| m.id.name)
        .collect();
    assert_eq!(deleted, vec!["b"]);

    assert!(h.get("v1", "ConfigMap", Some("default"), "a").await.is_some());
    assert!(h.get("v1", "ConfigMap", Some("default"), "manual").await.is_some());
    assert!(h.get("v1", "ConfigMap", Some("default"), "neighbour").await.is_some());
}

#[tokio::test]
async fn test_removed_kind_is_pruned() {
    let h = Harness::new();
    two_config_maps(&h);
    h.write(
        "deploy/sa.yaml",
        "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: runner\n  namespace: default\n",
    );
    h.kustomization("app", json!({}));
    h.reconcile("app").await;

    // The new set has no ServiceAccount at all; the previous inventory still
    // scopes the listing.
    h.remove("deploy/sa.yaml");
    h.publish("repo", "main@sha1:2");
    h.reconcile("app").await;

    assert!(h.get("v1", "ServiceAccount", Some("default"), "runner").await.is_none());
}

#[tokio::test]
async fn test_prune_opt_out_annotation_is_honoured() {
    let h = Harness::new();
    h.write("deploy/a.yaml", &config_map("a", "default"));
    h.write(
        "deploy/keep.yaml",
        "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: keep
  namespace: default
  annotations:
    kustomize.convoy.dev/prune: disabled
",
    );
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({}));
    h.reconcile("app").await;

    h.remove("deploy/keep.yaml");
    h.publish("repo", "main@sha1:2");
    h.reconcile("app").await;

    assert!(h.get("v1", "ConfigMap", Some("default"), "keep").await.is_some());
}

#[tokio::test]
async fn test_prune_disabled_keeps_everything() {
    let h = Harness::new();
    two_config_maps(&h);
    h.kustomization("app", json!({"prune": false}));
    h.reconcile("app").await;

    let a = h.get("v1", "ConfigMap", Some("default"), "a").await.unwrap();
    assert_eq!(a.label(CHECKSUM_LABEL), None);
    assert_eq!(a.label(NAME_LABEL), Some("app"));

    h.remove("deploy/b.yaml");
    h.publish("repo", "main@sha1:2");
    h.reconcile("app").await;
    assert!(h.get("v1", "ConfigMap", Some("default"), "b").await.is_some());
}

#[tokio::test]
async fn test_deleting_kustomization_garbage_collects() {
    let h = Harness::new();
    two_config_maps(&h);
    h.kustomization("app", json!({}));
    h.reconcile("app").await;

    h.cluster
        .delete(&api::gvk(), Some("default"), "app")
        .await
        .unwrap();
    assert!(h.status_of("app").await.metadata.deletion_timestamp.is_some());

    let outcome = h.reconcile("app").await;
    assert_eq!(outcome.phase, Phase::Finalized);
    assert!(h.get("v1", "ConfigMap", Some("default"), "a").await.is_none());
    assert!(h.get("v1", "ConfigMap", Some("default"), "b").await.is_none());
    assert!(h
        .cluster
        .get(&api::gvk(), Some("default"), "app")
        .await
        .unwrap()
        .is_none());

    assert_eq!(h.reconcile("app").await.phase, Phase::Gone);
}

#[tokio::test]
async fn test_deleting_without_prune_orphans_resources() {
    let h = Harness::new();
    two_config_maps(&h);
    h.kustomization("app", json!({"prune": false}));
    h.reconcile("app").await;

    h.cluster
        .delete(&api::gvk(), Some("default"), "app")
        .await
        .unwrap();
    assert_eq!(h.reconcile("app").await.phase, Phase::Finalized);
    assert!(h.get("v1", "ConfigMap", Some("default"), "a").await.is_some());
}
