//! The controller runtime end to end: workers, requeues and resync.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config_map, Harness};
use convoy_controller::api::ObjectKey;
use convoy_controller::controller::{Controller, ControllerConfig};
use serde_json::json;
use tokio::sync::watch;

async fn wait_until_ready(h: &Harness, names: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut all_ready = true;
        for name in names {
            all_ready &= h.status_of(name).await.is_ready();
        }
        if all_ready {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "kustomizations never became ready"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_controller_reconciles_everything() {
    let h = Harness::new();
    h.write("base/a.yaml", &config_map("base", "default"));
    h.write("app/b.yaml", &config_map("app", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("infra", json!({"path": "./base"}));
    h.kustomization(
        "apps",
        json!({"path": "./app", "dependsOn": [{"name": "infra"}]}),
    );

    let controller = Arc::new(Controller::new(
        Arc::clone(&h.ctx),
        ControllerConfig {
            workers: 2,
            resync_interval: Duration::from_millis(100),
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    wait_until_ready(&h, &["infra", "apps"]).await;
    assert!(h.get("v1", "ConfigMap", Some("default"), "app").await.is_some());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller stops")
        .unwrap();
}

#[tokio::test]
async fn test_new_revision_picked_up_by_resync() {
    let h = Harness::new();
    h.write("deploy/a.yaml", &config_map("a", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({}));

    let controller = Arc::new(Controller::new(
        Arc::clone(&h.ctx),
        ControllerConfig {
            workers: 1,
            resync_interval: Duration::from_millis(50),
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });
    wait_until_ready(&h, &["app"]).await;

    h.write("deploy/b.yaml", &config_map("b", "default"));
    h.publish("repo", "main@sha1:2");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.status_of("app").await.status.last_applied_revision.as_deref() != Some("main@sha1:2") {
        assert!(tokio::time::Instant::now() < deadline, "revision never applied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.get("v1", "ConfigMap", Some("default"), "b").await.is_some());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_queue_triggers_reconcile() {
    let h = Harness::new();
    h.write("deploy/a.yaml", &config_map("a", "default"));
    h.publish("repo", "main@sha1:1");
    h.kustomization("app", json!({}));

    // Resync far in the future; only the first tick and explicit adds run.
    let controller = Arc::new(Controller::new(
        Arc::clone(&h.ctx),
        ControllerConfig {
            workers: 1,
            resync_interval: Duration::from_secs(3600),
        },
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });
    wait_until_ready(&h, &["app"]).await;

    h.write("deploy/b.yaml", &config_map("b", "default"));
    h.publish("repo", "main@sha1:2");
    h.request_reconcile("app", "now").await;
    controller.queue().add(ObjectKey::new("default", "app")).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while h.get("v1", "ConfigMap", Some("default"), "b").await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "trigger was not processed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
