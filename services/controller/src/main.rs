//! convoy controller
//!
//! Runs the controller against a Kubernetes API server, or against an
//! in-memory cluster seeded from a directory of YAML manifests for
//! development. Sources are fetched over HTTP or from local paths.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use convoy_controller::build::{BuildEngine, Composer, KustomizeCli};
use convoy_controller::cluster::{ClusterClient, InMemoryCluster, KubeCluster};
use convoy_controller::config::{ClusterKind, Config, EngineKind};
use convoy_controller::controller::{Controller, ControllerConfig};
use convoy_controller::reconciler::{Context, ReconcilerConfig};
use convoy_controller::source::SchemeFetcher;
use convoy_manifest::{decode_documents, sort_legacy};
use convoy_reconcile::RetryTracker;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        workers = config.workers,
        engine = ?config.build_engine,
        cluster = ?config.cluster,
        resync_interval_secs = config.resync_interval.as_secs(),
        "Starting convoy controller"
    );

    let cluster: Arc<dyn ClusterClient> = match config.cluster {
        ClusterKind::Kube => Arc::new(
            KubeCluster::infer()
                .await
                .context("failed to connect to the API server")?,
        ),
        ClusterKind::Memory => {
            let cluster = InMemoryCluster::new();
            if let Some(seed_dir) = &config.seed_dir {
                let loaded = seed(&cluster, seed_dir)?;
                info!(dir = %seed_dir.display(), objects = loaded, "Seeded cluster");
            } else {
                warn!("CONVOY_SEED_DIR is not set, starting with an empty cluster");
            }
            Arc::new(cluster)
        }
    };

    let engine: Arc<dyn BuildEngine> = match config.build_engine {
        EngineKind::Builtin => Arc::new(Composer),
        EngineKind::Kustomize => Arc::new(KustomizeCli::new(&config.kustomize_bin)),
    };
    let ctx = Arc::new(Context::new(
        cluster,
        Arc::new(SchemeFetcher::new(config.http_timeout)?),
        engine,
        ReconcilerConfig {
            dependency_requeue: config.dependency_requeue,
            staging_dir: config.staging_dir.clone(),
            ..ReconcilerConfig::default()
        },
        RetryTracker::new(config.max_retries, config.retry_window),
    ));

    let controller = Controller::new(
        ctx,
        ControllerConfig {
            workers: config.workers,
            resync_interval: config.resync_interval,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller_handle = tokio::spawn(async move { controller.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_handle.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("Controller shutdown complete");
    Ok(())
}

/// Load every YAML file under `dir` into the cluster, in apply order.
fn seed(cluster: &InMemoryCluster, dir: &Path) -> Result<usize> {
    let mut resources = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        resources.extend(decode_documents(&text).with_context(|| format!("decoding {}", path.display()))?);
    }

    sort_legacy(&mut resources);
    let count = resources.len();
    for resource in resources {
        let id = resource.id();
        cluster
            .put(resource)
            .with_context(|| format!("seeding {id}"))?;
    }
    Ok(count)
}
