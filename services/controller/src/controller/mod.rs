//! Controller runtime.
//!
//! Drives [`reconcile`] for every Kustomization:
//! - a pool of workers pulling keys from a [`WorkQueue`]
//! - requeues scheduled from each attempt's [`Outcome`](crate::reconciler::Outcome)
//! - a periodic resync that enqueues every object

mod queue;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{self, ObjectKey};
use crate::cluster::ClusterError;
use crate::reconciler::{reconcile, Context};

pub use queue::WorkQueue;

/// Delay before retrying an attempt that could not even report its status.
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,

    /// Interval between full resyncs.
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(60),
        }
    }
}

pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(ctx: Arc<Context>, config: ControllerConfig) -> Self {
        Self {
            ctx,
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    /// Queue handle, e.g. for external triggers.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Enqueue every Kustomization in the cluster.
    pub async fn enqueue_all(&self) -> Result<usize, ClusterError> {
        let objects = self.ctx.client.list(&api::gvk(), &BTreeMap::new()).await?;
        let count = objects.len();
        for object in objects {
            let key = ObjectKey::new(object.namespace().unwrap_or_default(), object.name());
            self.queue.add(key).await;
        }
        Ok(count)
    }

    /// Run workers and the resync loop until shutdown.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting controller"
        );

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.queue),
                ))
            })
            .collect();

        let mut resync = tokio::time::interval(self.config.resync_interval);
        loop {
            tokio::select! {
                _ = resync.tick() => {
                    match self.enqueue_all().await {
                        Ok(count) => debug!(count, "Resync enqueued objects"),
                        Err(e) => error!(error = %e, "Resync failed"),
                    }
                    self.ctx.prune_retries();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }

        self.queue.shutdown().await;
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task failed");
            }
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<Context>, queue: Arc<WorkQueue>) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        match reconcile(&ctx, &key).await {
            Ok(outcome) => {
                debug!(
                    worker = id,
                    kustomization = %key,
                    phase = %outcome.phase,
                    requeue_after_ms = outcome.requeue_after.map(|d| d.as_millis() as u64),
                    "Reconcile finished"
                );
                if let Some(delay) = outcome.requeue_after {
                    queue.add_after(key.clone(), delay).await;
                }
            }
            Err(e) => {
                error!(worker = id, kustomization = %key, error = %e, "Reconcile error");
                queue.add_after(key.clone(), ERROR_REQUEUE).await;
            }
        }
        queue.done(&key).await;
    }
    debug!(worker = id, "Worker stopped");
}
