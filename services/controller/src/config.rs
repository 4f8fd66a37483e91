//! Configuration for the controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use convoy_reconcile::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

/// Which build engine renders overlays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineKind {
    /// In-process composer for plain overlays.
    Builtin,

    /// External `kustomize` binary.
    Kustomize,
}

/// Which cluster the controller talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    /// In-process cluster seeded from `CONVOY_SEED_DIR`.
    Memory,

    /// Kubernetes API server from the kubeconfig or in-cluster environment.
    Kube,
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Number of reconcile workers.
    pub workers: usize,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// Delay before rechecking unready dependencies.
    pub dependency_requeue: Duration,

    /// Failures tolerated inside the retry window before an object stalls.
    pub max_retries: u32,

    pub retry_window: Duration,

    pub build_engine: EngineKind,

    pub cluster: ClusterKind,

    /// Path to the kustomize binary.
    pub kustomize_bin: PathBuf,

    /// Parent directory for staging areas.
    pub staging_dir: Option<PathBuf>,

    /// Directory of YAML manifests loaded into the in-memory cluster at startup.
    pub seed_dir: Option<PathBuf>,

    /// Timeout for artifact downloads.
    pub http_timeout: Duration,
}

/// Parse `name` if set. A value that does not parse is an error.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {value:?} for {name}")),
        Err(_) => Ok(default),
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("CONVOY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let build_engine = match std::env::var("CONVOY_BUILD_ENGINE").as_deref() {
            Err(_) | Ok("builtin") => EngineKind::Builtin,
            Ok("kustomize") => EngineKind::Kustomize,
            Ok(other) => bail!("CONVOY_BUILD_ENGINE must be builtin or kustomize, got {other}"),
        };

        let cluster = match std::env::var("CONVOY_CLUSTER").as_deref() {
            Err(_) | Ok("memory") => ClusterKind::Memory,
            Ok("kube") => ClusterKind::Kube,
            Ok(other) => bail!("CONVOY_CLUSTER must be memory or kube, got {other}"),
        };

        let workers = env_parse("CONVOY_WORKERS", 4usize)?;
        if workers == 0 {
            bail!("CONVOY_WORKERS must be at least 1");
        }

        let resync_secs: u64 = env_parse("CONVOY_RESYNC_INTERVAL", 60)?;
        if resync_secs == 0 {
            bail!("CONVOY_RESYNC_INTERVAL must be at least 1 second");
        }

        Ok(Self {
            log_level,
            workers,
            resync_interval: Duration::from_secs(resync_secs),
            dependency_requeue: Duration::from_secs(env_parse("CONVOY_DEPENDENCY_REQUEUE", 30)?),
            max_retries: env_parse("CONVOY_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_window: Duration::from_secs(env_parse(
                "CONVOY_RETRY_WINDOW",
                DEFAULT_RETRY_WINDOW.as_secs(),
            )?),
            build_engine,
            cluster,
            kustomize_bin: env_path("CONVOY_KUSTOMIZE_BIN").unwrap_or_else(|| PathBuf::from("kustomize")),
            staging_dir: env_path("CONVOY_STAGING_DIR"),
            seed_dir: env_path("CONVOY_SEED_DIR"),
            http_timeout: Duration::from_secs(env_parse("CONVOY_HTTP_TIMEOUT", 60)?),
        })
    }
}
