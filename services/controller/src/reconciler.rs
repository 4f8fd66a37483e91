//! Reconciliation state machine for one Kustomization.
//!
//! A single call to [`reconcile`] runs one attempt:
//! - Finalize if the object is being deleted
//! - Short-circuit if suspended
//! - Resolve the source, skip if nothing changed and no force request is pending
//! - Recheck only health when the revision is applied but was unhealthy
//! - Gate on dependencies
//! - Stage, render, validate, apply and prune under the attempt deadline
//! - Wait for health checks
//! - Write status and tell the caller when to come back
//!
//! Waiting is never done in place. Every wait is returned as a requeue
//! delay in the [`Outcome`] so the worker is free for other objects.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use convoy_manifest::{GroupVersionKind, Resource};
use convoy_reconcile::{BackoffPolicy, RetryTracker};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::api::condition::{self, reason, HEALTHY, READY, STALLED};
use crate::api::{self, ConditionStatus, Inventory, Kustomization, ObjectKey, FINALIZER};
use crate::apply::{Applier, ApplyError};
use crate::build::BuildEngine;
use crate::cluster::{ClusterClient, ClusterError};
use crate::dependency::{check_dependencies, DependencyStatus};
use crate::health::{HealthAssessor, HealthError};
use crate::overlay::{resolve_build_dir, OverlayError, OverlayOptions};
use crate::render::{render, RenderError};
use crate::source::{resolve_source, ArtifactFetcher, FetchError, SourceSnapshot};

/// Errors that abort an attempt without a status update.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("invalid Kustomization: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A failed attempt, reported through the Ready condition.
#[derive(Debug, Error)]
pub enum ReconcileFailure {
    #[error("artifact fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("staging failed: {0}")]
    Stage(#[from] OverlayError),

    #[error("staging failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Render(#[from] RenderError),

    #[error("variable lookup failed: {0}")]
    Variables(String),

    #[error("build task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Validation(ApplyError),

    #[error("{0}")]
    Apply(ApplyError),

    #[error("{0}")]
    Prune(ApplyError),

    #[error("{0}")]
    Health(HealthError),

    #[error("reconciliation exceeded its {timeout} timeout while {phase}")]
    Timeout { timeout: String, phase: Phase },
}

impl ReconcileFailure {
    /// Condition reason for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Fetch(_) => reason::ARTIFACT_FAILED,
            Self::Stage(_) | Self::Io(_) | Self::Render(_) | Self::Variables(_) | Self::Task(_) => {
                reason::BUILD_FAILED
            }
            Self::Validation(_) => reason::VALIDATION_FAILED,
            Self::Apply(_) => reason::APPLY_FAILED,
            Self::Prune(_) => reason::PRUNE_FAILED,
            Self::Health(_) => reason::HEALTH_CHECK_FAILED,
            Self::Timeout { .. } => reason::RECONCILIATION_TIMEOUT,
        }
    }
}

/// Where an attempt is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Building,
    Validating,
    Applying,
    Pruning,
    HealthChecking,
    Applied,
    Failed,
    Stalled,
    Suspended,
    Finalized,
    Gone,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Validating => "validating",
            Self::Applying => "applying",
            Self::Pruning => "pruning",
            Self::HealthChecking => "health checking",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
            Self::Suspended => "suspended",
            Self::Finalized => "finalized",
            Self::Gone => "gone",
        };
        f.write_str(name)
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub phase: Phase,

    /// Run again after this delay. `None` waits for the next external trigger.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    fn done(phase: Phase) -> Self {
        Self {
            phase,
            requeue_after: None,
        }
    }

    fn requeue(phase: Phase, after: Duration) -> Self {
        Self {
            phase,
            requeue_after: Some(after),
        }
    }
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Field manager for server-side apply.
    pub field_manager: String,

    /// Delay before rechecking dependencies that are not ready.
    pub dependency_requeue: Duration,

    /// Poll interval for health checks.
    pub health_poll_interval: Duration,

    /// Parent for staging directories. System temp dir if unset.
    pub staging_dir: Option<std::path::PathBuf>,

    /// Attempts per resource for transient apply errors.
    pub apply_attempts: u32,

    /// Backoff between apply attempts.
    pub apply_backoff: BackoffPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            field_manager: "convoy-controller".to_string(),
            dependency_requeue: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(2),
            staging_dir: None,
            apply_attempts: 3,
            apply_backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
                jitter: 0.1,
            },
        }
    }
}

/// Everything a reconciliation needs, passed explicitly into every call.
pub struct Context {
    pub client: Arc<dyn ClusterClient>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub engine: Arc<dyn BuildEngine>,
    pub config: ReconcilerConfig,
    retries: Mutex<RetryTracker>,
}

impl Context {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        fetcher: Arc<dyn ArtifactFetcher>,
        engine: Arc<dyn BuildEngine>,
        config: ReconcilerConfig,
        retries: RetryTracker,
    ) -> Self {
        Self {
            client,
            fetcher,
            engine,
            config,
            retries: Mutex::new(retries),
        }
    }

    fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop retry bookkeeping of objects that failed long ago.
    pub fn prune_retries(&self) {
        self.retries().prune();
    }

    fn applier(&self, kustomization: &Kustomization) -> Applier {
        let client = match kustomization.impersonated_user() {
            Some(user) => self.client.impersonate(&user),
            None => Arc::clone(&self.client),
        };
        Applier::new(client, &self.config.field_manager)
            .with_retry(self.config.apply_backoff.clone(), self.config.apply_attempts)
    }
}

/// What a successful apply pass produced.
struct Applied {
    inventory: Inventory,
}

/// Run one reconciliation attempt for `key`.
#[instrument(skip_all, fields(kustomization = %key))]
pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
    let gvk = api::gvk();
    let Some(resource) = ctx.client.get(&gvk, Some(&key.namespace), &key.name).await? else {
        ctx.retries().clear(&key.to_string());
        debug!("Kustomization no longer exists");
        return Ok(Outcome::done(Phase::Gone));
    };
    let mut kustomization = Kustomization::from_resource(&resource)?;

    if kustomization.metadata.deletion_timestamp.is_some() {
        return finalize(ctx, &kustomization).await;
    }

    if kustomization.spec.suspend {
        info!("Reconciliation is suspended");
        return Ok(Outcome::done(Phase::Suspended));
    }

    if !kustomization.metadata.finalizers.iter().any(|f| f == FINALIZER) {
        let updated = ctx
            .client
            .add_finalizer(&gvk, Some(&key.namespace), &key.name, FINALIZER)
            .await?;
        kustomization = Kustomization::from_resource(&updated)?;
    }

    let requested = kustomization.pending_request().map(str::to_string);

    let snapshot = match resolve_source(ctx.client.as_ref(), &kustomization).await {
        Ok(snapshot) => snapshot,
        Err(e) => return fail(ctx, kustomization, None, requested, e.into()).await,
    };
    if !snapshot.ready {
        info!(source = %kustomization.spec.source_ref.name, "Source artifact is not ready, retrying later");
        return Ok(Outcome::requeue(Phase::Pending, kustomization.retry_interval()));
    }

    let applied = requested.is_none()
        && kustomization.status.last_applied_revision.as_deref() == Some(snapshot.revision.as_str())
        && kustomization.status.observed_generation == kustomization.metadata.generation;
    if applied {
        if kustomization.is_ready() {
            debug!(revision = %snapshot.revision, "Revision already applied");
            return Ok(Outcome::requeue(Phase::Applied, kustomization.interval()));
        }
        let health_failed = condition::find(&kustomization.status.conditions, READY)
            .is_some_and(|c| c.reason == reason::HEALTH_CHECK_FAILED);
        if health_failed {
            debug!(revision = %snapshot.revision, "Revision already applied, rechecking health");
            let deadline = Instant::now() + kustomization.timeout();
            return assess_health(ctx, kustomization, key, snapshot.revision, deadline).await;
        }
    }

    if let DependencyStatus::NotReady { dependency, reason } =
        check_dependencies(ctx.client.as_ref(), &kustomization).await?
    {
        info!(dependency = %dependency, reason = %reason, "Dependency not ready, requeueing");
        condition::set(
            &mut kustomization.status.conditions,
            READY,
            ConditionStatus::Unknown,
            reason::DEPENDENCY_NOT_READY,
            format!("dependency '{dependency}' is {reason}"),
        );
        if !write_status(ctx, &mut kustomization).await? {
            return Ok(Outcome::requeue(Phase::Pending, Duration::ZERO));
        }
        return Ok(Outcome::requeue(Phase::Pending, ctx.config.dependency_requeue));
    }

    if condition::find(&kustomization.status.conditions, READY).is_none() {
        condition::set(
            &mut kustomization.status.conditions,
            READY,
            ConditionStatus::Unknown,
            reason::PROGRESSING,
            "Reconciliation in progress",
        );
        if !write_status(ctx, &mut kustomization).await? {
            return Ok(Outcome::requeue(Phase::Pending, Duration::ZERO));
        }
    }

    info!(revision = %snapshot.revision, "Reconciling revision");
    let timeout = kustomization.timeout();
    let deadline = Instant::now() + timeout;
    let phase = Mutex::new(Phase::Building);

    let attempt = tokio::time::timeout_at(deadline, apply_revision(ctx, &kustomization, &snapshot, &phase)).await;
    let applied = match attempt {
        Ok(Ok(applied)) => applied,
        Ok(Err(failure)) => return fail(ctx, kustomization, Some(snapshot.revision.as_str()), requested, failure).await,
        Err(_) => {
            let phase = *phase.lock().unwrap_or_else(PoisonError::into_inner);
            let failure = ReconcileFailure::Timeout {
                timeout: api::duration::format(timeout),
                phase,
            };
            return fail(ctx, kustomization, Some(snapshot.revision.as_str()), requested, failure).await;
        }
    };

    let revision = snapshot.revision;
    let status = &mut kustomization.status;
    status.last_applied_revision = Some(revision.clone());
    status.last_attempted_revision = Some(revision.clone());
    status.observed_generation = kustomization.metadata.generation;
    status.inventory = Some(applied.inventory);
    if let Some(requested) = requested {
        status.last_handled_reconcile_at = Some(requested);
    }

    assess_health(ctx, kustomization, key, revision, deadline).await
}

/// Wait for the health checks of an applied revision and record the verdict.
async fn assess_health(
    ctx: &Context,
    mut kustomization: Kustomization,
    key: &ObjectKey,
    revision: String,
    deadline: Instant,
) -> Result<Outcome, ReconcileError> {
    let assessor = HealthAssessor::new(Arc::clone(&ctx.client), ctx.config.health_poll_interval);
    if let Err(e) = assessor
        .wait_ready(
            &kustomization.spec.health_checks,
            &kustomization.metadata.namespace,
            deadline,
        )
        .await
    {
        let failure = ReconcileFailure::Health(e);
        warn!(reason = failure.reason(), error = %failure, "Health checks failed");
        let conditions = &mut kustomization.status.conditions;
        condition::set(conditions, READY, ConditionStatus::False, failure.reason(), failure.to_string());
        condition::set(conditions, HEALTHY, ConditionStatus::False, failure.reason(), failure.to_string());
        if !write_status(ctx, &mut kustomization).await? {
            return Ok(Outcome::requeue(Phase::Pending, Duration::ZERO));
        }
        return Ok(Outcome::requeue(Phase::Failed, kustomization.interval()));
    }

    let conditions = &mut kustomization.status.conditions;
    condition::set(
        conditions,
        READY,
        ConditionStatus::True,
        reason::RECONCILIATION_SUCCEEDED,
        format!("Applied revision: {revision}"),
    );
    if kustomization.spec.health_checks.is_empty() {
        condition::remove(conditions, HEALTHY);
    } else {
        condition::set(
            conditions,
            HEALTHY,
            ConditionStatus::True,
            reason::RECONCILIATION_SUCCEEDED,
            "Health checks passed",
        );
    }
    condition::remove(conditions, STALLED);

    if !write_status(ctx, &mut kustomization).await? {
        return Ok(Outcome::requeue(Phase::Pending, Duration::ZERO));
    }
    ctx.retries().clear(&key.to_string());
    info!(revision = %revision, "Reconciliation finished");
    Ok(Outcome::requeue(Phase::Applied, kustomization.interval()))
}

fn enter(phase: &Mutex<Phase>, next: Phase) {
    *phase.lock().unwrap_or_else(PoisonError::into_inner) = next;
    debug!(phase = %next, "Entering phase");
}

/// Build, validate, apply and prune one revision.
async fn apply_revision(
    ctx: &Context,
    kustomization: &Kustomization,
    snapshot: &SourceSnapshot,
    phase: &Mutex<Phase>,
) -> Result<Applied, ReconcileFailure> {
    let mut staging = tempfile::Builder::new();
    staging.prefix("convoy-");
    let staging = match &ctx.config.staging_dir {
        Some(parent) => staging.tempdir_in(parent)?,
        None => staging.tempdir()?,
    };

    ctx.fetcher.fetch(snapshot, staging.path()).await?;
    let vars = collect_variables(ctx.client.as_ref(), kustomization).await?;
    let dir = resolve_build_dir(staging.path(), &kustomization.spec.path)?;

    let engine = Arc::clone(&ctx.engine);
    let options = OverlayOptions::from_kustomization(kustomization);
    // The staging area lives as long as the render, even if the attempt times out first.
    let rendered = tokio::task::spawn_blocking(move || {
        let rendered = render(engine.as_ref(), &dir, options, &vars);
        drop(staging);
        rendered
    })
    .await??;
    debug!(resources = rendered.resources.len(), token = %rendered.token, "Rendered overlay");

    let applier = ctx.applier(kustomization);

    enter(phase, Phase::Validating);
    applier
        .validate(&rendered.resources, kustomization.spec.validation)
        .await
        .map_err(ReconcileFailure::Validation)?;

    enter(phase, Phase::Applying);
    let report = applier
        .apply_all(&rendered.resources)
        .await
        .map_err(ReconcileFailure::Apply)?;
    if report.changed() > 0 {
        info!(changed = report.changed(), changes = ?report.summary(), "Applied resources");
    }

    let inventory = Inventory::from_resources(rendered.token.as_str(), &rendered.resources);

    if kustomization.spec.prune {
        if let Some(previous) = &kustomization.status.inventory {
            enter(phase, Phase::Pruning);
            let kinds = merged_kinds(previous, &inventory);
            let deleted = applier
                .prune(&kinds, &kustomization.selector(), &rendered.token)
                .await
                .map_err(ReconcileFailure::Prune)?;
            if !deleted.is_empty() {
                info!(deleted = deleted.len(), "Pruned stale resources");
            }
        }
    }

    enter(phase, Phase::HealthChecking);
    Ok(Applied { inventory })
}

fn merged_kinds(previous: &Inventory, current: &Inventory) -> Vec<GroupVersionKind> {
    let mut kinds = previous.kinds();
    kinds.extend(current.kinds());
    kinds.sort_by_key(GroupVersionKind::group_kind);
    kinds.dedup_by(|a, b| a.group_kind() == b.group_kind());
    kinds
}

/// Gather post-build variables. Inline values win over referenced objects.
async fn collect_variables(
    client: &dyn ClusterClient,
    kustomization: &Kustomization,
) -> Result<BTreeMap<String, String>, ReconcileFailure> {
    let Some(post_build) = &kustomization.spec.post_build else {
        return Ok(BTreeMap::new());
    };

    let namespace = kustomization.metadata.namespace.as_str();
    let mut vars = BTreeMap::new();
    for reference in &post_build.substitute_from {
        let secret = match reference.kind.as_str() {
            "ConfigMap" => false,
            "Secret" => true,
            other => return Err(ReconcileFailure::Variables(format!("unsupported kind {other}"))),
        };
        let gvk = GroupVersionKind::from_api_version("v1", &reference.kind);
        let object = client
            .get(&gvk, Some(namespace), &reference.name)
            .await
            .map_err(|e| ReconcileFailure::Variables(e.to_string()))?;

        let Some(object) = object else {
            if reference.optional {
                debug!(kind = %reference.kind, name = %reference.name, "Optional variables source not found");
                continue;
            }
            return Err(ReconcileFailure::Variables(format!(
                "{} {namespace}/{} not found",
                reference.kind, reference.name
            )));
        };
        vars.extend(data_entries(&object, secret)?);
    }

    vars.extend(post_build.substitute.clone());
    Ok(vars)
}

fn data_entries(object: &Resource, secret: bool) -> Result<BTreeMap<String, String>, ReconcileFailure> {
    let Some(data) = object.get(&["data"]).and_then(|d| d.as_object()) else {
        return Ok(BTreeMap::new());
    };

    let mut entries = BTreeMap::new();
    for (key, value) in data {
        let Some(text) = value.as_str() else { continue };
        let value = if secret {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| ReconcileFailure::Variables(format!("{}: key {key}: {e}", object.id())))?;
            String::from_utf8(bytes)
                .map_err(|_| ReconcileFailure::Variables(format!("{}: key {key} is not UTF-8", object.id())))?
        } else {
            text.to_string()
        };
        entries.insert(key.clone(), value);
    }
    Ok(entries)
}

/// Record a failed attempt and pick the next delay.
async fn fail(
    ctx: &Context,
    mut kustomization: Kustomization,
    revision: Option<&str>,
    requested: Option<String>,
    failure: ReconcileFailure,
) -> Result<Outcome, ReconcileError> {
    let key = kustomization.key().to_string();
    warn!(reason = failure.reason(), error = %failure, "Reconciliation failed");

    let status = &mut kustomization.status;
    if let Some(revision) = revision {
        status.last_attempted_revision = Some(revision.to_string());
    }
    if let Some(requested) = requested {
        status.last_handled_reconcile_at = Some(requested);
    }
    status.observed_generation = kustomization.metadata.generation;
    condition::set(
        &mut status.conditions,
        READY,
        ConditionStatus::False,
        failure.reason(),
        failure.to_string(),
    );

    let attempted = status.last_attempted_revision.clone().unwrap_or_default();
    let exhausted = ctx.retries().record_failure(&key, &attempted);
    let stalled = match &failure {
        ReconcileFailure::Timeout { .. } => Some((reason::RECONCILIATION_TIMEOUT, failure.to_string())),
        _ if exhausted => Some((reason::RETRIES_EXHAUSTED, "Retry budget exhausted".to_string())),
        _ => None,
    };

    let outcome = match stalled {
        Some((stall_reason, message)) => {
            condition::set(&mut status.conditions, STALLED, ConditionStatus::True, stall_reason, message);
            Outcome::requeue(Phase::Stalled, kustomization.interval())
        }
        None => {
            let failures = ctx.retries().failures(&key);
            let backoff = BackoffPolicy {
                base: kustomization.retry_interval(),
                max: kustomization.interval().max(kustomization.retry_interval()),
                jitter: 0.1,
            };
            Outcome::requeue(Phase::Failed, backoff.delay(failures.saturating_sub(1)))
        }
    };

    if !write_status(ctx, &mut kustomization).await? {
        return Ok(Outcome::requeue(Phase::Pending, Duration::ZERO));
    }
    Ok(outcome)
}

/// Delete owned resources if pruning, then release the finalizer.
async fn finalize(ctx: &Context, kustomization: &Kustomization) -> Result<Outcome, ReconcileError> {
    let key = kustomization.key();
    if !kustomization.metadata.finalizers.iter().any(|f| f == FINALIZER) {
        return Ok(Outcome::done(Phase::Finalized));
    }

    if kustomization.spec.prune && !kustomization.spec.suspend {
        let kinds = kustomization
            .status
            .inventory
            .as_ref()
            .map(Inventory::kinds)
            .unwrap_or_default();
        match ctx
            .applier(kustomization)
            .delete_all(&kinds, &kustomization.selector())
            .await
        {
            Ok(deleted) => info!(deleted = deleted.len(), "Garbage collected owned resources"),
            Err(e) => {
                warn!(error = %e, "Garbage collection failed, retrying");
                return Ok(Outcome::requeue(Phase::Failed, kustomization.retry_interval()));
            }
        }
    }

    ctx.client
        .remove_finalizer(&api::gvk(), Some(&key.namespace), &key.name, FINALIZER)
        .await?;
    ctx.retries().clear(&key.to_string());
    info!("Finalizer removed");
    Ok(Outcome::done(Phase::Finalized))
}

/// Write status with the resourceVersion read at the start of the attempt.
///
/// Returns false if the object changed meanwhile; the attempt's result is
/// then stale and must be dropped.
async fn write_status(ctx: &Context, kustomization: &mut Kustomization) -> Result<bool, ReconcileError> {
    let resource = kustomization.to_resource()?;
    match ctx.client.update_status(&resource).await {
        Ok(updated) => {
            kustomization.metadata.resource_version = updated
                .str_field(&["metadata", "resourceVersion"])
                .map(str::to_string);
            Ok(true)
        }
        Err(ClusterError::Conflict(_)) | Err(ClusterError::NotFound(_)) => {
            debug!("Object changed during reconciliation, dropping result");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons() {
        let failure = ReconcileFailure::Variables("x".into());
        assert_eq!(failure.reason(), reason::BUILD_FAILED);

        let failure = ReconcileFailure::Timeout {
            timeout: api::duration::format(Duration::from_secs(90)),
            phase: Phase::Applying,
        };
        assert_eq!(failure.reason(), reason::RECONCILIATION_TIMEOUT);
        assert_eq!(
            failure.to_string(),
            "reconciliation exceeded its 1m30s timeout while applying"
        );
    }

    #[test]
    fn test_merged_kinds_dedups_by_group_kind() {
        let previous = Inventory {
            token: "a".into(),
            entries: vec![api::InventoryEntry {
                namespace: "default".into(),
                kinds: BTreeMap::from([
                    ("ConfigMap".to_string(), "v1".to_string()),
                    ("Deployment".to_string(), "apps/v1".to_string()),
                ]),
            }],
        };
        let current = Inventory {
            token: "b".into(),
            entries: vec![api::InventoryEntry {
                namespace: "other".into(),
                kinds: BTreeMap::from([("ConfigMap".to_string(), "v1".to_string())]),
            }],
        };

        let kinds: Vec<_> = merged_kinds(&previous, &current)
            .into_iter()
            .map(|gvk| gvk.kind)
            .collect();
        assert_eq!(kinds, vec!["ConfigMap", "Deployment"]);
    }

    #[test]
    fn test_secret_data_is_decoded() {
        let secret = Resource::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "vars", "namespace": "default"},
            "data": {"password": "aHVudGVyMg=="}
        }))
        .unwrap();

        let entries = data_entries(&secret, true).unwrap();
        assert_eq!(entries["password"], "hunter2");
        assert!(data_entries(&secret, false).is_ok());
    }
}
