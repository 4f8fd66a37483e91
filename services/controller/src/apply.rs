//! Validation, apply and prune of a rendered resource set.
//!
//! - Validation runs over the whole set before anything is written, so a
//!   rejected set leaves the cluster untouched.
//! - Apply is server-side apply in the given (already sorted) order.
//!   Transient errors are retried a bounded number of times.
//! - Prune lists objects carrying the owner labels and deletes those whose
//!   generation token differs from the current one. Objects without the
//!   owner labels are never candidates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use convoy_manifest::{GroupKind, GroupVersionKind, Resource, ResourceId};
use convoy_reconcile::{partition_by_token, BackoffPolicy, GenerationToken};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ValidationMode, CHECKSUM_LABEL, PRUNE_ANNOTATION};
use crate::cluster::{ApplyOutcome, ApplyParams, ClusterClient, ClusterError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("validation failed for {id}: {message}")]
    Validation { id: String, message: String },

    #[error("apply failed for {id}: {source}")]
    Apply {
        id: ResourceId,
        #[source]
        source: ClusterError,
    },

    #[error("prune failed for {id}: {source}")]
    Prune {
        id: String,
        #[source]
        source: ClusterError,
    },
}

/// What one apply pass changed.
#[derive(Debug, Default, Clone)]
pub struct ApplyReport {
    pub entries: Vec<(ResourceId, ApplyOutcome)>,
}

impl ApplyReport {
    pub fn changed(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, outcome)| *outcome != ApplyOutcome::Unchanged)
            .count()
    }

    /// Human-readable summary, e.g. `Namespace/test created`.
    pub fn summary(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, outcome)| *outcome != ApplyOutcome::Unchanged)
            .map(|(id, outcome)| format!("{id} {outcome}"))
            .collect()
    }
}

/// Applies and prunes under one identity.
pub struct Applier {
    client: Arc<dyn ClusterClient>,
    params: ApplyParams,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl Applier {
    pub fn new(client: Arc<dyn ClusterClient>, field_manager: &str) -> Self {
        Self {
            client,
            params: ApplyParams::new(field_manager),
            backoff: BackoffPolicy {
                base: std::time::Duration::from_millis(200),
                max: std::time::Duration::from_secs(5),
                jitter: 0.1,
            },
            max_attempts: 3,
        }
    }

    pub fn with_retry(mut self, backoff: BackoffPolicy, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Check every resource before anything is applied.
    pub async fn validate(&self, resources: &[Resource], mode: ValidationMode) -> Result<(), ApplyError> {
        if mode == ValidationMode::None {
            return Ok(());
        }

        for resource in resources {
            resource.validate_identity().map_err(|e| ApplyError::Validation {
                id: resource.id().to_string(),
                message: e.to_string(),
            })?;
        }

        if mode == ValidationMode::Server {
            // Kinds and namespaces created earlier in the same set do not
            // exist yet during a dry run.
            let pending_kinds = defined_kinds(resources);
            let pending_namespaces: BTreeSet<&str> = resources
                .iter()
                .filter(|r| r.kind() == "Namespace" && r.api_version() == "v1")
                .map(Resource::name)
                .collect();

            let dry_run = self.params.clone().dry_run();
            for resource in resources {
                match self.client.apply(resource, &dry_run).await {
                    Ok(_) => {}
                    Err(ClusterError::NoKindMatch(_))
                        if pending_kinds.contains(&resource.gvk().group_kind()) => {}
                    Err(ClusterError::NamespaceNotFound(ns)) if pending_namespaces.contains(ns.as_str()) => {}
                    Err(e) => {
                        return Err(ApplyError::Validation {
                            id: resource.id().to_string(),
                            message: e.to_string(),
                        })
                    }
                }
            }
        }

        debug!(resources = resources.len(), mode = ?mode, "Validation passed");
        Ok(())
    }

    /// Apply resources in order, stopping at the first permanent failure.
    pub async fn apply_all(&self, resources: &[Resource]) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        for resource in resources {
            let outcome = self.apply_one(resource).await?;
            if outcome != ApplyOutcome::Unchanged {
                debug!(resource = %resource.id(), outcome = %outcome, "Applied resource");
            }
            report.entries.push((resource.id(), outcome));
        }
        Ok(report)
    }

    async fn apply_one(&self, resource: &Resource) -> Result<ApplyOutcome, ApplyError> {
        let mut attempt = 0;
        loop {
            match self.client.apply(resource, &self.params).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        resource = %resource.id(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Apply failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ApplyError::Apply {
                        id: resource.id(),
                        source,
                    })
                }
            }
        }
    }

    /// Delete owned objects of `kinds` not stamped with `token`.
    ///
    /// `selector` must hold the owner labels; with an empty selector nothing
    /// is deleted.
    pub async fn prune(
        &self,
        kinds: &[GroupVersionKind],
        selector: &BTreeMap<String, String>,
        token: &GenerationToken,
    ) -> Result<Vec<ResourceId>, ApplyError> {
        self.delete_owned(kinds, selector, Some(token)).await
    }

    /// Delete every owned object of `kinds`, whatever its token.
    pub async fn delete_all(
        &self,
        kinds: &[GroupVersionKind],
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceId>, ApplyError> {
        self.delete_owned(kinds, selector, None).await
    }

    async fn delete_owned(
        &self,
        kinds: &[GroupVersionKind],
        selector: &BTreeMap<String, String>,
        keep: Option<&GenerationToken>,
    ) -> Result<Vec<ResourceId>, ApplyError> {
        if selector.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for gvk in kinds {
            match self.client.list(gvk, selector).await {
                Ok(items) => candidates.extend(items),
                // The kind is gone, e.g. its CRD was removed.
                Err(ClusterError::NoKindMatch(_)) => continue,
                Err(source) => {
                    return Err(ApplyError::Prune {
                        id: gvk.to_string(),
                        source,
                    })
                }
            }
        }

        let stale = match keep {
            Some(token) => partition_by_token(candidates, token, |r| r.label(CHECKSUM_LABEL)).1,
            None => candidates,
        };

        // Namespaced objects first, so namespaces and CRDs go last.
        let (cluster_scoped, namespaced): (Vec<_>, Vec<_>) =
            stale.into_iter().partition(|r| r.namespace().is_none());

        let mut deleted = Vec::new();
        for resource in namespaced.iter().chain(cluster_scoped.iter()) {
            if !resource.matches_labels(selector) {
                continue;
            }
            if resource.annotation(PRUNE_ANNOTATION) == Some("disabled") {
                debug!(resource = %resource.id(), "Pruning disabled by annotation");
                continue;
            }
            match self
                .client
                .delete(&resource.gvk(), resource.namespace(), resource.name())
                .await
            {
                Ok(true) => {
                    info!(resource = %resource.id(), "Deleted resource");
                    deleted.push(resource.id());
                }
                Ok(false) => {}
                Err(source) => {
                    return Err(ApplyError::Prune {
                        id: resource.id().to_string(),
                        source,
                    })
                }
            }
        }
        Ok(deleted)
    }
}

/// Kinds defined by CustomResourceDefinitions in `resources`.
fn defined_kinds(resources: &[Resource]) -> BTreeSet<GroupKind> {
    resources
        .iter()
        .filter(|r| r.kind() == "CustomResourceDefinition")
        .filter_map(|crd| {
            Some(GroupKind {
                group: crd.str_field(&["spec", "group"])?.to_string(),
                kind: crd.str_field(&["spec", "names", "kind"])?.to_string(),
            })
        })
        .collect()
}
