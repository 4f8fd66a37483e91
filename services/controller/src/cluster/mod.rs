//! Cluster API interface.
//!
//! The controller talks to the cluster only through [`ClusterClient`]:
//! generic get/list/apply/delete over arbitrary kinds, plus the status and
//! finalizer writes of its own objects. Kinds are never typed at this seam.
//!
//! [`KubeCluster`] talks to a Kubernetes API server. [`InMemoryCluster`]
//! implements the interface for development and tests.

mod apiserver;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_manifest::{GroupVersionKind, Resource};
use thiserror::Error;

pub use apiserver::KubeCluster;
pub use memory::{InMemoryCluster, Mutation};

/// Errors returned by the cluster API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(String),

    /// The object changed since it was read.
    #[error("conflict on {0}: the object has been modified")]
    Conflict(String),

    #[error("{user} cannot {verb} {resource}")]
    Forbidden {
        user: String,
        verb: &'static str,
        resource: String,
    },

    #[error("no matches for kind {0}")]
    NoKindMatch(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    /// Temporary server-side failure.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }
}

/// Options for a server-side apply.
#[derive(Debug, Clone)]
pub struct ApplyParams {
    /// Owner of the applied fields.
    pub field_manager: String,

    /// Run admission and validation without persisting.
    pub dry_run: bool,
}

impl ApplyParams {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of one apply call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Configured,
    Unchanged,
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Configured => write!(f, "configured"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Generic cluster API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object. `Ok(None)` if it does not exist.
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError>;

    /// List objects of a kind across all namespaces matching every label in `selector`.
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Resource>, ClusterError>;

    /// Server-side apply of the fields set in `resource`.
    async fn apply(
        &self,
        resource: &Resource,
        params: &ApplyParams,
    ) -> Result<ApplyOutcome, ClusterError>;

    /// Delete an object. Returns false if it did not exist.
    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, ClusterError>;

    /// Replace the status of an object.
    ///
    /// Fails with [`ClusterError::Conflict`] if `metadata.resourceVersion`
    /// is set and no longer current.
    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClusterError>;

    /// Add a finalizer if absent. Returns the updated object.
    async fn add_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<Resource, ClusterError>;

    /// Remove a finalizer. An object pending deletion is removed once its
    /// last finalizer is gone.
    async fn remove_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<(), ClusterError>;

    /// A client acting as `user`.
    fn impersonate(&self, user: &str) -> Arc<dyn ClusterClient>;
}
