//! The `Kustomization` API type.
//!
//! Objects are stored in the cluster as generic [`Resource`]s and converted
//! to these typed structs at the start of every reconciliation:
//! - `spec`: desired state, written by users
//! - `status`: observed state, written only by the controller
//!
//! Label and annotation keys used on managed resources live here too.

pub mod condition;
pub mod duration;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use convoy_manifest::{GroupVersionKind, Resource};
use serde::{Deserialize, Serialize};

pub use condition::{Condition, ConditionStatus};

pub const GROUP: &str = "kustomize.convoy.dev";
pub const VERSION: &str = "v1beta1";
pub const KIND: &str = "Kustomization";

/// Default API version for source references.
pub const SOURCE_API_VERSION: &str = "source.convoy.dev/v1beta1";

/// Owner name label stamped on every managed resource.
pub const NAME_LABEL: &str = "kustomize.convoy.dev/name";

/// Owner namespace label stamped on every managed resource.
pub const NAMESPACE_LABEL: &str = "kustomize.convoy.dev/namespace";

/// Generation token label, stamped only when pruning is enabled.
pub const CHECKSUM_LABEL: &str = "kustomize.convoy.dev/checksum";

/// Resources annotated with `disabled` are never pruned.
pub const PRUNE_ANNOTATION: &str = "kustomize.convoy.dev/prune";

/// Setting this annotation to a new value forces a reconciliation.
pub const REQUESTED_AT_ANNOTATION: &str = "reconcile.convoy.dev/requestedAt";

pub const FINALIZER: &str = "finalizers.convoy.dev";

/// Floor for `interval` and `retryInterval`.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

pub fn gvk() -> GroupVersionKind {
    GroupVersionKind {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        kind: KIND.to_string(),
    }
}

/// Namespace/name key of a reconcilable object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kustomization {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: KustomizationSpec,

    #[serde(default)]
    pub status: KustomizationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Source object holding the artifact to build.
    pub source_ref: SourceReference,

    /// Path to the overlay inside the artifact.
    #[serde(default)]
    pub path: String,

    /// Interval between reconciliations.
    #[serde(with = "duration")]
    pub interval: Duration,

    /// Backoff base for transient failures. Defaults to 30s.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<Duration>,

    /// Deadline for one attempt, health checks included. Defaults to the interval.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub prune: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageOverride>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_build: Option<PostBuild>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheckTarget>,

    #[serde(default)]
    pub suspend: bool,

    #[serde(default)]
    pub validation: ValidationMode,

    /// Impersonate this service account (in the object's namespace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostBuild {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub substitute: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substitute_from: Vec<SubstituteReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteReference {
    /// `ConfigMap` or `Secret`.
    pub kind: String,
    pub name: String,

    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    #[default]
    None,
    Client,
    Server,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
}

/// Kinds applied by the last successful pass, used to scope prune listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    /// Generation token of the applied set.
    pub token: String,

    #[serde(default)]
    pub entries: Vec<InventoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryEntry {
    /// Empty for cluster-scoped resources.
    #[serde(default)]
    pub namespace: String,

    /// Kind → apiVersion.
    #[serde(default)]
    pub kinds: BTreeMap<String, String>,
}

impl Inventory {
    pub fn from_resources(token: &str, resources: &[Resource]) -> Self {
        let mut by_namespace: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for resource in resources {
            by_namespace
                .entry(resource.namespace().unwrap_or_default().to_string())
                .or_default()
                .insert(resource.kind().to_string(), resource.api_version().to_string());
        }
        Self {
            token: token.to_string(),
            entries: by_namespace
                .into_iter()
                .map(|(namespace, kinds)| InventoryEntry { namespace, kinds })
                .collect(),
        }
    }

    /// Every distinct kind in the inventory.
    pub fn kinds(&self) -> Vec<GroupVersionKind> {
        let mut kinds: Vec<_> = self
            .entries
            .iter()
            .flat_map(|e| e.kinds.iter())
            .map(|(kind, api_version)| GroupVersionKind::from_api_version(api_version, kind))
            .collect();
        kinds.sort();
        kinds.dedup_by(|a, b| a.group_kind() == b.group_kind());
        kinds
    }
}

impl Kustomization {
    pub fn from_resource(resource: &Resource) -> Result<Self, serde_json::Error> {
        serde_json::from_value(resource.to_value())
    }

    /// Render back into a generic resource, e.g. for a status write.
    pub fn to_resource(&self) -> Result<Resource, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        Resource::from_value(value).map_err(serde::ser::Error::custom)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn is_ready(&self) -> bool {
        condition::is_true(&self.status.conditions, condition::READY)
    }

    /// Ready, observed at the current generation, with nothing newer attempted.
    pub fn is_up_to_date(&self) -> bool {
        self.is_ready()
            && self.status.observed_generation == self.metadata.generation
            && self.status.last_applied_revision == self.status.last_attempted_revision
    }

    /// A force request that has not been handled yet.
    pub fn pending_request(&self) -> Option<&str> {
        let requested = self.metadata.annotations.get(REQUESTED_AT_ANNOTATION)?;
        (self.status.last_handled_reconcile_at.as_deref() != Some(requested.as_str()))
            .then_some(requested.as_str())
    }

    /// Owner labels selecting every resource this object manages.
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_string(), self.metadata.name.clone()),
            (NAMESPACE_LABEL.to_string(), self.metadata.namespace.clone()),
        ])
    }

    /// Delay between successful reconciliations, never below [`MIN_INTERVAL`].
    pub fn interval(&self) -> Duration {
        self.spec.interval.max(MIN_INTERVAL)
    }

    /// Backoff base for failures, never below [`MIN_INTERVAL`].
    pub fn retry_interval(&self) -> Duration {
        self.spec
            .retry_interval
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
            .max(MIN_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.spec.timeout.unwrap_or_else(|| self.interval())
    }

    /// Identity used for cluster writes, if impersonation is configured.
    pub fn impersonated_user(&self) -> Option<String> {
        self.spec
            .service_account_name
            .as_ref()
            .map(|sa| format!("system:serviceaccount:{}:{}", self.metadata.namespace, sa))
    }
}
