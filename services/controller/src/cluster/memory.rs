//! In-memory cluster for development and tests.
//!
//! Emulates the parts of the API server the reconciler depends on:
//! - discovery of builtin kinds and kinds registered by applied CRDs
//! - namespace existence checks for namespaced kinds
//! - `generation` / `resourceVersion` bookkeeping
//! - server-side apply with per-manager field ownership (no write when
//!   nothing changes)
//! - finalizers and deletion timestamps
//! - a per-user deny list for impersonation
//!
//! Every write is recorded in a mutation log so tests can assert on what
//! a reconciliation changed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use convoy_manifest::{
    merge_patch, owned_paths, remove_path, GroupKind, GroupVersionKind, Resource, ResourceId,
};
use serde_json::{Map, Value};
use tracing::debug;

use super::{ApplyOutcome, ApplyParams, ClusterClient, ClusterError};

/// Identity used when no impersonation is configured.
const CONTROLLER_USER: &str = "system:serviceaccount:convoy-system:convoy-controller";

/// (group, kind, namespaced)
const BUILTIN_KINDS: &[(&str, &str, bool)] = &[
    ("", "Namespace", false),
    ("", "ServiceAccount", true),
    ("", "ConfigMap", true),
    ("", "Secret", true),
    ("", "Service", true),
    ("", "Endpoints", true),
    ("", "Pod", true),
    ("", "PersistentVolume", false),
    ("", "PersistentVolumeClaim", true),
    ("", "ResourceQuota", true),
    ("", "LimitRange", true),
    ("apps", "Deployment", true),
    ("apps", "StatefulSet", true),
    ("apps", "DaemonSet", true),
    ("apps", "ReplicaSet", true),
    ("batch", "Job", true),
    ("batch", "CronJob", true),
    ("rbac.authorization.k8s.io", "Role", true),
    ("rbac.authorization.k8s.io", "RoleBinding", true),
    ("rbac.authorization.k8s.io", "ClusterRole", false),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding", false),
    ("networking.k8s.io", "Ingress", true),
    ("networking.k8s.io", "NetworkPolicy", true),
    ("policy", "PodDisruptionBudget", true),
    ("policy", "PodSecurityPolicy", false),
    ("storage.k8s.io", "StorageClass", false),
    ("scheduling.k8s.io", "PriorityClass", false),
    ("apiextensions.k8s.io", "CustomResourceDefinition", false),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration", false),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration", false),
    ("kustomize.convoy.dev", "Kustomization", true),
    ("source.convoy.dev", "GitRepository", true),
    ("source.convoy.dev", "OCIRepository", true),
    ("source.convoy.dev", "Bucket", true),
];

/// Metadata fields owned by the server, never taken from applied objects.
const SERVER_FIELDS: &[&str] = &[
    "resourceVersion",
    "generation",
    "uid",
    "creationTimestamp",
    "deletionTimestamp",
    "managedFields",
];

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// `create`, `update`, `delete`, `update_status` or `put`.
    pub verb: &'static str,
    pub id: ResourceId,
    pub user: String,
}

impl Mutation {
    /// Writes to status or test fixtures are not resource changes.
    pub fn is_resource_change(&self) -> bool {
        matches!(self.verb, "create" | "update" | "delete")
    }
}

struct StoredObject {
    object: Resource,

    /// Field manager → leaf paths it applied.
    managers: BTreeMap<String, BTreeSet<Vec<String>>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, StoredObject>,

    /// Known kinds and whether they are namespaced.
    kinds: BTreeMap<GroupKind, bool>,

    resource_version: u64,

    /// (user, kind) pairs that are rejected for every verb.
    denied: BTreeSet<(String, String)>,

    /// Number of upcoming applies to fail with `Unavailable`.
    failing_applies: u32,

    mutations: Vec<Mutation>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn authorize(&self, user: &str, verb: &'static str, kind: &str, name: &str) -> Result<(), ClusterError> {
        if self.denied.contains(&(user.to_string(), kind.to_string())) {
            return Err(ClusterError::Forbidden {
                user: user.to_string(),
                verb,
                resource: format!("{kind}/{name}"),
            });
        }
        Ok(())
    }

    fn resolve(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<ResourceId, ClusterError> {
        let gk = gvk.group_kind();
        let namespaced = *self
            .kinds
            .get(&gk)
            .ok_or_else(|| ClusterError::NoKindMatch(gvk.to_string()))?;
        let namespace = namespaced.then(|| namespace.unwrap_or("default"));
        Ok(ResourceId::new(gk, namespace, name))
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        let id = ResourceId::new(
            GroupKind {
                group: String::new(),
                kind: "Namespace".to_string(),
            },
            None,
            namespace,
        );
        self.objects.contains_key(&id)
    }

    fn record(&mut self, verb: &'static str, id: &ResourceId, user: &str) {
        self.mutations.push(Mutation {
            verb,
            id: id.clone(),
            user: user.to_string(),
        });
    }

    /// Track kinds defined by a CustomResourceDefinition.
    fn register_crd(&mut self, crd: &Resource) {
        let group = crd.str_field(&["spec", "group"]);
        let kind = crd.str_field(&["spec", "names", "kind"]);
        if let (Some(group), Some(kind)) = (group, kind) {
            let namespaced = crd.str_field(&["spec", "scope"]) != Some("Cluster");
            self.kinds.insert(
                GroupKind {
                    group: group.to_string(),
                    kind: kind.to_string(),
                },
                namespaced,
            );
        }
    }

    fn unregister_crd(&mut self, crd: &Resource) {
        let group = crd.str_field(&["spec", "group"]);
        let kind = crd.str_field(&["spec", "names", "kind"]);
        if let (Some(group), Some(kind)) = (group, kind) {
            self.kinds.remove(&GroupKind {
                group: group.to_string(),
                kind: kind.to_string(),
            });
        }
    }

    fn remove_object(&mut self, id: &ResourceId) {
        if let Some(stored) = self.objects.remove(id) {
            if is_crd(id) {
                self.unregister_crd(&stored.object);
            }
        }
        // Namespace deletion takes its contents with it.
        if id.kind == "Namespace" && id.group.is_empty() {
            self.objects
                .retain(|other, _| other.namespace.as_deref() != Some(id.name.as_str()));
        }
    }
}

/// In-memory implementation of [`ClusterClient`].
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
    user: String,
}

impl InMemoryCluster {
    /// Create a cluster with the builtin kinds and a `default` namespace.
    pub fn new() -> Self {
        let mut state = State::default();
        for (group, kind, namespaced) in BUILTIN_KINDS {
            state.kinds.insert(
                GroupKind {
                    group: group.to_string(),
                    kind: kind.to_string(),
                },
                *namespaced,
            );
        }

        let cluster = Self {
            state: Arc::new(Mutex::new(state)),
            user: CONTROLLER_USER.to_string(),
        };
        let default_ns = Resource::new(
            &GroupVersionKind::from_api_version("v1", "Namespace"),
            None,
            "default",
        );
        // The namespace kind is builtin, so this cannot fail.
        let _ = cluster.put(default_ns);
        cluster.lock().mutations.clear();
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write an object as a user would: full replace, no field ownership.
    ///
    /// `status` is kept from the existing object unless the new one sets it.
    pub fn put(&self, resource: Resource) -> Result<Resource, ClusterError> {
        resource
            .validate_identity()
            .map_err(|e| ClusterError::Invalid(e.to_string()))?;

        let mut state = self.lock();
        let id = state.resolve(&resource.gvk(), resource.namespace(), resource.name())?;
        let mut object = normalized(resource, &id);
        let existing = state.objects.get(&id).map(|s| s.object.clone());

        let generation = match &existing {
            Some(existing) => {
                let current = existing.i64_field(&["metadata", "generation"]).unwrap_or(1);
                if spec_view(existing) != spec_view(&object) {
                    current + 1
                } else {
                    current
                }
            }
            None => 1,
        };
        if object.get(&["status"]).is_none() {
            if let Some(status) = existing.as_ref().and_then(|e| e.get(&["status"])) {
                object.as_map_mut().insert("status".into(), status.clone());
            }
        }
        if let Some(existing) = &existing {
            copy_lifecycle_fields(existing, &mut object);
        }

        let rv = state.next_resource_version();
        let metadata = object.get_or_insert_object(&["metadata"]);
        metadata.insert("generation".into(), Value::from(generation));
        metadata.insert("resourceVersion".into(), Value::String(rv));

        if is_crd(&id) {
            state.register_crd(&object);
        }
        let managers = state
            .objects
            .remove(&id)
            .map(|s| s.managers)
            .unwrap_or_default();
        state.objects.insert(
            id.clone(),
            StoredObject {
                object: object.clone(),
                managers,
            },
        );
        state.record("put", &id, &self.user);
        Ok(object)
    }

    /// Replace the status of an object, as the owning workload controller would.
    pub fn set_status(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let id = state.resolve(gvk, namespace, name)?;
        let rv = state.next_resource_version();
        let stored = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        stored.object.as_map_mut().insert("status".into(), status);
        stored
            .object
            .get_or_insert_object(&["metadata"])
            .insert("resourceVersion".into(), Value::String(rv));
        Ok(())
    }

    /// Reject every request by `user` on `kind`.
    pub fn deny(&self, user: &str, kind: &str) {
        self.lock()
            .denied
            .insert((user.to_string(), kind.to_string()));
    }

    /// Fail the next `count` non-dry-run applies with a transient error.
    pub fn fail_next_applies(&self, count: u32) {
        self.lock().failing_applies = count;
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    /// Every stored object, in identity order.
    pub fn objects(&self) -> Vec<Resource> {
        self.lock()
            .objects
            .values()
            .map(|s| s.object.clone())
            .collect()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn is_crd(id: &ResourceId) -> bool {
    id.group == "apiextensions.k8s.io" && id.kind == "CustomResourceDefinition"
}

/// Set the resolved namespace and drop server-owned fields.
fn normalized(mut resource: Resource, id: &ResourceId) -> Resource {
    let metadata = resource.get_or_insert_object(&["metadata"]);
    for field in SERVER_FIELDS {
        metadata.remove(*field);
    }
    match &id.namespace {
        Some(ns) => {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        None => {
            metadata.remove("namespace");
        }
    }
    resource
}

fn copy_lifecycle_fields(from: &Resource, to: &mut Resource) {
    let metadata = to.get_or_insert_object(&["metadata"]);
    for field in ["uid", "creationTimestamp", "deletionTimestamp", "finalizers"] {
        if let Some(value) = from.get(&["metadata", field]) {
            metadata.entry(field).or_insert_with(|| value.clone());
        }
    }
}

/// Everything outside metadata and status; changes here bump `generation`.
fn spec_view(resource: &Resource) -> Map<String, Value> {
    let mut map = resource.as_map().clone();
    map.remove("metadata");
    map.remove("status");
    map
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError> {
        let state = self.lock();
        state.authorize(&self.user, "get", &gvk.kind, name)?;
        let id = state.resolve(gvk, namespace, name)?;
        Ok(state.objects.get(&id).map(|s| s.object.clone()))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Resource>, ClusterError> {
        let state = self.lock();
        state.authorize(&self.user, "list", &gvk.kind, "*")?;
        let gk = gvk.group_kind();
        if !state.kinds.contains_key(&gk) {
            return Err(ClusterError::NoKindMatch(gvk.to_string()));
        }
        Ok(state
            .objects
            .iter()
            .filter(|(id, stored)| id.group_kind() == gk && stored.object.matches_labels(selector))
            .map(|(_, stored)| stored.object.clone())
            .collect())
    }

    async fn apply(
        &self,
        resource: &Resource,
        params: &ApplyParams,
    ) -> Result<ApplyOutcome, ClusterError> {
        resource
            .validate_identity()
            .map_err(|e| ClusterError::Invalid(e.to_string()))?;

        let mut state = self.lock();
        state.authorize(&self.user, "patch", resource.kind(), resource.name())?;
        if !params.dry_run && state.failing_applies > 0 {
            state.failing_applies -= 1;
            return Err(ClusterError::Unavailable(format!(
                "injected failure applying {}",
                resource.id()
            )));
        }

        let id = state.resolve(&resource.gvk(), resource.namespace(), resource.name())?;
        if let Some(ns) = &id.namespace {
            if !state.namespace_exists(ns) {
                return Err(ClusterError::NamespaceNotFound(ns.clone()));
            }
        }

        let mut desired = normalized(resource.clone(), &id);
        desired.as_map_mut().remove("status");
        if let Some(Value::Object(metadata)) = desired.as_map_mut().get_mut("metadata") {
            metadata.remove("finalizers");
        }
        let desired_paths = owned_paths(&desired.to_value());

        let Some(stored) = state.objects.get(&id) else {
            if params.dry_run {
                return Ok(ApplyOutcome::Created);
            }
            let rv = state.next_resource_version();
            let mut object = desired;
            let metadata = object.get_or_insert_object(&["metadata"]);
            metadata.insert("generation".into(), Value::from(1));
            metadata.insert("resourceVersion".into(), Value::String(rv));
            metadata.insert("creationTimestamp".into(), Value::String(now()));

            if is_crd(&id) {
                state.register_crd(&object);
            }
            state.objects.insert(
                id.clone(),
                StoredObject {
                    object,
                    managers: BTreeMap::from([(params.field_manager.clone(), desired_paths)]),
                },
            );
            state.record("create", &id, &self.user);
            debug!(resource = %id, "Created object");
            return Ok(ApplyOutcome::Created);
        };

        if stored.object.get(&["metadata", "deletionTimestamp"]).is_some() {
            return Err(ClusterError::Conflict(format!("{id} is being deleted")));
        }

        let mut merged = stored.object.to_value();
        let previous = stored
            .managers
            .get(&params.field_manager)
            .cloned()
            .unwrap_or_default();
        for path in previous.difference(&desired_paths) {
            let shared = stored
                .managers
                .iter()
                .any(|(manager, paths)| *manager != params.field_manager && paths.contains(path));
            if !shared {
                remove_path(&mut merged, path);
            }
        }
        merge_patch(&mut merged, &desired.to_value());

        let merged = Resource::from_value(merged).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        let changed = merged != stored.object;
        let spec_changed = spec_view(&merged) != spec_view(&stored.object);

        if params.dry_run {
            return Ok(if changed {
                ApplyOutcome::Configured
            } else {
                ApplyOutcome::Unchanged
            });
        }

        if !changed {
            if let Some(stored) = state.objects.get_mut(&id) {
                stored
                    .managers
                    .insert(params.field_manager.clone(), desired_paths);
            }
            return Ok(ApplyOutcome::Unchanged);
        }

        let rv = state.next_resource_version();
        let mut object = merged;
        let generation = object.i64_field(&["metadata", "generation"]).unwrap_or(1);
        let metadata = object.get_or_insert_object(&["metadata"]);
        if spec_changed {
            metadata.insert("generation".into(), Value::from(generation + 1));
        }
        metadata.insert("resourceVersion".into(), Value::String(rv));

        if is_crd(&id) {
            state.register_crd(&object);
        }
        if let Some(stored) = state.objects.get_mut(&id) {
            stored.object = object;
            stored
                .managers
                .insert(params.field_manager.clone(), desired_paths);
        }
        state.record("update", &id, &self.user);
        debug!(resource = %id, "Configured object");
        Ok(ApplyOutcome::Configured)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, ClusterError> {
        let mut state = self.lock();
        state.authorize(&self.user, "delete", &gvk.kind, name)?;
        let id = state.resolve(gvk, namespace, name)?;
        let Some(stored) = state.objects.get(&id) else {
            return Ok(false);
        };

        let has_finalizers = stored
            .object
            .get(&["metadata", "finalizers"])
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        let terminating = stored.object.get(&["metadata", "deletionTimestamp"]).is_some();

        if has_finalizers {
            if !terminating {
                let rv = state.next_resource_version();
                if let Some(stored) = state.objects.get_mut(&id) {
                    let metadata = stored.object.get_or_insert_object(&["metadata"]);
                    metadata.insert("deletionTimestamp".into(), Value::String(now()));
                    metadata.insert("resourceVersion".into(), Value::String(rv));
                }
            }
        } else {
            state.remove_object(&id);
        }
        state.record("delete", &id, &self.user);
        Ok(true)
    }

    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        state.authorize(&self.user, "update", resource.kind(), resource.name())?;
        let id = state.resolve(&resource.gvk(), resource.namespace(), resource.name())?;
        let current_rv = state
            .objects
            .get(&id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?
            .object
            .str_field(&["metadata", "resourceVersion"])
            .map(str::to_string);

        if let Some(expected) = resource.str_field(&["metadata", "resourceVersion"]) {
            if current_rv.as_deref() != Some(expected) {
                return Err(ClusterError::Conflict(id.to_string()));
            }
        }

        let status = resource.get(&["status"]).cloned().unwrap_or(Value::Null);
        let unchanged = state
            .objects
            .get(&id)
            .is_some_and(|s| s.object.get(&["status"]).cloned().unwrap_or(Value::Null) == status);
        if unchanged {
            return state
                .objects
                .get(&id)
                .map(|s| s.object.clone())
                .ok_or_else(|| ClusterError::NotFound(id.to_string()));
        }

        let rv = state.next_resource_version();
        let stored = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        stored.object.as_map_mut().insert("status".into(), status);
        stored
            .object
            .get_or_insert_object(&["metadata"])
            .insert("resourceVersion".into(), Value::String(rv));
        let updated = stored.object.clone();
        state.record("update_status", &id, &self.user);
        Ok(updated)
    }

    async fn add_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<Resource, ClusterError> {
        let mut state = self.lock();
        state.authorize(&self.user, "update", &gvk.kind, name)?;
        let id = state.resolve(gvk, namespace, name)?;
        let rv = state.next_resource_version();
        let stored = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        let metadata = stored.object.get_or_insert_object(&["metadata"]);
        let finalizers = metadata
            .entry("finalizers")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !finalizers.is_array() {
            *finalizers = Value::Array(Vec::new());
        }
        if let Value::Array(list) = finalizers {
            if list.iter().any(|f| f.as_str() == Some(finalizer)) {
                return Ok(stored.object.clone());
            }
            list.push(Value::String(finalizer.to_string()));
        }
        metadata.insert("resourceVersion".into(), Value::String(rv));
        let updated = stored.object.clone();
        state.record("update", &id, &self.user);
        Ok(updated)
    }

    async fn remove_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.authorize(&self.user, "update", &gvk.kind, name)?;
        let id = state.resolve(gvk, namespace, name)?;
        let rv = state.next_resource_version();
        let stored = state
            .objects
            .get_mut(&id)
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;

        let metadata = stored.object.get_or_insert_object(&["metadata"]);
        let mut remaining = 0;
        if let Some(Value::Array(list)) = metadata.get_mut("finalizers") {
            list.retain(|f| f.as_str() != Some(finalizer));
            remaining = list.len();
        }
        metadata.insert("resourceVersion".into(), Value::String(rv));
        let terminating = metadata.contains_key("deletionTimestamp");

        if terminating && remaining == 0 {
            state.remove_object(&id);
        }
        state.record("update", &id, &self.user);
        Ok(())
    }

    fn impersonate(&self, user: &str) -> Arc<dyn ClusterClient> {
        Arc::new(Self {
            state: Arc::clone(&self.state),
            user: user.to_string(),
        })
    }
}
