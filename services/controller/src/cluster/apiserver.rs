//! Kubernetes API server adapter.
//!
//! Kinds are resolved through discovery and addressed as
//! [`DynamicObject`]s, so any kind the server serves (including CRDs
//! applied earlier in the same pass) can be applied and pruned. Resolved
//! kinds are cached for the life of the process; misses are not cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use convoy_manifest::{GroupVersionKind, Resource};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::ApiResource;
use kube::error::ErrorResponse;
use kube::discovery::{self, Scope};
use serde_json::{json, Value};
use tracing::debug;

use super::{ApplyOutcome, ApplyParams, ClusterClient, ClusterError};

/// Identity reported in errors when no impersonation is configured.
const SERVICE_ACCOUNT: &str = "controller service account";

type KindCache = Arc<Mutex<HashMap<GroupVersionKind, (ApiResource, bool)>>>;

/// [`ClusterClient`] backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    config: kube::Config,
    /// Client for this identity. A client that failed to build reports its
    /// error on every call instead of at impersonation time.
    client: Result<kube::Client, String>,
    user: String,
    kinds: KindCache,
}

impl KubeCluster {
    /// Connect with the kubeconfig or in-cluster environment.
    pub async fn infer() -> anyhow::Result<Self> {
        let config = kube::Config::infer().await?;
        Ok(Self::new(config)?)
    }

    pub fn new(config: kube::Config) -> Result<Self, kube::Error> {
        let client = kube::Client::try_from(config.clone())?;
        Ok(Self {
            config,
            client: Ok(client),
            user: SERVICE_ACCOUNT.to_string(),
            kinds: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn client(&self) -> Result<kube::Client, ClusterError> {
        self.client.clone().map_err(ClusterError::Unavailable)
    }

    fn kinds(&self) -> MutexGuard<'_, HashMap<GroupVersionKind, (ApiResource, bool)>> {
        self.kinds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a kind to its API resource and whether it is namespaced.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(found) = self.kinds().get(gvk) {
            return Ok(found.clone());
        }

        let client = self.client()?;
        let target = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (resource, caps) = match discovery::pinned_kind(&client, &target).await {
            Ok(found) => found,
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                return Err(ClusterError::NoKindMatch(gvk.to_string()))
            }
            Err(kube::Error::Discovery(_)) => return Err(ClusterError::NoKindMatch(gvk.to_string())),
            Err(e) => return Err(self.error(e, "get", &gvk.to_string())),
        };
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(kind = %gvk, plural = %resource.plural, namespaced, "Resolved kind");

        self.kinds()
            .insert(gvk.clone(), (resource.clone(), namespaced));
        Ok((resource, namespaced))
    }

    /// API handle for one object of `gvk`.
    async fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource), ClusterError> {
        let (resource, namespaced) = self.resolve(gvk).await?;
        let client = self.client()?;
        let api = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &resource),
            (true, None) => Api::default_namespaced_with(client, &resource),
            (false, _) => Api::all_with(client, &resource),
        };
        Ok((api, resource))
    }

    fn error(&self, err: kube::Error, verb: &'static str, target: &str) -> ClusterError {
        match err {
            kube::Error::Api(resp) => from_response(&resp, &self.user, verb, target),
            kube::Error::Discovery(e) => ClusterError::NoKindMatch(format!("{target}: {e}")),
            other => ClusterError::Unavailable(other.to_string()),
        }
    }
}

/// Map an API error response onto [`ClusterError`].
fn from_response(resp: &ErrorResponse, user: &str, verb: &'static str, target: &str) -> ClusterError {
    match resp.code {
        404 if resp.message.starts_with("namespaces ") => {
            let namespace = resp.message.split('"').nth(1).unwrap_or_default();
            ClusterError::NamespaceNotFound(namespace.to_string())
        }
        404 => ClusterError::NotFound(target.to_string()),
        409 => ClusterError::Conflict(target.to_string()),
        403 => ClusterError::Forbidden {
            user: user.to_string(),
            verb,
            resource: target.to_string(),
        },
        400 | 422 => ClusterError::Invalid(format!("{target}: {}", resp.message)),
        _ => ClusterError::Unavailable(format!("{target}: {} ({})", resp.message, resp.code)),
    }
}

/// Render a label selector as `key=value,...`.
fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert a served object. List items carry no type meta, so apiVersion
/// and kind are always taken from the resolved kind.
fn to_resource(object: DynamicObject, resource: &ApiResource) -> Result<Resource, ClusterError> {
    let mut value = serde_json::to_value(&object).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("apiVersion".into(), Value::String(resource.api_version.clone()));
        map.insert("kind".into(), Value::String(resource.kind.clone()));
    }
    Resource::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
}

/// Strip fields the server rewrites on every write.
fn comparable(resource: &Resource) -> Value {
    let mut value = resource.to_value();
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in ["resourceVersion", "generation", "managedFields"] {
            metadata.remove(field);
        }
    }
    value
}

fn display(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Resource>, ClusterError> {
        let (api, resource) = self.api(gvk, namespace).await?;
        let target = format!("{} {}", gvk.kind, display(namespace, name));
        match api.get_opt(name).await {
            Ok(Some(object)) => to_resource(object, &resource).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.error(e, "get", &target)),
        }
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Resource>, ClusterError> {
        let (resource, _) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client()?, &resource);
        let params = ListParams::default().labels(&label_selector(selector));
        let objects = api
            .list(&params)
            .await
            .map_err(|e| self.error(e, "list", &gvk.kind))?;
        objects
            .items
            .into_iter()
            .map(|object| to_resource(object, &resource))
            .collect()
    }

    async fn apply(
        &self,
        resource: &Resource,
        params: &ApplyParams,
    ) -> Result<ApplyOutcome, ClusterError> {
        let gvk = resource.gvk();
        let (api, served) = self.api(&gvk, resource.namespace()).await?;
        let target = resource.id().to_string();

        let before = match api.get_opt(resource.name()).await {
            Ok(found) => found.map(|o| to_resource(o, &served)).transpose()?,
            Err(e) => return Err(self.error(e, "get", &target)),
        };

        let mut patch_params = PatchParams::apply(&params.field_manager).force();
        if params.dry_run {
            patch_params = patch_params.dry_run();
        }
        let after = api
            .patch(resource.name(), &patch_params, &Patch::Apply(resource.to_value()))
            .await
            .map_err(|e| match self.error(e, "patch", &target) {
                ClusterError::NamespaceNotFound(ns) if ns.is_empty() => {
                    ClusterError::NamespaceNotFound(resource.namespace().unwrap_or_default().to_string())
                }
                other => other,
            })?;
        let after = to_resource(after, &served)?;

        let Some(before) = before else {
            return Ok(ApplyOutcome::Created);
        };
        let changed = if params.dry_run {
            comparable(&before) != comparable(&after)
        } else {
            before.str_field(&["metadata", "resourceVersion"]) != after.str_field(&["metadata", "resourceVersion"])
        };
        Ok(if changed {
            ApplyOutcome::Configured
        } else {
            ApplyOutcome::Unchanged
        })
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, ClusterError> {
        let (api, _) = self.api(gvk, namespace).await?;
        let target = format!("{} {}", gvk.kind, display(namespace, name));
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) => match self.error(e, "delete", &target) {
                ClusterError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn update_status(&self, resource: &Resource) -> Result<Resource, ClusterError> {
        let gvk = resource.gvk();
        let (api, served) = self.api(&gvk, resource.namespace()).await?;
        let target = resource.id().to_string();

        let mut patch = json!({"status": resource.get(&["status"]).cloned().unwrap_or(Value::Null)});
        if let Some(rv) = resource.str_field(&["metadata", "resourceVersion"]) {
            patch["metadata"] = json!({"resourceVersion": rv});
        }
        let updated = api
            .patch_status(resource.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.error(e, "update", &target))?;
        to_resource(updated, &served)
    }

    async fn add_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<Resource, ClusterError> {
        let (api, served) = self.api(gvk, namespace).await?;
        let target = format!("{} {}", gvk.kind, display(namespace, name));
        let current = api
            .get_opt(name)
            .await
            .map_err(|e| self.error(e, "get", &target))?
            .ok_or_else(|| ClusterError::NotFound(target.clone()))?;

        let mut finalizers = current.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return to_resource(current, &served);
        }
        finalizers.push(finalizer.to_string());

        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": current.metadata.resource_version,
            }
        });
        let updated = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.error(e, "update", &target))?;
        to_resource(updated, &served)
    }

    async fn remove_finalizer(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        finalizer: &str,
    ) -> Result<(), ClusterError> {
        let (api, _) = self.api(gvk, namespace).await?;
        let target = format!("{} {}", gvk.kind, display(namespace, name));
        let current = api
            .get_opt(name)
            .await
            .map_err(|e| self.error(e, "get", &target))?
            .ok_or_else(|| ClusterError::NotFound(target.clone()))?;

        let finalizers = current.metadata.finalizers.clone().unwrap_or_default();
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining: Vec<_> = finalizers.into_iter().filter(|f| f != finalizer).collect();

        let patch = json!({
            "metadata": {
                "finalizers": remaining,
                "resourceVersion": current.metadata.resource_version,
            }
        });
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            // The last finalizer is gone and the server already removed the object.
            Err(e) => match self.error(e, "update", &target) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn impersonate(&self, user: &str) -> Arc<dyn ClusterClient> {
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(user.to_string());
        let client = kube::Client::try_from(config.clone()).map_err(|e| format!("impersonating {user}: {e}"));
        Arc::new(Self {
            config,
            client,
            user: user.to_string(),
            kinds: Arc::clone(&self.kinds),
        })
    }
}
