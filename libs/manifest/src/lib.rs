//! # convoy-manifest
//!
//! Generic structured resources for the convoy reconciler.
//!
//! Cluster manifests are never modeled as a closed set of typed schemas.
//! Every document is a [`Resource`]: an untyped JSON object addressed by its
//! group/version/kind, namespace and name. This keeps the reconciler able to
//! apply, label and prune arbitrary kinds, including kinds introduced by
//! custom resource definitions in the same overlay.
//!
//! ## Modules
//!
//! - `merge`: JSON merge-patch helpers used by patches and field ownership
//! - `order`: the fixed apply-order policy for build output

mod merge;
mod order;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use merge::{merge_patch, owned_paths, remove_path};
pub use order::{kind_rank, sort_legacy, ORDER_FIRST, ORDER_LAST};

/// Errors from decoding or inspecting manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The YAML stream could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON conversion failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A document was not a mapping.
    #[error("document {index} is not an object")]
    NotAnObject { index: usize },

    /// A required identity field is missing.
    #[error("{resource}: missing required field {field}")]
    MissingField { resource: String, field: &'static str },
}

/// A Kubernetes-style group/version/kind triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    /// Build from an `apiVersion` string (`apps/v1`, `v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// Render the `apiVersion` field for this GVK.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Group and kind only; versions of one kind address the same objects.
    pub fn group_kind(&self) -> GroupKind {
        GroupKind {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// A group/kind pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Identity of a resource in the cluster: (group, kind, namespace, name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        group_kind: GroupKind,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group_kind.group,
            kind: group_kind.kind,
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.group_kind(), ns, self.name),
            None => write!(f, "{}/{}", self.group_kind(), self.name),
        }
    }
}

/// A generic manifest entry with an untyped field mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(Map<String, Value>);

impl Resource {
    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ManifestError::NotAnObject { index: 0 }),
        }
    }

    /// Create an empty resource with the given type and name.
    pub fn new(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(name.to_string()));
        if let Some(ns) = namespace {
            metadata.insert("namespace".into(), Value::String(ns.to_string()));
        }
        let mut map = Map::new();
        map.insert("apiVersion".into(), Value::String(gvk.api_version()));
        map.insert("kind".into(), Value::String(gvk.kind.clone()));
        map.insert("metadata".into(), Value::Object(metadata));
        Self(map)
    }

    pub fn api_version(&self) -> &str {
        self.str_field(&["apiVersion"]).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_field(&["kind"]).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_field(&["metadata", "name"]).unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_field(&["metadata", "namespace"])
            .filter(|ns| !ns.is_empty())
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(self.api_version(), self.kind())
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.gvk().group_kind(), self.namespace(), self.name())
    }

    /// Check that apiVersion, kind and metadata.name are present.
    pub fn validate_identity(&self) -> Result<(), ManifestError> {
        let describe = || format!("{}/{}", self.kind(), self.name());
        for (path, field) in [
            (&["apiVersion"][..], "apiVersion"),
            (&["kind"][..], "kind"),
            (&["metadata", "name"][..], "metadata.name"),
        ] {
            if self.str_field(path).map_or(true, str::is_empty) {
                return Err(ManifestError::MissingField {
                    resource: describe(),
                    field,
                });
            }
        }
        Ok(())
    }

    /// Look up a nested field.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for segment in rest {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current)
    }

    /// Look up a nested field, creating intermediate objects as needed.
    pub fn get_or_insert_object(&mut self, path: &[&str]) -> &mut Map<String, Value> {
        let mut current = &mut self.0;
        for segment in path {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        current
    }

    pub fn str_field(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn i64_field(&self, path: &[&str]) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// String labels from `metadata.labels`.
    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.get(&["metadata", "labels"]))
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "labels", key]).and_then(Value::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.get_or_insert_object(&["metadata", "labels"])
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.get(&["metadata", "annotations"]))
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "annotations", key])
            .and_then(Value::as_str)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.get_or_insert_object(&["metadata"])
            .insert("namespace".into(), Value::String(namespace.to_string()));
    }

    /// True when every key/value of `selector` is present in the labels.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| self.label(key) == Some(value.as_str()))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a multi-document YAML stream into resources.
///
/// Empty documents are skipped and `*List` kinds are flattened into their
/// items.
pub fn decode_documents(text: &str) -> Result<Vec<Resource>, ManifestError> {
    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document)?;
        match value {
            Value::Null => continue,
            Value::Object(map) => {
                let resource = Resource(map);
                if resource.kind().ends_with("List") {
                    if let Some(Value::Array(items)) = resource.get(&["items"]) {
                        for item in items {
                            match item {
                                Value::Object(map) => resources.push(Resource(map.clone())),
                                _ => return Err(ManifestError::NotAnObject { index }),
                            }
                        }
                        continue;
                    }
                }
                resources.push(resource);
            }
            _ => return Err(ManifestError::NotAnObject { index }),
        }
    }
    Ok(resources)
}

/// Encode resources as a multi-document YAML stream.
pub fn encode_documents(resources: &[Resource]) -> Result<String, ManifestError> {
    let mut out = String::new();
    for resource in resources {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(resource)?);
    }
    Ok(out)
}
