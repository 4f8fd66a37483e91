//! Builtin composer for plain overlays.
//!
//! Handles the subset of build configuration features that plain overlays
//! use, without shelling out:
//! - `resources`: manifest files and nested overlay directories
//! - `patchesStrategicMerge` and `patches`, applied as JSON merge patches
//! - `namespace`, `commonLabels`, `images`
//! - `transformers`: builtin `LabelTransformer` documents only
//!
//! Anything that would execute or fetch external code is rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use convoy_manifest::{decode_documents, merge_patch, Resource};
use serde_json::{Map, Value};

use super::{BuildEngine, BuildError};
use crate::overlay::{BuildConfig, Image, PatchTarget};

/// Nested overlays deeper than this are assumed to be cyclic.
const MAX_DEPTH: usize = 32;

/// Kinds without a namespace; `namespace:` leaves them alone.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
    "PodSecurityPolicy",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct Composer;

impl BuildEngine for Composer {
    fn name(&self) -> &str {
        "builtin"
    }

    fn build(&self, dir: &Path) -> Result<Vec<Resource>, BuildError> {
        compose(dir, 0)
    }
}

fn compose(dir: &Path, depth: usize) -> Result<Vec<Resource>, BuildError> {
    if depth > MAX_DEPTH {
        return Err(BuildError::TooDeep(dir.display().to_string()));
    }
    let config_path = BuildConfig::find(dir)
        .ok_or_else(|| BuildError::MissingConfig(dir.display().to_string()))?;
    let config = BuildConfig::load(&config_path)?;

    let mut resources = Vec::new();
    for entry in &config.resources {
        if entry.contains("://") {
            return Err(BuildError::RemoteResource(entry.clone()));
        }
        let path = dir.join(entry);
        if path.is_dir() {
            resources.extend(compose(&path, depth + 1)?);
        } else {
            resources.extend(load_manifests(&path)?);
        }
    }

    let mut seen = BTreeSet::new();
    for resource in &resources {
        if !seen.insert(resource.id()) {
            return Err(BuildError::DuplicateResource(resource.id().to_string()));
        }
    }

    for file in &config.patches_strategic_merge {
        for patch in load_manifests(&dir.join(file))? {
            apply_patch(&mut resources, &patch, None)?;
        }
    }
    for entry in &config.patches {
        let documents = match (&entry.patch, &entry.path) {
            (Some(inline), _) => decode_documents(inline).map_err(|source| BuildError::Manifest {
                path: "inline patch".to_string(),
                source,
            })?,
            (None, Some(file)) => load_manifests(&dir.join(file))?,
            (None, None) => Vec::new(),
        };
        for patch in &documents {
            apply_patch(&mut resources, patch, entry.target.as_ref())?;
        }
    }

    if let Some(namespace) = &config.namespace {
        let cluster_kinds = cluster_scoped_kinds(&resources);
        for resource in resources.iter_mut() {
            if !cluster_kinds.contains(resource.kind()) {
                resource.set_namespace(namespace);
            }
        }
    }

    for resource in resources.iter_mut() {
        for (key, value) in &config.common_labels {
            resource.set_label(key, value);
        }
    }

    if !config.images.is_empty() {
        for resource in resources.iter_mut() {
            rewrite_images(resource.as_map_mut(), &config.images);
        }
    }

    for file in &config.transformers {
        for transformer in load_manifests(&dir.join(file))? {
            if transformer.api_version() != "builtin" || transformer.kind() != "LabelTransformer" {
                return Err(BuildError::DisallowedExtension(format!(
                    "{}/{} in {}",
                    transformer.api_version(),
                    transformer.kind(),
                    file
                )));
            }
            apply_label_transformer(&mut resources, &transformer);
        }
    }

    Ok(resources)
}

fn load_manifests(path: &Path) -> Result<Vec<Resource>, BuildError> {
    let text = fs::read_to_string(path)?;
    decode_documents(&text).map_err(|source| BuildError::Manifest {
        path: path.display().to_string(),
        source,
    })
}

fn cluster_scoped_kinds(resources: &[Resource]) -> BTreeSet<String> {
    let mut kinds: BTreeSet<String> = CLUSTER_SCOPED.iter().map(|k| k.to_string()).collect();
    for crd in resources.iter().filter(|r| r.kind() == "CustomResourceDefinition") {
        if crd.str_field(&["spec", "scope"]) == Some("Cluster") {
            if let Some(kind) = crd.str_field(&["spec", "names", "kind"]) {
                kinds.insert(kind.to_string());
            }
        }
    }
    kinds
}

fn matches_target(resource: &Resource, target: &PatchTarget) -> bool {
    let gvk = resource.gvk();
    target.group.as_deref().map_or(true, |g| g == gvk.group)
        && target.version.as_deref().map_or(true, |v| v == gvk.version)
        && target.kind.as_deref().map_or(true, |k| k == gvk.kind)
        && target.name.as_deref().map_or(true, |n| n == resource.name())
        && target
            .namespace
            .as_deref()
            .map_or(true, |ns| Some(ns) == resource.namespace())
}

/// Merge `patch` into its targets.
///
/// Without an explicit target the patch addresses the resource with its
/// own kind and name. A patch may never rename or re-kind its target.
fn apply_patch(
    resources: &mut [Resource],
    patch: &Resource,
    target: Option<&PatchTarget>,
) -> Result<(), BuildError> {
    let implicit;
    let target = match target {
        Some(target) => target,
        None => {
            implicit = PatchTarget {
                kind: Some(patch.kind().to_string()),
                name: Some(patch.name().to_string()),
                namespace: patch.namespace().map(str::to_string),
                ..PatchTarget::default()
            };
            &implicit
        }
    };

    let mut matched = false;
    for resource in resources.iter_mut().filter(|r| matches_target(r, target)) {
        // A target without a name or kind lets the patch body carry any placeholder.
        let renames = target.name.is_some() && !patch.name().is_empty() && patch.name() != resource.name();
        let rekinds = target.kind.is_some() && !patch.kind().is_empty() && patch.kind() != resource.kind();
        if renames || rekinds {
            return Err(BuildError::IdentityChange {
                target: resource.id().to_string(),
                patch: format!("{}/{}", patch.kind(), patch.name()),
            });
        }

        let mut value = resource.to_value();
        merge_patch(&mut value, &patch.to_value());
        if let Value::Object(map) = value {
            *resource.as_map_mut() = map;
        }
        matched = true;
    }

    if !matched {
        return Err(BuildError::PatchTarget(format!(
            "{}/{}",
            target.kind.as_deref().unwrap_or("*"),
            target.name.as_deref().unwrap_or("*")
        )));
    }
    Ok(())
}

fn apply_label_transformer(resources: &mut [Resource], transformer: &Resource) {
    let labels: BTreeMap<String, String> = transformer
        .get(&["labels"])
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let mut specs: Vec<(Vec<String>, bool)> = transformer
        .get(&["fieldSpecs"])
        .and_then(Value::as_array)
        .map(|specs| {
            specs
                .iter()
                .filter_map(|spec| {
                    let path = spec.get("path")?.as_str()?;
                    let create = spec.get("create").and_then(Value::as_bool).unwrap_or(false);
                    Some((path.split('/').map(str::to_string).collect(), create))
                })
                .collect()
        })
        .unwrap_or_default();
    if specs.is_empty() {
        specs.push((vec!["metadata".to_string(), "labels".to_string()], true));
    }

    for resource in resources.iter_mut() {
        for (path, create) in &specs {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            if !create && resource.get(&segments).is_none() {
                continue;
            }
            let target = resource.get_or_insert_object(&segments);
            for (key, value) in &labels {
                target.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }
}

fn rewrite_images(map: &mut Map<String, Value>, images: &[Image]) {
    for (key, child) in map.iter_mut() {
        if key == "containers" || key == "initContainers" {
            if let Value::Array(containers) = child {
                for container in containers {
                    if let Some(Value::String(image)) = container.get_mut("image") {
                        if let Some(updated) = rewrite_image(image, images) {
                            *image = updated;
                        }
                    }
                }
            }
            continue;
        }
        match child {
            Value::Object(inner) => rewrite_images(inner, images),
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(inner) = item {
                        rewrite_images(inner, images);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Split `registry/name:tag` or `name@digest` into name and suffix.
fn split_image(reference: &str) -> (&str, &str) {
    if let Some(at) = reference.find('@') {
        return reference.split_at(at);
    }
    let start = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[start..].rfind(':') {
        Some(colon) => reference.split_at(start + colon),
        None => (reference, ""),
    }
}

fn rewrite_image(reference: &str, images: &[Image]) -> Option<String> {
    let (name, suffix) = split_image(reference);
    let image = images.iter().find(|i| i.name == name)?;
    let new_name = image.new_name.as_deref().unwrap_or(name);
    let suffix = match (&image.digest, &image.new_tag) {
        (Some(digest), _) => format!("@{digest}"),
        (None, Some(tag)) => format!(":{tag}"),
        (None, None) => suffix.to_string(),
    };
    Some(format!("{new_name}{suffix}"))
}
