//! Overlay synthesis in a staging directory.
//!
//! Before every build the staged overlay is prepared so the build engine
//! stamps ownership labels on its output:
//! - a build configuration is generated if the overlay has none
//! - a label transformer (`kustomization-gc-labels.yaml`) is written and
//!   referenced from the configuration
//! - image and target-namespace overrides from the spec are merged in
//!
//! The generation-token label is added in a second pass, once the token
//! of the token-free build is known.

mod config;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use convoy_manifest::{decode_documents, ManifestError};
use convoy_reconcile::GenerationToken;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use crate::api::{ImageOverride, Kustomization, CHECKSUM_LABEL, NAMESPACE_LABEL, NAME_LABEL};

pub use config::{BuildConfig, Image, Patch, PatchTarget, CONFIG_FILE_NAMES};

/// File name of the generated label transformer.
pub const TRANSFORMER_FILE: &str = "kustomization-gc-labels.yaml";

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to decode manifests from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: ManifestError,
    },

    #[error("path {0:?} escapes the source root")]
    InvalidPath(String),

    #[error("path {0} not found in source")]
    PathNotFound(String),
}

/// The parts of a Kustomization spec that shape the staged overlay.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub name: String,
    pub namespace: String,
    pub prune: bool,
    pub target_namespace: Option<String>,
    pub images: Vec<ImageOverride>,
}

impl OverlayOptions {
    pub fn from_kustomization(kustomization: &Kustomization) -> Self {
        Self {
            name: kustomization.metadata.name.clone(),
            namespace: kustomization.metadata.namespace.clone(),
            prune: kustomization.spec.prune,
            target_namespace: kustomization.spec.target_namespace.clone(),
            images: kustomization.spec.images.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LabelTransformer {
    api_version: &'static str,
    kind: &'static str,
    metadata: TransformerMeta,
    labels: BTreeMap<String, String>,
    field_specs: Vec<FieldSpec>,
}

#[derive(Serialize)]
struct TransformerMeta {
    name: String,
}

#[derive(Serialize)]
struct FieldSpec {
    path: &'static str,
    create: bool,
}

/// Resolve the overlay directory inside the fetched source tree.
pub fn resolve_build_dir(root: &Path, path: &str) -> Result<PathBuf, OverlayError> {
    let relative = Path::new(path);
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(OverlayError::InvalidPath(path.to_string()));
    }
    let dir = root.join(relative);
    if !dir.is_dir() {
        return Err(OverlayError::PathNotFound(path.to_string()));
    }
    Ok(dir)
}

/// Prepares staged overlays for one Kustomization.
pub struct OverlayBuilder {
    options: OverlayOptions,
}

impl OverlayBuilder {
    pub fn new(options: OverlayOptions) -> Self {
        Self { options }
    }

    /// Make `dir` buildable with ownership labels but no token yet.
    pub fn prepare(&self, dir: &Path) -> Result<(), OverlayError> {
        ensure_config(dir)?;
        self.write_transformer(dir, None)?;
        self.finalize_config(dir)
    }

    /// Rewrite the transformer to also stamp `token`. Only done with pruning on.
    pub fn stamp(&self, dir: &Path, token: &GenerationToken) -> Result<(), OverlayError> {
        self.write_transformer(dir, Some(token))
    }

    fn labels(&self, token: Option<&GenerationToken>) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (NAME_LABEL.to_string(), self.options.name.clone()),
            (NAMESPACE_LABEL.to_string(), self.options.namespace.clone()),
        ]);
        if let (true, Some(token)) = (self.options.prune, token) {
            labels.insert(CHECKSUM_LABEL.to_string(), token.to_string());
        }
        labels
    }

    fn write_transformer(&self, dir: &Path, token: Option<&GenerationToken>) -> Result<(), OverlayError> {
        let transformer = LabelTransformer {
            api_version: "builtin",
            kind: "LabelTransformer",
            metadata: TransformerMeta {
                name: self.options.name.clone(),
            },
            labels: self.labels(token),
            field_specs: vec![FieldSpec {
                path: "metadata/labels",
                create: true,
            }],
        };
        fs::write(dir.join(TRANSFORMER_FILE), serde_yaml::to_string(&transformer)?)?;
        Ok(())
    }

    /// Reference the transformer and merge image/namespace overrides.
    fn finalize_config(&self, dir: &Path) -> Result<(), OverlayError> {
        let path = BuildConfig::find(dir).unwrap_or_else(|| dir.join(CONFIG_FILE_NAMES[0]));
        let mut config = BuildConfig::load(&path)?;

        if !config.transformers.iter().any(|t| t == TRANSFORMER_FILE) {
            config.transformers.push(TRANSFORMER_FILE.to_string());
        }

        if let Some(namespace) = &self.options.target_namespace {
            config.namespace = Some(namespace.clone());
        }

        for image in &self.options.images {
            let replacement = Image {
                name: image.name.clone(),
                new_name: image.new_name.clone(),
                new_tag: image.new_tag.clone(),
                digest: image.digest.clone(),
            };
            match config.images.iter_mut().find(|i| i.name == image.name) {
                Some(existing) => *existing = replacement,
                None => config.images.push(replacement),
            }
        }

        config.save(&path)
    }
}

/// Generate a build configuration listing the overlay's manifests, unless
/// one exists. Returns true if a configuration was written.
pub fn ensure_config(dir: &Path) -> Result<bool, OverlayError> {
    if BuildConfig::find(dir).is_some() {
        return Ok(false);
    }

    let mut config = BuildConfig::new();
    config.resources = scan(dir)?;
    debug!(
        dir = %dir.display(),
        resources = config.resources.len(),
        "Generated build configuration"
    );
    config.save(&dir.join(CONFIG_FILE_NAMES[0]))?;
    Ok(true)
}

/// Collect `./`-relative resource paths under `root`.
///
/// Directories holding their own build configuration are listed as a
/// single entry and not descended into.
fn scan(root: &Path) -> Result<Vec<String>, OverlayError> {
    let mut paths = Vec::new();
    let mut walker = WalkDir::new(root).min_depth(1).sort_by_file_name().into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        let path = entry.path();

        if entry.file_type().is_dir() {
            if BuildConfig::find(path).is_some() {
                paths.push(relative(root, path));
                walker.skip_current_dir();
            }
            continue;
        }

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if !is_yaml {
            continue;
        }

        let text = fs::read_to_string(path)?;
        decode_documents(&text).map_err(|source| OverlayError::Decode {
            path: relative(root, path),
            source,
        })?;
        paths.push(relative(root, path));
    }

    Ok(paths)
}

fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    format!("./{}", parts.join("/"))
}
