//! Two-pass rendering of a staged overlay.
//!
//! 1. Prepare the overlay with ownership labels only, build, substitute.
//! 2. Hash that token-free result into a [`GenerationToken`].
//! 3. With pruning enabled, stamp the token into the label transformer,
//!    rebuild and substitute again. The second result is authoritative.
//!
//! Everything here is blocking filesystem and process work; callers run it
//! on the blocking pool.

use std::collections::BTreeMap;
use std::path::Path;

use convoy_manifest::{decode_documents, encode_documents, ManifestError, Resource};
use convoy_reconcile::{substitute, GenerationToken, SubstituteError};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::build::{build_ordered, BuildEngine, BuildError};
use crate::overlay::{OverlayBuilder, OverlayError, OverlayOptions};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("post-build substitution failed: {0}")]
    Substitute(#[from] SubstituteError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Final resource set of one pass.
#[derive(Debug, Clone)]
pub struct Rendered {
    /// In apply order.
    pub resources: Vec<Resource>,
    pub token: GenerationToken,
}

pub fn render(
    engine: &dyn BuildEngine,
    dir: &Path,
    options: OverlayOptions,
    vars: &BTreeMap<String, String>,
) -> Result<Rendered, RenderError> {
    let prune = options.prune;
    let builder = OverlayBuilder::new(options);
    builder.prepare(dir)?;

    let first = build_substituted(engine, dir, vars)?;
    let values: Vec<Value> = first.iter().map(Resource::to_value).collect();
    let token = GenerationToken::from_resources(&values);
    debug!(engine = engine.name(), token = %token, resources = first.len(), "Computed generation token");

    if !prune {
        return Ok(Rendered {
            resources: first,
            token,
        });
    }

    builder.stamp(dir, &token)?;
    let resources = build_substituted(engine, dir, vars)?;
    Ok(Rendered { resources, token })
}

fn build_substituted(
    engine: &dyn BuildEngine,
    dir: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<Vec<Resource>, RenderError> {
    let resources = build_ordered(engine, dir)?;
    if vars.is_empty() {
        return Ok(resources);
    }
    let text = encode_documents(&resources)?;
    let expanded = substitute(&text, vars)?;
    Ok(decode_documents(&expanded)?)
}
