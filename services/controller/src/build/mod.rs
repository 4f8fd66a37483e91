//! Build engine adapters.
//!
//! A build engine turns a prepared overlay directory into a flat list of
//! resources. Engines are treated as pure functions: no cluster access, no
//! state between calls. Output order is always normalized here with
//! [`sort_legacy`], whatever order the engine produced.

mod composer;
mod kustomize;

use std::path::Path;

use convoy_manifest::{sort_legacy, ManifestError, Resource};
use thiserror::Error;

use crate::overlay::OverlayError;

pub use composer::Composer;
pub use kustomize::KustomizeCli;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("build configuration error: {0}")]
    Config(#[from] OverlayError),

    #[error("failed to decode {path}: {source}")]
    Manifest {
        path: String,
        #[source]
        source: ManifestError,
    },

    #[error("no build configuration in {0}")]
    MissingConfig(String),

    #[error("disallowed extension {0}: only builtin label transformers are supported")]
    DisallowedExtension(String),

    #[error("remote resource {0} is not supported")]
    RemoteResource(String),

    #[error("patch for {target} would change its identity to {patch}")]
    IdentityChange { target: String, patch: String },

    #[error("no resource matches patch target {0}")]
    PatchTarget(String),

    #[error("resource {0} is declared more than once")]
    DuplicateResource(String),

    #[error("overlay nesting too deep at {0}")]
    TooDeep(String),

    #[error("kustomize exited with {status}: {stderr}")]
    Engine { status: String, stderr: String },
}

/// Directory in, resources out.
pub trait BuildEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Build the overlay in `dir`. Order of the result is unspecified.
    fn build(&self, dir: &Path) -> Result<Vec<Resource>, BuildError>;
}

/// Build `dir` with `engine` and sort the result into apply order.
pub fn build_ordered(engine: &dyn BuildEngine, dir: &Path) -> Result<Vec<Resource>, BuildError> {
    let mut resources = engine.build(dir)?;
    sort_legacy(&mut resources);
    Ok(resources)
}
