//! Adapter for the external `kustomize` binary.

use std::path::{Path, PathBuf};
use std::process::Command;

use convoy_manifest::{decode_documents, Resource};
use tracing::debug;

use super::{BuildEngine, BuildError};

/// Runs `kustomize build` with plugins and exec functions left disabled.
#[derive(Debug, Clone)]
pub struct KustomizeCli {
    binary: PathBuf,
}

impl KustomizeCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl BuildEngine for KustomizeCli {
    fn name(&self) -> &str {
        "kustomize"
    }

    fn build(&self, dir: &Path) -> Result<Vec<Resource>, BuildError> {
        debug!(binary = %self.binary.display(), dir = %dir.display(), "Running kustomize build");
        let output = Command::new(&self.binary)
            .arg("build")
            .arg("--load-restrictor")
            .arg("LoadRestrictionsNone")
            .arg(dir)
            .env_remove("KUSTOMIZE_PLUGIN_HOME")
            .output()?;

        if !output.status.success() {
            return Err(BuildError::Engine {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        decode_documents(&stdout).map_err(|source| BuildError::Manifest {
            path: "kustomize output".to_string(),
            source,
        })
    }
}
