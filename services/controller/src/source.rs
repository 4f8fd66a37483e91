//! Source snapshot resolution and artifact fetching.
//!
//! A Kustomization points at a source object whose `status.artifact`
//! describes an immutable snapshot: a fetch URL, a revision and an optional
//! checksum. This module reads that descriptor and materializes the content
//! into a staging directory:
//! - `http://` / `https://`: a tarball downloaded with `reqwest`
//! - `file://` or a bare path: a directory tree or a local tarball

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use convoy_manifest::{GroupVersionKind, Resource};
use flate2::read::GzDecoder;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::api::{Kustomization, SOURCE_API_VERSION};
use crate::cluster::{ClusterClient, ClusterError};

/// Errors from resolving or fetching a source artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source {0} not found")]
    SourceNotFound(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fetching {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("artifact checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("unsupported artifact URL: {0}")]
    UnsupportedUrl(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Immutable reference to fetched content, as published by the source object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub url: String,
    pub revision: String,
    pub checksum: Option<String>,
    pub ready: bool,
}

impl SourceSnapshot {
    /// Read `status.artifact` and the Ready condition of a source object.
    pub fn from_resource(source: &Resource) -> Self {
        let url = source.str_field(&["status", "artifact", "url"]).unwrap_or_default();
        let revision = source
            .str_field(&["status", "artifact", "revision"])
            .unwrap_or_default();
        let checksum = source
            .str_field(&["status", "artifact", "checksum"])
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let ready_condition = source
            .get(&["status", "conditions"])
            .and_then(Value::as_array)
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            });

        Self {
            url: url.to_string(),
            revision: revision.to_string(),
            checksum,
            ready: ready_condition && !url.is_empty(),
        }
    }
}

/// Look up the source object referenced by `kustomization`.
pub async fn resolve_source(
    client: &dyn ClusterClient,
    kustomization: &Kustomization,
) -> Result<SourceSnapshot, FetchError> {
    let reference = &kustomization.spec.source_ref;
    let api_version = reference
        .api_version
        .as_deref()
        .unwrap_or(SOURCE_API_VERSION);
    let gvk = GroupVersionKind::from_api_version(api_version, &reference.kind);
    let namespace = reference
        .namespace
        .as_deref()
        .unwrap_or(&kustomization.metadata.namespace);

    let source = client
        .get(&gvk, Some(namespace), &reference.name)
        .await?
        .ok_or_else(|| {
            FetchError::SourceNotFound(format!("{}/{}/{}", reference.kind, namespace, reference.name))
        })?;
    Ok(SourceSnapshot::from_resource(&source))
}

/// Materializes a snapshot into a directory.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), FetchError>;
}

/// Downloads and unpacks tarballs over HTTP.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), FetchError> {
        debug!(url = %snapshot.url, "Downloading artifact");
        let response = self.client.get(&snapshot.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: snapshot.url.clone(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        verify_checksum(snapshot.checksum.as_deref(), &body)?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_archive(&body[..], &dest)).await??;

        info!(
            url = %snapshot.url,
            revision = %snapshot.revision,
            "Artifact unpacked"
        );
        Ok(())
    }
}

/// Copies a local directory or unpacks a local tarball.
#[derive(Debug, Default)]
pub struct LocalFetcher;

#[async_trait]
impl ArtifactFetcher for LocalFetcher {
    async fn fetch(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), FetchError> {
        let src = PathBuf::from(snapshot.url.strip_prefix("file://").unwrap_or(&snapshot.url));
        let checksum = snapshot.checksum.clone();
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || {
            if src.is_dir() {
                copy_tree(&src, &dest)
            } else {
                let mut data = Vec::new();
                File::open(&src)?.read_to_end(&mut data)?;
                verify_checksum(checksum.as_deref(), &data)?;
                unpack_archive(&data[..], &dest)
            }
        })
        .await??;
        Ok(())
    }
}

/// Dispatches on the artifact URL scheme.
pub struct SchemeFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl SchemeFetcher {
    pub fn new(http_timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(http_timeout)?,
            local: LocalFetcher,
        })
    }
}

#[async_trait]
impl ArtifactFetcher for SchemeFetcher {
    async fn fetch(&self, snapshot: &SourceSnapshot, dest: &Path) -> Result<(), FetchError> {
        let url = snapshot.url.as_str();
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.fetch(snapshot, dest).await
        } else if url.starts_with("file://") || url.starts_with('/') {
            self.local.fetch(snapshot, dest).await
        } else {
            Err(FetchError::UnsupportedUrl(snapshot.url.clone()))
        }
    }
}

/// Accepts `sha256:<hex>` or bare hex.
fn verify_checksum(expected: Option<&str>, data: &[u8]) -> Result<(), FetchError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
    let actual = hex::encode(Sha256::digest(data));
    if !actual.eq_ignore_ascii_case(expected_hex) {
        return Err(FetchError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Unpack a tar stream, gzipped or not, skipping entries that would escape `dest`.
fn unpack_archive(data: &[u8], dest: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(dest)?;
    if data.starts_with(&[0x1f, 0x8b]) {
        extract(&mut Archive::new(GzDecoder::new(data)), dest)
    } else {
        extract(&mut Archive::new(data), dest)
    }
}

/// Links are never materialized: a link entry could redirect later entries
/// out of `dest`.
fn extract<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), FetchError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping archive entry outside the destination");
            continue;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!(path = %path.display(), "Skipping link in archive");
            continue;
        }

        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "Skipping archive entry outside the destination");
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), FetchError> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(())
}
