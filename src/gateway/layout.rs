use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::memory::media_type_of;
use super::tag_index::TagIndex;
use super::traits::{Connector, Descriptor, Manifest, RegistryGateway};
use crate::error::GatewayError;
use crate::reference::Digest;

const TAG_INDEX_FILE: &str = "tags.yaml";

/// Local registry mirror on disk.
///
/// Layout under the registry directory:
/// - `<repository>/tags.yaml` marks a repository and maps tags to digests
/// - `<repository>/blobs/<algorithm>/<hex>` holds manifest bytes
///
/// Referrers are found by scanning the repository's manifests for a
/// `subject` pointing at the requested digest.
#[derive(Debug, Clone)]
pub struct LayoutGateway {
    base_path: PathBuf,
}

/// The fields of a manifest needed to describe it as a referrer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFields {
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    config: Option<ConfigField>,
    #[serde(default)]
    subject: Option<SubjectField>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigField {
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct SubjectField {
    digest: String,
}

impl LayoutGateway {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        LayoutGateway {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn repository_dir(&self, repository: &str) -> PathBuf {
        self.base_path.join(repository)
    }

    fn tag_index_path(&self, repository: &str) -> PathBuf {
        self.repository_dir(repository).join(TAG_INDEX_FILE)
    }

    fn blob_path(&self, repository: &str, digest: &Digest) -> PathBuf {
        self.repository_dir(repository)
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Store a manifest, optionally tagging it, and return its digest.
    /// Blobs are immutable: an existing blob is never rewritten.
    pub fn put_manifest(&self, repository: &str, json: &str, tag: Option<&str>) -> Result<String> {
        let digest = Digest::sha256_of(json.as_bytes());
        let path = self.blob_path(repository, &digest);

        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create blob directory {:?}", parent))?;
            }
            fs::write(&path, json).with_context(|| format!("Failed to write blob {:?}", path))?;
        }

        let index_path = self.tag_index_path(repository);
        let mut index = TagIndex::load(&index_path)?;
        if let Some(tag) = tag {
            index.set(tag, &digest.to_string());
        }
        index.save(&index_path)?;

        tracing::debug!("Stored manifest {} in {}", digest, repository);
        Ok(digest.to_string())
    }

    fn read_repositories(&self) -> Result<Vec<String>, GatewayError> {
        let mut repositories = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            if dir.join(TAG_INDEX_FILE).is_file() {
                let name = dir
                    .strip_prefix(&self.base_path)
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !name.is_empty() {
                    repositories.push(name);
                }
            }
            for entry in fs::read_dir(&dir).map_err(io_error)? {
                let entry = entry.map_err(io_error)?;
                if entry.file_type().map_err(io_error)?.is_dir() && entry.file_name() != "blobs" {
                    pending.push(entry.path());
                }
            }
        }

        repositories.sort();
        Ok(repositories)
    }

    fn read_tag_index(&self, repository: &str) -> Result<TagIndex, GatewayError> {
        let path = self.tag_index_path(repository);
        if !path.is_file() {
            return Err(GatewayError::NotFound(format!("repository {}", repository)));
        }
        TagIndex::load(&path).map_err(|e| GatewayError::InvalidResponse(format!("{:#}", e)))
    }

    fn read_manifest(&self, repository: &str, digest: &str) -> Result<Manifest, GatewayError> {
        let parsed = Digest::parse(digest)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let path = self.blob_path(repository, &parsed);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(format!("manifest {}", digest)));
            }
            Err(e) => return Err(io_error(e)),
        };

        Ok(Manifest {
            digest: digest.to_string(),
            media_type: media_type_of(&json),
            json,
        })
    }

    fn read_referrers(&self, repository: &str, digest: &str) -> Result<Vec<Descriptor>, GatewayError> {
        // Make sure the repository exists before scanning
        self.read_tag_index(repository)?;

        let blobs_dir = self.repository_dir(repository).join("blobs");
        if !blobs_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut referrers = Vec::new();
        for algorithm_dir in fs::read_dir(&blobs_dir).map_err(io_error)? {
            let algorithm_dir = algorithm_dir.map_err(io_error)?;
            let algorithm = algorithm_dir.file_name().to_string_lossy().to_string();

            for blob in fs::read_dir(algorithm_dir.path()).map_err(io_error)? {
                let blob = blob.map_err(io_error)?;
                let content = fs::read_to_string(blob.path()).map_err(io_error)?;

                let Ok(fields) = serde_json::from_str::<ManifestFields>(&content) else {
                    tracing::debug!("Skipping non-manifest blob {:?}", blob.path());
                    continue;
                };
                if fields.subject.as_ref().map(|s| s.digest.as_str()) != Some(digest) {
                    continue;
                }

                let artifact_type = fields
                    .artifact_type
                    .or_else(|| fields.config.map(|c| c.media_type))
                    .unwrap_or_default();
                referrers.push(Descriptor {
                    digest: format!("{}:{}", algorithm, blob.file_name().to_string_lossy()),
                    artifact_type,
                    media_type: media_type_of(&content),
                    size: content.len() as u64,
                    annotations: fields.annotations,
                });
            }
        }

        referrers.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(referrers)
    }

    fn remove_manifest(&self, repository: &str, digest: &str) -> Result<(), GatewayError> {
        let parsed = Digest::parse(digest)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let path = self.blob_path(repository, &parsed);
        if !path.exists() {
            return Err(GatewayError::NotFound(format!("manifest {}", digest)));
        }

        let index_path = self.tag_index_path(repository);
        let mut index = self.read_tag_index(repository)?;
        let untagged = index.remove_digest(digest);
        index
            .save(&index_path)
            .map_err(|e| GatewayError::Unreachable(format!("{:#}", e)))?;
        fs::remove_file(&path).map_err(io_error)?;

        tracing::info!("Deleted {} from {} ({} tag(s) removed)", digest, repository, untagged);
        Ok(())
    }

    /// Run a blocking filesystem operation off the async executor
    async fn blocking<T, F>(&self, op: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(LayoutGateway) -> Result<T, GatewayError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || op(this))
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?
    }
}

#[async_trait]
impl RegistryGateway for LayoutGateway {
    async fn list_repositories(&self) -> Result<Vec<String>, GatewayError> {
        self.blocking(|gw| gw.read_repositories()).await
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, GatewayError> {
        let repository = repository.to_string();
        self.blocking(move |gw| {
            let index = gw.read_tag_index(&repository)?;
            Ok(index.names().cloned().collect())
        })
        .await
    }

    async fn manifest_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Manifest, GatewayError> {
        let repository = repository.to_string();
        let tag = tag.to_string();
        self.blocking(move |gw| {
            let index = gw.read_tag_index(&repository)?;
            let digest = index
                .get(&tag)
                .ok_or_else(|| GatewayError::NotFound(format!("tag {}:{}", repository, tag)))?;
            gw.read_manifest(&repository, digest)
        })
        .await
    }

    async fn manifest_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Manifest, GatewayError> {
        let repository = repository.to_string();
        let digest = digest.to_string();
        self.blocking(move |gw| {
            gw.read_tag_index(&repository)?;
            gw.read_manifest(&repository, &digest)
        })
        .await
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<Descriptor>, GatewayError> {
        let repository = repository.to_string();
        let digest = digest.to_string();
        self.blocking(move |gw| gw.read_referrers(&repository, &digest))
            .await
    }

    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), GatewayError> {
        let repository = repository.to_string();
        let digest = digest.to_string();
        self.blocking(move |gw| gw.remove_manifest(&repository, &digest))
            .await
    }
}

/// Connector mapping each registry host to a directory under `root`
#[derive(Debug, Clone)]
pub struct LayoutConnector {
    root: PathBuf,
}

impl LayoutConnector {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LayoutConnector {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Directory holding a registry's repositories (`:` in a host is replaced by `_`)
    pub fn registry_dir(&self, registry: &str) -> PathBuf {
        self.root.join(registry.replace(':', "_"))
    }

    pub fn gateway(&self, registry: &str) -> LayoutGateway {
        LayoutGateway::new(self.registry_dir(registry))
    }
}

#[async_trait]
impl Connector for LayoutConnector {
    async fn connect(&self, registry: &str) -> Result<Arc<dyn RegistryGateway>, GatewayError> {
        // The host must name a single directory directly under the root
        let host = registry.replace(':', "_");
        let mut components = Path::new(&host).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(GatewayError::Unreachable(format!(
                "{:?} is not a registry host",
                registry
            )));
        }

        let dir = self.registry_dir(registry);
        if !dir.is_dir() {
            return Err(GatewayError::Unreachable(format!(
                "no local registry at {:?}",
                dir
            )));
        }
        tracing::debug!("Opened registry {} at {:?}", registry, dir);
        Ok(Arc::new(LayoutGateway::new(dir)))
    }
}

fn io_error(e: io::Error) -> GatewayError {
    match e.kind() {
        io::ErrorKind::NotFound => GatewayError::NotFound(e.to_string()),
        io::ErrorKind::PermissionDenied => GatewayError::Unauthorized(e.to_string()),
        _ => GatewayError::Unreachable(e.to_string()),
    }
}
