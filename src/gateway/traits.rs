use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Media type assumed when a manifest does not declare one
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// A manifest as served by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Digest of the exact bytes in `json`
    pub digest: String,
    pub media_type: String,
    pub json: String,
}

/// An entry returned by the referrers API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub digest: String,
    #[serde(default)]
    pub artifact_type: String,
    pub media_type: String,
    pub size: u64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Operations the core consumes from a registry.
/// Implementations own all protocol and authentication details.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// List repository names known to the registry
    async fn list_repositories(&self) -> Result<Vec<String>, GatewayError>;

    /// List tag names in a repository
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, GatewayError>;

    /// Fetch the manifest a tag currently points at
    async fn manifest_by_tag(&self, repository: &str, tag: &str)
        -> Result<Manifest, GatewayError>;

    /// Fetch a manifest by content digest
    async fn manifest_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Manifest, GatewayError>;

    /// List descriptors whose subject is `digest`
    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<Descriptor>, GatewayError>;

    /// Delete a manifest by digest
    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), GatewayError>;
}

/// Opens (or hands back a cached) gateway for a registry host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, registry: &str) -> Result<Arc<dyn RegistryGateway>, GatewayError>;
}
