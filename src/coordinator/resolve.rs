//! Network side of a load: everything here runs in spawned tasks and hands
//! its result back to the coordinator loop

use std::sync::Arc;

use crate::error::{GatewayError, ResolutionError};
use crate::gateway::{Connector, Manifest, RegistryGateway};
use crate::reference::{Digest, Reference, TagOrDigest};

/// Lists to refresh alongside the manifest fetch
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct RefreshPlan {
    pub repositories: bool,
    pub tags: bool,
}

pub(super) struct Resolved {
    pub gateway: Arc<dyn RegistryGateway>,
    pub manifest: Manifest,
    pub repositories: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

pub(super) struct Deleted {
    pub gateway: Arc<dyn RegistryGateway>,
    pub digest: String,
    pub tags: Option<Vec<String>>,
}

/// Reuse the cached gateway for a registry or open a new one
pub(super) async fn open(
    connector: &dyn Connector,
    cached: Option<Arc<dyn RegistryGateway>>,
    registry: &str,
) -> Result<Arc<dyn RegistryGateway>, ResolutionError> {
    if let Some(gateway) = cached {
        return Ok(gateway);
    }
    tracing::debug!("Connecting to {}", registry);
    connector
        .connect(registry)
        .await
        .map_err(|source| ResolutionError::Connect {
            registry: registry.to_string(),
            source,
        })
}

/// Fetch the manifest `reference` points at.
///
/// Repository and tag listings are best effort: a failure there is logged and
/// the load goes on without refreshed lists.
pub(super) async fn resolve(
    gateway: Arc<dyn RegistryGateway>,
    reference: &Reference,
    plan: RefreshPlan,
    verify_digests: bool,
) -> Result<Resolved, ResolutionError> {
    let repositories = if plan.repositories {
        best_effort("list repositories", gateway.list_repositories().await)
    } else {
        None
    };

    let tags = if plan.tags {
        best_effort(
            "list tags",
            gateway.list_tags(reference.repository()).await,
        )
    } else {
        None
    };

    let fetch_error = |source| ResolutionError::Fetch {
        reference: reference.to_string(),
        source,
    };

    let manifest = match reference.content() {
        TagOrDigest::Tag(tag) => gateway
            .manifest_by_tag(reference.repository(), tag)
            .await
            .map_err(fetch_error)?,
        TagOrDigest::Digest(digest) => {
            let mut manifest = gateway
                .manifest_by_digest(reference.repository(), &digest.to_string())
                .await
                .map_err(fetch_error)?;
            if verify_digests && !digest.matches(manifest.json.as_bytes()) {
                return Err(ResolutionError::DigestMismatch {
                    reference: reference.to_string(),
                    actual: Digest::sha256_of(manifest.json.as_bytes()).to_string(),
                });
            }
            manifest.digest = digest.to_string();
            manifest
        }
    };

    Ok(Resolved {
        gateway,
        manifest,
        repositories,
        tags,
    })
}

/// Delete the manifest `reference` points at and re-list the repository's tags
pub(super) async fn delete(
    gateway: Arc<dyn RegistryGateway>,
    reference: &Reference,
) -> Result<Deleted, ResolutionError> {
    let delete_error = |source| ResolutionError::Delete {
        reference: reference.to_string(),
        source,
    };

    let digest = match reference.content() {
        TagOrDigest::Digest(digest) => digest.to_string(),
        TagOrDigest::Tag(tag) => {
            gateway
                .manifest_by_tag(reference.repository(), tag)
                .await
                .map_err(delete_error)?
                .digest
        }
    };

    gateway
        .delete_manifest(reference.repository(), &digest)
        .await
        .map_err(delete_error)?;
    tracing::info!("Deleted {} ({})", reference, digest);

    let tags = best_effort(
        "list tags",
        gateway.list_tags(reference.repository()).await,
    );

    Ok(Deleted {
        gateway,
        digest,
        tags,
    })
}

/// Open a gateway and list a repository's tags, for browsing outside a load
pub(super) async fn list_tags(
    connector: &dyn Connector,
    cached: Option<Arc<dyn RegistryGateway>>,
    registry: &str,
    repository: &str,
) -> Option<(Arc<dyn RegistryGateway>, Vec<String>)> {
    let gateway = match open(connector, cached, registry).await {
        Ok(gateway) => gateway,
        Err(e) => {
            tracing::warn!("{}", e);
            return None;
        }
    };
    let tags = best_effort("list tags", gateway.list_tags(repository).await)?;
    Some((gateway, tags))
}

fn best_effort<T>(what: &str, result: Result<T, GatewayError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Failed to {}: {}", what, e);
            None
        }
    }
}
