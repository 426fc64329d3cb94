use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{Connector, Descriptor, Manifest, RegistryGateway, OCI_IMAGE_MANIFEST};
use crate::error::GatewayError;
use crate::reference::Digest;

/// Gateway operation, recorded for every call made against a [`MemoryRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListRepositories,
    ListTags,
    ManifestByTag,
    ManifestByDigest,
    Referrers,
    DeleteManifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    /// Repository, tag or digest the call was about
    pub target: String,
}

#[derive(Default)]
struct Repository {
    tags: BTreeMap<String, String>,
    manifests: HashMap<String, Manifest>,
    referrers: HashMap<String, Vec<Descriptor>>,
}

#[derive(Default)]
struct Inner {
    repositories: BTreeMap<String, Repository>,
    /// Simulated latency keyed by tag name or digest
    delays: HashMap<String, Duration>,
    /// Injected failures keyed by tag name or digest
    failures: HashMap<String, GatewayError>,
    calls: Vec<Call>,
}

/// Registry held entirely in memory, with injectable latency and failures
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty repository
    pub fn add_repository(&self, repository: &str) {
        self.inner
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default();
    }

    /// Store a manifest and return its sha256 digest
    pub fn add_manifest(&self, repository: &str, json: &str) -> String {
        let digest = Digest::sha256_of(json.as_bytes()).to_string();
        self.add_manifest_with_digest(repository, &digest, json);
        digest
    }

    /// Store a manifest under an explicit digest, without checking it
    pub fn add_manifest_with_digest(&self, repository: &str, digest: &str, json: &str) {
        let manifest = Manifest {
            digest: digest.to_string(),
            media_type: media_type_of(json),
            json: json.to_string(),
        };
        self.inner
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .manifests
            .insert(digest.to_string(), manifest);
    }

    pub fn tag(&self, repository: &str, tag: &str, digest: &str) {
        self.inner
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .tags
            .insert(tag.to_string(), digest.to_string());
    }

    /// Record `referrer` as pointing at `subject`
    pub fn add_referrer(&self, repository: &str, subject: &str, referrer: Descriptor) {
        self.inner
            .lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .referrers
            .entry(subject.to_string())
            .or_default()
            .push(referrer);
    }

    /// Delay every call concerning `key` (a tag name or digest)
    pub fn set_delay(&self, key: &str, delay: Duration) {
        self.inner.lock().delays.insert(key.to_string(), delay);
    }

    /// Make every call concerning `key` fail with `error`
    pub fn fail_with(&self, key: &str, error: GatewayError) {
        self.inner.lock().failures.insert(key.to_string(), error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, operation: Operation) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Record the call and return the latency and failure configured for `key`
    fn record(&self, operation: Operation, key: &str) -> (Option<Duration>, Option<GatewayError>) {
        let mut inner = self.inner.lock();
        inner.calls.push(Call {
            operation,
            target: key.to_string(),
        });
        (
            inner.delays.get(key).copied(),
            inner.failures.get(key).cloned(),
        )
    }

    async fn enter(&self, operation: Operation, key: &str) -> Result<(), GatewayError> {
        let (delay, failure) = self.record(operation, key);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_repository<T>(
        &self,
        repository: &str,
        f: impl FnOnce(&mut Repository) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut inner = self.inner.lock();
        let repo = inner
            .repositories
            .get_mut(repository)
            .ok_or_else(|| GatewayError::NotFound(format!("repository {}", repository)))?;
        f(repo)
    }
}

#[async_trait]
impl RegistryGateway for MemoryRegistry {
    async fn list_repositories(&self) -> Result<Vec<String>, GatewayError> {
        self.enter(Operation::ListRepositories, "").await?;
        Ok(self.inner.lock().repositories.keys().cloned().collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, GatewayError> {
        self.enter(Operation::ListTags, repository).await?;
        self.with_repository(repository, |repo| Ok(repo.tags.keys().cloned().collect()))
    }

    async fn manifest_by_tag(
        &self,
        repository: &str,
        tag: &str,
    ) -> Result<Manifest, GatewayError> {
        self.enter(Operation::ManifestByTag, tag).await?;
        self.with_repository(repository, |repo| {
            let digest = repo
                .tags
                .get(tag)
                .ok_or_else(|| GatewayError::NotFound(format!("tag {}:{}", repository, tag)))?;
            repo.manifests
                .get(digest)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("manifest {}", digest)))
        })
    }

    async fn manifest_by_digest(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Manifest, GatewayError> {
        self.enter(Operation::ManifestByDigest, digest).await?;
        self.with_repository(repository, |repo| {
            repo.manifests
                .get(digest)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("manifest {}", digest)))
        })
    }

    async fn referrers(
        &self,
        repository: &str,
        digest: &str,
    ) -> Result<Vec<Descriptor>, GatewayError> {
        self.enter(Operation::Referrers, digest).await?;
        self.with_repository(repository, |repo| {
            Ok(repo.referrers.get(digest).cloned().unwrap_or_default())
        })
    }

    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<(), GatewayError> {
        self.enter(Operation::DeleteManifest, digest).await?;
        self.with_repository(repository, |repo| {
            if repo.manifests.remove(digest).is_none() {
                return Err(GatewayError::NotFound(format!("manifest {}", digest)));
            }
            repo.tags.retain(|_, target| target != digest);
            Ok(())
        })
    }
}

/// Connector serving fixed in-memory registries by host name
#[derive(Default)]
pub struct MemoryConnector {
    registries: HashMap<String, Arc<MemoryRegistry>>,
    connects: Mutex<usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, host: &str, registry: Arc<MemoryRegistry>) -> Self {
        self.registries.insert(host.to_ascii_lowercase(), registry);
        self
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        *self.connects.lock()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, registry: &str) -> Result<Arc<dyn RegistryGateway>, GatewayError> {
        let gateway = self
            .registries
            .get(registry)
            .cloned()
            .ok_or_else(|| GatewayError::Unreachable(registry.to_string()))?;
        *self.connects.lock() += 1;
        Ok(gateway)
    }
}

pub(crate) fn media_type_of(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|value| {
            value
                .get("mediaType")
                .and_then(|media_type| media_type.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| OCI_IMAGE_MANIFEST.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_manifest_by_tag_resolves_digest() {
        let registry = MemoryRegistry::new();
        let digest = registry.add_manifest("demo/app", r#"{"schemaVersion":2}"#);
        registry.tag("demo/app", "v1", &digest);

        let manifest = registry.manifest_by_tag("demo/app", "v1").await.unwrap();
        assert_eq!(manifest.digest, digest);
        assert_eq!(manifest.media_type, OCI_IMAGE_MANIFEST);
        assert_eq!(registry.call_count(Operation::ManifestByTag), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_injected_failure() {
        let registry = MemoryRegistry::new();
        registry.add_repository("demo/app");
        registry.fail_with("v1", GatewayError::Unauthorized("denied".to_string()));

        let err = registry.manifest_by_tag("demo/app", "v1").await.unwrap_err();
        assert_eq!(err, GatewayError::Unauthorized("denied".to_string()));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_delay_is_simulated() {
        let registry = MemoryRegistry::new();
        registry.add_repository("demo/app");
        registry.set_delay("demo/app", Duration::from_millis(200));

        let start = tokio::time::Instant::now();
        registry.list_tags("demo/app").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_delete_removes_tags() {
        let registry = MemoryRegistry::new();
        let digest = registry.add_manifest("demo/app", "{}");
        registry.tag("demo/app", "v1", &digest);

        registry.delete_manifest("demo/app", &digest).await.unwrap();
        assert!(registry.list_tags("demo/app").await.unwrap().is_empty());
        assert!(matches!(
            registry.delete_manifest("demo/app", &digest).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_connector_unknown_host() {
        let connector = MemoryConnector::new().with_registry("example.com", Arc::default());

        assert!(connector.connect("example.com").await.is_ok());
        assert!(matches!(
            connector.connect("other.io").await,
            Err(GatewayError::Unreachable(_))
        ));
        assert_eq!(connector.connect_count(), 1);
    }
}
