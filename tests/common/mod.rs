#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use oras_inspect::gateway::{Descriptor, MemoryConnector, MemoryRegistry};
use oras_inspect::{CoordinatorConfig, LoadCoordinator};

pub const REGISTRY: &str = "example.com";
pub const SIGNATURE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";
pub const SBOM: &str = "application/spdx+json";

pub fn manifest_json(name: &str) -> String {
    format!(
        r#"{{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","annotations":{{"org.example.name":"{}"}}}}"#,
        name
    )
}

/// `example.com` serving `demo/app` (tags v1, v2, v3) and `demo/other` (tag latest)
pub struct Fixture {
    pub registry: Arc<MemoryRegistry>,
    pub connector: Arc<MemoryConnector>,
    pub coordinator: LoadCoordinator,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub other: String,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let v1 = registry.add_manifest("demo/app", &manifest_json("v1"));
        let v2 = registry.add_manifest("demo/app", &manifest_json("v2"));
        let v3 = registry.add_manifest("demo/app", &manifest_json("v3"));
        registry.tag("demo/app", "v1", &v1);
        registry.tag("demo/app", "v2", &v2);
        registry.tag("demo/app", "v3", &v3);
        let other = registry.add_manifest("demo/other", &manifest_json("other"));
        registry.tag("demo/other", "latest", &other);

        let connector = Arc::new(MemoryConnector::new().with_registry(REGISTRY, registry.clone()));
        let coordinator = LoadCoordinator::spawn(connector.clone(), config);

        Fixture {
            registry,
            connector,
            coordinator,
            v1,
            v2,
            v3,
            other,
        }
    }

    pub fn reference(&self, tag: &str) -> String {
        format!("{}/demo/app:{}", REGISTRY, tag)
    }

    pub fn digest_reference(&self, digest: &str) -> String {
        format!("{}/demo/app@{}", REGISTRY, digest)
    }
}

pub fn descriptor(digest: &str, artifact_type: &str, annotations: &[(&str, &str)]) -> Descriptor {
    Descriptor {
        digest: digest.to_string(),
        artifact_type: artifact_type.to_string(),
        media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
        size: 512,
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn fake_digest(c: char) -> String {
    format!("sha256:{}", c.to_string().repeat(64))
}

/// Wait for the next notification, failing the test if none arrives
pub async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

/// Let every spawned task run to completion
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}

/// Assert nothing is queued on `rx`
pub fn assert_quiet<T: Clone + std::fmt::Debug>(rx: &mut broadcast::Receiver<T>) {
    match rx.try_recv() {
        Err(TryRecvError::Empty) => {}
        other => panic!("expected no notification, got {:?}", other),
    }
}
