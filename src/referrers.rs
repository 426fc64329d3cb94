//! Recursive discovery of the artifacts that refer to a manifest
//!
//! Expansion is breadth-first over an explicit worklist. Every digest is
//! expanded at most once per run; a descriptor whose digest was already seen
//! still shows up in the tree but gets no children of its own, which keeps
//! cycles and diamonds finite.

mod node;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub use node::{
    descriptor_count, progress_percent, DescriptorInfo, NodeKind, ReferrerNode,
    UNKNOWN_ARTIFACT_TYPE,
};

use crate::error::ReferrerTraversalError;
use crate::gateway::RegistryGateway;

/// Default bound on the number of digests expanded in one run, besides the root
pub const DEFAULT_MAX_DESCRIPTORS: usize = 10_000;

/// Tree node under construction; `children` index into the arena and are
/// always created after their parent
struct ArenaNode {
    node: ReferrerNode,
    children: Vec<usize>,
}

pub struct ReferrerGraphBuilder {
    gateway: Arc<dyn RegistryGateway>,
    max_descriptors: usize,
}

impl ReferrerGraphBuilder {
    pub fn new(gateway: Arc<dyn RegistryGateway>) -> Self {
        ReferrerGraphBuilder {
            gateway,
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
        }
    }

    pub fn with_max_descriptors(mut self, max_descriptors: usize) -> Self {
        self.max_descriptors = max_descriptors.max(1);
        self
    }

    /// Build the forest of groups referring (transitively) to `root_digest`.
    ///
    /// `on_progress` is called after every registry call with the number of
    /// descriptors discovered so far. Any failed call aborts the run and no
    /// partial tree is returned.
    pub async fn build<F>(
        &self,
        repository: &str,
        root_digest: &str,
        mut on_progress: F,
    ) -> Result<Vec<ReferrerNode>, ReferrerTraversalError>
    where
        F: FnMut(usize) + Send,
    {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_digest.to_string());

        let mut worklist: VecDeque<(String, Option<usize>)> = VecDeque::new();
        worklist.push_back((root_digest.to_string(), None));

        let mut arena: Vec<ArenaNode> = Vec::new();
        let mut roots: Vec<usize> = Vec::new();
        let mut discovered = 0usize;
        let mut truncated = false;

        while let Some((digest, parent)) = worklist.pop_front() {
            let descriptors = self
                .gateway
                .referrers(repository, &digest)
                .await
                .map_err(|source| ReferrerTraversalError {
                    digest: digest.clone(),
                    source,
                })?;
            tracing::debug!("{} has {} referrer(s)", digest, descriptors.len());

            // One group per artifact type at this level, in discovery order
            let mut groups: HashMap<String, usize> = HashMap::new();

            for descriptor in &descriptors {
                if descriptor.digest.is_empty() {
                    tracing::warn!("Ignoring referrer of {} without a digest", digest);
                    continue;
                }

                let group = match groups.get(&descriptor.artifact_type) {
                    Some(&group) => group,
                    None => {
                        let group = arena.len();
                        arena.push(ArenaNode {
                            node: ReferrerNode::group(&descriptor.artifact_type),
                            children: Vec::new(),
                        });
                        match parent {
                            Some(parent) => arena[parent].children.push(group),
                            None => roots.push(group),
                        }
                        groups.insert(descriptor.artifact_type.clone(), group);
                        group
                    }
                };

                let index = arena.len();
                arena.push(ArenaNode {
                    node: ReferrerNode::descriptor(descriptor),
                    children: Vec::new(),
                });
                arena[group].children.push(index);
                discovered += 1;

                if visited.contains(&descriptor.digest) {
                    tracing::debug!("{} already expanded, not following", descriptor.digest);
                } else if visited.len() > self.max_descriptors {
                    truncated = true;
                } else {
                    visited.insert(descriptor.digest.clone());
                    worklist.push_back((descriptor.digest.clone(), Some(index)));
                }
            }

            on_progress(discovered);
        }

        if truncated {
            tracing::warn!(
                "Stopped expanding referrers of {} after {} digests",
                root_digest,
                self.max_descriptors
            );
        }

        Ok(assemble(arena, &roots))
    }
}

/// Turn the arena into owned nodes, children before parents
fn assemble(arena: Vec<ArenaNode>, roots: &[usize]) -> Vec<ReferrerNode> {
    let mut finished: Vec<Option<ReferrerNode>> = vec![None; arena.len()];

    for (index, entry) in arena.into_iter().enumerate().rev() {
        let mut node = entry.node;
        for child in entry.children {
            if let Some(child) = finished[child].take() {
                node.children.push(child);
            }
        }
        finished[index] = Some(node);
    }

    roots.iter().filter_map(|&root| finished[root].take()).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{Descriptor, MemoryRegistry, Operation};

    const REPO: &str = "demo/app";
    const SIGNATURE: &str = "application/vnd.dev.cosign.signature";
    const SBOM: &str = "application/spdx+json";

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    fn referrer(c: char, artifact_type: &str) -> Descriptor {
        Descriptor {
            digest: digest(c),
            artifact_type: artifact_type.to_string(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            size: 512,
            annotations: BTreeMap::new(),
        }
    }

    fn builder(registry: Arc<MemoryRegistry>) -> ReferrerGraphBuilder {
        ReferrerGraphBuilder::new(registry)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_groups_by_artifact_type_in_discovery_order() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        registry.add_referrer(REPO, &digest('a'), referrer('b', SIGNATURE));
        registry.add_referrer(REPO, &digest('a'), referrer('c', SBOM));
        registry.add_referrer(REPO, &digest('a'), referrer('d', SIGNATURE));

        let forest = builder(registry).build(REPO, &digest('a'), |_| {}).await.unwrap();

        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].display, SIGNATURE);
        assert_eq!(forest[1].display, SBOM);
        let signatures: Vec<_> = forest[0].children.iter().filter_map(|n| n.digest()).collect();
        assert_eq!(signatures, vec![digest('b'), digest('d')]);
        assert_eq!(descriptor_count(&forest), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_nested_referrers_and_annotations() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        let mut sbom = referrer('b', SBOM);
        sbom.annotations
            .insert("org.opencontainers.image.created".to_string(), "2024".to_string());
        registry.add_referrer(REPO, &digest('a'), sbom);
        registry.add_referrer(REPO, &digest('b'), referrer('c', SIGNATURE));

        let forest = builder(registry).build(REPO, &digest('a'), |_| {}).await.unwrap();

        let sbom = &forest[0].children[0];
        assert_eq!(sbom.kind, NodeKind::Descriptor);
        assert_eq!(sbom.children[0].kind, NodeKind::AnnotationLeaf);
        assert_eq!(sbom.children[0].display, "org.opencontainers.image.created: 2024");

        let nested_group = &sbom.children[1];
        assert_eq!(nested_group.kind, NodeKind::Group);
        assert_eq!(nested_group.display, SIGNATURE);
        assert_eq!(nested_group.children[0].digest(), Some(digest('c').as_str()));
        assert_eq!(descriptor_count(&forest), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_back_reference_is_not_expanded() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        // a <- b <- c, and c claims to refer to a again
        registry.add_referrer(REPO, &digest('a'), referrer('b', SIGNATURE));
        registry.add_referrer(REPO, &digest('b'), referrer('c', SIGNATURE));
        registry.add_referrer(REPO, &digest('c'), referrer('a', SIGNATURE));

        let forest = builder(registry.clone())
            .build(REPO, &digest('a'), |_| {})
            .await
            .unwrap();

        let b = &forest[0].children[0];
        let c = &b.children[0].children[0];
        let back = &c.children[0].children[0];
        assert_eq!(back.digest(), Some(digest('a').as_str()));
        assert!(back.children.is_empty());
        assert_eq!(descriptor_count(&forest), 3);
        // a, b and c are each listed exactly once
        assert_eq!(registry.call_count(Operation::Referrers), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_diamond_expanded_once() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        registry.add_referrer(REPO, &digest('a'), referrer('b', SIGNATURE));
        registry.add_referrer(REPO, &digest('a'), referrer('c', SBOM));
        registry.add_referrer(REPO, &digest('b'), referrer('d', SIGNATURE));
        registry.add_referrer(REPO, &digest('c'), referrer('d', SIGNATURE));

        let forest = builder(registry.clone())
            .build(REPO, &digest('a'), |_| {})
            .await
            .unwrap();

        assert_eq!(descriptor_count(&forest), 4);
        let d_listings = registry
            .calls()
            .iter()
            .filter(|call| call.operation == Operation::Referrers && call.target == digest('d'))
            .count();
        assert_eq!(d_listings, 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_progress_is_monotonic() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        registry.add_referrer(REPO, &digest('a'), referrer('b', SIGNATURE));
        registry.add_referrer(REPO, &digest('a'), referrer('c', SIGNATURE));
        registry.add_referrer(REPO, &digest('b'), referrer('d', SBOM));

        let mut reports = Vec::new();
        builder(registry)
            .build(REPO, &digest('a'), |count| reports.push(count))
            .await
            .unwrap();

        // one report per registry call: a, b, c, d
        assert_eq!(reports, vec![2, 3, 3, 3]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failure_aborts_traversal() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        registry.add_referrer(REPO, &digest('a'), referrer('b', SIGNATURE));
        registry.fail_with(&digest('b'), GatewayError::Unreachable("timeout".to_string()));

        let err = builder(registry)
            .build(REPO, &digest('a'), |_| {})
            .await
            .unwrap_err();

        assert_eq!(err.digest, digest('b'));
        assert_eq!(err.source, GatewayError::Unreachable("timeout".to_string()));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_expansion_is_bounded() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);
        let chain = ['a', 'b', 'c', 'd', 'e', 'f'];
        for pair in chain.windows(2) {
            registry.add_referrer(REPO, &digest(pair[0]), referrer(pair[1], SIGNATURE));
        }

        let forest = builder(registry.clone())
            .with_max_descriptors(2)
            .build(REPO, &digest('a'), |_| {})
            .await
            .unwrap();

        // the root plus two further digests are expanded; d is listed but not followed
        assert_eq!(registry.call_count(Operation::Referrers), 3);
        assert_eq!(descriptor_count(&forest), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_no_referrers_is_empty_forest() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.add_repository(REPO);

        let forest = builder(registry).build(REPO, &digest('a'), |_| {}).await.unwrap();
        assert!(forest.is_empty());
    }
}
