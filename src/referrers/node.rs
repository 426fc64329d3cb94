use crate::gateway::Descriptor;

/// Shown for groups whose descriptors declare no artifact type
pub const UNKNOWN_ARTIFACT_TYPE: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Bucket of descriptors sharing an artifact type
    Group,
    /// One referrer manifest
    Descriptor,
    /// `key: value` annotation of the parent descriptor
    AnnotationLeaf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub digest: String,
    pub artifact_type: String,
    pub media_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerNode {
    pub kind: NodeKind,
    pub display: String,
    pub info: Option<DescriptorInfo>,
    pub children: Vec<ReferrerNode>,
}

impl ReferrerNode {
    pub fn group(artifact_type: &str) -> Self {
        let display = if artifact_type.is_empty() {
            UNKNOWN_ARTIFACT_TYPE
        } else {
            artifact_type
        };
        ReferrerNode {
            kind: NodeKind::Group,
            display: display.to_string(),
            info: None,
            children: Vec::new(),
        }
    }

    /// Descriptor node with one annotation leaf per annotation, in key order
    pub fn descriptor(descriptor: &Descriptor) -> Self {
        let children = descriptor
            .annotations
            .iter()
            .map(|(key, value)| ReferrerNode::annotation(key, value))
            .collect();
        ReferrerNode {
            kind: NodeKind::Descriptor,
            display: descriptor.digest.clone(),
            info: Some(DescriptorInfo {
                digest: descriptor.digest.clone(),
                artifact_type: descriptor.artifact_type.clone(),
                media_type: descriptor.media_type.clone(),
                size: descriptor.size,
            }),
            children,
        }
    }

    pub fn annotation(key: &str, value: &str) -> Self {
        ReferrerNode {
            kind: NodeKind::AnnotationLeaf,
            display: format!("{}: {}", key, value),
            info: None,
            children: Vec::new(),
        }
    }

    pub fn digest(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.digest.as_str())
    }

    /// Pre-order walk over this node and all of its descendants
    pub fn iter(&self) -> impl Iterator<Item = &ReferrerNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

/// Number of descriptor nodes in a forest; groups and annotations don't count
pub fn descriptor_count(forest: &[ReferrerNode]) -> usize {
    forest
        .iter()
        .flat_map(|node| node.iter())
        .filter(|node| node.kind == NodeKind::Descriptor)
        .count()
}

/// Map an open-ended progress count onto 0..=100 for display
pub fn progress_percent(count: usize) -> u8 {
    count.min(100) as u8
}
