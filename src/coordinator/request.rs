use crate::reference::Reference;

/// Where a load request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    ReferenceBox,
    History,
    TagSelection,
    DigestClick,
    CoordinatorNavigation,
}

impl SourceKind {
    /// Tag selections wait for a quiet period before loading
    pub fn is_debounced(&self) -> bool {
        matches!(self, SourceKind::TagSelection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub reference: Reference,
    pub source: SourceKind,
    pub force_reload: bool,
    /// Strictly increasing, assigned when the request is enqueued
    pub request_id: u64,
}

/// Where the coordinator is in its current load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Idle,
    Resolving,
    FetchingManifest,
    Applying,
    Failed,
}
