use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};

use crate::reference::{Reference, TagOrDigest};

/// The manifest currently on display. Replaced as a whole, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentIdentity {
    pub registry: String,
    pub repository: String,
    pub manifest_digest: String,
    pub selected_tag_name: Option<String>,
    pub raw_manifest_json: String,
    pub media_type: String,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl CurrentIdentity {
    pub fn is_empty(&self) -> bool {
        self.manifest_digest.is_empty()
    }

    /// Whether `reference` is the exact form that was loaded. A digest form of
    /// a manifest loaded by tag does not match, so it still gets its own load.
    pub fn matches(&self, reference: &Reference) -> bool {
        if self.is_empty()
            || self.registry != reference.registry()
            || self.repository != reference.repository()
        {
            return false;
        }
        match reference.content() {
            TagOrDigest::Tag(tag) => self.selected_tag_name.as_deref() == Some(tag.as_str()),
            TagOrDigest::Digest(digest) => {
                self.selected_tag_name.is_none() && self.manifest_digest == digest.to_string()
            }
        }
    }
}

/// Single-owner cell for the current identity.
///
/// Readers get a consistent snapshot; only the load coordinator holds the
/// cell and can swap in a new value.
#[derive(Debug, Default)]
pub struct IdentityCell {
    current: ArcSwap<CurrentIdentity>,
}

impl IdentityCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<CurrentIdentity> {
        self.current.load_full()
    }

    pub(crate) fn replace(&self, identity: CurrentIdentity) {
        self.current.store(Arc::new(identity));
    }

    pub(crate) fn clear(&self) {
        self.current.store(Arc::new(CurrentIdentity::default()));
    }
}
