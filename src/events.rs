//! Typed notification channels, one per notification kind
//!
//! Every subscriber gets its own `broadcast::Receiver`. Sends with no
//! subscribers are dropped silently.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::coordinator::SourceKind;
use crate::error::{ReferrerTraversalError, ResolutionError};
use crate::identity::CurrentIdentity;
use crate::selection::SelectionChanged;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequested {
    pub request_id: u64,
    pub reference: String,
    pub source: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCompleted {
    pub request_id: u64,
    pub reference: String,
    pub source: SourceKind,
    pub identity: Arc<CurrentIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailed {
    pub request_id: u64,
    pub reference: String,
    pub error: ResolutionError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrerProgress {
    pub root_digest: String,
    /// Descriptors discovered so far in the current traversal
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrersLoaded {
    pub root_digest: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferrersFailed {
    pub root_digest: String,
    pub error: ReferrerTraversalError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDeleted {
    pub reference: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteFailed {
    pub reference: String,
    pub error: ResolutionError,
}

pub struct Notifications {
    load_requested: broadcast::Sender<LoadRequested>,
    load_completed: broadcast::Sender<LoadCompleted>,
    load_failed: broadcast::Sender<LoadFailed>,
    referrer_progress: broadcast::Sender<ReferrerProgress>,
    referrers_loaded: broadcast::Sender<ReferrersLoaded>,
    referrers_failed: broadcast::Sender<ReferrersFailed>,
    selection_changed: broadcast::Sender<SelectionChanged>,
    manifest_deleted: broadcast::Sender<ManifestDeleted>,
    delete_failed: broadcast::Sender<DeleteFailed>,
}

impl Default for Notifications {
    fn default() -> Self {
        Notifications {
            load_requested: broadcast::channel(CHANNEL_CAPACITY).0,
            load_completed: broadcast::channel(CHANNEL_CAPACITY).0,
            load_failed: broadcast::channel(CHANNEL_CAPACITY).0,
            referrer_progress: broadcast::channel(CHANNEL_CAPACITY).0,
            referrers_loaded: broadcast::channel(CHANNEL_CAPACITY).0,
            referrers_failed: broadcast::channel(CHANNEL_CAPACITY).0,
            selection_changed: broadcast::channel(CHANNEL_CAPACITY).0,
            manifest_deleted: broadcast::channel(CHANNEL_CAPACITY).0,
            delete_failed: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

impl Notifications {
    pub fn on_load_requested(&self) -> broadcast::Receiver<LoadRequested> {
        self.load_requested.subscribe()
    }

    pub fn on_load_completed(&self) -> broadcast::Receiver<LoadCompleted> {
        self.load_completed.subscribe()
    }

    pub fn on_load_failed(&self) -> broadcast::Receiver<LoadFailed> {
        self.load_failed.subscribe()
    }

    pub fn on_referrer_progress(&self) -> broadcast::Receiver<ReferrerProgress> {
        self.referrer_progress.subscribe()
    }

    pub fn on_referrers_loaded(&self) -> broadcast::Receiver<ReferrersLoaded> {
        self.referrers_loaded.subscribe()
    }

    pub fn on_referrers_failed(&self) -> broadcast::Receiver<ReferrersFailed> {
        self.referrers_failed.subscribe()
    }

    pub fn on_selection_changed(&self) -> broadcast::Receiver<SelectionChanged> {
        self.selection_changed.subscribe()
    }

    pub fn on_manifest_deleted(&self) -> broadcast::Receiver<ManifestDeleted> {
        self.manifest_deleted.subscribe()
    }

    pub fn on_delete_failed(&self) -> broadcast::Receiver<DeleteFailed> {
        self.delete_failed.subscribe()
    }

    pub(crate) fn load_requested(&self, event: LoadRequested) {
        tracing::debug!("load requested: #{} {}", event.request_id, event.reference);
        let _ = self.load_requested.send(event);
    }

    pub(crate) fn load_completed(&self, event: LoadCompleted) {
        tracing::debug!("load completed: #{} {}", event.request_id, event.reference);
        let _ = self.load_completed.send(event);
    }

    pub(crate) fn load_failed(&self, event: LoadFailed) {
        tracing::debug!("load failed: #{} {}", event.request_id, event.error);
        let _ = self.load_failed.send(event);
    }

    pub(crate) fn referrer_progress(&self, event: ReferrerProgress) {
        let _ = self.referrer_progress.send(event);
    }

    pub(crate) fn referrers_loaded(&self, event: ReferrersLoaded) {
        let _ = self.referrers_loaded.send(event);
    }

    pub(crate) fn referrers_failed(&self, event: ReferrersFailed) {
        let _ = self.referrers_failed.send(event);
    }

    pub(crate) fn selection_changed(&self, event: SelectionChanged) {
        tracing::debug!("selection changed: {:?}", event);
        let _ = self.selection_changed.send(event);
    }

    pub(crate) fn manifest_deleted(&self, event: ManifestDeleted) {
        let _ = self.manifest_deleted.send(event);
    }

    pub(crate) fn delete_failed(&self, event: DeleteFailed) {
        let _ = self.delete_failed.send(event);
    }
}
