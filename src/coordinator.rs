//! Load coordinator: the one place that decides which load request wins and
//! what the current identity becomes
//!
//! Requests from any source are parsed synchronously and handed to a single
//! task that owns all mutable coordination state. Network work runs in
//! separately spawned tasks whose results come back through that task, so
//! results are applied one at a time and only when they belong to the most
//! recently issued request.

mod request;
mod resolve;
mod task;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub use request::{LoadPhase, LoadRequest, SourceKind};

use crate::config::InspectorConfig;
use crate::error::CoordinatorError;
use crate::events::Notifications;
use crate::gateway::Connector;
use crate::history::{History, HistorySnapshot, HistoryStore};
use crate::identity::{CurrentIdentity, IdentityCell};
use crate::reference::Reference;
use crate::referrers::{ReferrerNode, DEFAULT_MAX_DESCRIPTORS};
use crate::selection::{SelectionSnapshot, SelectionSync};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Quiet period before a tag selection loads
    pub tag_debounce: Duration,
    pub max_referrers: usize,
    /// Check digest-form manifests against their digest
    pub verify_digests: bool,
    /// Abort superseded fetches and traversals instead of letting them finish
    pub cancel_superseded: bool,
    pub history_capacity: usize,
    /// Where history is persisted, if anywhere
    pub history_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            tag_debounce: Duration::from_millis(500),
            max_referrers: DEFAULT_MAX_DESCRIPTORS,
            verify_digests: true,
            cancel_superseded: true,
            history_capacity: crate::history::DEFAULT_CAPACITY,
            history_path: None,
        }
    }
}

impl From<&InspectorConfig> for CoordinatorConfig {
    fn from(config: &InspectorConfig) -> Self {
        CoordinatorConfig {
            tag_debounce: Duration::from_millis(config.tag_debounce_ms),
            max_referrers: config.max_referrers,
            verify_digests: config.verify_digests,
            cancel_superseded: config.cancel_superseded,
            history_capacity: config.history_capacity,
            history_path: config.history_path.clone(),
        }
    }
}

/// Referrer tree for the current identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferrerTree {
    pub root_digest: Option<String>,
    pub nodes: Vec<ReferrerNode>,
    /// A traversal for `root_digest` is still running
    pub loading: bool,
}

/// State readable from outside the coordinator task.
/// Only the task writes identity, selection, referrers and phase.
pub(crate) struct Shared {
    pub identity: IdentityCell,
    pub history: Mutex<History>,
    pub history_store: Option<Arc<HistoryStore>>,
    pub selection: Mutex<SelectionSync>,
    pub referrers: Mutex<ReferrerTree>,
    pub phase: Mutex<LoadPhase>,
    pub notifications: Notifications,
}

impl Shared {
    /// Edit history under its lock. The returned snapshot, present when a
    /// history file is configured, is written after the lock is released.
    pub fn edit_history<R>(
        &self,
        edit: impl FnOnce(&mut History) -> R,
    ) -> (R, Option<HistorySnapshot>) {
        let mut history = self.history.lock();
        let result = edit(&mut history);
        let snapshot = self
            .history_store
            .as_ref()
            .map(|store| store.snapshot(&history));
        (result, snapshot)
    }
}

pub(crate) enum Command {
    Load(LoadRequest),
    /// Start a pending tag selection now
    CommitSelection,
    SelectRepository(String),
    SelectTag(String),
    SuppressNextAutoLoad,
    Delete(Reference),
    Disconnect,
}

/// Handle to the load coordinator. Cheap to clone; the coordinator task stops
/// when the last handle is dropped.
#[derive(Clone)]
pub struct LoadCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    next_request_id: Arc<AtomicU64>,
    shared: Arc<Shared>,
}

impl LoadCoordinator {
    /// Start the coordinator task on the current tokio runtime
    pub fn spawn(connector: Arc<dyn Connector>, config: CoordinatorConfig) -> Self {
        let history = match &config.history_path {
            Some(path) => History::load(path, config.history_capacity).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable history: {:#}", e);
                History::with_capacity(config.history_capacity)
            }),
            None => History::with_capacity(config.history_capacity),
        };

        let shared = Arc::new(Shared {
            identity: IdentityCell::new(),
            history: Mutex::new(history),
            history_store: config.history_path.clone().map(HistoryStore::new),
            selection: Mutex::new(SelectionSync::new()),
            referrers: Mutex::new(ReferrerTree::default()),
            phase: Mutex::new(LoadPhase::Idle),
            notifications: Notifications::default(),
        });

        let next_request_id = Arc::new(AtomicU64::new(1));
        let (tx, rx) = mpsc::unbounded_channel();
        task::CoordinatorTask::new(connector, config, shared.clone(), next_request_id.clone(), rx)
            .spawn();

        LoadCoordinator {
            commands: tx,
            next_request_id,
            shared,
        }
    }

    /// Ask for `reference_text` to be displayed. Parse errors are returned
    /// here; everything else is reported through notifications.
    pub fn request_load(
        &self,
        reference_text: &str,
        source: SourceKind,
        force_reload: bool,
    ) -> Result<u64, CoordinatorError> {
        let reference = Reference::parse(reference_text)?;
        let request_id = next_id(&self.next_request_id);
        self.send(Command::Load(LoadRequest {
            reference,
            source,
            force_reload,
            request_id,
        }))?;
        Ok(request_id)
    }

    /// Load the pending tag selection immediately, skipping the rest of the
    /// quiet period
    pub fn commit_selection(&self) -> Result<(), CoordinatorError> {
        self.send(Command::CommitSelection)
    }

    /// User picked a repository; its tag list gets refreshed
    pub fn select_repository(&self, name: &str) -> Result<(), CoordinatorError> {
        self.send(Command::SelectRepository(name.to_string()))
    }

    /// User picked a tag; loads it after the quiet period unless suppressed
    pub fn select_tag(&self, name: &str) -> Result<(), CoordinatorError> {
        self.send(Command::SelectTag(name.to_string()))
    }

    /// The next tag selection will not start a load
    pub fn suppress_next_auto_load(&self) -> Result<(), CoordinatorError> {
        self.send(Command::SuppressNextAutoLoad)
    }

    pub fn delete_manifest(&self, reference_text: &str) -> Result<(), CoordinatorError> {
        let reference = Reference::parse(reference_text)?;
        self.send(Command::Delete(reference))
    }

    /// Forget the current registry: identity, lists, selection and connections
    pub fn disconnect(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Disconnect)
    }

    pub fn current_identity(&self) -> Arc<CurrentIdentity> {
        self.shared.identity.snapshot()
    }

    pub fn phase(&self) -> LoadPhase {
        *self.shared.phase.lock()
    }

    pub fn selection(&self) -> SelectionSnapshot {
        self.shared.selection.lock().snapshot()
    }

    pub fn referrer_tree(&self) -> ReferrerTree {
        self.shared.referrers.lock().clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.shared.history.lock().entries().to_vec()
    }

    /// Clear history, writing the file before returning
    pub fn clear_history(&self) {
        let ((), snapshot) = self.shared.edit_history(History::clear);
        if let Some(snapshot) = snapshot {
            snapshot.write();
        }
    }

    /// Remove one entry, writing the file before returning if it was present
    pub fn remove_history_entry(&self, text: &str) -> bool {
        let (removed, snapshot) = self.shared.edit_history(|history| history.remove(text));
        if let (true, Some(snapshot)) = (removed, snapshot) {
            snapshot.write();
        }
        removed
    }

    pub fn notifications(&self) -> &Notifications {
        &self.shared.notifications
    }

    fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.commands
            .send(command)
            .map_err(|_| CoordinatorError::Closed)
    }
}

pub(crate) fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::SeqCst)
}
