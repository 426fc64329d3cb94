use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::request::{LoadPhase, LoadRequest, SourceKind};
use super::resolve::{self, Deleted, RefreshPlan, Resolved};
use super::{next_id, Command, CoordinatorConfig, ReferrerTree, Shared};
use crate::error::{ReferrerTraversalError, ResolutionError};
use crate::events::{
    DeleteFailed, LoadCompleted, LoadFailed, LoadRequested, ManifestDeleted, ReferrerProgress,
    ReferrersFailed, ReferrersLoaded,
};
use crate::gateway::{Connector, RegistryGateway};
use crate::identity::CurrentIdentity;
use crate::reference::Reference;
use crate::referrers::{descriptor_count, ReferrerGraphBuilder, ReferrerNode};
use crate::selection::SelectionChanged;

/// Results handed back by spawned work
enum TaskEvent {
    Phase {
        request_id: u64,
        phase: LoadPhase,
    },
    Fetched {
        request: LoadRequest,
        result: Result<Resolved, ResolutionError>,
    },
    ReferrerProgress {
        generation: u64,
        count: usize,
    },
    ReferrersBuilt {
        generation: u64,
        root_digest: String,
        result: Result<Vec<ReferrerNode>, ReferrerTraversalError>,
    },
    TagsListed {
        registry: String,
        repository: String,
        listing: Option<(Arc<dyn RegistryGateway>, Vec<String>)>,
    },
    Deleted {
        reference: Reference,
        result: Result<Deleted, ResolutionError>,
    },
}

struct InFlight {
    request: LoadRequest,
    handle: JoinHandle<()>,
}

/// Debounced tag selection waiting for its quiet period to pass
struct PendingSelection {
    request: LoadRequest,
    deadline: Instant,
}

pub(super) struct CoordinatorTask {
    connector: Arc<dyn Connector>,
    config: CoordinatorConfig,
    shared: Arc<Shared>,
    next_request_id: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    gateways: HashMap<String, Arc<dyn RegistryGateway>>,
    /// Registry the repository list was fetched from
    registry: Option<String>,
    in_flight: Option<InFlight>,
    pending: Option<PendingSelection>,
    referrer_task: Option<JoinHandle<()>>,
    referrer_generation: u64,
}

impl CoordinatorTask {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: CoordinatorConfig,
        shared: Arc<Shared>,
        next_request_id: Arc<AtomicU64>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        CoordinatorTask {
            connector,
            config,
            shared,
            next_request_id,
            commands,
            events_tx,
            events,
            gateways: HashMap::new(),
            registry: None,
            in_flight: None,
            pending: None,
            referrer_task: None,
            referrer_generation: 0,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|pending| pending.deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(pending) = self.pending.take() {
                        tracing::debug!("Quiet period over for #{}", pending.request.request_id);
                        self.start(pending.request);
                    }
                }
            }
        }

        tracing::debug!("Load coordinator shutting down");
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
        if let Some(task) = self.referrer_task.take() {
            task.abort();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Load(request) => self.enqueue(request),
            Command::CommitSelection => self.commit_selection(),
            Command::SelectRepository(name) => self.select_repository(&name),
            Command::SelectTag(name) => self.select_tag(&name),
            Command::SuppressNextAutoLoad => self.shared.selection.lock().suppress_next_auto_load(),
            Command::Delete(reference) => self.delete(reference),
            Command::Disconnect => self.disconnect(),
        }
    }

    fn handle_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Phase { request_id, phase } => {
                if self.is_current(request_id) {
                    self.set_phase(phase);
                }
            }
            TaskEvent::Fetched { request, result } => self.finish_load(request, result),
            TaskEvent::ReferrerProgress { generation, count } => {
                self.report_referrer_progress(generation, count)
            }
            TaskEvent::ReferrersBuilt {
                generation,
                root_digest,
                result,
            } => self.finish_referrers(generation, root_digest, result),
            TaskEvent::TagsListed {
                registry,
                repository,
                listing,
            } => self.finish_tag_listing(registry, repository, listing),
            TaskEvent::Deleted { reference, result } => self.finish_delete(reference, result),
        }
    }

    fn enqueue(&mut self, request: LoadRequest) {
        if request.source.is_debounced() {
            if let Some(previous) = &self.pending {
                tracing::debug!(
                    "Tag selection #{} replaces pending #{}",
                    request.request_id,
                    previous.request.request_id
                );
            }
            self.pending = Some(PendingSelection {
                request,
                deadline: Instant::now() + self.config.tag_debounce,
            });
            return;
        }

        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                "Dropping pending tag selection #{} for #{}",
                pending.request.request_id,
                request.request_id
            );
        }
        self.start(request);
    }

    /// Accept a request: collapse it, skip it, or fetch it
    fn start(&mut self, request: LoadRequest) {
        if !request.force_reload {
            if let Some(in_flight) = &self.in_flight {
                if in_flight.request.reference == request.reference {
                    tracing::debug!(
                        "Collapsing #{} into in-flight #{} ({})",
                        request.request_id,
                        in_flight.request.request_id,
                        request.reference
                    );
                    return;
                }
            } else if self.shared.identity.snapshot().matches(&request.reference) {
                tracing::debug!("{} is already loaded, skipping", request.reference);
                return;
            }
        }

        if let Some(previous) = self.in_flight.take() {
            tracing::debug!(
                "#{} supersedes #{}",
                request.request_id,
                previous.request.request_id
            );
            if self.config.cancel_superseded {
                previous.handle.abort();
            }
        }

        let plan = self.refresh_plan(&request);
        let cached = self.gateways.get(request.reference.registry()).cloned();
        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        let verify_digests = self.config.verify_digests;

        self.shared.notifications.load_requested(LoadRequested {
            request_id: request.request_id,
            reference: request.reference.to_string(),
            source: request.source,
        });
        self.set_phase(LoadPhase::Resolving);
        tracing::info!("Loading {} (#{})", request.reference, request.request_id);

        let task_request = request.clone();
        let handle = tokio::spawn(async move {
            let result = fetch(connector, cached, &task_request, plan, verify_digests, &events).await;
            let _ = events.send(TaskEvent::Fetched {
                request: task_request,
                result,
            });
        });
        self.in_flight = Some(InFlight { request, handle });
    }

    fn refresh_plan(&self, request: &LoadRequest) -> RefreshPlan {
        let reference = &request.reference;
        let repositories =
            request.force_reload || self.registry.as_deref() != Some(reference.registry());
        let tags = repositories
            || self.shared.selection.lock().tags_repository() != Some(reference.repository());
        RefreshPlan { repositories, tags }
    }

    /// The in-flight request, unless a newer tag selection is waiting to replace it
    fn is_current(&self, request_id: u64) -> bool {
        let in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.request.request_id == request_id);
        in_flight
            && !self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.request.request_id > request_id)
    }

    fn finish_load(&mut self, request: LoadRequest, result: Result<Resolved, ResolutionError>) {
        if !self.is_current(request.request_id) {
            tracing::debug!("Discarding stale result for #{}", request.request_id);
            // Superseded by a pending selection: nothing is fetching until it starts
            if self
                .in_flight
                .as_ref()
                .is_some_and(|in_flight| in_flight.request.request_id == request.request_id)
            {
                self.in_flight = None;
                self.set_phase(LoadPhase::Idle);
            }
            return;
        }
        self.in_flight = None;

        let resolved = match result {
            Ok(resolved) => resolved,
            Err(error) => {
                tracing::warn!("Load #{} failed: {}", request.request_id, error);
                self.set_phase(LoadPhase::Failed);
                self.shared.notifications.load_failed(LoadFailed {
                    request_id: request.request_id,
                    reference: request.reference.to_string(),
                    error,
                });
                return;
            }
        };

        self.set_phase(LoadPhase::Applying);
        let reference = &request.reference;
        let Resolved {
            gateway,
            manifest,
            repositories,
            tags,
        } = resolved;
        self.gateways
            .insert(reference.registry().to_string(), gateway.clone());

        let identity = CurrentIdentity {
            registry: reference.registry().to_string(),
            repository: reference.repository().to_string(),
            manifest_digest: manifest.digest,
            selected_tag_name: reference.tag().map(str::to_string),
            raw_manifest_json: manifest.json,
            media_type: manifest.media_type,
            loaded_at: Some(chrono::Utc::now()),
        };

        let mut changes = Vec::new();
        {
            let mut selection = self.shared.selection.lock();
            if let Some(repositories) = repositories {
                selection.set_repositories(repositories);
                self.registry = Some(reference.registry().to_string());
            }
            if let Some(tags) = tags {
                changes.extend(selection.set_tags(reference.repository(), tags));
            }
            changes.extend(selection.sync_to(&identity, reference));
        }

        let root_digest = identity.manifest_digest.clone();
        self.shared.identity.replace(identity);
        let entry = reference.to_string();
        let ((), snapshot) = self.shared.edit_history(|history| history.insert(&entry));
        if let Some(snapshot) = snapshot {
            tokio::task::spawn_blocking(move || snapshot.write());
        }
        tracing::info!("Loaded {} ({})", reference, root_digest);

        self.shared.notifications.load_completed(LoadCompleted {
            request_id: request.request_id,
            reference: reference.to_string(),
            source: request.source,
            identity: self.shared.identity.snapshot(),
        });
        for change in changes {
            self.shared.notifications.selection_changed(change);
        }

        self.start_referrers(gateway, reference.repository().to_string(), root_digest);
        self.set_phase(LoadPhase::Idle);
    }

    fn start_referrers(
        &mut self,
        gateway: Arc<dyn RegistryGateway>,
        repository: String,
        root_digest: String,
    ) {
        self.stop_referrers();
        let generation = self.referrer_generation;
        *self.shared.referrers.lock() = ReferrerTree {
            root_digest: Some(root_digest.clone()),
            nodes: Vec::new(),
            loading: true,
        };

        let builder =
            ReferrerGraphBuilder::new(gateway).with_max_descriptors(self.config.max_referrers);
        let progress = self.events_tx.clone();
        let events = self.events_tx.clone();
        self.referrer_task = Some(tokio::spawn(async move {
            let result = builder
                .build(&repository, &root_digest, |count| {
                    let _ = progress.send(TaskEvent::ReferrerProgress { generation, count });
                })
                .await;
            let _ = events.send(TaskEvent::ReferrersBuilt {
                generation,
                root_digest,
                result,
            });
        }));
    }

    /// Forward progress of the live traversal only
    fn report_referrer_progress(&self, generation: u64, count: usize) {
        if generation != self.referrer_generation {
            return;
        }
        let Some(root_digest) = self.shared.referrers.lock().root_digest.clone() else {
            return;
        };
        self.shared
            .notifications
            .referrer_progress(ReferrerProgress { root_digest, count });
    }

    /// Invalidate the running traversal, aborting it if configured to
    fn stop_referrers(&mut self) {
        if let Some(task) = self.referrer_task.take() {
            if self.config.cancel_superseded {
                task.abort();
            }
        }
        self.referrer_generation += 1;
    }

    fn finish_referrers(
        &mut self,
        generation: u64,
        root_digest: String,
        result: Result<Vec<ReferrerNode>, ReferrerTraversalError>,
    ) {
        if generation != self.referrer_generation
            || self.shared.identity.snapshot().manifest_digest != root_digest
        {
            tracing::debug!("Discarding referrer tree for {}", root_digest);
            return;
        }
        self.referrer_task = None;

        let mut tree = self.shared.referrers.lock();
        tree.loading = false;
        match result {
            Ok(nodes) => {
                let count = descriptor_count(&nodes);
                tree.nodes = nodes;
                drop(tree);
                tracing::info!("{} referrers loaded for {}", count, root_digest);
                self.shared
                    .notifications
                    .referrers_loaded(ReferrersLoaded { root_digest, count });
            }
            Err(error) => {
                tree.nodes.clear();
                drop(tree);
                tracing::warn!("{}", error);
                self.shared
                    .notifications
                    .referrers_failed(ReferrersFailed { root_digest, error });
            }
        }
    }

    /// Registry lists belong to: the one listed, else the one loaded
    fn current_registry(&self) -> Option<String> {
        self.registry.clone().or_else(|| {
            let identity = self.shared.identity.snapshot();
            (!identity.is_empty()).then(|| identity.registry.clone())
        })
    }

    fn select_repository(&mut self, name: &str) {
        let change = self.shared.selection.lock().user_select_repository(name);
        let repository = match &change {
            SelectionChanged::Repository {
                name: Some(name), ..
            } => name.clone(),
            _ => name.to_string(),
        };
        self.shared.notifications.selection_changed(change);

        let Some(registry) = self.current_registry() else {
            tracing::warn!("No registry connected, cannot list tags of {}", repository);
            return;
        };

        let cached = self.gateways.get(&registry).cloned();
        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let listing =
                resolve::list_tags(connector.as_ref(), cached, &registry, &repository).await;
            let _ = events.send(TaskEvent::TagsListed {
                registry,
                repository,
                listing,
            });
        });
    }

    fn finish_tag_listing(
        &mut self,
        registry: String,
        repository: String,
        listing: Option<(Arc<dyn RegistryGateway>, Vec<String>)>,
    ) {
        let Some((gateway, tags)) = listing else {
            return;
        };
        self.gateways.insert(registry.clone(), gateway);
        if self.current_registry().as_deref() != Some(registry.as_str()) {
            return;
        }

        let change = {
            let mut selection = self.shared.selection.lock();
            let still_selected = selection
                .snapshot()
                .selected_repository
                .is_some_and(|selected| selected.eq_ignore_ascii_case(&repository));
            if !still_selected {
                tracing::debug!("Ignoring tags of {}, no longer selected", repository);
                return;
            }
            selection.set_tags(&repository, tags)
        };
        if let Some(change) = change {
            self.shared.notifications.selection_changed(change);
        }
    }

    fn select_tag(&mut self, name: &str) {
        let (change, auto_load) = self.shared.selection.lock().user_select_tag(name);
        self.shared.notifications.selection_changed(change);
        if !auto_load {
            tracing::debug!("Selection of {} not loaded (suppressed)", name);
            return;
        }
        if let Some(request) = self.selected_tag_request() {
            self.enqueue(request);
        }
    }

    fn commit_selection(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.start(pending.request);
        } else if let Some(mut request) = self.selected_tag_request() {
            request.source = SourceKind::CoordinatorNavigation;
            self.start(request);
        }
    }

    /// Tag-selection load for whatever tag is selected in the tag list
    fn selected_tag_request(&self) -> Option<LoadRequest> {
        let snapshot = self.shared.selection.lock().snapshot();
        let tag = snapshot.selected_tag?;
        let repository = snapshot.tags_repository?;
        let registry = self.current_registry()?;

        let reference = match Reference::parse(&format!("{}/{}:{}", registry, repository, tag)) {
            Ok(reference) => reference,
            Err(e) => {
                tracing::warn!("Cannot load selected tag: {}", e);
                return None;
            }
        };
        Some(LoadRequest {
            reference,
            source: SourceKind::TagSelection,
            force_reload: false,
            request_id: next_id(&self.next_request_id),
        })
    }

    fn delete(&mut self, reference: Reference) {
        let cached = self.gateways.get(reference.registry()).cloned();
        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match resolve::open(connector.as_ref(), cached, reference.registry()).await
            {
                Ok(gateway) => resolve::delete(gateway, &reference).await,
                Err(e) => Err(e),
            };
            let _ = events.send(TaskEvent::Deleted { reference, result });
        });
    }

    fn finish_delete(&mut self, reference: Reference, result: Result<Deleted, ResolutionError>) {
        let Deleted {
            gateway,
            digest,
            tags,
        } = match result {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!("{}", error);
                self.shared.notifications.delete_failed(DeleteFailed {
                    reference: reference.to_string(),
                    error,
                });
                return;
            }
        };
        self.gateways
            .insert(reference.registry().to_string(), gateway);

        let identity = self.shared.identity.snapshot();
        if identity.registry == reference.registry()
            && identity.repository == reference.repository()
            && identity.manifest_digest == digest
        {
            tracing::info!("Current manifest {} was deleted", digest);
            self.shared.identity.clear();
            self.stop_referrers();
            *self.shared.referrers.lock() = ReferrerTree::default();
        }

        let change = {
            let mut selection = self.shared.selection.lock();
            selection.forget_digest(&digest);
            match tags {
                Some(tags) if selection.tags_repository() == Some(reference.repository()) => {
                    selection.set_tags(reference.repository(), tags)
                }
                _ => None,
            }
        };

        self.shared.notifications.manifest_deleted(ManifestDeleted {
            reference: reference.to_string(),
            digest,
        });
        if let Some(change) = change {
            self.shared.notifications.selection_changed(change);
        }
    }

    fn disconnect(&mut self) {
        tracing::info!("Disconnecting");
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.handle.abort();
        }
        self.pending = None;
        self.stop_referrers();
        self.gateways.clear();
        self.registry = None;

        self.shared.identity.clear();
        *self.shared.referrers.lock() = ReferrerTree::default();
        let changes = self.shared.selection.lock().clear();
        self.set_phase(LoadPhase::Idle);
        for change in changes {
            self.shared.notifications.selection_changed(change);
        }
    }

    fn set_phase(&self, phase: LoadPhase) {
        *self.shared.phase.lock() = phase;
    }
}

async fn fetch(
    connector: Arc<dyn Connector>,
    cached: Option<Arc<dyn RegistryGateway>>,
    request: &LoadRequest,
    plan: RefreshPlan,
    verify_digests: bool,
    events: &mpsc::UnboundedSender<TaskEvent>,
) -> Result<Resolved, ResolutionError> {
    let gateway = resolve::open(connector.as_ref(), cached, request.reference.registry()).await?;
    let _ = events.send(TaskEvent::Phase {
        request_id: request.request_id,
        phase: LoadPhase::FetchingManifest,
    });
    resolve::resolve(gateway, &request.reference, plan, verify_digests).await
}
