//! The backend: one object answering package queries from an in-memory
//! cache and handing privileged jobs to the worker.
//!
//! [`Backend::init`] loads the database, so every `Backend` value is ready
//! to use. Queries and marks are synchronous. Commits and cache updates
//! run in a worker session whose notifications are re-emitted to every
//! [`Backend::subscribe`]r, in order.

use crate::cache::PackageCache;
use crate::codes::{message_details, Details, ErrorCode, FetchType, WarningCode, WorkerEvent, WorkerQuestion};
use crate::config::BackendConfig;
use crate::database::PackageDatabase;
use crate::error::{Error, Result};
use crate::package::{Group, Package, PackageState};
use crate::protocol::{WorkerMessage, WorkerRequest};
use crate::search::SearchIndex;
use crate::transport::WorkerTransport;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Notifications emitted by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    ErrorOccurred { code: ErrorCode, details: Details },
    WarningOccurred { code: WarningCode, details: Details },
    /// Answer with [`Backend::answer_worker_question`].
    QuestionOccurred { question: WorkerQuestion, details: Details },
    /// A pending package state changed.
    PackageChanged,
    WorkerEvent(WorkerEvent),
    /// Download progress; speed in bytes per second, ETA in seconds.
    DownloadProgress { percentage: u8, speed: u64, eta: u64 },
    DownloadMessage { flag: FetchType, message: String },
    CommitProgress { status: String, percentage: u8 },
    WorkerStarted,
    /// The worker job ended. On success the cache has been reloaded.
    WorkerFinished { success: bool },
}

impl From<WorkerMessage> for BackendEvent {
    fn from(message: WorkerMessage) -> Self {
        match message {
            WorkerMessage::Started => BackendEvent::WorkerStarted,
            WorkerMessage::Finished { success } => BackendEvent::WorkerFinished { success },
            WorkerMessage::Error { code, details } => BackendEvent::ErrorOccurred { code, details },
            WorkerMessage::Warning { code, details } => BackendEvent::WarningOccurred { code, details },
            WorkerMessage::Question { question, details } => {
                BackendEvent::QuestionOccurred { question, details }
            }
            WorkerMessage::Event { event } => BackendEvent::WorkerEvent(event),
            WorkerMessage::DownloadProgress { percentage, speed, eta } => {
                BackendEvent::DownloadProgress { percentage, speed, eta }
            }
            WorkerMessage::DownloadMessage { flag, message } => {
                BackendEvent::DownloadMessage { flag, message }
            }
            WorkerMessage::CommitProgress { status, percentage } => {
                BackendEvent::CommitProgress { status, percentage }
            }
        }
    }
}

struct State {
    cache: PackageCache,
    index: SearchIndex,
    /// Whether `index` matches the persisted copy.
    index_saved: bool,
}

struct Inner {
    config: BackendConfig,
    database: Arc<dyn PackageDatabase>,
    transport: Arc<dyn WorkerTransport>,
    state: RwLock<State>,
    events: broadcast::Sender<BackendEvent>,
    busy: AtomicBool,
    job: Mutex<Option<mpsc::Sender<WorkerRequest>>>,
}

/// The package backend.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    /// Opens the database, fills the cache and opens the search index.
    ///
    /// Blocking: call it from a blocking context inside a runtime.
    pub fn init(
        database: Arc<dyn PackageDatabase>,
        transport: Arc<dyn WorkerTransport>,
        config: BackendConfig,
    ) -> Result<Self> {
        info!("Initializing backend with {} database", database.source_id());

        let cache = PackageCache::new(database.load()?);
        let (index, index_saved) = open_index(&config.index_path(), &cache);
        info!("Loaded {} packages in {} groups", cache.len(), cache.groups().count());

        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                database,
                transport,
                state: RwLock::new(State {
                    cache,
                    index,
                    index_saved,
                }),
                events,
                busy: AtomicBool::new(false),
                job: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    /// Receives every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }

    /// Repopulates the cache from the database. Pending marks are lost.
    pub fn reload_cache(&self) -> Result<()> {
        self.inner.reload_cache()
    }

    pub fn package(&self, name: &str) -> Option<Package> {
        self.inner.read_state().cache.package(name).cloned()
    }

    /// Number of packages, not counting leftovers without any version.
    pub fn package_count(&self) -> usize {
        self.inner.read_state().cache.len()
    }

    /// Number of packages having any of `states`.
    pub fn package_count_with(&self, states: PackageState) -> usize {
        self.inner.read_state().cache.count(states)
    }

    pub fn available_packages(&self) -> Vec<Package> {
        self.inner.read_state().cache.packages().cloned().collect()
    }

    pub fn upgradeable_packages(&self) -> Vec<Package> {
        self.inner.read_state().cache.upgradeable().cloned().collect()
    }

    pub fn marked_packages(&self) -> Vec<Package> {
        self.inner.read_state().cache.marked().cloned().collect()
    }

    pub fn group(&self, name: &str) -> Option<Group> {
        self.inner.read_state().cache.group(name).cloned()
    }

    pub fn available_groups(&self) -> Vec<Group> {
        self.inner.read_state().cache.groups().cloned().collect()
    }

    /// Packages matching `query` in the search index, best match first.
    pub fn search(&self, query: &str) -> Vec<Package> {
        let state = self.inner.read_state();
        state
            .index
            .search(query)
            .iter()
            .filter_map(|name| state.cache.package(name).cloned())
            .collect()
    }

    /// Whether the search index is missing or older than the database.
    pub fn search_index_needs_update(&self) -> bool {
        let modified = self.inner.database.last_modified();
        let state = self.inner.read_state();
        !state.index_saved || state.index.needs_update(modified, state.cache.len())
    }

    /// Rebuilds the search index from the cache and persists it.
    pub fn update_search_index(&self) -> Result<()> {
        let path = self.inner.config.index_path();
        let mut state = self.inner.write_state();
        let index = SearchIndex::build(state.cache.packages());
        index.save(&path)?;
        info!("Search index rebuilt with {} packages", index.package_count());
        state.index = index;
        state.index_saved = true;
        Ok(())
    }

    /// Marks every upgradeable package for upgrade, without allowing new
    /// packages to be installed. Withdraws an earlier dist-upgrade.
    pub fn mark_packages_for_upgrade(&self) {
        self.mark_upgrades(false);
    }

    /// Marks every upgradeable package for upgrade and lets the worker
    /// install new packages the upgrade requires.
    pub fn mark_packages_for_dist_upgrade(&self) {
        self.mark_upgrades(true);
    }

    fn mark_upgrades(&self, dist: bool) {
        let changed = {
            let mut state = self.inner.write_state();
            let was_dist = state.cache.is_dist_upgrade();
            let marked = state.cache.mark_all_upgrades(dist);
            debug!("Marked {} packages for upgrade (dist: {})", marked, dist);
            marked > 0 || was_dist != dist
        };
        if changed {
            self.inner.emit(BackendEvent::PackageChanged);
        }
    }

    /// Drops every pending change, including a requested dist-upgrade.
    pub fn clear_marks(&self) {
        let changed = {
            let mut state = self.inner.write_state();
            let pending = state.cache.is_dist_upgrade() || state.cache.marked().next().is_some();
            state.cache.clear_marks();
            pending
        };
        if changed {
            self.inner.emit(BackendEvent::PackageChanged);
        }
    }

    pub fn mark_package_for_install(&self, name: &str) -> Result<()> {
        self.mark_with(name, PackageCache::mark_install)
    }

    pub fn mark_package_for_removal(&self, name: &str) -> Result<()> {
        self.mark_with(name, PackageCache::mark_remove)
    }

    /// Drops the pending change of a package.
    pub fn mark_package_keep(&self, name: &str) -> Result<()> {
        self.mark_with(name, PackageCache::mark_keep)
    }

    fn mark_with(
        &self,
        name: &str,
        mark: impl FnOnce(&mut PackageCache, &str) -> Result<bool>,
    ) -> Result<()> {
        let changed = mark(&mut self.inner.write_state().cache, name)?;
        if changed {
            self.inner.emit(BackendEvent::PackageChanged);
        }
        Ok(())
    }

    /// Hands the pending changes to the worker. Progress and the outcome
    /// arrive as events.
    pub async fn commit_changes(&self) -> Result<()> {
        let changes = self.inner.read_state().cache.change_set();
        if changes.is_empty() {
            info!("No pending changes to commit");
            return Ok(());
        }
        info!("Committing changes to {} packages", changes.len());
        self.start_job(WorkerRequest::CommitChanges { changes }).await
    }

    /// Asks the worker to download fresh package source lists.
    pub async fn update_cache(&self) -> Result<()> {
        info!("Updating package cache");
        self.start_job(WorkerRequest::UpdateCache).await
    }

    /// Cancels the running job's downloads. Does nothing when idle.
    pub async fn cancel_download(&self) {
        match self.inner.job_sender() {
            Some(sender) => {
                info!("Cancelling worker job");
                if sender.send(WorkerRequest::CancelDownload).await.is_err() {
                    debug!("Worker already gone");
                }
            }
            None => debug!("No worker job to cancel"),
        }
    }

    /// Sends the answer to the worker's outstanding question.
    pub async fn answer_worker_question(&self, response: Details) -> Result<()> {
        let sender = self
            .inner
            .job_sender()
            .ok_or_else(|| Error::WorkerUnavailable("no worker job is running".into()))?;
        sender
            .send(WorkerRequest::Answer { response })
            .await
            .map_err(|_| Error::WorkerUnavailable("worker is gone".into()))
    }

    /// Whether a worker job is running.
    pub fn is_worker_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    async fn start_job(&self, request: WorkerRequest) -> Result<()> {
        if self.inner.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::WorkerBusy);
        }

        let session = match self.inner.transport.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.inner.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if session.requests.send(request).await.is_err() {
            self.inner.busy.store(false, Ordering::SeqCst);
            return Err(Error::WorkerUnavailable("worker closed its input".into()));
        }

        *self.inner.lock_job() = Some(session.requests);
        tokio::spawn(relay(self.inner.clone(), session.messages));
        Ok(())
    }
}

impl Inner {
    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_job(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<WorkerRequest>>> {
        self.job.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn job_sender(&self) -> Option<mpsc::Sender<WorkerRequest>> {
        self.lock_job().clone()
    }

    fn emit(&self, event: BackendEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn reload_cache(&self) -> Result<()> {
        let cache = PackageCache::new(self.database.load()?);
        info!("Reloaded {} packages", cache.len());
        self.write_state().cache = cache;
        Ok(())
    }
}

/// Forwards worker messages as events until the job finishes.
async fn relay(inner: Arc<Inner>, mut messages: mpsc::Receiver<WorkerMessage>) {
    let mut success = false;

    while let Some(message) = messages.recv().await {
        if let WorkerMessage::Finished { success: finished } = message {
            success = finished;
            break;
        }
        inner.emit(message.into());
    }

    if success {
        let reloading = inner.clone();
        let reloaded = tokio::task::spawn_blocking(move || reloading.reload_cache())
            .await
            .map_err(|e| Error::Other(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = reloaded {
            error!("Failed to reload cache after worker job: {}", e);
            inner.emit(BackendEvent::ErrorOccurred {
                code: ErrorCode::InitError,
                details: message_details(e.to_string()),
            });
        }
    }

    *inner.lock_job() = None;
    inner.busy.store(false, Ordering::SeqCst);
    info!("Worker job finished (success: {})", success);
    inner.emit(BackendEvent::WorkerFinished { success });
}

fn open_index(path: &Path, cache: &PackageCache) -> (SearchIndex, bool) {
    match SearchIndex::load(path) {
        Ok(Some(index)) => return (index, true),
        Ok(None) => debug!("No search index at {}", path.display()),
        Err(e) => warn!("Discarding unreadable search index: {}", e),
    }

    let index = SearchIndex::build(cache.packages());
    match index.save(path) {
        Ok(()) => (index, true),
        Err(e) => {
            warn!("Failed to save search index: {}", e);
            (index, false)
        }
    }
}
