//! rescache core - client-side resource fetch and cache coordinator
//!
//! A [`Registry`] owns one [`Resource`] per normalized URL, admits transfers
//! under a concurrency cap, streams bytes through pluggable
//! [`FetchStrategy`]s into a file-backed buffer, commits artifacts atomically
//! to an optionally encrypted on-disk store and keeps a debounced JSON index
//! of everything it knows.

mod cipher;
pub mod engine;
mod error;
mod group;
mod key;
mod queue;
mod resource;
mod storage;
mod watcher;

pub use cipher::*;
pub use engine::{FetchRequest, FetchStrategy, HttpStrategy, TransferContext};
pub use error::*;
pub use group::*;
pub use key::*;
pub use resource::Resource;
pub use storage::*;
pub use watcher::{CompletionHandler, CompletionOutcome, IdleHandler, ResourceWatcher, WatcherId};

pub use rescache_types::{CacheSettings, ResourceEvent, ResourceInfo, ResourceStatus, ResponseMeta};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use engine::{load_index, FinishedBuffer, IndexFile, IndexWriter, StrategyList, INDEX_FILE};
use parking_lot::Mutex;
use queue::{ActiveTransfer, AdmissionQueue};
use resource::{ResourceState, StartOutcome};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watcher::{Dispatcher, Notice, Notification};

/// The coordinator
///
/// Cheap to clone; clones share the same state. Every mutation goes through a
/// single lock and notifications are delivered after it is released, in
/// mutation order.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    dispatcher: Dispatcher,
    store: CacheStore,
    index: IndexWriter,
    settings: CacheSettings,
    /// Stops the periodic sweep
    background: CancellationToken,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

struct RegistryState {
    resources: HashMap<ResourceKey, ResourceState>,
    watchers: HashMap<WatcherId, Arc<dyn ResourceWatcher>>,
    queue: AdmissionQueue,
    strategies: StrategyList,
    idle_handlers: Vec<IdleHandler>,
    next_attempt: u64,
    next_watcher: u64,
}

/// A transfer admitted under the lock, started once it is released
struct Launch {
    key: ResourceKey,
    attempt: u64,
    token: CancellationToken,
    strategy: Arc<dyn FetchStrategy>,
}

impl RegistryState {
    fn entry(&mut self, key: &ResourceKey, expiration: Duration) -> &mut ResourceState {
        self.resources
            .entry(key.clone())
            .or_insert_with(|| ResourceState::new(key.clone(), expiration))
    }

    fn watchers_of(&self, resource: &ResourceState) -> Vec<Arc<dyn ResourceWatcher>> {
        resource
            .watchers
            .iter()
            .filter_map(|id| self.watchers.get(id).cloned())
            .collect()
    }

    /// Queue a notification carrying the resource's current snapshot
    fn notify(
        &self,
        dispatcher: &Dispatcher,
        key: &ResourceKey,
        notice: Notice,
        handlers: Vec<CompletionHandler>,
    ) {
        let Some(resource) = self.resources.get(key) else {
            return;
        };
        dispatcher.push(Notification::Resource {
            info: resource.snapshot(),
            watchers: self.watchers_of(resource),
            notice,
            handlers,
        });
    }

    fn take_handlers(&mut self, key: &ResourceKey) -> Vec<CompletionHandler> {
        self.resources
            .get_mut(key)
            .map(ResourceState::take_completion_handlers)
            .unwrap_or_default()
    }

    /// Move `key` to `InProgress` and reserve a slot for it
    fn admit(&mut self, dispatcher: &Dispatcher, key: ResourceKey) -> Option<Launch> {
        let resource = self.resources.get_mut(&key)?;
        resource.queued = false;
        match resource.start() {
            Ok(StartOutcome::Started) => {}
            Ok(StartOutcome::AlreadyDownloaded) => return None,
            Err(e) => {
                debug!(url = %key, "Not admitted: {}", e);
                return None;
            }
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let token = CancellationToken::new();
        let strategy = self.strategies.select(key.url());
        self.queue.admit(ActiveTransfer {
            key: key.clone(),
            attempt,
            token: token.clone(),
            strategy: strategy.clone(),
        });
        self.notify(dispatcher, &key, Notice::StatusChanged, Vec::new());
        debug!(url = %key, attempt, strategy = strategy.name(), "Transfer admitted");

        Some(Launch {
            key,
            attempt,
            token,
            strategy,
        })
    }

    /// Admit waiting requests while slots are free
    fn pump(&mut self, dispatcher: &Dispatcher) -> Vec<Launch> {
        let mut launches = Vec::new();
        while let Some(key) = self.queue.next_admissible() {
            if let Some(launch) = self.admit(dispatcher, key) {
                launches.push(launch);
            }
        }
        launches
    }

    /// Fire registry-level completion handlers once nothing is left to do
    fn settle(&mut self, dispatcher: &Dispatcher) {
        if self.queue.is_idle() {
            dispatcher.push(Notification::Idle {
                handlers: std::mem::take(&mut self.idle_handlers),
            });
        }
    }

    fn index_snapshot(&self) -> IndexFile {
        let mut resources: Vec<_> = self
            .resources
            .values()
            .filter(|r| r.indexed)
            .map(ResourceState::to_index)
            .collect();
        resources.sort_by(|a, b| a.url.cmp(&b.url));
        IndexFile::new(resources)
    }
}

impl RegistryInner {
    fn schedule_index(&self, state: &RegistryState) {
        self.index.schedule(state.index_snapshot());
    }

    /// Drop the artifact and reset the resource; the lock is held by the caller
    fn discard_artifact(&self, state: &mut RegistryState, key: &ResourceKey, notice: Notice) {
        if let Err(e) = self.store.remove_now(key) {
            warn!(url = %key, "Failed to delete artifact: {}", e);
        }
        if let Some(resource) = state.resources.get_mut(key) {
            resource.discard();
        }
        state.notify(&self.dispatcher, key, notice, Vec::new());
    }
}

impl Registry {
    /// Open a registry over `settings.cache_dir` without loading the index
    pub async fn new(settings: CacheSettings) -> Result<Self> {
        Self::with_cipher(settings, Arc::new(AesCipher)).await
    }

    /// Like [`new`](Self::new) with a custom at-rest cipher
    ///
    /// The cipher is only used when `settings.encryption_key` is set.
    pub async fn with_cipher(settings: CacheSettings, cipher: Arc<dyn Cipher>) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.cache_dir).await?;

        let mut store = CacheStore::open(&settings.cache_dir).await?;
        if let Some(key) = &settings.encryption_key {
            store = store.with_cipher(cipher, key.clone());
        }

        let http: Arc<dyn FetchStrategy> = Arc::new(HttpStrategy::new(&settings)?);
        let (event_tx, _) = broadcast::channel(1000);
        let index = IndexWriter::spawn(
            settings.cache_dir.join(INDEX_FILE),
            settings.index_debounce(),
        );

        let state = RegistryState {
            resources: HashMap::new(),
            watchers: HashMap::new(),
            queue: AdmissionQueue::new(settings.max_concurrent_downloads),
            strategies: StrategyList::new(http),
            idle_handlers: Vec::new(),
            next_attempt: 0,
            next_watcher: 0,
        };

        let registry = Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(state),
                dispatcher: Dispatcher::new(event_tx),
                store,
                index,
                settings,
                background: CancellationToken::new(),
            }),
        };

        if let Some(interval) = registry.inner.settings.sweep_interval() {
            registry.spawn_sweeper(interval);
        }

        info!(
            "Registry opened at {} (encrypted: {})",
            registry.inner.settings.cache_dir.display(),
            registry.inner.store.is_encrypted()
        );
        Ok(registry)
    }

    /// [`new`](Self::new) followed by [`restore`](Self::restore)
    pub async fn open(settings: CacheSettings) -> Result<Self> {
        let registry = Self::new(settings).await?;
        registry.restore().await;
        Ok(registry)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn index_path(&self) -> PathBuf {
        self.inner.index.path().to_path_buf()
    }

    /// Subscribe to every notification as a [`ResourceEvent`]
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.dispatcher.subscribe()
    }

    pub(crate) fn same_as(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get or create the resource for `url`; never starts a transfer
    pub fn resource_for(&self, url: impl IntoResourceKey) -> Result<Resource> {
        let key = url.into_resource_key()?;
        self.inner
            .state
            .lock()
            .entry(&key, self.inner.settings.default_expiration());
        Ok(Resource::new(key, self.clone()))
    }

    /// The resource for `url` if the registry already knows it
    pub fn get(&self, url: impl IntoResourceKey) -> Option<Resource> {
        let key = url.into_resource_key().ok()?;
        let known = self.inner.state.lock().resources.contains_key(&key);
        known.then(|| Resource::new(key, self.clone()))
    }

    /// Snapshots of every known resource, ordered by URL
    pub fn resources(&self) -> Vec<ResourceInfo> {
        let state = self.inner.state.lock();
        let mut all: Vec<_> = state.resources.values().map(ResourceState::snapshot).collect();
        all.sort_by(|a, b| a.url.cmp(&b.url));
        all
    }

    pub(crate) fn info_for(&self, key: &ResourceKey) -> ResourceInfo {
        let state = self.inner.state.lock();
        match state.resources.get(key) {
            Some(resource) => resource.snapshot(),
            None => ResourceState::new(key.clone(), self.inner.settings.default_expiration())
                .snapshot(),
        }
    }

    pub(crate) fn last_error_for(&self, key: &ResourceKey) -> Option<CacheError> {
        self.inner
            .state
            .lock()
            .resources
            .get(key)
            .and_then(|r| r.last_error.clone())
    }

    pub(crate) fn is_queued(&self, key: &ResourceKey) -> bool {
        self.inner.state.lock().queue.is_pending(key)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Get or create the resource and start it unless it is already
    /// downloaded, in progress or queued
    pub fn download(&self, url: impl IntoResourceKey) -> Result<Resource> {
        let key = url.into_resource_key()?;
        self.request(&key, false)?;
        Ok(Resource::new(key, self.clone()))
    }

    /// Start `key`, rejecting it with [`CacheError::Busy`] while it is
    /// already running or waiting for a slot
    pub(crate) fn start_key(&self, key: &ResourceKey) -> Result<()> {
        self.request(key, true)
    }

    fn request(&self, key: &ResourceKey, reject_busy: bool) -> Result<()> {
        let key = key.clone();
        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let status = state
                .entry(&key, self.inner.settings.default_expiration())
                .status;
            let busy = status == ResourceStatus::InProgress || state.queue.is_pending(&key);
            if busy && reject_busy {
                return Err(CacheError::Busy(format!("{} is already requested", key)));
            }

            match status {
                ResourceStatus::Downloaded | ResourceStatus::InProgress => Vec::new(),
                ResourceStatus::NotDownloaded if state.queue.is_pending(&key) => Vec::new(),
                ResourceStatus::NotDownloaded if state.queue.can_admit() => state
                    .admit(&self.inner.dispatcher, key.clone())
                    .into_iter()
                    .collect(),
                ResourceStatus::NotDownloaded => {
                    state.queue.enqueue(key.clone());
                    if let Some(resource) = state.resources.get_mut(&key) {
                        resource.queued = true;
                    }
                    debug!(url = %key, pending = state.queue.pending_count(), "Download queued");
                    Vec::new()
                }
            }
        };

        self.inner.dispatcher.flush();
        self.launch(launches);
        Ok(())
    }

    /// Cancel an in-flight or queued download; no-op otherwise
    pub fn cancel(&self, url: impl IntoResourceKey) -> Result<()> {
        let key = url.into_resource_key()?;
        self.cancel_key(&key);
        Ok(())
    }

    pub(crate) fn cancel_key(&self, key: &ResourceKey) {
        let (strategy, launches) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;

            if let Some(active) = state.queue.take_active(key) {
                active.token.cancel();
                if let Some(resource) = state.resources.get_mut(key) {
                    let _ = resource.cancel();
                }
                let handlers = state.take_handlers(key);
                state.notify(dispatcher, key, Notice::StatusChanged, Vec::new());
                state.notify(dispatcher, key, Notice::Cancelled, handlers);
                let launches = state.pump(dispatcher);
                state.settle(dispatcher);
                self.inner.schedule_index(state);
                info!(url = %key, "Transfer cancelled");
                (Some(active.strategy), launches)
            } else if state.queue.remove_pending(key) {
                if let Some(resource) = state.resources.get_mut(key) {
                    resource.queued = false;
                }
                let handlers = state.take_handlers(key);
                state.notify(dispatcher, key, Notice::Cancelled, handlers);
                state.settle(dispatcher);
                debug!(url = %key, "Queued download cancelled");
                (None, Vec::new())
            } else {
                (None, Vec::new())
            }
        };

        self.inner.dispatcher.flush();
        if let Some(strategy) = strategy {
            strategy.cancel(key);
        }
        self.launch(launches);
    }

    /// Stop every running transfer and hold new ones until [`resume`](Self::resume)
    ///
    /// Suspended transfers keep their place at the head of the queue. Their
    /// resources go back to `NotDownloaded` without a cancellation signal and
    /// their completion handlers stay armed.
    pub fn suspend(&self) {
        let drained = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let drained = state.queue.suspend();
            for transfer in &drained {
                transfer.token.cancel();
                if let Some(resource) = state.resources.get_mut(&transfer.key) {
                    let _ = resource.cancel();
                    resource.queued = true;
                }
                state.notify(
                    &self.inner.dispatcher,
                    &transfer.key,
                    Notice::StatusChanged,
                    Vec::new(),
                );
            }
            self.inner.schedule_index(state);
            drained
        };

        self.inner.dispatcher.flush();
        info!("Suspended {} transfers", drained.len());
        for transfer in drained {
            transfer.strategy.cancel(&transfer.key);
        }
    }

    pub fn resume(&self) {
        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.queue.resume();
            let launches = state.pump(&self.inner.dispatcher);
            state.settle(&self.inner.dispatcher);
            launches
        };
        self.inner.dispatcher.flush();
        info!("Resumed, {} transfers admitted", launches.len());
        self.launch(launches);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().queue.is_suspended()
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.inner.state.lock().queue.max_concurrent()
    }

    /// Values below 1 are raised to 1; raising the cap admits waiting requests
    pub fn set_max_concurrent_downloads(&self, max: usize) {
        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.queue.set_max_concurrent(max);
            state.pump(&self.inner.dispatcher)
        };
        self.inner.dispatcher.flush();
        self.launch(launches);
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().queue.active_count()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().queue.pending_count()
    }

    /// Run `handler` once when no transfer is running or waiting
    ///
    /// Runs right away if the registry is already idle.
    pub fn add_completion_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !state.queue.is_idle() {
                state.idle_handlers.push(Box::new(handler));
                return;
            }
        }
        handler();
    }

    pub(crate) fn add_resource_completion_handler(
        &self,
        key: &ResourceKey,
        handler: CompletionHandler,
    ) {
        let info = {
            let mut state = self.inner.state.lock();
            let resource = state.entry(key, self.inner.settings.default_expiration());
            let settled = resource.status == ResourceStatus::Downloaded;
            if !settled {
                resource.completion_handlers.push(handler);
                return;
            }
            resource.snapshot()
        };
        handler(&info, &CompletionOutcome::Downloaded);
    }

    fn launch(&self, launches: Vec<Launch>) {
        for launch in launches {
            info!(url = %launch.key, strategy = launch.strategy.name(), "Starting transfer");
            let transfer = TransferContext::new(
                self.clone(),
                launch.key,
                launch.attempt,
                launch.token,
                self.inner.store.staging_dir().to_path_buf(),
            );
            launch.strategy.start(transfer);
        }
    }

    // ========================================================================
    // Transfer reports
    // ========================================================================

    fn is_current(&self, key: &ResourceKey, attempt: u64) -> bool {
        self.inner.state.lock().queue.current(key, attempt).is_some()
    }

    pub(crate) fn transfer_will_send(
        &self,
        key: &ResourceKey,
        attempt: u64,
        request: &mut FetchRequest,
    ) {
        let (info, watchers) = {
            let state = self.inner.state.lock();
            if state.queue.current(key, attempt).is_none() {
                return;
            }
            let Some(resource) = state.resources.get(key) else {
                return;
            };
            (resource.snapshot(), state.watchers_of(resource))
        };

        for watcher in watchers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                watcher.will_send_request(&info, request)
            }));
            if result.is_err() {
                warn!(url = %key, "Watcher panicked in will_send_request");
            }
        }
        self.inner.dispatcher.emit(ResourceEvent::WillSendRequest {
            url: key.to_string(),
        });
    }

    pub(crate) fn transfer_expected_length(&self, key: &ResourceKey, attempt: u64, length: i64) {
        let mut state = self.inner.state.lock();
        if state.queue.current(key, attempt).is_none() {
            return;
        }
        if let Some(resource) = state.resources.get_mut(key) {
            resource.set_expected_length(length);
        }
    }

    pub(crate) fn transfer_content_type(
        &self,
        key: &ResourceKey,
        attempt: u64,
        content_type: String,
    ) {
        let mut state = self.inner.state.lock();
        if state.queue.current(key, attempt).is_none() {
            return;
        }
        if let Some(resource) = state.resources.get_mut(key) {
            resource.set_content_type(content_type);
        }
    }

    pub(crate) fn transfer_progress(&self, key: &ResourceKey, attempt: u64, downloaded: u64) {
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.queue.current(key, attempt).is_none() {
                return;
            }
            let moved = state
                .resources
                .get_mut(key)
                .and_then(|r| r.report_progress(downloaded));
            let Some(progress) = moved else {
                return;
            };
            state.notify(
                &self.inner.dispatcher,
                key,
                Notice::Progress(progress),
                Vec::new(),
            );
        }
        self.inner.dispatcher.flush();
    }

    pub(crate) fn transfer_failed(&self, key: &ResourceKey, attempt: u64, error: CacheError) {
        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;
            if state.queue.current(key, attempt).is_none() {
                return;
            }
            state.queue.take_active(key);
            if let Some(resource) = state.resources.get_mut(key) {
                let _ = resource.fail(error.clone());
            }
            warn!(url = %key, attempt, "Transfer failed: {}", error);

            let handlers = state.take_handlers(key);
            state.notify(dispatcher, key, Notice::StatusChanged, Vec::new());
            state.notify(dispatcher, key, Notice::Completed(Some(error)), handlers);
            let launches = state.pump(dispatcher);
            state.settle(dispatcher);
            self.inner.schedule_index(state);
            launches
        };

        self.inner.dispatcher.flush();
        self.launch(launches);
    }

    /// Commit a finished buffer unless the attempt was superseded meanwhile
    ///
    /// Sealing happens off the lock; the final rename and the state transition
    /// happen together under it, so a concurrent cancel either wins outright
    /// or finds the resource already downloaded.
    pub(crate) async fn transfer_succeeded(
        &self,
        key: &ResourceKey,
        attempt: u64,
        buffer: FinishedBuffer,
        response: Option<ResponseMeta>,
    ) {
        if !self.is_current(key, attempt) {
            return;
        }

        let length = buffer.len();
        let staged = match self.inner.store.stage_buffer(buffer.into_temp_path()).await {
            Ok(staged) => staged,
            Err(e) => return self.transfer_failed(key, attempt, e),
        };

        let launches = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;
            if state.queue.current(key, attempt).is_none() {
                debug!(url = %key, attempt, "Dropping superseded commit");
                return;
            }
            if let Err(e) = self.inner.store.install(key, staged) {
                drop(guard);
                return self.transfer_failed(key, attempt, e);
            }

            state.queue.take_active(key);
            if let Some(resource) = state.resources.get_mut(key) {
                if let Err(e) = resource.succeed(length, response) {
                    error!(url = %key, "Inconsistent state on commit: {}", e);
                }
            }
            info!(url = %key, bytes = length, "Transfer committed");

            let handlers = state.take_handlers(key);
            state.notify(dispatcher, key, Notice::StatusChanged, Vec::new());
            state.notify(dispatcher, key, Notice::Completed(None), handlers);
            let launches = state.pump(dispatcher);
            state.settle(dispatcher);
            self.inner.schedule_index(state);
            launches
        };

        self.inner.dispatcher.flush();
        self.launch(launches);
    }

    // ========================================================================
    // Cached bytes
    // ========================================================================

    /// Read the committed artifact and refresh the access date
    ///
    /// Fails with [`CacheError::NotDownloaded`] unless the resource is
    /// downloaded. An expired resource is evicted here instead of being served.
    pub async fn data(&self, url: impl IntoResourceKey) -> Result<Bytes> {
        let key = url.into_resource_key()?;
        let now = Utc::now();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let downloaded = state
                .resources
                .get(&key)
                .filter(|r| r.status == ResourceStatus::Downloaded);
            let Some(resource) = downloaded else {
                return Err(CacheError::NotDownloaded(key.to_string()));
            };
            if resource.is_expired(now) {
                info!(url = %key, "Expired on access");
                self.inner.discard_artifact(state, &key, Notice::Evicted);
                self.inner.schedule_index(state);
                drop(guard);
                self.inner.dispatcher.flush();
                return Err(CacheError::NotDownloaded(key.to_string()));
            }
        }

        match self.inner.store.read(&key).await {
            Ok(bytes) => {
                let mut guard = self.inner.state.lock();
                if let Some(resource) = guard.resources.get_mut(&key) {
                    if resource.status == ResourceStatus::Downloaded {
                        resource.touch(now);
                    }
                }
                self.inner.schedule_index(&guard);
                Ok(bytes)
            }
            Err(CacheError::NotDownloaded(_)) => {
                {
                    let mut guard = self.inner.state.lock();
                    let state = &mut *guard;
                    let stale = state
                        .resources
                        .get(&key)
                        .is_some_and(|r| r.status == ResourceStatus::Downloaded);
                    if stale {
                        warn!(url = %key, "Artifact missing, resetting resource");
                        if let Some(resource) = state.resources.get_mut(&key) {
                            resource.discard();
                        }
                        state.notify(&self.inner.dispatcher, &key, Notice::StatusChanged, Vec::new());
                        self.inner.schedule_index(state);
                    }
                }
                self.inner.dispatcher.flush();
                Err(CacheError::NotDownloaded(key.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Seed the cache with `data`, bypassing the network
    ///
    /// Rejected with [`CacheError::Busy`] while a transfer is running. A queued
    /// request for the URL is satisfied by the seed.
    pub async fn set_data(&self, url: impl IntoResourceKey, data: impl Into<Bytes>) -> Result<()> {
        let key = url.into_resource_key()?;
        let data: Bytes = data.into();
        if self
            .inner
            .state
            .lock()
            .resources
            .get(&key)
            .is_some_and(ResourceState::is_in_progress)
        {
            return Err(CacheError::Busy(key.to_string()));
        }

        let length = data.len() as u64;
        let staged = self.inner.store.stage_bytes(data).await?;

        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;
            let expiration = self.inner.settings.default_expiration();

            if state.entry(&key, expiration).is_in_progress() {
                return Err(CacheError::Busy(key.to_string()));
            }
            self.inner.store.install(&key, staged)?;
            let was_queued = state.queue.remove_pending(&key);

            let resource = state.entry(&key, expiration);
            if resource.status == ResourceStatus::NotDownloaded {
                resource.start()?;
                state.notify(dispatcher, &key, Notice::StatusChanged, Vec::new());
                state.entry(&key, expiration).succeed(length, None)?;
            } else {
                resource.replace_payload(length)?;
            }

            let handlers = state.take_handlers(&key);
            state.notify(dispatcher, &key, Notice::StatusChanged, Vec::new());
            state.notify(dispatcher, &key, Notice::Completed(None), handlers);
            if was_queued {
                state.settle(dispatcher);
            }
            self.inner.schedule_index(state);
            debug!(url = %key, bytes = length, "Seeded");
        }

        self.inner.dispatcher.flush();
        Ok(())
    }

    /// Delete the artifact and the index entry; the resource itself stays
    /// known as `NotDownloaded`
    pub fn remove(&self, url: impl IntoResourceKey) -> Result<()> {
        let key = url.into_resource_key()?;
        let (strategy, launches, removed) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;
            let mut strategy = None;
            let mut launches = Vec::new();

            if let Some(active) = state.queue.take_active(&key) {
                active.token.cancel();
                if let Some(resource) = state.resources.get_mut(&key) {
                    let _ = resource.cancel();
                }
                let handlers = state.take_handlers(&key);
                state.notify(dispatcher, &key, Notice::StatusChanged, Vec::new());
                state.notify(dispatcher, &key, Notice::Cancelled, handlers);
                launches = state.pump(dispatcher);
                state.settle(dispatcher);
                strategy = Some(active.strategy);
            } else if state.queue.remove_pending(&key) {
                let handlers = state.take_handlers(&key);
                state.notify(dispatcher, &key, Notice::Cancelled, handlers);
                state.settle(dispatcher);
            }

            let removed = self.inner.store.remove_now(&key);
            if let Some(resource) = state.resources.get_mut(&key) {
                resource.discard();
                resource.queued = false;
                resource.indexed = false;
            }
            state.notify(dispatcher, &key, Notice::Removed, Vec::new());
            self.inner.schedule_index(state);
            info!(url = %key, "Removed");
            (strategy, launches, removed)
        };

        self.inner.dispatcher.flush();
        if let Some(strategy) = strategy {
            strategy.cancel(&key);
        }
        self.launch(launches);
        removed.map(|_| ())
    }

    /// Zero disables expiration
    pub fn set_expiration_period(&self, url: impl IntoResourceKey, period: Duration) -> Result<()> {
        let key = url.into_resource_key()?;
        self.expire_after(&key, period);
        Ok(())
    }

    pub(crate) fn expire_after(&self, key: &ResourceKey, period: Duration) {
        let mut state = self.inner.state.lock();
        state
            .entry(key, self.inner.settings.default_expiration())
            .expiration_period = period;
        self.inner.schedule_index(&state);
    }

    /// Evict every resource whose expiration period has elapsed since its
    /// last access
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit clock
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let evicted = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let expired: Vec<ResourceKey> = state
                .resources
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.key.clone())
                .collect();
            for key in &expired {
                self.inner.discard_artifact(state, key, Notice::Evicted);
            }
            if !expired.is_empty() {
                self.inner.schedule_index(state);
            }
            expired.len()
        };

        self.inner.dispatcher.flush();
        if evicted > 0 {
            info!("Evicted {} expired resources", evicted);
        }
        evicted
    }

    fn spawn_sweeper(&self, interval: Duration) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let stop = self.inner.background.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Registry { inner }.sweep_expired();
            }
            debug!("Sweeper stopped");
        });
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    pub fn register_watcher(&self, watcher: Arc<dyn ResourceWatcher>) -> WatcherId {
        let mut state = self.inner.state.lock();
        state.next_watcher += 1;
        let id = WatcherId(state.next_watcher);
        state.watchers.insert(id, watcher);
        id
    }

    /// Forget the watcher entirely, detaching it from every resource
    pub fn unregister_watcher(&self, id: WatcherId) {
        let mut state = self.inner.state.lock();
        state.watchers.remove(&id);
        for resource in state.resources.values_mut() {
            resource.remove_watcher(id);
        }
    }

    pub fn add_watcher(&self, url: impl IntoResourceKey, id: WatcherId) -> Result<()> {
        let key = url.into_resource_key()?;
        self.attach_watcher(&key, id);
        Ok(())
    }

    pub fn remove_watcher(&self, url: impl IntoResourceKey, id: WatcherId) -> Result<()> {
        let key = url.into_resource_key()?;
        self.detach_watcher(&key, id);
        Ok(())
    }

    /// Detach `id` from every resource but keep it registered
    pub fn remove_watcher_from_all(&self, id: WatcherId) {
        let mut state = self.inner.state.lock();
        for resource in state.resources.values_mut() {
            resource.remove_watcher(id);
        }
    }

    pub(crate) fn attach_watcher(&self, key: &ResourceKey, id: WatcherId) {
        let mut state = self.inner.state.lock();
        state
            .entry(key, self.inner.settings.default_expiration())
            .add_watcher(id);
    }

    pub(crate) fn detach_watcher(&self, key: &ResourceKey, id: WatcherId) {
        if let Some(resource) = self.inner.state.lock().resources.get_mut(key) {
            resource.remove_watcher(id);
        }
    }

    // ========================================================================
    // Strategies
    // ========================================================================

    /// Consulted in registration order before the default HTTP strategy
    pub fn register_strategy(&self, strategy: Arc<dyn FetchStrategy>) {
        info!("Registered fetch strategy {}", strategy.name());
        self.inner.state.lock().strategies.register(strategy);
    }

    pub fn unregister_strategy(&self, name: &str) -> bool {
        self.inner.state.lock().strategies.unregister(name)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load the persistence index, then sweep expired entries
    ///
    /// Returns the number of resources restored. A missing, corrupt or
    /// foreign-version index restores nothing. Resources already known to
    /// this registry are left alone.
    pub async fn restore(&self) -> usize {
        let index = load_index(self.inner.index.path()).await;

        let mut loaded = Vec::with_capacity(index.resources.len());
        for entry in &index.resources {
            let key = match ResourceKey::parse(&entry.url) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping index entry: {}", e);
                    continue;
                }
            };
            let mut resource = ResourceState::from_index(key.clone(), entry);
            if resource.status == ResourceStatus::Downloaded && !self.inner.store.contains(&key).await
            {
                warn!(url = %key, "Indexed artifact missing, marking not downloaded");
                resource.discard();
            }
            loaded.push(resource);
        }

        let restored = {
            let mut state = self.inner.state.lock();
            let mut restored = 0;
            for resource in loaded {
                if !state.resources.contains_key(&resource.key) {
                    state.resources.insert(resource.key.clone(), resource);
                    restored += 1;
                }
            }
            self.inner.schedule_index(&state);
            restored
        };

        info!("Restored {} resources from index", restored);
        self.sweep_expired();
        restored
    }

    /// Write the pending index snapshot now
    pub async fn flush_index(&self) -> Result<()> {
        self.inner.index.flush().await
    }

    /// Cancel every transfer, stop background work and flush the index
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.background.cancel();

        let drained = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let dispatcher = &self.inner.dispatcher;
            let drained = state.queue.suspend();
            for transfer in &drained {
                transfer.token.cancel();
                if let Some(resource) = state.resources.get_mut(&transfer.key) {
                    let _ = resource.cancel();
                }
                state.notify(dispatcher, &transfer.key, Notice::StatusChanged, Vec::new());
            }
            for key in state.queue.drain_pending() {
                if let Some(resource) = state.resources.get_mut(&key) {
                    resource.queued = false;
                }
                let handlers = state.take_handlers(&key);
                state.notify(dispatcher, &key, Notice::Cancelled, handlers);
            }
            state.settle(dispatcher);
            self.inner.schedule_index(state);
            drained
        };

        self.inner.dispatcher.flush();
        for transfer in drained {
            transfer.strategy.cancel(&transfer.key);
        }
        self.inner.index.shutdown().await?;
        info!("Registry shut down");
        Ok(())
    }
}
