//! Sync cache manager.
//!
//! Reads are two-phase. Whatever the local store holds is published at
//! once; a background task then asks the remote source, writes the answer
//! back to the store and publishes it only if the selection it was started
//! for is still current. Every selection change bumps a generation counter,
//! and a background result carries the generation it was requested under.
//!
//! Writes are optimistic. The record is built locally, stored, published,
//! and only then sent to the remote source. A remote failure is logged and
//! recorded in the write log; it never undoes the local change.
//!
//! Changes pushed by the remote source are applied to the store directly
//! and to the published state only where the affected collection is shown.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, MergeStrategy};
use crate::error::{Result, SyncError};
use crate::logging::OperationTimer;
use crate::merge::merge_records;
use crate::metrics::{ReconcileOutcome, SyncMetrics};
use crate::models::{
    ChangeEvent, Channel, ChannelFilter, ChannelPatch, ChannelRow, Message, MessagePatch,
    MessageRow, NewChannel, Preferences, Reactions, Record, RemoteChange, Workspace,
};
use crate::normalize::{
    normalize_attachment, normalize_channel, normalize_message, normalize_workspace,
    renormalize_message,
};
use crate::remote::RemoteSource;
use crate::state::{StateProjection, SyncKey, WorkspaceSnapshot, WriteEntry, WriteStatus};
use crate::store::{Collection, LocalStore};
use crate::validation::InputValidator;

/// Behaviour knobs of [`WorkspaceSync`]
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Author id stamped on new messages and channels
    pub user_id: String,
    /// Content a soft-deleted message is left with
    pub tombstone_text: String,
    /// How fetched snapshots are combined with cached ones
    pub merge_strategy: MergeStrategy,
    /// Upper bound on every remote call
    pub remote_timeout: Duration,
    /// Number of write log entries kept
    pub write_log_capacity: usize,
}

impl SyncSettings {
    /// Settings from the `sync`, `session` and `remote` config sections
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            user_id: config.session.user_id.clone(),
            tombstone_text: config.sync.tombstone_text.clone(),
            merge_strategy: config.sync.merge_strategy,
            remote_timeout: config.remote.timeout(),
            write_log_capacity: config.sync.write_log_capacity,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Background fetches started by a read.
///
/// Dropping it detaches the tasks; they still run to completion.
#[derive(Debug, Default)]
pub struct Reconciliation {
    handles: Vec<JoinHandle<()>>,
}

impl Reconciliation {
    fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handles: vec![tokio::spawn(task)],
        }
    }

    fn join(mut self, other: Self) -> Self {
        self.handles.extend(other.handles);
        self
    }

    /// True when no fetch was started, e.g. because one was already in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every fetch to settle
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Reconciliation task aborted");
            }
        }
    }
}

/// Live feed of remote changes being applied to the cache.
///
/// Dropping it stops the feed.
#[derive(Debug)]
pub struct RealtimeSubscription {
    handle: JoinHandle<()>,
}

impl RealtimeSubscription {
    /// Stop applying remote changes
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Whether the feed is still being consumed
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Inner {
    store: LocalStore,
    remote: Arc<dyn RemoteSource>,
    state: StateProjection,
    metrics: SyncMetrics,
    settings: SyncSettings,
    workspace_generation: AtomicU64,
    channel_generation: AtomicU64,
    /// Keys with a registered fetch, mapped to the newest generation asking
    in_flight: Mutex<HashMap<SyncKey, u64>>,
    /// Remote calls running per key; `syncing` in the snapshot mirrors the
    /// nonzero entries
    syncing: Mutex<HashMap<SyncKey, usize>>,
    /// Channels deleted during this session; late fetches for them are dropped
    deleted_channels: Mutex<HashSet<String>>,
    write_seq: AtomicU64,
}

/// Local-first cache of workspaces, channels and messages
#[derive(Clone)]
pub struct WorkspaceSync {
    inner: Arc<Inner>,
}

impl WorkspaceSync {
    /// Build a manager over `store` and `remote`.
    ///
    /// Saved preferences are loaded from the store; if that fails the
    /// defaults are used.
    pub fn new(store: LocalStore, remote: Arc<dyn RemoteSource>, settings: SyncSettings) -> Self {
        let preferences = store.load_preferences().unwrap_or_else(|e| {
            warn!(error = %e, "Could not load saved preferences; using defaults");
            Preferences::default()
        });
        let state = StateProjection::new(WorkspaceSnapshot {
            preferences,
            ..WorkspaceSnapshot::default()
        });

        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                state,
                metrics: SyncMetrics::default(),
                settings,
                workspace_generation: AtomicU64::new(0),
                channel_generation: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                syncing: Mutex::new(HashMap::new()),
                deleted_channels: Mutex::new(HashSet::new()),
                write_seq: AtomicU64::new(0),
            }),
        }
    }

    /// New subscriber to published snapshots
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkspaceSnapshot> {
        self.inner.state.subscribe()
    }

    /// Clone of the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.inner.state.snapshot()
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Flush the local store to disk
    pub fn flush(&self) -> Result<()> {
        self.inner.store.flush()
    }

    /// Forget the last reported failure
    pub fn clear_error(&self) {
        self.inner.state.update_if(|s| s.last_error.take().is_some());
    }

    // ---- read path ----

    /// Publish cached workspaces, then refresh them from the remote source.
    ///
    /// Must be called within a Tokio runtime.
    pub fn load_workspaces(&self) -> Reconciliation {
        if let Ok(workspaces) = self.local_workspaces() {
            self.inner.state.update(|s| s.workspaces = workspaces);
        }

        if !self.begin_fetch(&SyncKey::Workspaces, 0) {
            debug!("Workspace fetch already in flight");
            return Reconciliation::default();
        }
        let this = self.clone();
        Reconciliation::spawn(async move {
            if let Err(e) = this.reconcile_workspaces().await {
                warn!(error = %e, "Workspace sync failed; keeping cached workspaces");
            }
        })
    }

    /// Switch workspace. Channel selection and the channel list are reset,
    /// then the new workspace's channels are loaded.
    pub fn select_workspace(&self, workspace_id: Option<&str>) -> Reconciliation {
        let mut generation = 0;
        self.inner.state.update(|s| {
            generation = self.inner.workspace_generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.channel_generation.fetch_add(1, Ordering::SeqCst);
            s.current_workspace = workspace_id.map(str::to_string);
            s.channels.clear();
            s.channels_loading = false;
            s.clear_channel_view();
        });
        info!(workspace_id = ?workspace_id, generation, "Workspace selected");

        match workspace_id {
            Some(workspace_id) => self.load_channels_at(workspace_id, generation),
            None => Reconciliation::default(),
        }
    }

    /// Publish cached channels of `workspace_id`, then refresh them
    pub fn load_channels(&self, workspace_id: &str) -> Reconciliation {
        let generation = self.inner.workspace_generation.load(Ordering::SeqCst);
        self.load_channels_at(workspace_id, generation)
    }

    fn load_channels_at(&self, workspace_id: &str, generation: u64) -> Reconciliation {
        let key = SyncKey::Channels(workspace_id.to_string());
        self.inner.state.update(|s| s.channels_loading = true);
        let cached = self.local_channels(workspace_id);
        self.inner.state.update(|s| {
            s.channels_loading = false;
            if let Ok(channels) = cached {
                if self.is_current(s, &key, generation) {
                    s.channels = channels;
                }
            }
        });

        if !self.begin_fetch(&key, generation) {
            debug!(workspace_id, "Channel fetch already in flight");
            return Reconciliation::default();
        }
        let this = self.clone();
        let workspace_id = workspace_id.to_string();
        Reconciliation::spawn(async move {
            if let Err(e) = this.reconcile_channels(&workspace_id, generation, true).await {
                warn!(workspace_id = %workspace_id, error = %e, "Channel sync failed; keeping cached channels");
            }
        })
    }

    /// Change the selected channel.
    ///
    /// Per-channel state is cleared first. With a channel given, its
    /// messages, advance lists and shared order lists are loaded; results of
    /// fetches started for an earlier selection are dropped.
    pub fn select_channel(&self, channel_id: Option<&str>) -> Reconciliation {
        let mut generation = 0;
        self.inner.state.update(|s| {
            generation = self.inner.channel_generation.fetch_add(1, Ordering::SeqCst) + 1;
            s.clear_channel_view();
            s.selected_channel = channel_id.map(str::to_string);
        });
        info!(channel_id = ?channel_id, generation, "Channel selected");

        let Some(channel_id) = channel_id else {
            return Reconciliation::default();
        };
        self.load_messages_at(channel_id, generation)
            .join(self.load_advance_lists(channel_id, generation))
            .join(self.load_shared_order_lists(channel_id, generation))
    }

    /// Publish cached messages of `channel_id`, then refresh them.
    ///
    /// The cached publish has happened by the time this returns. The
    /// refresh runs in the background; if one is already in flight for the
    /// channel it is reused and the returned [`Reconciliation`] is empty.
    pub fn load_messages(&self, channel_id: &str) -> Reconciliation {
        let generation = self.inner.channel_generation.load(Ordering::SeqCst);
        self.load_messages_at(channel_id, generation)
    }

    /// Publish cached messages of `channel_id` without asking the remote
    pub fn load_messages_local(&self, channel_id: &str) {
        let generation = self.inner.channel_generation.load(Ordering::SeqCst);
        self.publish_local_messages(channel_id, generation);
    }

    /// Fetch `channel_id` from the remote source now and wait for it.
    ///
    /// Unlike background refreshes, a failure is returned to the caller.
    pub async fn sync_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        InputValidator::validate_id(channel_id)?;
        let generation = self.inner.channel_generation.load(Ordering::SeqCst);
        let timer = OperationTimer::new("sync_messages");
        let result = self.reconcile_messages(channel_id, generation, false).await;
        timer.finish();
        if let Err(e) = &result {
            self.report_error("sync_messages", e);
        }
        result
    }

    fn load_messages_at(&self, channel_id: &str, generation: u64) -> Reconciliation {
        self.publish_local_messages(channel_id, generation);

        if !self.begin_fetch(&SyncKey::Messages(channel_id.to_string()), generation) {
            debug!(channel_id, "Message fetch already in flight");
            return Reconciliation::default();
        }
        let this = self.clone();
        let channel_id = channel_id.to_string();
        Reconciliation::spawn(async move {
            if let Err(e) = this.reconcile_messages(&channel_id, generation, true).await {
                warn!(channel_id = %channel_id, error = %e, "Message sync failed; keeping cached messages");
            }
        })
    }

    fn publish_local_messages(&self, channel_id: &str, generation: u64) {
        let key = SyncKey::Messages(channel_id.to_string());
        self.inner.state.update(|s| {
            s.loading.insert(channel_id.to_string());
        });
        let cached = self.local_messages(channel_id);
        self.inner.state.update(|s| {
            s.loading.remove(channel_id);
            if let Ok(messages) = cached {
                if self.is_current(s, &key, generation) {
                    debug!(channel_id, count = messages.len(), "Published cached messages");
                    s.messages.insert(channel_id.to_string(), messages);
                    s.from_cache.insert(channel_id.to_string());
                }
            }
        });
    }

    fn load_advance_lists(&self, channel_id: &str, generation: u64) -> Reconciliation {
        let key = SyncKey::AdvanceLists(channel_id.to_string());
        if !self.begin_fetch(&key, generation) {
            return Reconciliation::default();
        }
        let this = self.clone();
        let channel_id = channel_id.to_string();
        Reconciliation::spawn(async move {
            let request = this.inner.remote.list_advance_lists(&channel_id);
            this.fetch_list(&key, generation, "list_advance_lists", request, |s, lists| {
                s.advance_lists = lists;
            })
            .await;
        })
    }

    fn load_shared_order_lists(&self, channel_id: &str, generation: u64) -> Reconciliation {
        let key = SyncKey::SharedOrderLists(channel_id.to_string());
        if !self.begin_fetch(&key, generation) {
            return Reconciliation::default();
        }
        let this = self.clone();
        let channel_id = channel_id.to_string();
        Reconciliation::spawn(async move {
            let request = this.inner.remote.list_shared_order_lists(&channel_id);
            this.fetch_list(&key, generation, "list_shared_order_lists", request, |s, lists| {
                s.shared_order_lists = lists;
            })
            .await;
        })
    }

    /// Remote-only lists; nothing is cached locally
    async fn fetch_list<T>(
        &self,
        key: &SyncKey,
        generation: u64,
        operation: &'static str,
        request: impl Future<Output = Result<Vec<T>>>,
        apply: impl FnOnce(&mut WorkspaceSnapshot, Vec<T>),
    ) {
        self.mark_syncing(key);
        let fetched = self.call(operation, request).await;
        let target = self.fetch_target(key, generation, true);
        match fetched {
            Ok(items) => {
                self.settle(key, target, |s| apply(s, items));
            },
            Err(e) => {
                self.fetch_failed(key);
                warn!(collection = key.collection(), error = %e, "List fetch failed");
            },
        }
    }

    async fn reconcile_workspaces(&self) -> Result<Vec<Workspace>> {
        let key = SyncKey::Workspaces;
        self.mark_syncing(&key);
        let fetched = self
            .call("list_workspaces", self.inner.remote.list_workspaces())
            .await;
        let target = self.fetch_target(&key, 0, true);
        let rows = fetched.inspect_err(|_| self.fetch_failed(&key))?;

        let fresh: Vec<Workspace> = rows.into_iter().map(normalize_workspace).collect();
        let merged = self.merge_with_cache(fresh, || self.local_workspaces());
        self.write_back(Collection::Workspaces, &merged);

        let view = merged.clone();
        self.settle(&key, target, |s| s.workspaces = view);
        Ok(merged)
    }

    async fn reconcile_channels(
        &self,
        workspace_id: &str,
        generation: u64,
        registered: bool,
    ) -> Result<Vec<Channel>> {
        let key = SyncKey::Channels(workspace_id.to_string());
        self.mark_syncing(&key);
        let fetched = self
            .call("list_channels", self.inner.remote.list_channels(workspace_id))
            .await;
        let target = self.fetch_target(&key, generation, registered);
        let rows = fetched.inspect_err(|_| self.fetch_failed(&key))?;

        let fresh: Vec<Channel> = rows
            .into_iter()
            .map(normalize_channel)
            .filter(|c| !self.is_deleted(&c.id))
            .collect();
        let merged = self.merge_with_cache(fresh, || self.local_channels(workspace_id));
        self.write_back(Collection::Channels, &merged);

        let view = merged.clone();
        self.settle(&key, target, |s| s.channels = view);
        Ok(merged)
    }

    async fn reconcile_messages(
        &self,
        channel_id: &str,
        generation: u64,
        registered: bool,
    ) -> Result<Vec<Message>> {
        let key = SyncKey::Messages(channel_id.to_string());
        self.mark_syncing(&key);
        let fetched = self
            .call("list_messages", self.inner.remote.list_messages(channel_id))
            .await;
        let target = self.fetch_target(&key, generation, registered);
        let rows = fetched.inspect_err(|_| self.fetch_failed(&key))?;

        if self.is_deleted(channel_id) {
            self.settle(&key, target, |_| {});
            debug!(channel_id, "Channel deleted while fetching; messages dropped");
            return Ok(Vec::new());
        }
        let fresh: Vec<Message> = rows.into_iter().map(normalize_message).collect();
        let merged = self.merge_with_cache(fresh, || self.local_messages(channel_id));
        self.write_back(Collection::Messages, &merged);
        if self.is_deleted(channel_id) {
            self.purge_messages(channel_id);
        }

        let view = merged.clone();
        let published = self.settle(&key, target, |s| {
            s.messages.insert(channel_id.to_string(), view);
            s.from_cache.remove(channel_id);
        });
        debug!(channel_id, count = merged.len(), published, "Message sync finished");
        Ok(merged)
    }

    fn merge_with_cache<T: Record>(
        &self,
        fresh: Vec<T>,
        cached: impl FnOnce() -> Result<Vec<T>>,
    ) -> Vec<T> {
        let strategy = self.inner.settings.merge_strategy;
        let cached = match strategy {
            MergeStrategy::ServerAuthority => Vec::new(),
            MergeStrategy::LastWriteWins | MergeStrategy::LocalFirst => cached().unwrap_or_default(),
        };
        merge_records(cached, fresh, strategy)
    }

    fn write_back<T: Serialize + Record>(&self, collection: Collection, records: &[T]) {
        if let Err(e) = self.inner.store.put_all(collection, records) {
            self.log_store_error("write_back", &e);
        }
    }

    fn local_workspaces(&self) -> Result<Vec<Workspace>> {
        let mut workspaces: Vec<Workspace> = self
            .inner
            .store
            .get_all(Collection::Workspaces)
            .inspect_err(|e| self.log_store_error("read_workspaces", e))?;
        workspaces.sort_by_key(|w| w.created_at);
        Ok(workspaces)
    }

    fn local_channels(&self, workspace_id: &str) -> Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self
            .inner
            .store
            .get_all_where(Collection::Channels, |c: &Channel| c.workspace_id == workspace_id)
            .inspect_err(|e| self.log_store_error("read_channels", e))?;
        channels.sort_by_key(|c| c.created_at);
        Ok(channels)
    }

    fn local_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .inner
            .store
            .get_all_where(Collection::Messages, |m: &Message| m.channel_id == channel_id)
            .inspect_err(|e| self.log_store_error("read_messages", e))?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages.into_iter().map(renormalize_message).collect())
    }

    // ---- fetch bookkeeping ----

    fn generation(&self, key: &SyncKey) -> Option<&AtomicU64> {
        match key {
            SyncKey::Workspaces => None,
            SyncKey::Channels(_) => Some(&self.inner.workspace_generation),
            SyncKey::Messages(_) | SyncKey::AdvanceLists(_) | SyncKey::SharedOrderLists(_) => {
                Some(&self.inner.channel_generation)
            },
        }
    }

    /// Whether a result for `key` requested under `generation` may be
    /// published into `s`
    fn is_current(&self, s: &WorkspaceSnapshot, key: &SyncKey, generation: u64) -> bool {
        let current = self
            .generation(key)
            .map_or(0, |current| current.load(Ordering::SeqCst));
        if current != generation {
            return false;
        }
        match key {
            SyncKey::Workspaces => true,
            SyncKey::Channels(workspace_id) => s.shows_workspace(workspace_id),
            SyncKey::Messages(channel_id)
            | SyncKey::AdvanceLists(channel_id)
            | SyncKey::SharedOrderLists(channel_id) => !self.is_deleted(channel_id),
        }
    }

    fn is_deleted(&self, channel_id: &str) -> bool {
        self.inner
            .deleted_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(channel_id)
    }

    /// Register a fetch for `key`. Returns false if one is already in
    /// flight, in which case that fetch will publish for `generation`.
    fn begin_fetch(&self, key: &SyncKey, generation: u64) -> bool {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(target) = in_flight.get_mut(key) {
            *target = (*target).max(generation);
            return false;
        }
        in_flight.insert(key.clone(), generation);
        true
    }

    /// Generation a finished fetch publishes against
    fn fetch_target(&self, key: &SyncKey, generation: u64, registered: bool) -> u64 {
        if !registered {
            return generation;
        }
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .unwrap_or(generation)
    }

    fn mark_syncing(&self, key: &SyncKey) {
        self.inner.state.update(|s| {
            *self
                .inner
                .syncing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default() += 1;
            s.syncing.insert(key.clone());
        });
    }

    /// Drop one running call for `key`; the flag clears with the last one
    fn release_syncing(&self, s: &mut WorkspaceSnapshot, key: &SyncKey) {
        let mut running = self
            .inner
            .syncing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let left = running.get_mut(key).map_or(0, |n| {
            *n = n.saturating_sub(1);
            *n
        });
        if left == 0 {
            running.remove(key);
            s.syncing.remove(key);
        }
    }

    fn fetch_failed(&self, key: &SyncKey) {
        self.inner.state.update(|s| self.release_syncing(s, key));
        self.inner
            .metrics
            .record_reconciliation(key.collection(), ReconcileOutcome::Failed);
    }

    /// Clear the syncing flag and, if `target` is still current, apply
    /// `publish` in the same snapshot. Returns whether it was applied.
    fn settle(&self, key: &SyncKey, target: u64, publish: impl FnOnce(&mut WorkspaceSnapshot)) -> bool {
        let mut published = false;
        self.inner.state.update(|s| {
            self.release_syncing(s, key);
            if self.is_current(s, key, target) {
                publish(s);
                s.last_synced_at = Some(Utc::now());
                published = true;
            }
        });

        let outcome = if published {
            ReconcileOutcome::Published
        } else {
            debug!(collection = key.collection(), "Selection changed; fetched data cached only");
            ReconcileOutcome::Stale
        };
        self.inner.metrics.record_reconciliation(key.collection(), outcome);
        published
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.inner.settings.remote_timeout, request)
            .await
            .unwrap_or_else(|_| Err(SyncError::Timeout(operation)));
        self.inner
            .metrics
            .record_remote_call(operation, started.elapsed(), result.is_ok());
        result
    }

    fn log_store_error(&self, operation: &'static str, error: &SyncError) {
        warn!(operation, error = %error, "Local store access failed");
        self.inner.metrics.record_local_store_error(operation);
        self.report_error(operation, error);
    }

    /// Must not be called from inside a state update
    fn report_error(&self, operation: &'static str, error: &SyncError) {
        let text = format!("{operation}: {error}");
        self.inner.state.update(|s| s.last_error = Some(text));
    }

    // ---- write path ----

    /// Send a message. It is visible in the published state when this
    /// returns, whether or not the remote source accepted it.
    ///
    /// `attachments` may be in any shape the normalizer understands.
    pub async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
        attachments: &[Value],
    ) -> Result<Message> {
        InputValidator::validate_id(channel_id)?;
        InputValidator::validate_message(content, attachments.len())?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            author_id: self.inner.settings.user_id.clone(),
            content: content.to_string(),
            reactions: Reactions::new(),
            attachments: attachments.iter().map(normalize_attachment).collect(),
            created_at: Utc::now(),
            edited_at: None,
            is_pinned: false,
        };

        self.persist(Collection::Messages, &message, "send_message");
        self.inner.state.update(|s| {
            s.messages
                .entry(message.channel_id.clone())
                .or_default()
                .push(message.clone());
        });
        debug!(channel_id, message_id = %message.id, "Message sent locally");

        let row = MessageRow::from(&message);
        self.propagate("send_message", &message.id, self.inner.remote.insert_message(&row))
            .await;
        Ok(message)
    }

    /// Replace a message's content and stamp the edit time
    pub async fn update_message(&self, message_id: &str, content: &str) -> Result<Message> {
        let mut message = self.find_message(message_id)?;
        InputValidator::validate_message(content, message.attachments.len())?;

        message.content = content.to_string();
        message.edited_at = Some(Utc::now());
        self.commit_message(&message, "update_message");

        let patch = MessagePatch {
            content: Some(message.content.clone()),
            edited_at: message.edited_at,
            ..MessagePatch::default()
        };
        self.propagate(
            "update_message",
            &message.id,
            self.inner.remote.update_message(&message.id, &patch),
        )
        .await;
        Ok(message)
    }

    /// Remove a message locally and remotely
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let message = self.find_message(message_id)?;

        if let Err(e) = self.inner.store.delete(Collection::Messages, &message.id) {
            self.log_store_error("delete_message", &e);
        }
        self.inner.state.update(|s| {
            if let Some(messages) = s.messages.get_mut(&message.channel_id) {
                messages.retain(|m| m.id != message.id);
            }
        });

        self.propagate(
            "delete_message",
            &message.id,
            self.inner.remote.delete_message(&message.id),
        )
        .await;
        Ok(())
    }

    /// Replace a message's content with the tombstone text. Nothing else
    /// about the message changes.
    pub async fn soft_delete_message(&self, message_id: &str) -> Result<Message> {
        let mut message = self.find_message(message_id)?;
        message.content.clone_from(&self.inner.settings.tombstone_text);
        self.commit_message(&message, "soft_delete_message");

        let patch = MessagePatch {
            content: Some(message.content.clone()),
            ..MessagePatch::default()
        };
        self.propagate(
            "soft_delete_message",
            &message.id,
            self.inner.remote.update_message(&message.id, &patch),
        )
        .await;
        Ok(message)
    }

    pub async fn toggle_pin_message(&self, message_id: &str) -> Result<Message> {
        let mut message = self.find_message(message_id)?;
        message.is_pinned = !message.is_pinned;
        self.commit_message(&message, "toggle_pin_message");

        let patch = MessagePatch {
            is_pinned: Some(message.is_pinned),
            ..MessagePatch::default()
        };
        self.propagate(
            "toggle_pin_message",
            &message.id,
            self.inner.remote.update_message(&message.id, &patch),
        )
        .await;
        Ok(message)
    }

    /// Add `user_id` to the `emoji` reaction. Adding an existing reaction
    /// is a no-op and issues no write.
    pub async fn add_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<Message> {
        InputValidator::validate_reaction(emoji)?;
        InputValidator::validate_id(user_id)?;
        let mut message = self.find_message(message_id)?;
        if !message.add_reaction(emoji, user_id) {
            debug!(message_id, emoji, user_id, "Reaction already present");
            return Ok(message);
        }
        self.write_reactions(message, "add_reaction").await
    }

    /// Remove `user_id` from the `emoji` reaction, if present
    pub async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<Message> {
        InputValidator::validate_id(user_id)?;
        let mut message = self.find_message(message_id)?;
        if !message.remove_reaction(emoji, user_id) {
            return Ok(message);
        }
        self.write_reactions(message, "remove_reaction").await
    }

    async fn write_reactions(&self, message: Message, operation: &'static str) -> Result<Message> {
        self.commit_message(&message, operation);
        let patch = MessagePatch {
            reactions: Some(message.reactions.clone()),
            ..MessagePatch::default()
        };
        self.propagate(
            operation,
            &message.id,
            self.inner.remote.update_message(&message.id, &patch),
        )
        .await;
        Ok(message)
    }

    /// Create a channel. It joins the published list if it belongs to the
    /// current workspace, or if no workspace is selected.
    pub async fn create_channel(&self, new: NewChannel) -> Result<Channel> {
        InputValidator::validate_id(&new.workspace_id)?;
        InputValidator::validate_channel_name(&new.name)?;

        let channel = Channel {
            id: Uuid::new_v4().to_string(),
            workspace_id: new.workspace_id,
            name: new.name.trim().to_string(),
            description: new.description,
            kind: new.kind,
            group_id: new.group_id,
            tour_id: new.tour_id,
            is_favorite: false,
            created_by: Some(self.inner.settings.user_id.clone()),
            created_at: Utc::now(),
            updated_at: None,
        };

        self.persist(Collection::Channels, &channel, "create_channel");
        self.inner.state.update(|s| {
            if s
                .current_workspace
                .as_deref()
                .map_or(true, |w| w == channel.workspace_id)
            {
                s.channels.push(channel.clone());
            }
        });
        info!(channel_id = %channel.id, name = %channel.name, "Channel created locally");

        let row = ChannelRow::from(&channel);
        self.propagate("create_channel", &channel.id, self.inner.remote.insert_channel(&row))
            .await;
        Ok(channel)
    }

    /// Apply `patch` to a channel
    pub async fn update_channel(&self, channel_id: &str, patch: ChannelPatch) -> Result<Channel> {
        if let Some(name) = &patch.name {
            InputValidator::validate_channel_name(name)?;
        }
        let mut channel = self.find_channel(channel_id)?;
        patch.apply(&mut channel);
        channel.updated_at = Some(Utc::now());

        self.persist(Collection::Channels, &channel, "update_channel");
        self.inner.state.update(|s| {
            if let Some(slot) = s.channels.iter_mut().find(|c| c.id == channel.id) {
                slot.clone_from(&channel);
            }
        });

        self.propagate(
            "update_channel",
            &channel.id,
            self.inner.remote.update_channel(&channel.id, &patch),
        )
        .await;
        Ok(channel)
    }

    pub async fn toggle_favorite_channel(&self, channel_id: &str) -> Result<Channel> {
        let channel = self.find_channel(channel_id)?;
        let patch = ChannelPatch {
            is_favorite: Some(!channel.is_favorite),
            ..ChannelPatch::default()
        };
        self.update_channel(channel_id, patch).await
    }

    /// Delete a channel and its cached messages. Deleting the selected
    /// channel clears the selection.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let channel = self.find_channel(channel_id)?;
        self.drop_channel(&channel.id);

        self.propagate(
            "delete_channel",
            &channel.id,
            self.inner.remote.delete_channel(&channel.id),
        )
        .await;
        Ok(())
    }

    /// Remove a channel and its messages from the store and the published
    /// state. Returns whether the published state changed.
    fn drop_channel(&self, channel_id: &str) -> bool {
        self.inner
            .deleted_channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel_id.to_string());

        if let Err(e) = self.inner.store.delete(Collection::Channels, channel_id) {
            self.log_store_error("delete_channel", &e);
        }
        self.purge_messages(channel_id);

        self.inner.state.update_if(|s| {
            let before = s.channels.len();
            s.channels.retain(|c| c.id != channel_id);
            let mut changed = s.channels.len() != before;
            changed |= s.messages.remove(channel_id).is_some();
            s.from_cache.remove(channel_id);
            s.loading.remove(channel_id);
            if s.selected_channel.as_deref() == Some(channel_id) {
                self.inner.channel_generation.fetch_add(1, Ordering::SeqCst);
                s.clear_channel_view();
                changed = true;
            }
            changed
        })
    }

    fn purge_messages(&self, channel_id: &str) {
        match self
            .inner
            .store
            .delete_where(Collection::Messages, |m: &Message| m.channel_id == channel_id)
        {
            Ok(removed) => debug!(channel_id, removed, "Dropped cached messages of deleted channel"),
            Err(e) => self.log_store_error("delete_channel", &e),
        }
    }

    // ---- remote changes ----

    /// Start applying the remote source's change feed. Changes keep
    /// flowing until the returned subscription is dropped.
    pub async fn subscribe_realtime(&self) -> Result<RealtimeSubscription> {
        let mut changes = self.inner.remote.subscribe_changes().await?;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                this.apply_remote_change(change);
            }
            debug!("Remote change feed closed");
        });
        info!("Subscribed to remote changes");
        Ok(RealtimeSubscription { handle })
    }

    /// Apply a change made elsewhere to the store and, where the affected
    /// collection is on display, to the published state.
    ///
    /// Inserts of records already published are ignored, which covers the
    /// echo of this client's own writes. Returns whether the published
    /// state changed.
    pub fn apply_remote_change(&self, change: RemoteChange) -> bool {
        match change {
            RemoteChange::Message(event) => self.apply_message_change(event),
            RemoteChange::Channel(event) => self.apply_channel_change(event),
        }
    }

    fn apply_message_change(&self, event: ChangeEvent<MessageRow>) -> bool {
        match event {
            ChangeEvent::Insert(row) => {
                let message = normalize_message(row);
                if self.is_deleted(&message.channel_id) {
                    return false;
                }
                let mut duplicate = false;
                let published = self.inner.state.update_if(|s| {
                    duplicate = s.find_message(&message.id).is_some();
                    !duplicate && s.insert_message(message.clone())
                });
                if duplicate {
                    debug!(message_id = %message.id, "Remote insert already known");
                    return false;
                }
                self.persist(Collection::Messages, &message, "remote_insert");
                published
            },
            ChangeEvent::Update(row) => {
                let message = normalize_message(row);
                if self.is_deleted(&message.channel_id) {
                    return false;
                }
                self.persist(Collection::Messages, &message, "remote_update");
                self.inner.state.update_if(|s| s.replace_message(&message))
            },
            ChangeEvent::Delete(id) => {
                if let Err(e) = self.inner.store.delete(Collection::Messages, &id) {
                    self.log_store_error("remote_delete", &e);
                }
                self.inner.state.update_if(|s| s.remove_message(&id))
            },
        }
    }

    fn apply_channel_change(&self, event: ChangeEvent<ChannelRow>) -> bool {
        match event {
            ChangeEvent::Insert(row) => {
                let channel = normalize_channel(row);
                if self.is_deleted(&channel.id) {
                    return false;
                }
                let mut duplicate = false;
                let published = self.inner.state.update_if(|s| {
                    duplicate = s.channels.iter().any(|c| c.id == channel.id);
                    if duplicate || !s.shows_workspace(&channel.workspace_id) {
                        return false;
                    }
                    s.channels.push(channel.clone());
                    true
                });
                if duplicate {
                    debug!(channel_id = %channel.id, "Remote insert already known");
                    return false;
                }
                self.persist(Collection::Channels, &channel, "remote_insert");
                published
            },
            ChangeEvent::Update(row) => {
                let channel = normalize_channel(row);
                if self.is_deleted(&channel.id) {
                    return false;
                }
                self.persist(Collection::Channels, &channel, "remote_update");
                self.inner.state.update_if(|s| {
                    match s.channels.iter_mut().find(|c| c.id == channel.id) {
                        Some(slot) => {
                            slot.clone_from(&channel);
                            true
                        },
                        None => false,
                    }
                })
            },
            ChangeEvent::Delete(id) => self.drop_channel(&id),
        }
    }

    /// Remember `filter` across restarts and publish it
    pub fn set_channel_filter(&self, filter: ChannelFilter) {
        let preferences = Preferences {
            channel_filter: filter,
        };
        if let Err(e) = self.inner.store.save_preferences(&preferences) {
            self.log_store_error("save_preferences", &e);
        }
        self.inner.state.update(|s| s.preferences = preferences);
    }

    fn find_message(&self, message_id: &str) -> Result<Message> {
        InputValidator::validate_id(message_id)?;
        if let Some(message) = self
            .inner
            .state
            .read(|s| s.find_message(message_id).cloned())
        {
            return Ok(message);
        }
        self.inner
            .store
            .get(Collection::Messages, message_id)
            .inspect_err(|e| self.log_store_error("get_message", e))?
            .ok_or_else(|| SyncError::message_not_found(message_id))
    }

    fn find_channel(&self, channel_id: &str) -> Result<Channel> {
        InputValidator::validate_id(channel_id)?;
        if let Some(channel) = self
            .inner
            .state
            .read(|s| s.channels.iter().find(|c| c.id == channel_id).cloned())
        {
            return Ok(channel);
        }
        self.inner
            .store
            .get(Collection::Channels, channel_id)
            .inspect_err(|e| self.log_store_error("get_channel", e))?
            .ok_or_else(|| SyncError::channel_not_found(channel_id))
    }

    fn persist<T: Serialize + Record>(&self, collection: Collection, record: &T, operation: &'static str) {
        if let Err(e) = self.inner.store.put(collection, record) {
            self.log_store_error(operation, &e);
        }
    }

    fn commit_message(&self, message: &Message, operation: &'static str) {
        self.persist(Collection::Messages, message, operation);
        self.inner.state.update(|s| {
            s.replace_message(message);
        });
    }

    /// Send a write to the remote source and record the outcome
    async fn propagate(
        &self,
        operation: &'static str,
        target_id: &str,
        request: impl Future<Output = Result<()>>,
    ) {
        self.inner.metrics.record_optimistic_write(operation);
        let seq = self.begin_write(operation, target_id);
        let outcome = self.call(operation, request).await;
        if let Err(e) = &outcome {
            warn!(operation, target_id, error = %e, "Remote write failed; keeping local change");
        }
        self.finish_write(seq, outcome.err());
    }

    fn begin_write(&self, operation: &'static str, target_id: &str) -> u64 {
        let seq = self.inner.write_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let capacity = self.inner.settings.write_log_capacity.max(1);
        self.inner.state.update(|s| {
            s.writes.push_back(WriteEntry {
                seq,
                operation,
                target_id: target_id.to_string(),
                status: WriteStatus::Pending,
                error: None,
            });
            while s.writes.len() > capacity {
                s.writes.pop_front();
            }
        });
        seq
    }

    fn finish_write(&self, seq: u64, error: Option<SyncError>) {
        self.inner.state.update(|s| {
            if let Some(entry) = s.writes.iter_mut().find(|w| w.seq == seq) {
                match error {
                    None => entry.status = WriteStatus::Confirmed,
                    Some(e) => {
                        entry.status = WriteStatus::Failed;
                        entry.error = Some(e.to_string());
                    },
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelKind, MessageRow};
    use crate::remote::MockRemoteSource;

    fn row(id: &str, channel_id: &str, minute: u32) -> MessageRow {
        MessageRow {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            author_id: Some("u1".to_string()),
            content: Some(format!("message {id}")),
            created_at: Some(format!("2025-01-20T12:{minute:02}:00Z")),
            ..MessageRow::default()
        }
    }

    fn manager(remote: MockRemoteSource) -> WorkspaceSync {
        WorkspaceSync::new(
            LocalStore::temporary().unwrap(),
            Arc::new(remote),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_overlapping_loads_share_one_fetch() {
        let mut remote = MockRemoteSource::new();
        remote
            .expect_list_messages()
            .times(1)
            .returning(|_| Ok(vec![row("m1", "c1", 0)]));
        let sync = manager(remote);

        let first = sync.load_messages("c1");
        let second = sync.load_messages("c1");
        assert!(!first.is_empty());
        assert!(second.is_empty());

        first.wait().await;
        assert_eq!(sync.snapshot().messages["c1"].len(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_is_logged_not_returned() {
        let mut remote = MockRemoteSource::new();
        remote.expect_insert_message().returning(|_| {
            Err(SyncError::Remote {
                operation: "insert_message",
                message: "offline".to_string(),
            })
        });
        let sync = manager(remote);

        let sent = sync.send_message("c1", "hello", &[]).await.unwrap();
        let snap = sync.snapshot();
        assert_eq!(snap.messages["c1"][0].id, sent.id);

        let entry = snap.writes.back().unwrap();
        assert_eq!(entry.operation, "send_message");
        assert_eq!(entry.status, WriteStatus::Failed);
        assert!(entry.error.as_deref().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_write_log_is_bounded() {
        let mut remote = MockRemoteSource::new();
        remote.expect_insert_message().returning(|_| Ok(()));
        let settings = SyncSettings {
            write_log_capacity: 2,
            ..SyncSettings::default()
        };
        let sync = WorkspaceSync::new(LocalStore::temporary().unwrap(), Arc::new(remote), settings);

        for text in ["one", "two", "three"] {
            sync.send_message("c1", text, &[]).await.unwrap();
        }
        let writes = sync.snapshot().writes;
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.status == WriteStatus::Confirmed));
        assert_eq!(writes[0].seq, 2);
    }

    #[tokio::test]
    async fn test_repeated_reaction_writes_once() {
        let mut remote = MockRemoteSource::new();
        remote.expect_insert_message().returning(|_| Ok(()));
        remote.expect_update_message().times(1).returning(|_, _| Ok(()));
        let sync = manager(remote);

        let msg = sync.send_message("c1", "hi", &[]).await.unwrap();
        sync.add_reaction(&msg.id, "👍", "u2").await.unwrap();
        let msg = sync.add_reaction(&msg.id, "👍", "u2").await.unwrap();
        assert_eq!(msg.reactions["👍"].len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_found() {
        let sync = manager(MockRemoteSource::new());
        let err = sync.toggle_pin_message("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { kind: "message", .. }));
    }

    #[tokio::test]
    async fn test_create_channel_outside_current_workspace_stays_hidden() {
        let mut remote = MockRemoteSource::new();
        remote.expect_list_channels().returning(|_| Ok(Vec::new()));
        remote.expect_insert_channel().returning(|_| Ok(()));
        let sync = manager(remote);

        sync.select_workspace(Some("w1")).wait().await;
        let channel = sync
            .create_channel(NewChannel {
                workspace_id: "w2".to_string(),
                name: "elsewhere".to_string(),
                kind: ChannelKind::Private,
                ..NewChannel::default()
            })
            .await
            .unwrap();

        assert!(sync.snapshot().channels.is_empty());
        assert_eq!(channel.created_by.as_deref(), Some("local-user"));
    }

    #[tokio::test]
    async fn test_toggle_favorite_flips_and_patches() {
        let mut remote = MockRemoteSource::new();
        remote.expect_insert_channel().returning(|_| Ok(()));
        remote
            .expect_update_channel()
            .withf(|_, patch| patch.is_favorite == Some(true) && patch.name.is_none())
            .times(1)
            .returning(|_, _| Ok(()));
        let sync = manager(remote);

        let channel = sync
            .create_channel(NewChannel {
                workspace_id: "w1".to_string(),
                name: "general".to_string(),
                ..NewChannel::default()
            })
            .await
            .unwrap();
        let toggled = sync.toggle_favorite_channel(&channel.id).await.unwrap();
        assert!(toggled.is_favorite);
        assert!(toggled.updated_at.is_some());
        assert!(sync.snapshot().channels[0].is_favorite);
    }

    #[tokio::test]
    async fn test_realtime_needs_a_change_feed() {
        let mut remote = MockRemoteSource::new();
        remote
            .expect_subscribe_changes()
            .returning(|| Err(SyncError::Unsupported("subscribe_changes")));
        let sync = manager(remote);

        let err = sync.subscribe_realtime().await.unwrap_err();
        assert!(matches!(err, SyncError::Unsupported("subscribe_changes")));
    }

    #[tokio::test]
    async fn test_sync_messages_returns_remote_error() {
        let mut remote = MockRemoteSource::new();
        remote.expect_list_messages().returning(|_| {
            Err(SyncError::RemoteStatus {
                status: 503,
                body: "unavailable".to_string(),
            })
        });
        let sync = manager(remote);

        let err = sync.sync_messages("c1").await.unwrap_err();
        assert!(err.is_remote());
        let snap = sync.snapshot();
        assert!(snap.syncing.is_empty());
        assert!(snap.last_error.as_deref().unwrap().contains("503"));

        sync.clear_error();
        assert!(sync.snapshot().last_error.is_none());
    }
}
