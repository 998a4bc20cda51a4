//! Observable state projection.
//!
//! Subscribers hold a `watch::Receiver<WorkspaceSnapshot>`. Every mutation
//! goes through [`StateProjection::update`], so a subscriber only ever sees
//! whole snapshots.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::models::{AdvanceList, Channel, Message, Preferences, SharedOrderList, Workspace};

/// Outcome of an optimistic write as far as the remote source is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Remote call still in flight
    Pending,
    /// Remote accepted the write
    Confirmed,
    /// Remote rejected or never answered; local state kept anyway
    Failed,
}

/// One optimistic write and what became of it remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    /// Sequence number, unique per [`crate::sync::WorkspaceSync`]
    pub seq: u64,
    /// Operation name, e.g. `send_message`
    pub operation: &'static str,
    /// Id of the record written
    pub target_id: String,
    /// Remote outcome
    pub status: WriteStatus,
    /// Error text for failed writes
    pub error: Option<String>,
}

/// A collection whose remote fetch can be in flight
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncKey {
    /// The workspace list
    Workspaces,
    /// Channels of a workspace
    Channels(String),
    /// Messages of a channel
    Messages(String),
    /// Advance lists of a channel
    AdvanceLists(String),
    /// Shared order lists of a channel
    SharedOrderLists(String),
}

impl SyncKey {
    /// Collection label used in logs and metrics
    #[must_use]
    pub const fn collection(&self) -> &'static str {
        match self {
            Self::Workspaces => "workspaces",
            Self::Channels(_) => "channels",
            Self::Messages(_) => "messages",
            Self::AdvanceLists(_) => "advance_lists",
            Self::SharedOrderLists(_) => "shared_order_lists",
        }
    }
}

/// Everything a UI layer renders from
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    pub workspaces: Vec<Workspace>,
    pub current_workspace: Option<String>,
    pub channels: Vec<Channel>,
    /// True until the local read of the channel list completes
    pub channels_loading: bool,
    pub selected_channel: Option<String>,
    /// Channel id to messages in arrival order
    pub messages: HashMap<String, Vec<Message>>,
    /// Channels whose local read has not completed yet
    pub loading: HashSet<String>,
    /// Keys with a remote fetch in flight
    pub syncing: HashSet<SyncKey>,
    /// Channels whose published messages came from the local store only
    pub from_cache: HashSet<String>,
    pub advance_lists: Vec<AdvanceList>,
    pub shared_order_lists: Vec<SharedOrderList>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub preferences: Preferences,
    pub writes: VecDeque<WriteEntry>,
    /// Most recent local store or explicit sync failure, until cleared
    pub last_error: Option<String>,
}

impl WorkspaceSnapshot {
    /// Messages of the selected channel; empty when nothing is selected
    #[must_use]
    pub fn current_messages(&self) -> &[Message] {
        self.selected_channel
            .as_ref()
            .and_then(|id| self.messages.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The selected channel record, if it is loaded
    #[must_use]
    pub fn current_channel(&self) -> Option<&Channel> {
        let id = self.selected_channel.as_ref()?;
        self.channels.iter().find(|c| &c.id == id)
    }

    /// Channels passing the remembered filter
    #[must_use]
    pub fn visible_channels(&self) -> Vec<&Channel> {
        self.channels
            .iter()
            .filter(|c| self.preferences.channel_filter.matches(c))
            .collect()
    }

    /// Whether the local read for `channel_id` is still outstanding
    #[must_use]
    pub fn is_loading(&self, channel_id: &str) -> bool {
        self.loading.contains(channel_id)
    }

    /// Whether a remote fetch for `key` is in flight
    #[must_use]
    pub fn is_syncing(&self, key: &SyncKey) -> bool {
        self.syncing.contains(key)
    }

    /// Locate a message in any loaded channel
    #[must_use]
    pub fn find_message(&self, message_id: &str) -> Option<&Message> {
        self.messages
            .values()
            .flat_map(|msgs| msgs.iter())
            .find(|m| m.id == message_id)
    }

    /// Replace a message in place if its channel is loaded
    pub(crate) fn replace_message(&mut self, message: &Message) -> bool {
        let slot = self
            .messages
            .get_mut(&message.channel_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message.id));
        match slot {
            Some(slot) => {
                slot.clone_from(message);
                true
            },
            None => false,
        }
    }

    /// Add a message to its channel's loaded list, keeping arrival order
    pub(crate) fn insert_message(&mut self, message: Message) -> bool {
        let Some(msgs) = self.messages.get_mut(&message.channel_id) else {
            return false;
        };
        msgs.push(message);
        msgs.sort_by_key(|m| m.created_at);
        true
    }

    /// Remove a message from whichever loaded channel holds it
    pub(crate) fn remove_message(&mut self, message_id: &str) -> bool {
        let mut removed = false;
        for msgs in self.messages.values_mut() {
            let before = msgs.len();
            msgs.retain(|m| m.id != message_id);
            removed |= msgs.len() != before;
        }
        removed
    }

    /// Whether `workspace_id`'s channels belong in the published list
    #[must_use]
    pub fn shows_workspace(&self, workspace_id: &str) -> bool {
        self.current_workspace
            .as_deref()
            .map_or(true, |w| w == workspace_id)
    }

    /// Drop everything tied to the selected channel
    pub(crate) fn clear_channel_view(&mut self) {
        self.selected_channel = None;
        self.messages.clear();
        self.loading.clear();
        self.from_cache.clear();
        self.advance_lists.clear();
        self.shared_order_lists.clear();
    }
}

/// Single publisher of [`WorkspaceSnapshot`]s
#[derive(Debug)]
pub struct StateProjection {
    tx: watch::Sender<WorkspaceSnapshot>,
}

impl StateProjection {
    #[must_use]
    pub fn new(initial: WorkspaceSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// New subscriber, starting at the current snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WorkspaceSnapshot> {
        self.tx.subscribe()
    }

    /// Clone of the current snapshot
    #[must_use]
    pub fn snapshot(&self) -> WorkspaceSnapshot {
        self.tx.borrow().clone()
    }

    /// Read a value out of the current snapshot without cloning it all
    pub fn read<R>(&self, f: impl FnOnce(&WorkspaceSnapshot) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Apply `f` and publish the result as one snapshot
    pub fn update(&self, f: impl FnOnce(&mut WorkspaceSnapshot)) {
        self.tx.send_modify(f);
    }

    /// Like [`Self::update`], but subscribers are only notified when `f`
    /// returns true
    pub fn update_if(&self, f: impl FnOnce(&mut WorkspaceSnapshot) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }
}
