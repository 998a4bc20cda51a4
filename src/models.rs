//! Data models for workspaces, channels and messages
//!
//! Canonical records are what the cache, the local store and subscribers
//! see. The `*Row` types mirror the hosted backend's tables and are only
//! used at the remote boundary.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reaction symbol mapped to the distinct authors who used it
pub type Reactions = BTreeMap<String, BTreeSet<String>>;

/// Anything that lives in a local store collection
pub trait Record {
    /// Primary key within the collection
    fn id(&self) -> &str;
    /// Creation time; collections are kept in this order
    fn created_at(&self) -> DateTime<Utc>;
    /// Last modification time, used by last-write-wins merging
    fn updated_at(&self) -> DateTime<Utc>;
}

/// Visibility of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Visible to every workspace member
    #[default]
    Public,
    /// Invite only
    Private,
    /// One-to-one conversation
    Direct,
}

impl ChannelKind {
    /// Parse the backend's `type` column
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }

    /// Backend representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Direct => "direct",
        }
    }
}

/// A workspace owning a set of channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Optional icon reference
    pub icon: Option<String>,
    /// Inactive workspaces are kept but hidden by clients
    pub is_active: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Record for Workspace {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A named communication scope within a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Unique id
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Visibility
    pub kind: ChannelKind,
    /// Optional sidebar grouping key
    pub group_id: Option<String>,
    /// Optional linked tour
    pub tour_id: Option<String>,
    /// Favorite flag
    pub is_favorite: bool,
    /// Creator, when known
    pub created_by: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last local or remote modification
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// Canonical attachment bound to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Stable id
    pub id: String,
    /// Display file name
    pub file_name: String,
    /// Size in bytes
    pub file_size: u64,
    /// MIME type
    pub mime_type: String,
    /// Storage path
    pub path: String,
    /// Resolved public URL
    pub public_url: String,
}

/// A unit of communication within a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: String,
    /// Owning channel
    pub channel_id: String,
    /// Author id
    pub author_id: String,
    /// Text content
    pub content: String,
    /// Reaction symbol to distinct authors
    pub reactions: Reactions,
    /// Ordered attachments
    pub attachments: Vec<Attachment>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set when the content was edited
    pub edited_at: Option<DateTime<Utc>>,
    /// Pinned flag
    pub is_pinned: bool,
}

impl Message {
    /// Add `user_id` under `emoji`. Returns false if it was already there.
    pub fn add_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        self.reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user_id.to_string())
    }

    /// Remove `user_id` from `emoji`, dropping the emoji once nobody uses it.
    pub fn remove_reaction(&mut self, emoji: &str, user_id: &str) -> bool {
        let Some(users) = self.reactions.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user_id);
        if users.is_empty() {
            self.reactions.remove(emoji);
        }
        removed
    }
}

impl Record for Message {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.created_at)
    }
}

/// Advance-payment list attached to a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceList {
    /// Unique id
    pub id: String,
    /// Owning channel
    pub channel_id: String,
    /// Author id
    #[serde(default)]
    pub author_id: String,
    /// Creation time as reported by the backend
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Order list shared into a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedOrderList {
    /// Unique id
    pub id: String,
    /// Owning channel
    pub channel_id: String,
    /// Author id
    #[serde(default)]
    pub author_id: String,
    /// Shared order ids
    #[serde(default)]
    pub order_ids: Vec<String>,
    /// Creation time as reported by the backend
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Input for creating a channel
#[derive(Debug, Clone, Default)]
pub struct NewChannel {
    /// Owning workspace
    pub workspace_id: String,
    /// Display name
    pub name: String,
    /// Optional description
    pub description: Option<String>,
    /// Visibility
    pub kind: ChannelKind,
    /// Optional grouping key
    pub group_id: Option<String>,
    /// Optional linked tour
    pub tour_id: Option<String>,
}

/// Partial channel update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelPatch {
    /// New name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description; `Some(None)` clears it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    /// New group; `Some(None)` ungroups
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<String>>,
    /// New favorite flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

impl ChannelPatch {
    /// Apply the set fields to `channel`
    pub fn apply(&self, channel: &mut Channel) {
        if let Some(name) = &self.name {
            channel.name.clone_from(name);
        }
        if let Some(description) = &self.description {
            channel.description.clone_from(description);
        }
        if let Some(group_id) = &self.group_id {
            channel.group_id.clone_from(group_id);
        }
        if let Some(is_favorite) = self.is_favorite {
            channel.is_favorite = is_favorite;
        }
    }
}

/// Partial message update sent to the remote source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessagePatch {
    /// New content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Edit timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    /// Pinned flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    /// Full reaction map
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
}

/// Which channels a client lists
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelFilter {
    /// Every channel
    #[default]
    All,
    /// Favorites only
    Favorites,
    /// Channels of one kind
    Kind(ChannelKind),
    /// Channels in one group
    Group(String),
}

impl ChannelFilter {
    /// True when `channel` passes the filter
    #[must_use]
    pub fn matches(&self, channel: &Channel) -> bool {
        match self {
            Self::All => true,
            Self::Favorites => channel.is_favorite,
            Self::Kind(kind) => channel.kind == *kind,
            Self::Group(group) => channel.group_id.as_deref() == Some(group.as_str()),
        }
    }
}

/// View preferences that survive restarts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Remembered channel list filter
    pub channel_filter: ChannelFilter,
}

/// `workspaces` table row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceRow {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// `channels` table row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub tour_id: Option<String>,
    #[serde(default)]
    pub is_favorite: Option<bool>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<&Channel> for ChannelRow {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.clone(),
            workspace_id: channel.workspace_id.clone(),
            name: Some(channel.name.clone()),
            description: channel.description.clone(),
            kind: Some(channel.kind.as_str().to_string()),
            group_id: channel.group_id.clone(),
            tour_id: channel.tour_id.clone(),
            is_favorite: Some(channel.is_favorite),
            created_by: channel.created_by.clone(),
            created_at: Some(channel.created_at.to_rfc3339()),
            updated_at: channel.updated_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// `messages` table row. Reactions and attachments arrive as loose JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reactions: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Option<serde_json::Value>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub edited_at: Option<String>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            author_id: Some(message.author_id.clone()),
            content: Some(message.content.clone()),
            reactions: serde_json::to_value(&message.reactions).ok(),
            attachments: serde_json::to_value(&message.attachments).ok(),
            created_at: Some(message.created_at.to_rfc3339()),
            edited_at: message.edited_at.map(|t| t.to_rfc3339()),
            is_pinned: Some(message.is_pinned),
        }
    }
}

/// One row change pushed by the remote source
#[derive(Debug, Clone)]
pub enum ChangeEvent<R> {
    Insert(R),
    Update(R),
    /// Id of the removed row
    Delete(String),
}

/// A change to one of the tables the cache mirrors
#[derive(Debug, Clone)]
pub enum RemoteChange {
    Channel(ChangeEvent<ChannelRow>),
    Message(ChangeEvent<MessageRow>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            author_id: "u1".to_string(),
            content: "hello".to_string(),
            reactions: Reactions::new(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            edited_at: None,
            is_pinned: false,
        }
    }

    #[test]
    fn test_add_reaction_is_set_like() {
        let mut msg = message();
        assert!(msg.add_reaction("👍", "u2"));
        assert!(!msg.add_reaction("👍", "u2"));
        assert_eq!(msg.reactions["👍"].len(), 1);
    }

    #[test]
    fn test_remove_last_reaction_drops_emoji() {
        let mut msg = message();
        msg.add_reaction("🎉", "u2");
        assert!(msg.remove_reaction("🎉", "u2"));
        assert!(!msg.reactions.contains_key("🎉"));
        assert!(!msg.remove_reaction("🎉", "u2"));
    }

    #[test]
    fn test_channel_patch_clears_description() {
        let mut channel = Channel {
            id: "c1".to_string(),
            workspace_id: "w1".to_string(),
            name: "general".to_string(),
            description: Some("old".to_string()),
            kind: ChannelKind::Public,
            group_id: None,
            tour_id: None,
            is_favorite: false,
            created_by: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        let patch = ChannelPatch {
            name: Some("ops".to_string()),
            description: Some(None),
            ..ChannelPatch::default()
        };
        patch.apply(&mut channel);
        assert_eq!(channel.name, "ops");
        assert_eq!(channel.description, None);
    }

    #[test]
    fn test_channel_patch_serializes_only_set_fields() {
        let patch = ChannelPatch {
            is_favorite: Some(true),
            ..ChannelPatch::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "is_favorite": true }));
    }

    #[test]
    fn test_filter_matches_group() {
        let filter = ChannelFilter::Group("g1".to_string());
        let mut channel = Channel {
            id: "c1".to_string(),
            workspace_id: "w1".to_string(),
            name: "general".to_string(),
            description: None,
            kind: ChannelKind::Private,
            group_id: Some("g1".to_string()),
            tour_id: None,
            is_favorite: false,
            created_by: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        assert!(filter.matches(&channel));
        channel.group_id = None;
        assert!(!filter.matches(&channel));
        assert!(ChannelFilter::Kind(ChannelKind::Private).matches(&channel));
    }
}
