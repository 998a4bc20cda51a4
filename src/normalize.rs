//! Canonicalization of records arriving from the remote source.
//!
//! Every field is resolved through an ordered list of candidate keys; the
//! first usable value wins and a fixed default fills the gap. Nothing here
//! fails: a record of unknown shape still comes out canonical.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::models::{
    Attachment, Channel, ChannelKind, ChannelRow, Message, MessageRow, Reactions, Workspace,
    WorkspaceRow,
};

/// Placeholder used when an attachment carries no usable name
pub const UNNAMED_FILE: &str = "unnamed file";

/// MIME type used when none can be found
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const PATH_KEYS: &[&str] = &["path", "url"];
const FILE_NAME_KEYS: &[&str] = &["fileName", "name"];
const MIME_TYPE_KEYS: &[&str] = &["mimeType", "fileType", "type"];
const FILE_SIZE_KEYS: &[&str] = &["fileSize", "size"];
const PUBLIC_URL_KEYS: &[&str] = &["publicUrl", "url"];

fn first_string(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| raw.get(key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn first_size(raw: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| {
        let value = raw.get(key)?;
        value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                // Saturating float-to-int cast; fractional bytes are dropped
                .map(|f| f as u64)
        })
    })
}

/// Turn an attachment of any known shape into a canonical [`Attachment`].
///
/// Legacy uploads only carry `url`/`name`/`size`/`type`; newer ones carry
/// `path`/`fileName`/`fileSize`/`mimeType`/`publicUrl`. When no id is
/// present the path is used, then a key derived from name, size and type.
#[must_use]
pub fn normalize_attachment(raw: &Value) -> Attachment {
    let path = first_string(raw, PATH_KEYS).unwrap_or_default();
    let file_name = first_string(raw, FILE_NAME_KEYS).unwrap_or_else(|| UNNAMED_FILE.to_string());
    let mime_type =
        first_string(raw, MIME_TYPE_KEYS).unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
    let file_size = first_size(raw, FILE_SIZE_KEYS).unwrap_or(0);
    let public_url = first_string(raw, PUBLIC_URL_KEYS).unwrap_or_default();

    // file_name is never empty, so the derived key always exists
    let id = first_string(raw, &["id"]).unwrap_or_else(|| {
        if path.is_empty() {
            format!("{file_name}-{file_size}-{mime_type}")
        } else {
            path.clone()
        }
    });

    Attachment {
        id,
        file_name,
        file_size,
        mime_type,
        path,
        public_url,
    }
}

/// Normalize an attachment list. Anything that is not an array yields none.
#[must_use]
pub fn normalize_attachments(raw: Option<&Value>) -> Vec<Attachment> {
    match raw {
        Some(Value::Array(items)) => items.iter().map(normalize_attachment).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            debug!(value = %other, "Ignoring non-array attachments");
            Vec::new()
        },
    }
}

/// Normalize a reaction object into symbol -> distinct author ids.
///
/// Non-string authors are skipped and symbols left without authors dropped.
#[must_use]
pub fn normalize_reactions(raw: Option<&Value>) -> Reactions {
    let mut reactions = Reactions::new();
    let Some(Value::Object(map)) = raw else {
        return reactions;
    };
    for (emoji, users) in map {
        let Value::Array(users) = users else {
            continue;
        };
        let users: std::collections::BTreeSet<String> = users
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !users.is_empty() {
            reactions.insert(emoji.clone(), users);
        }
    }
    reactions
}

/// Parse a backend timestamp, falling back to the epoch
#[must_use]
pub fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    parse_optional_timestamp(raw).unwrap_or_default()
}

/// Parse an optional backend timestamp; malformed values become `None`
#[must_use]
pub fn parse_optional_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Canonical message from a `messages` row
#[must_use]
pub fn normalize_message(row: MessageRow) -> Message {
    Message {
        attachments: normalize_attachments(row.attachments.as_ref()),
        reactions: normalize_reactions(row.reactions.as_ref()),
        created_at: parse_timestamp(row.created_at.as_deref()),
        edited_at: parse_optional_timestamp(row.edited_at.as_deref()),
        id: row.id,
        channel_id: row.channel_id,
        author_id: row.author_id.unwrap_or_default(),
        content: row.content.unwrap_or_default(),
        is_pinned: row.is_pinned.unwrap_or(false),
    }
}

/// Re-run attachment normalization on an already-typed message.
///
/// Used on records read back from the local store, which may predate the
/// current canonical form.
#[must_use]
pub fn renormalize_message(mut message: Message) -> Message {
    message.attachments = message
        .attachments
        .iter()
        .map(|a| serde_json::to_value(a).map_or_else(|_| a.clone(), |v| normalize_attachment(&v)))
        .collect();
    message
}

/// Canonical channel from a `channels` row
#[must_use]
pub fn normalize_channel(row: ChannelRow) -> Channel {
    Channel {
        kind: row
            .kind
            .as_deref()
            .and_then(ChannelKind::parse)
            .unwrap_or_default(),
        created_at: parse_timestamp(row.created_at.as_deref()),
        updated_at: parse_optional_timestamp(row.updated_at.as_deref()),
        id: row.id,
        workspace_id: row.workspace_id,
        name: row.name.unwrap_or_default(),
        description: row.description,
        group_id: row.group_id,
        tour_id: row.tour_id,
        is_favorite: row.is_favorite.unwrap_or(false),
        created_by: row.created_by,
    }
}

/// Canonical workspace from a `workspaces` row
#[must_use]
pub fn normalize_workspace(row: WorkspaceRow) -> Workspace {
    Workspace {
        created_at: parse_timestamp(row.created_at.as_deref()),
        id: row.id,
        name: row.name.unwrap_or_default(),
        description: row.description,
        icon: row.icon,
        is_active: row.is_active.unwrap_or(true),
    }
}
