//! Tests for normalize.rs: legacy shapes, totality and idempotence

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use workspace_sync::models::{ChannelKind, ChannelRow, MessageRow};
use workspace_sync::normalize::{
    normalize_attachment, normalize_attachments, normalize_channel, normalize_message,
    parse_timestamp, renormalize_message, DEFAULT_MIME_TYPE, UNNAMED_FILE,
};

const KEYS: [&str; 11] = [
    "id", "path", "url", "fileName", "name", "mimeType", "fileType", "type", "fileSize", "size",
    "publicUrl",
];

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        (0.0f64..1e12).prop_map(Value::from),
        "[a-z0-9./:-]{0,16}".prop_map(Value::from),
    ]
}

fn raw_attachment() -> impl Strategy<Value = Value> {
    proptest::collection::vec(proptest::option::of(field_value()), KEYS.len()).prop_map(|values| {
        let mut map = Map::new();
        for (key, value) in KEYS.iter().zip(values) {
            if let Some(value) = value {
                map.insert((*key).to_string(), value);
            }
        }
        Value::Object(map)
    })
}

proptest! {
    #[test]
    fn prop_normalization_is_idempotent(raw in raw_attachment()) {
        let once = normalize_attachment(&raw);
        let twice = normalize_attachment(&serde_json::to_value(&once).unwrap());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_normalized_fields_are_always_filled(raw in raw_attachment()) {
        let att = normalize_attachment(&raw);
        prop_assert!(!att.id.is_empty());
        prop_assert!(!att.file_name.is_empty());
        prop_assert!(!att.mime_type.is_empty());

        let value = serde_json::to_value(&att).unwrap();
        for key in ["id", "fileName", "mimeType", "path", "publicUrl"] {
            prop_assert!(value[key].is_string(), "{} should be a string", key);
        }
        prop_assert!(value["fileSize"].is_u64());
    }
}

#[test]
fn test_legacy_url_shape() {
    let att = normalize_attachment(&json!({
        "url": "https://x/y.png",
        "name": "y.png",
        "size": 100,
        "type": "image/png",
    }));

    assert_eq!(att.id, "https://x/y.png");
    assert_eq!(att.file_name, "y.png");
    assert_eq!(att.file_size, 100);
    assert_eq!(att.mime_type, "image/png");
    assert_eq!(att.path, "https://x/y.png");
    assert_eq!(att.public_url, "https://x/y.png");
}

#[test]
fn test_legacy_shape_serializes_camel_case() {
    let att = normalize_attachment(&json!({
        "url": "https://x/y.png",
        "name": "y.png",
        "size": 100,
        "type": "image/png",
    }));
    assert_eq!(
        serde_json::to_value(&att).unwrap(),
        json!({
            "id": "https://x/y.png",
            "fileName": "y.png",
            "fileSize": 100,
            "mimeType": "image/png",
            "path": "https://x/y.png",
            "publicUrl": "https://x/y.png",
        })
    );
}

#[test]
fn test_derived_id_without_path() {
    let att = normalize_attachment(&json!({ "name": "notes.txt", "size": 12, "type": "text/plain" }));
    assert_eq!(att.id, "notes.txt-12-text/plain");
    assert_eq!(att.path, "");
}

#[test]
fn test_empty_id_is_ignored() {
    let att = normalize_attachment(&json!({ "id": "", "path": "uploads/a.png" }));
    assert_eq!(att.id, "uploads/a.png");
}

#[test]
fn test_non_object_attachment_gets_defaults() {
    let att = normalize_attachment(&json!("just a string"));
    assert_eq!(att.file_name, UNNAMED_FILE);
    assert_eq!(att.mime_type, DEFAULT_MIME_TYPE);
}

#[test]
fn test_attachments_not_an_array() {
    assert!(normalize_attachments(Some(&json!({ "url": "x" }))).is_empty());
    assert!(normalize_attachments(None).is_empty());
}

#[test]
fn test_message_row_normalization() {
    let row = MessageRow {
        id: "m1".to_string(),
        channel_id: "c1".to_string(),
        author_id: None,
        content: None,
        reactions: Some(json!({ "👍": ["u1", "u1"] })),
        attachments: Some(json!([{ "url": "https://x/y.png" }])),
        created_at: Some("2025-01-20T12:00:00Z".to_string()),
        edited_at: Some("garbage".to_string()),
        is_pinned: None,
    };
    let msg = normalize_message(row);

    assert_eq!(msg.author_id, "");
    assert_eq!(msg.content, "");
    assert_eq!(msg.reactions["👍"].len(), 1);
    assert_eq!(msg.attachments[0].path, "https://x/y.png");
    assert_eq!(msg.created_at.to_rfc3339(), "2025-01-20T12:00:00+00:00");
    assert_eq!(msg.edited_at, None);
    assert!(!msg.is_pinned);

    let again = renormalize_message(msg.clone());
    assert_eq!(again, msg);
}

#[test]
fn test_channel_row_unknown_kind_defaults_public() {
    let channel = normalize_channel(ChannelRow {
        id: "c1".to_string(),
        workspace_id: "w1".to_string(),
        kind: Some("broadcast".to_string()),
        ..ChannelRow::default()
    });
    assert_eq!(channel.kind, ChannelKind::Public);
    assert_eq!(channel.name, "");
    assert!(!channel.is_favorite);
}

#[test]
fn test_channel_row_reads_type_column() {
    let row: ChannelRow = serde_json::from_value(json!({
        "id": "c1",
        "workspace_id": "w1",
        "name": "ops",
        "type": "private",
        "is_favorite": true,
    }))
    .unwrap();
    let channel = normalize_channel(row);
    assert_eq!(channel.kind, ChannelKind::Private);
    assert!(channel.is_favorite);
}

#[test]
fn test_bad_timestamp_falls_back_to_epoch() {
    assert_eq!(parse_timestamp(Some("yesterday")).timestamp(), 0);
    assert_eq!(parse_timestamp(None).timestamp(), 0);
}
