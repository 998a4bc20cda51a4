//! Workspace Sync - Local-First Channel and Message Cache
//!
//! A Rust library that keeps workspaces, channels and messages available
//! offline and reconciles them with a hosted backend in the background.
//!
//! # Features
//!
//! - Cached reads published immediately, refreshed from the remote source
//! - Stale results from an abandoned selection are never shown
//! - Optimistic writes with an observable write log
//! - Remote change feed applied to the cache as it arrives
//! - Tolerant normalization of legacy attachment and reaction shapes
//! - Embedded sled store and a PostgREST-style HTTP remote

/// Configuration management
pub mod config;
/// Error types
pub mod error;
/// Logging setup and utilities
pub mod logging;
/// Merging cached and fetched snapshots
pub mod merge;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Record normalization
pub mod normalize;
/// Remote source adapter
pub mod remote;
/// Observable state
pub mod state;
/// Local store
pub mod store;
/// Sync cache manager
pub mod sync;
/// Input validation and sanitization
pub mod validation;

// Re-export key components for easier access
pub use crate::config::AppConfig;
pub use error::{Result, SyncError};
pub use models::{
    Attachment, ChangeEvent, Channel, ChannelFilter, ChannelKind, Message, RemoteChange, Workspace,
};
pub use remote::{RemoteSource, RestRemote};
pub use state::{StateProjection, SyncKey, WorkspaceSnapshot};
pub use store::{Collection, LocalStore};
pub use sync::{RealtimeSubscription, Reconciliation, SyncSettings, WorkspaceSync};
