//! Remote source adapter.
//!
//! [`RemoteSource`] is the narrow seam between the cache and whatever
//! backend holds the records of truth. Implementations do not retry;
//! the caller decides what a failure means.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::models::{
    AdvanceList, ChannelPatch, ChannelRow, MessagePatch, MessageRow, RemoteChange, SharedOrderList,
    WorkspaceRow,
};

/// Operations the sync layer needs from the hosted backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Every workspace visible to the session
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceRow>>;

    /// Channels of one workspace
    async fn list_channels(&self, workspace_id: &str) -> Result<Vec<ChannelRow>>;

    /// Messages of one channel, oldest first
    async fn list_messages(&self, channel_id: &str) -> Result<Vec<MessageRow>>;

    /// Advance lists shared into a channel
    async fn list_advance_lists(&self, channel_id: &str) -> Result<Vec<AdvanceList>>;

    /// Order lists shared into a channel
    async fn list_shared_order_lists(&self, channel_id: &str) -> Result<Vec<SharedOrderList>>;

    async fn insert_channel(&self, record: &ChannelRow) -> Result<()>;

    async fn insert_message(&self, record: &MessageRow) -> Result<()>;

    async fn update_channel(&self, id: &str, patch: &ChannelPatch) -> Result<()>;

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()>;

    async fn delete_channel(&self, id: &str) -> Result<()>;

    async fn delete_message(&self, id: &str) -> Result<()>;

    /// Feed of row changes made by other clients. Sources without one
    /// return [`SyncError::Unsupported`].
    async fn subscribe_changes(&self) -> Result<mpsc::Receiver<RemoteChange>> {
        Err(SyncError::Unsupported("subscribe_changes"))
    }
}

/// [`RemoteSource`] over a PostgREST-style HTTP API (e.g. Supabase)
#[derive(Clone)]
pub struct RestRemote {
    client: Client,
    base_url: String,
}

impl RestRemote {
    /// Build a client for `config.base_url`, authenticating with
    /// `config.api_key` when one is set
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let invalid = |_| SyncError::InvalidConfig("remote.api_key is not a valid header".to_string());
            headers.insert("apikey", HeaderValue::from_str(key).map_err(invalid)?);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| SyncError::Remote {
            operation,
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::RemoteStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn select<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        table: &str,
        filter: Option<(&str, &str)>,
        order: Option<&str>,
    ) -> Result<Vec<T>> {
        let mut query: Vec<(String, String)> = vec![("select".to_string(), "*".to_string())];
        if let Some((column, value)) = filter {
            query.push((column.to_string(), format!("eq.{value}")));
        }
        if let Some(order) = order {
            query.push(("order".to_string(), order.to_string()));
        }

        debug!(table, ?filter, "Remote select");
        let response = self
            .send(operation, self.client.get(self.url(table)).query(&query))
            .await?;
        response.json().await.map_err(|e| SyncError::Remote {
            operation,
            message: e.to_string(),
        })
    }

    async fn insert<B: Serialize + Sync>(&self, operation: &'static str, table: &str, body: &B) -> Result<()> {
        self.send(
            operation,
            self.client
                .post(self.url(table))
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await?;
        Ok(())
    }

    async fn patch<B: Serialize + Sync>(
        &self,
        operation: &'static str,
        table: &str,
        id: &str,
        body: &B,
    ) -> Result<()> {
        self.send(
            operation,
            self.client
                .patch(self.url(table))
                .query(&[("id", format!("eq.{id}"))])
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, operation: &'static str, table: &str, id: &str) -> Result<()> {
        self.send(
            operation,
            self.client
                .delete(self.url(table))
                .query(&[("id", format!("eq.{id}"))]),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for RestRemote {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceRow>> {
        self.select("list_workspaces", "workspaces", None, Some("created_at.asc"))
            .await
    }

    async fn list_channels(&self, workspace_id: &str) -> Result<Vec<ChannelRow>> {
        self.select(
            "list_channels",
            "channels",
            Some(("workspace_id", workspace_id)),
            Some("created_at.asc"),
        )
        .await
    }

    async fn list_messages(&self, channel_id: &str) -> Result<Vec<MessageRow>> {
        self.select(
            "list_messages",
            "messages",
            Some(("channel_id", channel_id)),
            Some("created_at.asc"),
        )
        .await
    }

    async fn list_advance_lists(&self, channel_id: &str) -> Result<Vec<AdvanceList>> {
        self.select(
            "list_advance_lists",
            "advance_lists",
            Some(("channel_id", channel_id)),
            Some("created_at.desc"),
        )
        .await
    }

    async fn list_shared_order_lists(&self, channel_id: &str) -> Result<Vec<SharedOrderList>> {
        self.select(
            "list_shared_order_lists",
            "shared_order_lists",
            Some(("channel_id", channel_id)),
            Some("created_at.desc"),
        )
        .await
    }

    async fn insert_channel(&self, record: &ChannelRow) -> Result<()> {
        self.insert("insert_channel", "channels", record).await
    }

    async fn insert_message(&self, record: &MessageRow) -> Result<()> {
        self.insert("insert_message", "messages", record).await
    }

    async fn update_channel(&self, id: &str, patch: &ChannelPatch) -> Result<()> {
        self.patch("update_channel", "channels", id, patch).await
    }

    async fn update_message(&self, id: &str, patch: &MessagePatch) -> Result<()> {
        self.patch("update_message", "messages", id, patch).await
    }

    async fn delete_channel(&self, id: &str) -> Result<()> {
        self.remove("delete_channel", "channels", id).await
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        self.remove("delete_message", "messages", id).await
    }
}
