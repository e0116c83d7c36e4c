// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP remote adapter.
//!
//! One `reqwest::Client` serves both capability traits. Reads go through the
//! bulk sync endpoint; writes and per-task comment reads go through REST v2.
//!
//! Status mapping:
//!
//! | Response                         | Error                      |
//! |----------------------------------|----------------------------|
//! | 401 / 403                        | [`RemoteError::Auth`]      |
//! | 404                              | [`RemoteError::NotFound`]  |
//! | 429, 5xx, connect/timeout errors | [`RemoteError::Unavailable`] |
//! | other 4xx, undecodable body      | [`RemoteError::Protocol`]  |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::traits::{NewTask, ReadClient, RemoteError, TaskUpdate, WriteClient};
use super::wire::{self, SyncResponse};
use crate::config::SyncEngineConfig;
use crate::model::{Comment, Snapshot, SyncToken, Task};

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_token: String,
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        RemoteError::Protocol(e.to_string())
    } else {
        RemoteError::Unavailable(e.to_string())
    }
}

/// Map a non-success status to the error taxonomy.
pub(crate) fn status_error(status: StatusCode, context: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Auth(format!("{} ({})", context, status))
        }
        StatusCode::NOT_FOUND => RemoteError::NotFound(context.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Unavailable(format!("{} rate limited", context)),
        s if s.is_server_error() => RemoteError::Unavailable(format!("{} ({})", context, s)),
        s => RemoteError::Protocol(format!("{} unexpected status {}", context, s)),
    }
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        })
    }

    pub fn from_config(config: &SyncEngineConfig) -> Result<Self, RemoteError> {
        let token = config
            .api_token
            .clone()
            .ok_or_else(|| RemoteError::Auth("no API token configured".into()))?;
        Self::new(
            config.remote_base_url.clone(),
            token,
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    /// REST v2 endpoint for `segments`. Each segment is percent-encoded, so
    /// ids containing `/`, `?` or `#` stay inside their path segment.
    fn rest(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Protocol(format!("invalid base URL '{}': {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Protocol(format!("base URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["rest", "v2"])
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.api_token)
    }

    async fn send(&self, builder: RequestBuilder, context: &str) -> Result<Response, RemoteError> {
        let response = self.authed(builder).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, context, body = %body, "Remote request failed");
        Err(status_error(status, context))
    }

    async fn send_json(&self, builder: RequestBuilder, context: &str) -> Result<Value, RemoteError> {
        self.send(builder, context)
            .await?
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Protocol(format!("{}: {}", context, e)))
    }
}

#[async_trait]
impl ReadClient for HttpRemote {
    async fn fetch_snapshot(&self, checkpoint: Option<&SyncToken>) -> Result<Snapshot, RemoteError> {
        let url = format!("{}/sync/v9/sync", self.base_url);
        let form = wire::sync_request_form(checkpoint);
        let response = self.send(self.client.post(&url).form(&form), "sync").await?;
        let body: SyncResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Protocol(format!("sync: {}", e)))?;

        let snapshot = wire::snapshot_from_sync(body)?;
        if checkpoint.is_some() && snapshot.is_full_sync {
            debug!("Remote ignored checkpoint and returned a full snapshot");
        }
        Ok(snapshot)
    }

    async fn fetch_comments(&self, task_id: &str) -> Result<Vec<Comment>, RemoteError> {
        let url = self.rest(&["comments"])?;
        let body = self
            .send_json(self.client.get(url).query(&[("task_id", task_id)]), "comments")
            .await?;
        let items = body
            .as_array()
            .ok_or_else(|| RemoteError::Protocol("comments: expected an array".into()))?;
        items.iter().map(wire::comment_from_rest).collect()
    }
}

#[async_trait]
impl WriteClient for HttpRemote {
    async fn create_task(&self, task: &NewTask) -> Result<Task, RemoteError> {
        let body = self
            .send_json(self.client.post(self.rest(&["tasks"])?).json(task), "create_task")
            .await?;
        wire::task_from_rest(&body)
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, RemoteError> {
        let url = self.rest(&["tasks", task_id])?;
        let body = self
            .send_json(self.client.post(url).json(update), "update_task")
            .await?;
        wire::task_from_rest(&body)
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), RemoteError> {
        let url = self.rest(&["tasks", task_id])?;
        self.send(self.client.delete(url), "delete_task").await?;
        Ok(())
    }

    async fn complete_task(&self, task_id: &str) -> Result<(), RemoteError> {
        let url = self.rest(&["tasks", task_id, "close"])?;
        self.send(self.client.post(url), "complete_task").await?;
        Ok(())
    }

    async fn reopen_task(&self, task_id: &str) -> Result<(), RemoteError> {
        let url = self.rest(&["tasks", task_id, "reopen"])?;
        self.send(self.client.post(url), "reopen_task").await?;
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, content: &str) -> Result<Comment, RemoteError> {
        let payload = json!({"task_id": task_id, "content": content});
        let body = self
            .send_json(self.client.post(self.rest(&["comments"])?).json(&payload), "add_comment")
            .await?;
        wire::comment_from_rest(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, "x"), RemoteError::Auth(_)));
        assert!(matches!(status_error(StatusCode::FORBIDDEN, "x"), RemoteError::Auth(_)));
        assert!(matches!(status_error(StatusCode::NOT_FOUND, "x"), RemoteError::NotFound(_)));
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(status_error(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(matches!(status_error(StatusCode::BAD_REQUEST, "x"), RemoteError::Protocol(_)));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let remote = HttpRemote::new("https://example.test/", "tok", Duration::from_secs(1)).unwrap();
        assert_eq!(remote.rest(&["tasks"]).unwrap().as_str(), "https://example.test/rest/v2/tasks");
    }

    #[test]
    fn test_task_ids_are_path_encoded() {
        let remote = HttpRemote::new("https://example.test/api", "tok", Duration::from_secs(1)).unwrap();
        let url = remote.rest(&["tasks", "a/b?c#d", "close"]).unwrap();
        assert_eq!(url.as_str(), "https://example.test/api/rest/v2/tasks/a%2Fb%3Fc%23d/close");
        assert_eq!(url.path_segments().unwrap().count(), 6);

        let broken = HttpRemote::new("not a url", "tok", Duration::from_secs(1)).unwrap();
        assert!(matches!(broken.rest(&["tasks"]), Err(RemoteError::Protocol(_))));
    }

    #[test]
    fn test_from_config_requires_token() {
        let config = SyncEngineConfig::default();
        assert!(matches!(HttpRemote::from_config(&config), Err(RemoteError::Auth(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments
        let remote = HttpRemote::new("http://127.0.0.1:9", "tok", Duration::from_millis(500)).unwrap();
        let err = remote.fetch_snapshot(None).await.unwrap_err();
        assert!(err.is_retryable(), "got {:?}", err);
    }
}
