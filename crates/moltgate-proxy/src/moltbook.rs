//! Moltbook action-API client.
//!
//! The write endpoints (`/post`, `/vote`) never let the agent talk to the
//! social network directly; validated and scanned requests are re-issued
//! here with the bearer credential the agent never sees. The upstream
//! status and body are relayed verbatim so the caller can decide between
//! success and a 502.

use crate::config::MoltbookConfig;
use crate::error::{ProxyError, Result};
use moltgate::schema::PostRequest;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Timeout on every action call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Status and parsed body of an upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
}

impl UpstreamResponse {
    /// Whether the upstream accepted the action.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Client for the moltbook write API.
pub struct MoltbookClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MoltbookClient {
    /// Build a client from configuration.
    pub fn new(config: &MoltbookConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Create a post, or a comment when the request names a thread.
    pub async fn create_post(&self, request: &PostRequest) -> Result<UpstreamResponse> {
        let (url, payload) = match &request.thread_id {
            Some(thread_id) => (
                format!("{}/threads/{}/comments", self.base_url, thread_id),
                json!({ "content": request.content }),
            ),
            None => {
                let mut payload = json!({ "content": request.content });
                if let Some(title) = &request.title {
                    payload["title"] = json!(title);
                }
                if let Some(submolt) = &request.submolt_name {
                    payload["submolt_name"] = json!(submolt);
                }
                (format!("{}/posts", self.base_url), payload)
            }
        };
        self.execute(&url, &payload).await
    }

    /// Upvote a post.
    pub async fn upvote(&self, post_id: &str) -> Result<UpstreamResponse> {
        let url = format!("{}/posts/{}/upvote", self.base_url, post_id);
        self.execute(&url, &json!({})).await
    }

    async fn execute(&self, url: &str, payload: &Value) -> Result<UpstreamResponse> {
        debug!("moltbook call: POST {}", url);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(UpstreamResponse { status, body })
    }
}
