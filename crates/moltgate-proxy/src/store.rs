//! Object-store client for the agent memory container.
//!
//! Speaks the JSON object API (GCS-compatible; the endpoint is configurable
//! so tests and emulators point it at a local server). The append-only
//! guarantee rides on the store's conditional-create primitive:
//! `ifGenerationMatch=0` makes a create of an existing key fail with 412,
//! which surfaces as [`StoreError::AlreadyExists`], never a blind
//! overwrite.
//!
//! Authentication is ambient: a bearer token from the instance metadata
//! endpoint, cached until near expiry. A static token can be injected for
//! local runs and tests.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::StoreConfig;

/// Timeout for reads, lists, and metadata updates.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
/// Uploads get a longer bound.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Refresh ambient tokens this long before they expire.
const TOKEN_SLACK_SECS: i64 = 60;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Errors from the object store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("blob already exists: {key}")]
    AlreadyExists { key: String },

    #[error("blob not found: {key}")]
    NotFound { key: String },

    #[error("store request failed: {0}")]
    Request(String),

    #[error("unexpected store response {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("identity token unavailable: {0}")]
    Identity(String),
}

/// A listed blob.
#[derive(Debug, Clone)]
pub struct BlobItem {
    pub name: String,
    /// RFC 3339 last-modified time as reported by the store.
    pub updated: String,
    /// Custom metadata map (empty when the blob has none).
    pub metadata: HashMap<String, String>,
}

impl BlobItem {
    /// Parsed last-modified time; `None` when the store sent garbage.
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.updated)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
    #[serde(default)]
    updated: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

enum TokenSource {
    Static(String),
    Ambient(Mutex<Option<CachedToken>>),
}

/// Client for one blob container.
pub struct BlobStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: TokenSource,
}

impl BlobStore {
    /// Build a client from configuration.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Request(format!("failed to build HTTP client: {}", e)))?;
        let token = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::Ambient(Mutex::new(None)),
        };
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            token,
        })
    }

    /// Create a blob. Fails with [`StoreError::AlreadyExists`] when the key
    /// is already present; existing content is never touched.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=multipart&ifGenerationMatch=0",
            self.endpoint, self.bucket
        );

        let boundary = "moltgate_blob_boundary";
        let descriptor = json!({
            "name": key,
            "contentType": content_type,
            "metadata": metadata,
        });
        let mut body = Vec::with_capacity(bytes.len() + 512);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(descriptor.to_string().as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let response = self
            .http
            .post(&url)
            .timeout(UPLOAD_TIMEOUT)
            .bearer_auth(&token)
            .header(
                "content-type",
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        match response.status().as_u16() {
            200 | 201 => {
                debug!("created blob {} ({} bytes)", key, bytes.len());
                Ok(())
            }
            412 => Err(StoreError::AlreadyExists {
                key: key.to_string(),
            }),
            status => Err(StoreError::Unexpected {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Download a blob's content.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?alt=media",
            self.endpoint,
            self.bucket,
            encode_key(key)
        );

        let response = self
            .http
            .get(&url)
            .timeout(OP_TIMEOUT)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(response
                .bytes()
                .await
                .map_err(|e| StoreError::Request(e.to_string()))?
                .to_vec()),
            404 => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            status => Err(StoreError::Unexpected {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// List blobs under a key prefix, with metadata.
    pub async fn list(&self, prefix: &str) -> Result<Vec<BlobItem>, StoreError> {
        let token = self.bearer().await?;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/storage/v1/b/{}/o?prefix={}",
                self.endpoint,
                self.bucket,
                encode_key(prefix)
            );
            if let Some(ref t) = page_token {
                url.push_str("&pageToken=");
                url.push_str(t);
            }

            let response = self
                .http
                .get(&url)
                .timeout(OP_TIMEOUT)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| StoreError::Request(e.to_string()))?;

            let status = response.status().as_u16();
            if status != 200 {
                return Err(StoreError::Unexpected {
                    status,
                    body: response.text().await.unwrap_or_default(),
                });
            }

            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Request(format!("invalid list response: {}", e)))?;
            items.extend(page.items.into_iter().map(|i| BlobItem {
                name: i.name,
                updated: i.updated,
                metadata: i.metadata,
            }));

            match page.next_page_token {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }

        Ok(items)
    }

    /// Replace a blob's custom metadata map. Content is untouched.
    pub async fn set_metadata(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            self.bucket,
            encode_key(key)
        );

        let response = self
            .http
            .patch(&url)
            .timeout(OP_TIMEOUT)
            .bearer_auth(&token)
            .json(&json!({ "metadata": metadata }))
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(()),
            404 => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            status => Err(StoreError::Unexpected {
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn bearer(&self) -> Result<String, StoreError> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Ambient(cache) => {
                let mut cache = cache.lock().await;
                if let Some(cached) = cache.as_ref() {
                    if cached.expires_at > Utc::now() {
                        return Ok(cached.value.clone());
                    }
                }

                let response = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .timeout(OP_TIMEOUT)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| StoreError::Identity(e.to_string()))?;
                if response.status().as_u16() != 200 {
                    return Err(StoreError::Identity(format!(
                        "metadata endpoint returned {}",
                        response.status()
                    )));
                }
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| StoreError::Identity(e.to_string()))?;

                let expires_at = Utc::now()
                    + ChronoDuration::seconds((token.expires_in - TOKEN_SLACK_SECS).max(0));
                let value = token.access_token.clone();
                *cache = Some(CachedToken {
                    value: token.access_token,
                    expires_at,
                });
                Ok(value)
            }
        }
    }
}

/// Percent-encode an object key for use as a single path segment.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
