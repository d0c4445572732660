//! Runtime configuration sourced from the environment.
//!
//! The proxy carries no config file of its own beyond the allowlist path;
//! everything else (port, upstream credential, store coordinates) arrives
//! through environment variables so the container orchestrator owns the
//! wiring.

use crate::error::{ProxyError, Result};
use std::path::PathBuf;

/// Default listener port.
pub const DEFAULT_PORT: u16 = 3128;
/// Default concurrent-connection cap (0 = unlimited).
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
/// Default moltbook API base.
pub const DEFAULT_MOLTBOOK_API_URL: &str = "https://api.moltbook.com/api/v1";
/// Default object-store endpoint.
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

/// Top-level proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listener port (0 = OS-assigned, used by tests).
    pub port: u16,
    /// Path to the allowlist JSON file.
    pub allowlist_path: PathBuf,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Action-API upstream; `None` disables `/post` and `/vote`.
    pub moltbook: Option<MoltbookConfig>,
    /// Object store; `None` disables `/memory` and `/memory/latest`.
    pub store: Option<StoreConfig>,
}

/// Moltbook action-API settings.
#[derive(Debug, Clone)]
pub struct MoltbookConfig {
    /// API base URL including the version prefix.
    pub base_url: String,
    /// Bearer credential sourced from the environment at startup.
    pub api_key: String,
}

/// Object-store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store endpoint base URL.
    pub endpoint: String,
    /// Container (bucket) name.
    pub bucket: String,
    /// Static bearer token override. When absent the client fetches tokens
    /// from the instance metadata endpoint (ambient identity).
    pub access_token: Option<String>,
}

impl ProxyConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests inject a map here).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| ProxyError::Config(format!("invalid PORT value: {}", raw)))?,
            None => DEFAULT_PORT,
        };

        let allowlist_path =
            PathBuf::from(get("ALLOWLIST_CONFIG").unwrap_or_else(|| "allowlist.json".to_string()));

        let max_connections = match get("MAX_CONNECTIONS") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                ProxyError::Config(format!("invalid MAX_CONNECTIONS value: {}", raw))
            })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let moltbook = get("MOLTBOOK_API_KEY").map(|api_key| MoltbookConfig {
            base_url: get("MOLTBOOK_API_URL")
                .unwrap_or_else(|| DEFAULT_MOLTBOOK_API_URL.to_string()),
            api_key,
        });

        let store = get("STORAGE_BUCKET").map(|bucket| StoreConfig {
            endpoint: get("STORAGE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_STORAGE_ENDPOINT.to_string()),
            bucket,
            access_token: get("STORAGE_ACCESS_TOKEN"),
        });

        Ok(Self {
            port,
            allowlist_path,
            max_connections,
            moltbook,
            store,
        })
    }
}
