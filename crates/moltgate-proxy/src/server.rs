//! Proxy server: TCP listener, connection dispatch, and lifecycle.
//!
//! One listener serves two protocols: outbound egress (CONNECT tunnels and
//! plain-HTTP forwarding) and the local write API. Each accepted connection
//! runs on its own task; the head is read once here, then the request is
//! dispatched by its shape:
//!
//! CONNECT method        -> [`crate::connect`] (tunnel)
//! absolute-form target  -> [`crate::forward`]
//! remote Host header    -> [`crate::forward`]
//! origin-form path      -> [`crate::endpoints`] (local API)

use crate::audit::{AuditLog, AuditRecord};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::filter::AllowlistHandle;
use crate::httpio::{self, RequestHead};
use crate::moltbook::MoltbookClient;
use crate::store::BlobStore;
use crate::{connect, endpoints, forward};
use moltgate::{RateLimiter, Sanitizer};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Timeout for forwarded upstream fetches.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the proxy server.
pub struct ServerState {
    pub allowlist: AllowlistHandle,
    pub sanitizer: Sanitizer,
    pub limiter: RateLimiter,
    pub audit: AuditLog,
    /// Shared client for the forwarding arm. Redirects followed, 10 s cap.
    pub http: reqwest::Client,
    pub moltbook: Option<MoltbookClient>,
    pub store: Option<BlobStore>,
    /// Port the listener is actually bound to.
    pub port: u16,
    pub started: Instant,
    active_connections: AtomicUsize,
    max_connections: usize,
}

impl ServerState {
    /// Number of connections currently being served.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Handle returned when the proxy server starts.
pub struct ProxyHandle {
    /// The actual port the proxy is listening on.
    pub port: u16,
    /// Shared server state (allowlist reload, audit, drain bookkeeping).
    pub state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait up to `timeout` for in-flight connections to finish.
    ///
    /// Returns true when the proxy drained cleanly.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state.active() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "shutdown timed out with {} connection(s) in flight",
                    self.state.active()
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Start the proxy server.
///
/// Binds `0.0.0.0:config.port` (port 0 = OS-assigned, used by tests), loads
/// the allowlist, and begins accepting connections. The server runs until
/// [`ProxyHandle::shutdown`] is called.
pub async fn start(config: ProxyConfig, audit: AuditLog) -> Result<ProxyHandle> {
    let allowlist = AllowlistHandle::load(&config.allowlist_path)?;

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| ProxyError::Bind {
        addr: addr.clone(),
        source: e,
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ProxyError::Bind { addr, source: e })?
        .port();
    info!("moltgate listening on port {}", port);

    let http = reqwest::Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .build()
        .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {}", e)))?;

    let moltbook = match &config.moltbook {
        Some(cfg) => Some(MoltbookClient::new(cfg)?),
        None => None,
    };
    let store = match &config.store {
        Some(cfg) => Some(BlobStore::new(cfg)?),
        None => None,
    };

    let state = Arc::new(ServerState {
        allowlist,
        sanitizer: Sanitizer::new(),
        limiter: RateLimiter::new(),
        audit,
        http,
        moltbook,
        store,
        port,
        started: Instant::now(),
        active_connections: AtomicUsize::new(0),
        max_connections: config.max_connections,
    });

    state.audit.log(AuditRecord {
        method: "STARTUP".to_string(),
        hostname: "localhost".to_string(),
        port,
        allowed: true,
        ..Default::default()
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));

    Ok(ProxyHandle {
        port,
        state,
        shutdown_tx,
    })
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let max = state.max_connections;
                        if max > 0 && state.active() >= max {
                            warn!("connection limit reached ({}), rejecting {}", max, addr);
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        debug!("accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!("connection handler error: {}", e);
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("listener shutting down");
                    return;
                }
            }
        }
    }
}

/// Handle a single client connection: read the head once, dispatch by shape.
async fn handle_connection(mut stream: TcpStream, state: &ServerState) -> Result<()> {
    let (head, leftover) = match httpio::read_head(&mut stream).await {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(()), // client disconnected
        Err(ProxyError::HttpParse(reason)) => {
            state.audit.log(AuditRecord {
                method: "MALFORMED".to_string(),
                allowed: false,
                blocked_reason: Some(reason.clone()),
                ..Default::default()
            });
            httpio::write_json(
                &mut stream,
                400,
                &json!({"error": "Bad request", "message": reason}),
            )
            .await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        return connect::handle_connect(&head, &mut stream, state).await;
    }

    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return forward::handle_forward(&head, &mut stream, leftover, state).await;
    }

    if head.target.starts_with('/') {
        if is_local_request(&head) {
            return endpoints::handle_local(&head, &mut stream, leftover, state).await;
        }
        // Origin-form path aimed at a remote Host: treat as forwarding.
        return forward::handle_forward(&head, &mut stream, leftover, state).await;
    }

    state.audit.log(AuditRecord {
        method: head.method.to_uppercase(),
        path: head.target.clone(),
        allowed: false,
        blocked_reason: Some(format!("Unsupported request target: {}", head.target)),
        ..Default::default()
    });
    httpio::write_json(&mut stream, 400, &json!({"error": "Bad request"})).await?;
    Ok(())
}

/// Whether an origin-form request targets the proxy's own API.
fn is_local_request(head: &RequestHead) -> bool {
    match head.host() {
        None => true,
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn allowlist_file(domains: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let entries: Vec<String> = domains
            .iter()
            .map(|d| format!(r#"{{"domain":"{}","methods":["GET","POST","CONNECT"]}}"#, d))
            .collect();
        write!(f, r#"{{"allowedDomains":[{}]}}"#, entries.join(",")).unwrap();
        f
    }

    fn test_config(allowlist: &tempfile::NamedTempFile) -> ProxyConfig {
        ProxyConfig {
            port: 0,
            allowlist_path: allowlist.path().to_path_buf(),
            max_connections: 16,
            moltbook: None,
            store: None,
        }
    }

    async fn roundtrip(port: u16, request: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_server_starts_on_ephemeral_port() {
        let allowlist = allowlist_file(&["api.example.com"]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();
        assert!(handle.port > 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let allowlist = allowlist_file(&["api.example.com"]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();

        let response = roundtrip(
            handle.port,
            "GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains(r#""status":"healthy""#));
        assert!(response.contains("api.example.com"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_blocked_domain_is_403() {
        let allowlist = allowlist_file(&["api.example.com"]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();

        let response = roundtrip(handle.port, "CONNECT evil.example.com:443 HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(response.contains("Domain not in allowlist: evil.example.com"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_local_path_is_404() {
        let allowlist = allowlist_file(&[]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();

        let response = roundtrip(
            handle.port,
            "GET /admin HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_line_is_400() {
        let allowlist = allowlist_file(&[]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();

        let response = roundtrip(handle.port, "GARBAGE\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_drain_completes_when_idle() {
        let allowlist = allowlist_file(&[]);
        let handle = start(test_config(&allowlist), AuditLog::to_writer(Box::new(std::io::sink())))
            .await
            .unwrap();
        handle.shutdown();
        assert!(handle.drain(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_is_local_request() {
        let head = |host: Option<&str>| RequestHead {
            method: "GET".to_string(),
            target: "/health".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: host
                .map(|h| vec![("Host".to_string(), h.to_string())])
                .unwrap_or_default(),
        };
        assert!(is_local_request(&head(None)));
        assert!(is_local_request(&head(Some("localhost:3128"))));
        assert!(is_local_request(&head(Some("127.0.0.1"))));
        assert!(!is_local_request(&head(Some("feeds.example.com"))));
    }
}
