//! Plain-HTTP forwarding arm.
//!
//! Serves absolute-form requests (`GET http://host/path HTTP/1.1`) and
//! origin-form requests whose Host header names a remote host. The upstream
//! call goes through the shared reqwest client (redirects followed, 10 s
//! timeout); the response body is scanned by the sanitizer before it
//! reaches the agent, with `Content-Length` recomputed over the redacted
//! bytes.

use crate::audit::AuditRecord;
use crate::error::{ProxyError, Result};
use crate::httpio::{self, RequestHead};
use crate::server::ServerState;
use serde_json::json;
use std::time::Instant;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::debug;

/// Hop-by-hop and proxy-control headers never forwarded upstream.
const STRIPPED_REQUEST_HEADERS: [&str; 5] = [
    "proxy-connection",
    "proxy-authorization",
    "host",
    "content-length",
    "connection",
];

/// Response headers replaced by the proxy's own framing.
const STRIPPED_RESPONSE_HEADERS: [&str; 3] = ["transfer-encoding", "content-length", "connection"];

/// Handle a forwarding request. Emits exactly one audit record.
pub async fn handle_forward(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    state: &ServerState,
) -> Result<()> {
    let started = Instant::now();
    let (url, host, port, path) = resolve_target(head)?;
    let method = head.method.to_uppercase();
    debug!("forwarding {} {}", method, url);

    let decision = state
        .allowlist
        .snapshot()
        .check(&host, &method, Some(&path));
    if !decision.is_allowed() {
        let reason = decision.reason();
        state.audit.log(AuditRecord {
            method,
            hostname: host,
            port,
            path,
            allowed: false,
            blocked_reason: Some(reason.clone()),
            duration_ms: elapsed_ms(started),
            ..Default::default()
        });
        httpio::write_json(stream, 403, &json!({"error": "Forbidden", "reason": reason})).await?;
        return Ok(());
    }

    // Body is already buffered (or read here) before the upstream call.
    let body = match head.content_length() {
        Some(len) if len > 0 && method != "GET" && method != "HEAD" => {
            httpio::read_body(stream, &leftover, len).await?
        }
        _ => Vec::new(),
    };

    let reqwest_method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ProxyError::HttpParse(format!("unsupported method: {}", method)))?;
    let mut request = state.http.request(reqwest_method, url.clone());
    for (name, value) in &head.headers {
        if STRIPPED_REQUEST_HEADERS
            .iter()
            .any(|s| name.eq_ignore_ascii_case(s))
        {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    // A client that hangs up while the upstream call is in flight cancels it.
    let response = tokio::select! {
        response = request.send() => response,
        () = wait_for_client_close(stream) => {
            debug!("client closed during upstream fetch for {}", url);
            state.audit.log(AuditRecord {
                method,
                hostname: host,
                port,
                path,
                allowed: true,
                blocked_reason: Some("client closed connection".to_string()),
                duration_ms: elapsed_ms(started),
                ..Default::default()
            });
            return Ok(());
        }
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            state.audit.log(AuditRecord {
                method,
                hostname: host.clone(),
                port,
                path,
                allowed: true,
                response_status: Some(502),
                duration_ms: elapsed_ms(started),
                ..Default::default()
            });
            state
                .audit
                .log_error(&format!("upstream fetch failed for {}", host), Some(&e));
            httpio::write_json(
                stream,
                502,
                &json!({"error": "Bad Gateway", "message": "Failed to reach upstream"}),
            )
            .await?;
            return Ok(());
        }
    };

    let status = response.status().as_u16();
    let forwarded_headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter(|(name, _)| {
            !STRIPPED_RESPONSE_HEADERS
                .iter()
                .any(|s| name.as_str().eq_ignore_ascii_case(s))
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let raw_body = response
        .bytes()
        .await
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    // Binary payloads pass through unscanned; the taxonomy targets text.
    let (out_body, sanitized, patterns) = match std::str::from_utf8(&raw_body) {
        Ok(text) => {
            let outcome = state.sanitizer.scan(text);
            if outcome.sanitized {
                (outcome.content.into_bytes(), true, Some(outcome.patterns))
            } else {
                (raw_body.to_vec(), false, None)
            }
        }
        Err(_) => (raw_body.to_vec(), false, None),
    };

    let headers: Vec<(&str, String)> = forwarded_headers
        .iter()
        .map(|(n, v)| (n.as_str(), v.clone()))
        .collect();
    httpio::write_response(stream, status, &headers, &out_body).await?;

    state.audit.log(AuditRecord {
        method,
        hostname: host,
        port,
        path,
        allowed: true,
        sanitized,
        injection_patterns: patterns,
        response_status: Some(status),
        duration_ms: elapsed_ms(started),
        ..Default::default()
    });

    Ok(())
}

/// Resolve the absolute target URL, host, port, and path for a request.
///
/// Absolute-form targets are taken as-is; origin-form targets are joined
/// with the Host header (plain HTTP; encrypted upstreams go via CONNECT).
fn resolve_target(head: &RequestHead) -> Result<(String, String, u16, String)> {
    let absolute = if head.target.starts_with("http://") || head.target.starts_with("https://") {
        head.target.clone()
    } else {
        let host = head.header("host").ok_or_else(|| {
            ProxyError::HttpParse("origin-form request without Host header".to_string())
        })?;
        format!("http://{}{}", host, head.target)
    };

    let parsed = url::Url::parse(&absolute)
        .map_err(|e| ProxyError::HttpParse(format!("invalid target URL {}: {}", absolute, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProxyError::HttpParse(format!("target URL has no host: {}", absolute)))?
        .to_string();
    let port = parsed
        .port()
        .unwrap_or(if parsed.scheme() == "https" { 443 } else { 80 });
    let path = parsed.path().to_string();

    Ok((absolute, host, port, path))
}

/// Resolve until the client half-closes or drops the connection. Data the
/// client pipelines after the head is ignored.
async fn wait_for_client_close(stream: &TcpStream) {
    let mut scratch = [0u8; 512];
    loop {
        if stream.ready(Interest::READABLE).await.is_err() {
            return;
        }
        match stream.try_read(&mut scratch) {
            Ok(0) => return,
            Ok(_) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            Err(_) => return,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_resolve_absolute_form() {
        let (url, host, port, path) =
            resolve_target(&head("GET", "http://feeds.example.com/rss?page=2", &[])).unwrap();
        assert_eq!(url, "http://feeds.example.com/rss?page=2");
        assert_eq!(host, "feeds.example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/rss");
    }

    #[test]
    fn test_resolve_origin_form_uses_host_header() {
        let (url, host, port, path) = resolve_target(&head(
            "GET",
            "/feed.xml",
            &[("Host", "feeds.example.com:8080")],
        ))
        .unwrap();
        assert_eq!(url, "http://feeds.example.com:8080/feed.xml");
        assert_eq!(host, "feeds.example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/feed.xml");
    }

    #[test]
    fn test_resolve_origin_form_without_host_fails() {
        assert!(resolve_target(&head("GET", "/feed.xml", &[])).is_err());
    }

    #[test]
    fn test_resolve_https_default_port() {
        let (_, _, port, _) =
            resolve_target(&head("GET", "https://api.example.com/v1", &[])).unwrap();
        assert_eq!(port, 443);
    }
}
