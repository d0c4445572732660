//! HTTP CONNECT tunnel arm.
//!
//! Handles `CONNECT host:port HTTP/1.1` by checking the allowlist, dialing
//! the upstream, answering `200 Connection Established`, and splicing bytes
//! in both directions until either side closes. The proxy never terminates
//! TLS; tunneled content is opaque and uninspected.

use crate::audit::AuditRecord;
use crate::error::{ProxyError, Result};
use crate::httpio::{self, RequestHead};
use crate::server::ServerState;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Timeout for the upstream TCP dial.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a CONNECT request. Emits exactly one audit record per attempt.
pub async fn handle_connect(
    head: &RequestHead,
    stream: &mut TcpStream,
    state: &ServerState,
) -> Result<()> {
    let started = Instant::now();
    let (host, port) = parse_connect_target(&head.target)?;
    debug!("CONNECT request to {}:{}", host, port);

    let decision = state.allowlist.snapshot().check(&host, "CONNECT", None);
    if !decision.is_allowed() {
        let reason = decision.reason();
        state.audit.log(AuditRecord {
            method: "CONNECT".to_string(),
            hostname: host.clone(),
            port,
            allowed: false,
            blocked_reason: Some(reason.clone()),
            duration_ms: elapsed_ms(started),
            ..Default::default()
        });
        httpio::write_json(stream, 403, &json!({"error": "Forbidden", "reason": reason})).await?;
        return Ok(());
    }

    let target = format!("{}:{}", host, port);
    let upstream = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(&target)).await;
    let mut upstream = match upstream {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            return tunnel_dial_failed(stream, state, &host, port, started, e.to_string()).await;
        }
        Err(_) => {
            return tunnel_dial_failed(
                stream,
                state,
                &host,
                port,
                started,
                "connection timed out".to_string(),
            )
            .await;
        }
    };

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    state.audit.log(AuditRecord {
        method: "CONNECT".to_string(),
        hostname: host.clone(),
        port,
        allowed: true,
        duration_ms: elapsed_ms(started),
        ..Default::default()
    });

    // Opaque splice until either end closes. Errors after the 200 cannot be
    // reported over HTTP; both sides just tear down.
    let result = tokio::io::copy_bidirectional(stream, &mut upstream).await;
    debug!("tunnel closed for {}:{}: {:?}", host, port, result);

    Ok(())
}

async fn tunnel_dial_failed(
    stream: &mut TcpStream,
    state: &ServerState,
    host: &str,
    port: u16,
    started: Instant,
    reason: String,
) -> Result<()> {
    state.audit.log(AuditRecord {
        method: "CONNECT".to_string(),
        hostname: host.to_string(),
        port,
        allowed: true,
        response_status: Some(502),
        duration_ms: elapsed_ms(started),
        ..Default::default()
    });
    state.audit.log_error(
        &format!("upstream dial failed for {}:{}", host, port),
        Some(&ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: reason.clone(),
        }),
    );
    httpio::write_json(
        stream,
        502,
        &json!({"error": "Bad Gateway", "message": reason}),
    )
    .await?;
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Parse the target of a CONNECT request line. Port defaults to 443.
fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    if target.is_empty() || target.starts_with('/') {
        return Err(ProxyError::HttpParse(format!(
            "malformed CONNECT target: {}",
            target
        )));
    }
    if let Some((host, port_str)) = target.rsplit_once(':') {
        let port = port_str.parse::<u16>().map_err(|_| {
            ProxyError::HttpParse(format!("invalid port in CONNECT target: {}", target))
        })?;
        Ok((host.to_string(), port))
    } else {
        Ok((target.to_string(), 443))
    }
}
