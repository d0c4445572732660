//! Local API arm: the structured write endpoints and health probe.
//!
//! Requests that reach this arm never leave the proxy unchecked. Each write
//! endpoint runs the same fixed pipeline (parse, validate, rate-check,
//! scan, upstream call, rate-record, audit, respond) and quota is consumed
//! only after the upstream accepted the action. A request that fails any
//! earlier stage costs no quota.

use crate::audit::AuditRecord;
use crate::error::Result;
use crate::httpio::{self, RequestHead, MAX_LOCAL_BODY_BYTES};
use crate::server::ServerState;
use crate::store::StoreError;
use chrono::{Duration as ChronoDuration, Utc};
use moltgate::schema::{self, MAX_MEMORY_BYTES};
use moltgate::RateKey;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::debug;

/// Blobs older than this are ignored when selecting the latest memory; the
/// storage lifecycle deletes them on the same horizon.
const MEMORY_MAX_AGE_DAYS: i64 = 7;

/// Outcome of one local endpoint invocation.
struct LocalOutcome {
    status: u16,
    body: Value,
    blocked_reason: Option<String>,
    sanitized: bool,
    patterns: Option<Vec<String>>,
}

impl LocalOutcome {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            blocked_reason: None,
            sanitized: false,
            patterns: None,
        }
    }

    fn denied(status: u16, reason: impl Into<String>, body: Value) -> Self {
        Self {
            status,
            body,
            blocked_reason: Some(reason.into()),
            sanitized: false,
            patterns: None,
        }
    }
}

/// Handle a request routed to the local arm. Emits exactly one audit record.
pub async fn handle_local(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    state: &ServerState,
) -> Result<()> {
    let started = Instant::now();
    let path = head.target.clone();
    debug!("local request: {} {}", head.method, path);

    let outcome = match (head.method.as_str(), path.as_str()) {
        ("GET", "/health") => health(state),
        ("POST", "/post") => post(head, stream, leftover, state).await,
        ("POST", "/vote") => vote(head, stream, leftover, state).await,
        ("POST", "/memory") => memory_write(head, stream, leftover, state).await,
        ("GET", "/memory/latest") => memory_latest(state).await,
        _ => LocalOutcome::denied(
            404,
            format!("Unknown path: {}", path),
            json!({"error": "Not found"}),
        ),
    };

    state.audit.log(AuditRecord {
        method: head.method.to_uppercase(),
        hostname: "localhost".to_string(),
        port: state.port,
        path,
        allowed: outcome.status < 400,
        sanitized: outcome.sanitized,
        injection_patterns: outcome.patterns.clone(),
        blocked_reason: outcome.blocked_reason.clone(),
        response_status: Some(outcome.status),
        duration_ms: duration_ms(started),
        ..Default::default()
    });

    httpio::write_json(stream, outcome.status, &outcome.body).await?;
    Ok(())
}

fn health(state: &ServerState) -> LocalOutcome {
    LocalOutcome::ok(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started.elapsed().as_secs(),
        "allowlist_domains": state.allowlist.snapshot().domains(),
    }))
}

async fn post(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    state: &ServerState,
) -> LocalOutcome {
    let body = match read_local_body(head, stream, leftover).await {
        Ok(body) => body,
        Err(outcome) => return outcome,
    };
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return LocalOutcome::denied(400, "Invalid JSON", json!({"error": "Invalid JSON"}));
        }
    };
    let request = match schema::validate_post_request(&value) {
        Ok(request) => request,
        Err(details) => {
            return LocalOutcome::denied(
                400,
                details.clone(),
                json!({"error": "Validation failed", "details": details}),
            );
        }
    };

    // Both windows must admit the post; neither is recorded yet.
    for key in [RateKey::PostHourly, RateKey::PostDaily] {
        if let Err(reason) = state.limiter.check(key) {
            return LocalOutcome::denied(
                429,
                reason.clone(),
                json!({"error": "Rate limit exceeded", "reason": reason}),
            );
        }
    }

    let scan = state.sanitizer.scan(&request.content);
    if scan.sanitized {
        // Injected content is never forwarded, even redacted.
        let mut outcome = LocalOutcome::denied(
            400,
            "Content contains disallowed patterns",
            json!({
                "error": "Content contains disallowed patterns",
                "patterns": scan.patterns.clone(),
            }),
        );
        outcome.sanitized = true;
        outcome.patterns = Some(scan.patterns);
        return outcome;
    }

    let Some(moltbook) = &state.moltbook else {
        return LocalOutcome::denied(
            500,
            "Moltbook credential not configured",
            json!({"error": "Moltbook credential not configured"}),
        );
    };

    match moltbook.create_post(&request).await {
        Ok(response) if response.is_success() => {
            state.limiter.record(RateKey::PostHourly);
            state.limiter.record(RateKey::PostDaily);
            LocalOutcome::ok(json!({
                "ok": true,
                "moltbook_status": response.status,
                "data": response.body,
            }))
        }
        Ok(response) => LocalOutcome::denied(
            502,
            format!("Upstream returned {}", response.status),
            json!({
                "error": "Upstream error",
                "moltbook_status": response.status,
                "data": response.body,
            }),
        ),
        Err(e) => {
            state.audit.log_error("moltbook post failed", Some(&e));
            LocalOutcome::denied(
                502,
                "Failed to reach upstream",
                json!({"error": "Failed to reach upstream", "message": e.to_string()}),
            )
        }
    }
}

async fn vote(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    state: &ServerState,
) -> LocalOutcome {
    let body = match read_local_body(head, stream, leftover).await {
        Ok(body) => body,
        Err(outcome) => return outcome,
    };
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return LocalOutcome::denied(400, "Invalid JSON", json!({"error": "Invalid JSON"}));
        }
    };
    let request = match schema::validate_vote_request(&value) {
        Ok(request) => request,
        Err(details) => {
            return LocalOutcome::denied(
                400,
                details.clone(),
                json!({"error": "Validation failed", "details": details}),
            );
        }
    };

    if let Err(reason) = state.limiter.check(RateKey::VoteHourly) {
        return LocalOutcome::denied(
            429,
            reason.clone(),
            json!({"error": "Rate limit exceeded", "reason": reason}),
        );
    }

    let Some(moltbook) = &state.moltbook else {
        return LocalOutcome::denied(
            500,
            "Moltbook credential not configured",
            json!({"error": "Moltbook credential not configured"}),
        );
    };

    match moltbook.upvote(&request.post_id).await {
        Ok(response) if response.is_success() => {
            state.limiter.record(RateKey::VoteHourly);
            LocalOutcome::ok(json!({
                "ok": true,
                "moltbook_status": response.status,
            }))
        }
        Ok(response) => LocalOutcome::denied(
            502,
            format!("Upstream returned {}", response.status),
            json!({
                "error": "Upstream error",
                "moltbook_status": response.status,
                "data": response.body,
            }),
        ),
        Err(e) => {
            state.audit.log_error("moltbook upvote failed", Some(&e));
            LocalOutcome::denied(
                502,
                "Failed to reach upstream",
                json!({"error": "Failed to reach upstream", "message": e.to_string()}),
            )
        }
    }
}

async fn memory_write(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
    state: &ServerState,
) -> LocalOutcome {
    let body = match read_local_body(head, stream, leftover).await {
        Ok(body) => body,
        Err(outcome) => return outcome,
    };
    if body.is_empty() {
        return LocalOutcome::denied(400, "Empty body", json!({"error": "Empty body"}));
    }
    if body.len() > MAX_MEMORY_BYTES {
        return LocalOutcome::denied(
            413,
            format!("Memory body of {} bytes exceeds limit", body.len()),
            json!({
                "error": "Payload too large",
                "size": body.len(),
                "max": MAX_MEMORY_BYTES,
            }),
        );
    }
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return LocalOutcome::denied(400, "Invalid JSON", json!({"error": "Invalid JSON"}));
        }
    };
    let memory = match schema::validate_memory(&value) {
        Ok(memory) => memory,
        Err(details) => {
            return LocalOutcome::denied(
                400,
                details.clone(),
                json!({"error": "Validation failed", "details": details}),
            );
        }
    };

    let Some(store) = &state.store else {
        return LocalOutcome::denied(
            500,
            "Object store not configured",
            json!({"error": "Object store not configured"}),
        );
    };

    let key = format!("memory/{}.json", memory.run_id);
    let mut metadata = HashMap::new();
    metadata.insert("run_id".to_string(), memory.run_id.clone());
    metadata.insert("run_start".to_string(), memory.run_start.clone());
    metadata.insert("analyzed".to_string(), "false".to_string());
    metadata.insert("approved".to_string(), "false".to_string());

    // The stored bytes are exactly what the agent sent, so the approved
    // round-trip through /memory/latest is byte-faithful.
    match store.put(&key, &body, "application/json", &metadata).await {
        Ok(()) => LocalOutcome::ok(json!({
            "ok": true,
            "blob": key,
            "run_id": memory.run_id,
        })),
        Err(StoreError::AlreadyExists { .. }) => LocalOutcome::denied(
            409,
            format!("Memory blob already exists for run_id {}", memory.run_id),
            json!({
                "error": "Memory blob already exists for this run_id",
                "run_id": memory.run_id,
            }),
        ),
        Err(e) => {
            state.audit.log_error("memory blob write failed", Some(&e));
            LocalOutcome::denied(
                500,
                "Storage failure",
                json!({"error": "Storage failure", "message": e.to_string()}),
            )
        }
    }
}

async fn memory_latest(state: &ServerState) -> LocalOutcome {
    let Some(store) = &state.store else {
        return LocalOutcome::denied(
            500,
            "Object store not configured",
            json!({"error": "Object store not configured"}),
        );
    };

    let items = match store.list("memory/").await {
        Ok(items) => items,
        Err(e) => {
            state.audit.log_error("memory list failed", Some(&e));
            return LocalOutcome::denied(
                500,
                "Storage failure",
                json!({"error": "Storage failure", "message": e.to_string()}),
            );
        }
    };

    let horizon = Utc::now() - ChronoDuration::days(MEMORY_MAX_AGE_DAYS);
    let latest = items
        .into_iter()
        .filter(|item| item.metadata.get("approved").map(String::as_str) == Some("true"))
        .filter_map(|item| item.updated_at().map(|at| (at, item)))
        .filter(|(at, _)| *at >= horizon)
        .max_by_key(|(at, _)| *at)
        .map(|(_, item)| item);

    let Some(latest) = latest else {
        return LocalOutcome::ok(json!({
            "ok": true,
            "data": Value::Null,
            "message": "No approved memory found",
        }));
    };

    match store.get(&latest.name).await {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(data) => LocalOutcome::ok(json!({"ok": true, "data": data})),
            Err(e) => {
                state.audit.log_error("stored memory is not valid JSON", Some(&e));
                LocalOutcome::denied(
                    500,
                    "Storage failure",
                    json!({"error": "Storage failure", "message": "stored memory is not valid JSON"}),
                )
            }
        },
        Err(e) => {
            state.audit.log_error("memory blob read failed", Some(&e));
            LocalOutcome::denied(
                500,
                "Storage failure",
                json!({"error": "Storage failure", "message": e.to_string()}),
            )
        }
    }
}

/// Read the request body for a local endpoint, enforcing the local cap.
async fn read_local_body(
    head: &RequestHead,
    stream: &mut TcpStream,
    leftover: Vec<u8>,
) -> std::result::Result<Vec<u8>, LocalOutcome> {
    let len = head.content_length().unwrap_or(0);
    if len > MAX_LOCAL_BODY_BYTES {
        return Err(LocalOutcome::denied(
            413,
            format!("Body of {} bytes exceeds limit", len),
            json!({
                "error": "Payload too large",
                "size": len,
                "max": MAX_LOCAL_BODY_BYTES,
            }),
        ));
    }
    httpio::read_body(stream, &leftover, len).await.map_err(|e| {
        LocalOutcome::denied(
            400,
            format!("Body read failed: {}", e),
            json!({"error": "Body read failed"}),
        )
    })
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
