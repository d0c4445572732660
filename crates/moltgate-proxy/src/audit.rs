//! Machine-readable audit trail.
//!
//! Every request decision produces exactly one JSON object on standard
//! output, one per line. Diagnostics stay on `tracing` (stderr); this sink
//! is the contract with the downstream log pipeline, so records are written
//! whole under a mutex and never interleave.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::sync::Mutex;

/// One request decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditRecord {
    /// ISO-8601 UTC, stamped by the logger when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub method: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub allowed: bool,
    pub sanitized: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_patterns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
}

/// Serialized JSONL sink.
pub struct AuditLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl AuditLog {
    /// Log to the process's standard output (production sink).
    #[must_use]
    pub fn stdout() -> Self {
        Self::to_writer(Box::new(std::io::stdout()))
    }

    /// Log to an arbitrary writer (tests capture output here).
    #[must_use]
    pub fn to_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Emit one decision record, stamping `timestamp` if the caller left it
    /// unset.
    pub fn log(&self, mut record: AuditRecord) {
        if record.timestamp.is_none() {
            record.timestamp = Some(now_iso());
        }
        match serde_json::to_value(&record) {
            Ok(value) => self.write_line(&value),
            Err(e) => tracing::warn!("failed to serialize audit record: {}", e),
        }
    }

    /// Emit an error record. The full error detail belongs here, never in a
    /// client response body.
    pub fn log_error(&self, message: &str, err: Option<&(dyn std::error::Error + 'static)>) {
        let mut value = json!({
            "timestamp": now_iso(),
            "level": "error",
            "message": message,
        });
        if let Some(err) = err {
            let debug = format!("{:?}", err);
            value["error_name"] = json!(error_name(&debug));
            value["error_message"] = json!(err.to_string());
            value["stack"] = json!(source_chain(err));
        }
        self.write_line(&value);
    }

    fn write_line(&self, value: &serde_json::Value) {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if writeln!(sink, "{}", value).is_err() || sink.flush().is_err() {
            tracing::warn!("failed to write audit record");
        }
    }
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// First identifier of the Debug representation, e.g. the enum variant name.
fn error_name(debug: &str) -> &str {
    debug
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("Error")
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = vec![err.to_string()];
    let mut current = err.source();
    while let Some(cause) = current {
        chain.push(format!("caused by: {}", cause));
        current = cause.source();
    }
    chain.join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let raw = self.0.lock().unwrap();
            String::from_utf8(raw.clone())
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn capture() -> (AuditLog, SharedBuf) {
        let buf = SharedBuf::default();
        (AuditLog::to_writer(Box::new(buf.clone())), buf)
    }

    #[test]
    fn test_record_is_one_json_line_with_timestamp() {
        let (log, buf) = capture();
        log.log(AuditRecord {
            method: "CONNECT".to_string(),
            hostname: "api.example.com".to_string(),
            port: 443,
            allowed: true,
            duration_ms: 12,
            ..Default::default()
        });

        let lines = buf.lines();
        assert_eq!(lines.len(), 1);
        let record = &lines[0];
        assert_eq!(record["method"], "CONNECT");
        assert_eq!(record["hostname"], "api.example.com");
        assert_eq!(record["port"], 443);
        assert_eq!(record["allowed"], true);
        let ts = record["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp not UTC: {}", ts);
        assert!(ts.contains('.'), "timestamp lacks millis: {}", ts);
    }

    #[test]
    fn test_caller_timestamp_preserved() {
        let (log, buf) = capture();
        log.log(AuditRecord {
            timestamp: Some("2026-08-01T00:00:00.000Z".to_string()),
            method: "GET".to_string(),
            ..Default::default()
        });
        assert_eq!(buf.lines()[0]["timestamp"], "2026-08-01T00:00:00.000Z");
    }

    #[test]
    fn test_optional_fields_omitted_when_unset() {
        let (log, buf) = capture();
        log.log(AuditRecord {
            method: "GET".to_string(),
            ..Default::default()
        });
        let record = &buf.lines()[0];
        assert!(record.get("blocked_reason").is_none());
        assert!(record.get("injection_patterns").is_none());
        assert!(record.get("response_status").is_none());
    }

    #[test]
    fn test_denied_record_carries_reason() {
        let (log, buf) = capture();
        log.log(AuditRecord {
            method: "CONNECT".to_string(),
            hostname: "evil.example.com".to_string(),
            port: 443,
            allowed: false,
            blocked_reason: Some("Domain not in allowlist: evil.example.com".to_string()),
            ..Default::default()
        });
        let record = &buf.lines()[0];
        assert_eq!(record["allowed"], false);
        assert_eq!(
            record["blocked_reason"],
            "Domain not in allowlist: evil.example.com"
        );
    }

    #[test]
    fn test_log_error_includes_detail() {
        let (log, buf) = capture();
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        log.log_error("upstream dial failed", Some(&err));

        let record = &buf.lines()[0];
        assert_eq!(record["level"], "error");
        assert_eq!(record["message"], "upstream dial failed");
        assert!(record["error_name"].as_str().unwrap().len() > 1);
        assert_eq!(record["error_message"], "refused");
        assert!(record["stack"].is_string());
    }

    #[test]
    fn test_log_error_without_error_object() {
        let (log, buf) = capture();
        log.log_error("allowlist reload failed", None);
        let record = &buf.lines()[0];
        assert_eq!(record["level"], "error");
        assert!(record.get("error_name").is_none());
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let (log, buf) = capture();
        let log = Arc::new(log);
        let mut handles = Vec::new();
        for i in 0..8 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    log.log(AuditRecord {
                        method: format!("M{}", i),
                        ..Default::default()
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Every line parses as standalone JSON; interleaving would break this.
        assert_eq!(buf.lines().len(), 400);
    }
}
