//! Request and memory-file schemas with accumulated-error validation.
//!
//! Three shapes cross the trust boundary: the agent's memory snapshot
//! (persisted to the blob store), post requests, and vote requests. Each is
//! modeled as a strict serde type; memory entries are an internally tagged
//! enum so the `type` discriminator is parsed before the arm-specific
//! fields.
//!
//! Validation is two-stage. Shape and constraint checks walk the raw JSON
//! value first, accumulating `path: message` fragments, so a document with
//! an unknown field, a bad tag, and an out-of-range string reports all
//! three at once, joined by `"; "`. Only a clean document is deserialized
//! into the typed structs; serde engine errors never cross the boundary.

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Serialized memory documents are bounded to 1 MiB.
pub const MAX_MEMORY_BYTES: usize = 1024 * 1024;
/// A memory document holds at most this many entries.
pub const MAX_ENTRIES: usize = 10_000;

const MAX_ID_LEN: usize = 128;
const MAX_CONTENT_LEN: usize = 500;
const MAX_TITLE_LEN: usize = 300;
const MAX_SUBMOLT_LEN: usize = 128;

const MEMORY_FIELDS: [&str; 6] = [
    "version",
    "run_id",
    "run_start",
    "run_end",
    "entries",
    "stats",
];
const STATS_FIELDS: [&str; 4] = ["posts_read", "posts_made", "upvotes", "threads_tracked"];
const POST_FIELDS: [&str; 4] = ["content", "thread_id", "title", "submolt_name"];
const VOTE_FIELDS: [&str; 1] = ["post_id"];

const ENTRY_TYPES: [&str; 3] = ["post_seen", "post_made", "thread_tracked"];
const TOPIC_LABELS: [&str; 6] = [
    "ai_safety",
    "agent_design",
    "moltbook_meta",
    "social",
    "technical",
    "other",
];
const SENTIMENTS: [&str; 3] = ["positive", "neutral", "negative"];
const ACTIONS: [&str; 3] = ["reply", "new_post", "upvote"];

// Raw UUIDs plus UUID-with-checkpoint-suffix forms.
static RUN_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-f0-9-]+(-(cp|checkpoint)\d+)?$").expect("invalid run_id regex")
});

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("invalid id regex"));

/// The agent's persisted state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryFile {
    pub version: u32,
    pub run_id: String,
    pub run_start: String,
    pub run_end: String,
    pub entries: Vec<MemoryEntry>,
    pub stats: MemoryStats,
}

/// One observed or performed action, discriminated on `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryEntry {
    PostSeen {
        post_id: String,
        timestamp: String,
        topic_label: TopicLabel,
        sentiment: Sentiment,
    },
    PostMade {
        post_id: String,
        thread_id: String,
        timestamp: String,
        action: PostAction,
    },
    ThreadTracked {
        thread_id: String,
        topic_label: TopicLabel,
        first_seen: String,
        last_interaction: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryStats {
    pub posts_read: u64,
    pub posts_made: u64,
    pub upvotes: u64,
    pub threads_tracked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicLabel {
    AiSafety,
    AgentDesign,
    MoltbookMeta,
    Social,
    Technical,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAction {
    Reply,
    NewPost,
    Upvote,
}

/// Body of `POST /post`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submolt_name: Option<String>,
}

/// Body of `POST /vote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoteRequest {
    pub post_id: String,
}

/// Validate a memory document, returning the typed file or an accumulated
/// error string.
pub fn validate_memory(value: &Value) -> Result<MemoryFile, String> {
    let mut issues = Vec::new();
    let Some(obj) = require_object(value, &mut issues) else {
        return Err(issues.join("; "));
    };
    reject_unknown_fields(obj, &MEMORY_FIELDS, "", &mut issues);

    match obj.get("version") {
        Some(v) if v.as_u64() == Some(1) => {}
        Some(v) => issues.push(format!("version: must be 1, got {}", v)),
        None => issues.push("version: required field is missing".to_string()),
    }

    if let Some(run_id) = require_str(obj, "run_id", &mut issues) {
        if !RUN_ID_RE.is_match(run_id) {
            issues.push("run_id: must match ^[a-f0-9-]+(-(cp|checkpoint)\\d+)?$".to_string());
        }
        if run_id.len() > MAX_ID_LEN {
            issues.push(format!("run_id: exceeds {} characters", MAX_ID_LEN));
        }
    }
    if let Some(ts) = require_str(obj, "run_start", &mut issues) {
        check_timestamp("run_start", ts, &mut issues);
    }
    if let Some(ts) = require_str(obj, "run_end", &mut issues) {
        check_timestamp("run_end", ts, &mut issues);
    }

    match obj.get("entries") {
        Some(Value::Array(entries)) => {
            if entries.len() > MAX_ENTRIES {
                issues.push(format!(
                    "entries: at most {} entries allowed, got {}",
                    MAX_ENTRIES,
                    entries.len()
                ));
            }
            for (i, entry) in entries.iter().enumerate() {
                check_entry(i, entry, &mut issues);
            }
        }
        Some(_) => issues.push("entries: must be an array".to_string()),
        None => issues.push("entries: required field is missing".to_string()),
    }

    match obj.get("stats") {
        Some(Value::Object(stats)) => {
            reject_unknown_fields(stats, &STATS_FIELDS, "stats", &mut issues);
            for field in STATS_FIELDS {
                match stats.get(field) {
                    Some(v) if v.as_u64().is_some() => {}
                    Some(_) => issues.push(format!(
                        "stats.{}: must be a non-negative integer",
                        field
                    )),
                    None => issues.push(format!("stats.{}: required field is missing", field)),
                }
            }
        }
        Some(_) => issues.push("stats: must be an object".to_string()),
        None => issues.push("stats: required field is missing".to_string()),
    }

    if !issues.is_empty() {
        return Err(issues.join("; "));
    }
    // A document that passed every shape check deserializes cleanly.
    serde_json::from_value(value.clone()).map_err(|e| format!("body: {}", e))
}

/// Validate a `POST /post` body.
pub fn validate_post_request(value: &Value) -> Result<PostRequest, String> {
    let mut issues = Vec::new();
    let Some(obj) = require_object(value, &mut issues) else {
        return Err(issues.join("; "));
    };
    reject_unknown_fields(obj, &POST_FIELDS, "", &mut issues);

    if let Some(content) = require_str(obj, "content", &mut issues) {
        check_bounded_string("content", content, 1, MAX_CONTENT_LEN, &mut issues);
    }
    if let Some(thread_id) = optional_str(obj, "thread_id", &mut issues) {
        check_id("thread_id", thread_id, &mut issues);
    }
    if let Some(title) = optional_str(obj, "title", &mut issues) {
        check_bounded_string("title", title, 1, MAX_TITLE_LEN, &mut issues);
    }
    if let Some(submolt) = optional_str(obj, "submolt_name", &mut issues) {
        check_bounded_string("submolt_name", submolt, 1, MAX_SUBMOLT_LEN, &mut issues);
    }

    if !issues.is_empty() {
        return Err(issues.join("; "));
    }
    serde_json::from_value(value.clone()).map_err(|e| format!("body: {}", e))
}

/// Validate a `POST /vote` body.
pub fn validate_vote_request(value: &Value) -> Result<VoteRequest, String> {
    let mut issues = Vec::new();
    let Some(obj) = require_object(value, &mut issues) else {
        return Err(issues.join("; "));
    };
    reject_unknown_fields(obj, &VOTE_FIELDS, "", &mut issues);
    if let Some(post_id) = require_str(obj, "post_id", &mut issues) {
        check_id("post_id", post_id, &mut issues);
    }

    if !issues.is_empty() {
        return Err(issues.join("; "));
    }
    serde_json::from_value(value.clone()).map_err(|e| format!("body: {}", e))
}

fn check_entry(i: usize, entry: &Value, issues: &mut Vec<String>) {
    let path = format!("entries[{}]", i);
    let Some(obj) = entry.as_object() else {
        issues.push(format!("{}: must be an object", path));
        return;
    };
    let tag = match obj.get("type") {
        Some(Value::String(tag)) => tag.as_str(),
        Some(_) => {
            issues.push(format!("{}.type: must be a string", path));
            return;
        }
        None => {
            issues.push(format!("{}.type: required field is missing", path));
            return;
        }
    };

    match tag {
        "post_seen" => {
            entry_id(obj, &path, "post_id", issues);
            entry_timestamp(obj, &path, "timestamp", issues);
            entry_enum(obj, &path, "topic_label", &TOPIC_LABELS, issues);
            entry_enum(obj, &path, "sentiment", &SENTIMENTS, issues);
        }
        "post_made" => {
            entry_id(obj, &path, "post_id", issues);
            entry_id(obj, &path, "thread_id", issues);
            entry_timestamp(obj, &path, "timestamp", issues);
            entry_enum(obj, &path, "action", &ACTIONS, issues);
        }
        "thread_tracked" => {
            entry_id(obj, &path, "thread_id", issues);
            entry_enum(obj, &path, "topic_label", &TOPIC_LABELS, issues);
            entry_timestamp(obj, &path, "first_seen", issues);
            entry_timestamp(obj, &path, "last_interaction", issues);
        }
        other => issues.push(format!(
            "{}.type: unknown entry type {}, expected one of {}",
            path,
            other,
            ENTRY_TYPES.join(", ")
        )),
    }
}

fn require_object<'a>(value: &'a Value, issues: &mut Vec<String>) -> Option<&'a Map<String, Value>> {
    match value.as_object() {
        Some(obj) => Some(obj),
        None => {
            issues.push("body: must be a JSON object".to_string());
            None
        }
    }
}

fn reject_unknown_fields(
    obj: &Map<String, Value>,
    allowed: &[&str],
    prefix: &str,
    issues: &mut Vec<String>,
) {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            if prefix.is_empty() {
                issues.push(format!("{}: unknown field", key));
            } else {
                issues.push(format!("{}.{}: unknown field", prefix, key));
            }
        }
    }
}

fn require_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<&'a str> {
    match obj.get(field) {
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            issues.push(format!("{}: must be a string", field));
            None
        }
        None => {
            issues.push(format!("{}: required field is missing", field));
            None
        }
    }
}

// Absent and null are both "not provided" for optional request fields.
fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<&'a str> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            issues.push(format!("{}: must be a string", field));
            None
        }
    }
}

fn entry_str<'a>(
    obj: &'a Map<String, Value>,
    path: &str,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<&'a str> {
    match obj.get(field) {
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            issues.push(format!("{}.{}: must be a string", path, field));
            None
        }
        None => {
            issues.push(format!("{}.{}: required field is missing", path, field));
            None
        }
    }
}

fn entry_id(obj: &Map<String, Value>, path: &str, field: &str, issues: &mut Vec<String>) {
    if let Some(id) = entry_str(obj, path, field, issues) {
        check_id(&format!("{}.{}", path, field), id, issues);
    }
}

fn entry_timestamp(obj: &Map<String, Value>, path: &str, field: &str, issues: &mut Vec<String>) {
    if let Some(ts) = entry_str(obj, path, field, issues) {
        check_timestamp(&format!("{}.{}", path, field), ts, issues);
    }
}

fn entry_enum(
    obj: &Map<String, Value>,
    path: &str,
    field: &str,
    catalog: &[&str],
    issues: &mut Vec<String>,
) {
    if let Some(v) = entry_str(obj, path, field, issues) {
        if !catalog.contains(&v) {
            issues.push(format!(
                "{}.{}: must be one of {}",
                path,
                field,
                catalog.join(", ")
            ));
        }
    }
}

fn check_id(path: &str, value: &str, issues: &mut Vec<String>) {
    if !ID_RE.is_match(value) {
        issues.push(format!("{}: must match ^[A-Za-z0-9_-]+$", path));
    }
    if value.len() > MAX_ID_LEN {
        issues.push(format!("{}: exceeds {} characters", path, MAX_ID_LEN));
    }
}

fn check_timestamp(path: &str, value: &str, issues: &mut Vec<String>) {
    if DateTime::parse_from_rfc3339(value).is_err() {
        issues.push(format!("{}: not an ISO-8601 timestamp", path));
    }
}

// Bounds count Unicode scalar values, not bytes.
fn check_bounded_string(path: &str, value: &str, min: usize, max: usize, issues: &mut Vec<String>) {
    let len = value.chars().count();
    if len < min {
        issues.push(format!("{}: at least {} character(s) required", path, min));
    }
    if len > max {
        issues.push(format!("{}: exceeds {} characters", path, max));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_memory(run_id: &str) -> Value {
        json!({
            "version": 1,
            "run_id": run_id,
            "run_start": "2026-08-01T10:00:00Z",
            "run_end": "2026-08-01T11:30:00Z",
            "entries": [],
            "stats": {"posts_read": 0, "posts_made": 0, "upvotes": 0, "threads_tracked": 0}
        })
    }

    #[test]
    fn test_valid_memory_with_all_entry_variants() {
        let mut doc = minimal_memory("550e8400-e29b-41d4-a716-446655440000");
        doc["entries"] = json!([
            {"type": "post_seen", "post_id": "p_1", "timestamp": "2026-08-01T10:05:00Z",
             "topic_label": "other", "sentiment": "neutral"},
            {"type": "post_made", "post_id": "p_2", "thread_id": "t_9",
             "timestamp": "2026-08-01T10:10:00Z", "action": "reply"},
            {"type": "thread_tracked", "thread_id": "t_9", "topic_label": "ai_safety",
             "first_seen": "2026-08-01T10:00:00Z", "last_interaction": "2026-08-01T10:10:00Z"}
        ]);
        doc["stats"] = json!({"posts_read": 1, "posts_made": 1, "upvotes": 0, "threads_tracked": 1});

        let parsed = validate_memory(&doc).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        assert!(matches!(parsed.entries[1], MemoryEntry::PostMade { .. }));
    }

    #[test]
    fn test_run_id_forms() {
        for good in [
            "abc-123",
            "550e8400-e29b-41d4-a716-446655440000",
            "550e8400-e29b-41d4-a716-446655440000-cp3",
            "550e8400-e29b-41d4-a716-446655440000-checkpoint12",
        ] {
            assert!(validate_memory(&minimal_memory(good)).is_ok(), "{}", good);
        }
        for bad in ["has spaces!", "UPPER-CASE", "run/../../etc"] {
            let err = validate_memory(&minimal_memory(bad)).unwrap_err();
            assert!(err.contains("run_id: must match"), "{}: {}", bad, err);
        }
    }

    #[test]
    fn test_run_id_length_bound() {
        let max = "a".repeat(128);
        assert!(validate_memory(&minimal_memory(&max)).is_ok());

        let over = "a".repeat(129);
        let err = validate_memory(&minimal_memory(&over)).unwrap_err();
        assert!(err.contains("run_id: exceeds 128"));
    }

    #[test]
    fn test_version_must_be_one() {
        let mut doc = minimal_memory("abc-123");
        doc["version"] = json!(2);
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("version: must be 1"));
    }

    #[test]
    fn test_non_object_body() {
        let err = validate_memory(&json!("not a document")).unwrap_err();
        assert_eq!(err, "body: must be a JSON object");
        let err = validate_post_request(&json!([1, 2])).unwrap_err();
        assert_eq!(err, "body: must be a JSON object");
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let mut doc = minimal_memory("abc-123");
        doc["extra"] = json!("nope");
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("extra: unknown field"), "{}", err);
    }

    #[test]
    fn test_unknown_entry_tag_rejected() {
        let mut doc = minimal_memory("abc-123");
        doc["entries"] = json!([{"type": "post_deleted", "post_id": "p_1"}]);
        let err = validate_memory(&doc).unwrap_err();
        assert!(
            err.contains("entries[0].type: unknown entry type post_deleted"),
            "{}",
            err
        );
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let mut doc = minimal_memory("abc-123");
        doc["entries"] = json!([
            {"type": "post_seen", "post_id": "p_1", "timestamp": "2026-08-01T10:05:00Z",
             "topic_label": "memes", "sentiment": "neutral"}
        ]);
        let err = validate_memory(&doc).unwrap_err();
        assert!(
            err.contains("entries[0].topic_label: must be one of"),
            "{}",
            err
        );
    }

    #[test]
    fn test_negative_stats_rejected() {
        let mut doc = minimal_memory("abc-123");
        doc["stats"]["upvotes"] = json!(-1);
        let err = validate_memory(&doc).unwrap_err();
        assert!(
            err.contains("stats.upvotes: must be a non-negative integer"),
            "{}",
            err
        );
    }

    #[test]
    fn test_missing_required_field_reported_with_path() {
        let mut doc = minimal_memory("abc-123");
        doc.as_object_mut().unwrap().remove("stats");
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("stats: required field is missing"), "{}", err);
    }

    #[test]
    fn test_bad_timestamp_reported_with_path() {
        let mut doc = minimal_memory("abc-123");
        doc["run_start"] = json!("yesterday");
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("run_start: not an ISO-8601 timestamp"));
    }

    #[test]
    fn test_structural_and_semantic_issues_accumulate() {
        // An unknown field (shape) and a bad run_id (constraint) arrive in
        // one report, joined by "; ".
        let mut doc = minimal_memory("NOT-VALID");
        doc["surprise"] = json!(true);
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("surprise: unknown field"), "{}", err);
        assert!(err.contains("run_id: must match"), "{}", err);
        assert!(err.contains("; "), "{}", err);
    }

    #[test]
    fn test_entries_count_boundary() {
        let entry = json!({"type": "post_seen", "post_id": "p", "timestamp": "2026-08-01T10:05:00Z",
                           "topic_label": "other", "sentiment": "neutral"});
        let mut doc = minimal_memory("abc-123");

        doc["entries"] = Value::Array(vec![entry.clone(); MAX_ENTRIES]);
        assert!(validate_memory(&doc).is_ok());

        doc["entries"] = Value::Array(vec![entry; MAX_ENTRIES + 1]);
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("entries: at most 10000"));
    }

    #[test]
    fn test_entry_issue_paths_accumulate() {
        let mut doc = minimal_memory("abc-123");
        doc["entries"] = json!([
            {"type": "post_made", "post_id": "bad id!", "thread_id": "t_1",
             "timestamp": "not-a-time", "action": "upvote"}
        ]);
        let err = validate_memory(&doc).unwrap_err();
        assert!(err.contains("entries[0].post_id"));
        assert!(err.contains("entries[0].timestamp"));
        assert!(err.contains("; "));
    }

    #[test]
    fn test_post_request_content_bounds() {
        let ok = json!({"content": "a".repeat(500)});
        assert!(validate_post_request(&ok).is_ok());

        let over = json!({"content": "a".repeat(501)});
        let err = validate_post_request(&over).unwrap_err();
        assert!(err.contains("content: exceeds 500"));

        let empty = json!({"content": ""});
        let err = validate_post_request(&empty).unwrap_err();
        assert!(err.contains("content: at least 1"));
    }

    #[test]
    fn test_post_request_optional_fields() {
        let full = json!({
            "content": "hello",
            "thread_id": "t_12",
            "title": "a title",
            "submolt_name": "crabs"
        });
        let req = validate_post_request(&full).unwrap();
        assert_eq!(req.thread_id.as_deref(), Some("t_12"));

        let bad_thread = json!({"content": "hello", "thread_id": "no spaces allowed"});
        let err = validate_post_request(&bad_thread).unwrap_err();
        assert!(err.contains("thread_id: must match"));

        let long_title = json!({"content": "hello", "title": "t".repeat(301)});
        let err = validate_post_request(&long_title).unwrap_err();
        assert!(err.contains("title: exceeds 300"));
    }

    #[test]
    fn test_post_request_null_optional_is_absent() {
        let req = validate_post_request(&json!({"content": "hello", "thread_id": null})).unwrap();
        assert!(req.thread_id.is_none());
    }

    #[test]
    fn test_post_request_unknown_field_rejected() {
        let req = json!({"content": "hello", "urgency": "max"});
        let err = validate_post_request(&req).unwrap_err();
        assert!(err.contains("urgency: unknown field"), "{}", err);
    }

    #[test]
    fn test_post_request_wrong_type_reported_with_path() {
        let err = validate_post_request(&json!({"content": 7})).unwrap_err();
        assert!(err.contains("content: must be a string"), "{}", err);
    }

    #[test]
    fn test_content_bounds_count_chars_not_bytes() {
        // 500 multibyte scalars serialize to >500 bytes but remain in bounds.
        let ok = json!({"content": "\u{00e9}".repeat(500)});
        assert!(validate_post_request(&ok).is_ok());
    }

    #[test]
    fn test_vote_request() {
        assert!(validate_vote_request(&json!({"post_id": "p_123"})).is_ok());

        let err = validate_vote_request(&json!({"post_id": "p 123"})).unwrap_err();
        assert!(err.contains("post_id: must match"));

        let err = validate_vote_request(&json!({})).unwrap_err();
        assert!(err.contains("post_id: required field is missing"));

        let err = validate_vote_request(&json!({"post_id": "p", "weight": 2})).unwrap_err();
        assert!(err.contains("weight: unknown field"));
    }

    #[test]
    fn test_validation_is_stable_under_reserialization() {
        let doc = minimal_memory("abc-123");
        let first = validate_memory(&doc).unwrap();
        let reserialized = serde_json::to_value(&first).unwrap();
        let second = validate_memory(&reserialized).unwrap();
        assert_eq!(first, second);
    }
}
