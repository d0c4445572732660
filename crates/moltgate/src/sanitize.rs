//! Prompt-injection scanning for outbound and inbound payloads.
//!
//! The catalog is fixed: five named categories, each backed by a
//! case-insensitive regex (or, for `encoding_evasion`, literal base64
//! encodings of known injection phrases). Matched substrings are replaced
//! with a single marker and the set of fired categories is reported.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

/// Replacement text for every matched substring.
pub const MARKER: &str = "[SANITIZED: injection pattern detected]";

/// Category names, in scan order.
pub const CATEGORIES: [&str; 5] = [
    "system_prompt_override",
    "role_injection",
    "instruction_injection",
    "data_exfiltration",
    "encoding_evasion",
];

const SYSTEM_PROMPT_OVERRIDE: &str = r"(?i)(?:(?:ignore|disregard|forget)\s+(?:all\s+|any\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|directives|rules)|new\s+system\s+prompt|your\s+new\s+instructions\s+are)";

const ROLE_INJECTION: &str = r"(?i)(?:<\|im_start\|>|<\|system\|>|<\|assistant\|>|\[\s*(?:system|assistant)\s*\]\s*:|(?:^|\n)\s*(?:system|assistant)\s*:)";

const INSTRUCTION_INJECTION: &str = r"(?i)(?:you\s+(?:must|should|will)\s+now\b|from\s+now\s+on,?\s+you\b|pretend\s+(?:to\s+be|you\s+are)\b|act\s+as\s+(?:if|though)\s+you\b|do\s+anything\s+now\b|jailbreak)";

const DATA_EXFILTRATION: &str = r"(?i)(?:(?:reveal|print|show|output|repeat|leak)\s+(?:your|the)\s+(?:system\s+prompt|hidden\s+prompt|instructions|api\s+keys?|secrets?|credentials)|send\s+(?:your|the|all)\s+(?:credentials|secrets?|api\s+keys?|tokens?)|exfiltrat)";

/// Phrases whose base64 encodings are scanned for under `encoding_evasion`.
const ENCODED_PHRASES: [&str; 5] = [
    "ignore all previous instructions",
    "ignore previous instructions",
    "disregard all previous instructions",
    "you are now",
    "system prompt",
];

/// Outcome of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Input with every match replaced by [`MARKER`].
    pub content: String,
    /// True iff at least one category fired.
    pub sanitized: bool,
    /// Fired category names, deduplicated, in catalog order.
    pub patterns: Vec<String>,
}

struct CategoryRule {
    name: &'static str,
    regex: Regex,
}

/// Compiled injection-pattern scanner.
pub struct Sanitizer {
    rules: Vec<CategoryRule>,
}

impl Sanitizer {
    /// Compile the fixed catalog.
    #[must_use]
    pub fn new() -> Self {
        // Base64 is case-sensitive; padding is stripped from the needles so
        // both padded and unpadded encodings match.
        let encoded: Vec<String> = ENCODED_PHRASES
            .iter()
            .map(|p| {
                let b64 = BASE64.encode(p.as_bytes());
                regex::escape(b64.trim_end_matches('='))
            })
            .collect();
        let encoding_evasion = encoded.join("|");

        let rules = vec![
            CategoryRule {
                name: CATEGORIES[0],
                regex: Regex::new(SYSTEM_PROMPT_OVERRIDE).expect("invalid override regex"),
            },
            CategoryRule {
                name: CATEGORIES[1],
                regex: Regex::new(ROLE_INJECTION).expect("invalid role regex"),
            },
            CategoryRule {
                name: CATEGORIES[2],
                regex: Regex::new(INSTRUCTION_INJECTION).expect("invalid instruction regex"),
            },
            CategoryRule {
                name: CATEGORIES[3],
                regex: Regex::new(DATA_EXFILTRATION).expect("invalid exfiltration regex"),
            },
            CategoryRule {
                name: CATEGORIES[4],
                regex: Regex::new(&encoding_evasion).expect("invalid encoding regex"),
            },
        ];

        Self { rules }
    }

    /// Scan `content`, replacing every match with [`MARKER`].
    ///
    /// When nothing fires, the returned content is the input unchanged.
    /// Scanning is idempotent: the marker itself matches no category.
    #[must_use]
    pub fn scan(&self, content: &str) -> ScanOutcome {
        let mut out = content.to_string();
        let mut patterns = Vec::new();

        for rule in &self.rules {
            if rule.regex.is_match(&out) {
                patterns.push(rule.name.to_string());
                out = rule.regex.replace_all(&out, MARKER).into_owned();
            }
        }

        ScanOutcome {
            sanitized: !patterns.is_empty(),
            content: out,
            patterns,
        }
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}
