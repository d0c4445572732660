//! Domain/method/path allowlist for outbound requests.
//!
//! The allowlist is an ordered set of domain rules loaded from a JSON file:
//!
//! ```json
//! {"allowedDomains": [
//!   {"domain": "api.example.com", "methods": ["GET", "POST"], "paths": ["/v1/"]}
//! ]}
//! ```
//!
//! Hostname matching is case-insensitive exact equality, with no wildcard
//! or subdomain logic. The first rule whose domain matches decides the request;
//! a method or path mismatch on that rule denies without falling through to
//! later rules. A rule without `paths` permits any path.

use crate::error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk allowlist document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistFile {
    pub allowed_domains: Vec<DomainRule>,
}

/// A single domain rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRule {
    /// Hostname, matched case-insensitively and exactly.
    pub domain: String,
    /// Permitted HTTP methods (compared uppercased).
    pub methods: Vec<String>,
    /// Permitted path prefixes. `None` means any path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

/// Result of an allowlist check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Request is permitted by a matching rule.
    Allow,
    /// No rule matches the hostname.
    DenyDomain { host: String },
    /// The matching rule does not permit this method.
    DenyMethod { host: String, method: String },
    /// The matching rule restricts paths and none prefixes the request path.
    DenyPath { host: String, path: String },
}

impl Decision {
    /// Whether the decision permits the request.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// A human-readable reason for the decision.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Decision::Allow => "request allowed".to_string(),
            Decision::DenyDomain { host } => format!("Domain not in allowlist: {}", host),
            Decision::DenyMethod { host, method } => {
                format!("Method {} not allowed for {}", method, host)
            }
            Decision::DenyPath { host, path } => {
                format!("Path {} not in allowed paths for {}", path, host)
            }
        }
    }
}

/// Compiled allowlist ready for checks.
#[derive(Debug, Clone)]
pub struct Allowlist {
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    /// Lowercased hostname.
    domain: String,
    /// Uppercased method set.
    methods: Vec<String>,
    paths: Option<Vec<String>>,
}

impl Allowlist {
    /// Load and compile an allowlist from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::AllowlistRead {
            path: path.display().to_string(),
            source,
        })?;
        let file: AllowlistFile =
            serde_json::from_str(&raw).map_err(|source| PolicyError::AllowlistParse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::from_file(file))
    }

    /// Compile an already-parsed allowlist document.
    #[must_use]
    pub fn from_file(file: AllowlistFile) -> Self {
        let rules = file
            .allowed_domains
            .into_iter()
            .map(|rule| CompiledRule {
                domain: rule.domain.to_lowercase(),
                methods: rule.methods.iter().map(|m| m.to_uppercase()).collect(),
                paths: rule.paths,
            })
            .collect();
        Self { rules }
    }

    /// Check a request against the allowlist.
    ///
    /// `path` is `None` for CONNECT requests, which carry no path; a rule's
    /// path restriction only applies when the request has one.
    #[must_use]
    pub fn check(&self, host: &str, method: &str, path: Option<&str>) -> Decision {
        let lower_host = host.to_lowercase();
        let upper_method = method.to_uppercase();

        // First rule whose hostname matches wins; no fall-through.
        let Some(rule) = self.rules.iter().find(|r| r.domain == lower_host) else {
            return Decision::DenyDomain {
                host: host.to_string(),
            };
        };

        if !rule.methods.iter().any(|m| *m == upper_method) {
            return Decision::DenyMethod {
                host: host.to_string(),
                method: upper_method,
            };
        }

        if let (Some(allowed_paths), Some(path)) = (&rule.paths, path) {
            if !allowed_paths.iter().any(|p| path.starts_with(p.as_str())) {
                return Decision::DenyPath {
                    host: host.to_string(),
                    path: path.to_string(),
                };
            }
        }

        Decision::Allow
    }

    /// Configured domains, in rule order.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.domain.clone()).collect()
    }

    /// Number of configured rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the allowlist has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
