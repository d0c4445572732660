//! Policy core for the moltgate egress proxy.
//!
//! This crate holds the pure decision logic the proxy enforces:
//!
//! - [`allowlist`] - domain/method/path allowlist with exact deny reasons
//! - [`sanitize`] - fixed-catalog prompt-injection scanning and redaction
//! - [`schema`] - strict serde models and accumulated-error validation for
//!   memory files, post requests, and vote requests
//! - [`ratelimit`] - sliding-window counters per action class
//!
//! Nothing here performs I/O beyond reading the allowlist file; the async
//! proxy crate wires these into the network path.

pub mod allowlist;
pub mod error;
pub mod ratelimit;
pub mod sanitize;
pub mod schema;

pub use allowlist::{Allowlist, Decision};
pub use error::{PolicyError, Result};
pub use ratelimit::{RateKey, RateLimiter};
pub use sanitize::{ScanOutcome, Sanitizer};
