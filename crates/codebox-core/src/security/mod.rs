//! Security layer: everything that stands between submitted code and the
//! execution engine.
//!
//! - [`sanitizer`] : `InputSanitizer` (size, control characters, parameters)
//! - [`scanner`]   : `SecurityScanner` (pattern table + syntax pass, policy)
//! - [`syntax`]    : token-level inspection for Python and JS/TS
//! - [`violation`] : `SecurityViolation`, threat levels, risk score
//! - [`rate_limit`]: sliding-window `RateLimiter`
//! - [`audit`]     : hash-chained `AuditLogger` and its sinks

pub mod audit;
pub mod rate_limit;
pub mod sanitizer;
pub mod scanner;
pub mod syntax;
pub mod violation;

pub use audit::{
    verify_entries, AuditEventType, AuditLogEntry, AuditLogger, AuditSink, ChainBreak,
    JsonlFileSink, SurrealAuditSink,
};
pub use rate_limit::{RateDecision, RateLimitAction, RateLimitRule, RateLimiter, RuleScope};
pub use sanitizer::{InputSanitizer, SanitizedCode};
pub use scanner::{ScanPolicy, ScanReport, SecurityScanner};
pub use violation::{risk_score, CodeLocation, SecurityViolation, ThreatLevel, ViolationType};
