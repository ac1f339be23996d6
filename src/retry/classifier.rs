//! Maps a stage failure to a retry class.
//!
//! HTTP status codes are checked first because they are the more reliable
//! signal; message text is matched case-insensitively only when the status is
//! absent or not one we recognise.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stage::StageFailure;

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, timeout or rate-limit trouble. Worth another attempt.
    Transient,
    /// Authentication or malformed request. Another attempt will fail the same way.
    Permanent,
    /// Matched neither list. The executor's configuration decides.
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

const TRANSIENT_STATUS: &[u16] = &[408, 429, 502, 503, 504];
const PERMANENT_STATUS: &[u16] = &[400, 401, 403, 404];

const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection aborted",
    "broken pipe",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "overloaded",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "unauthorized",
    "authentication",
    "forbidden",
    "permission denied",
    "invalid api key",
    "invalid x-api-key",
    "bad request",
    "invalid request",
    "malformed",
    "syntax error",
    "not found",
];

/// Classifies a failure as transient, permanent or unknown.
pub fn classify(failure: &StageFailure) -> ErrorClass {
    if let Some(class) = failure.class {
        return class;
    }
    if let Some(status) = failure.status {
        if TRANSIENT_STATUS.contains(&status) {
            return ErrorClass::Transient;
        }
        if PERMANENT_STATUS.contains(&status) {
            return ErrorClass::Permanent;
        }
    }
    classify_message(&failure.message)
}

/// Classifies free-form error text, including status codes mentioned in it.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
        || TRANSIENT_STATUS.iter().any(|&s| mentions_status(&lower, s))
    {
        return ErrorClass::Transient;
    }
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p))
        || PERMANENT_STATUS.iter().any(|&s| mentions_status(&lower, s))
    {
        return ErrorClass::Permanent;
    }
    ErrorClass::Unknown
}

// A code counts only as a standalone number, so "4290 rows" is not a 429.
fn mentions_status(text: &str, status: u16) -> bool {
    let code = status.to_string();
    text.split(|c: char| !c.is_ascii_digit())
        .any(|token| token == code)
}
