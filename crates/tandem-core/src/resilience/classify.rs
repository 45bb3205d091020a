//! Stable error codes and message-pattern classification.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Stable failure classification shared by both resilience mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Operation exceeded its deadline
    TimeoutError,
    /// Connection level failure
    NetworkError,
    /// Collaborator throttled the call
    RateLimit,
    /// Collaborator temporarily unavailable (503, open circuit)
    ServiceUnavailable,
    /// Collaborator internal failure (500)
    InternalServerError,
    /// Malformed protocol or leaked code
    ValidationError,
    /// Role boundary crossed
    BoundaryViolation,
    /// Anything else
    UnknownError,
}

impl ErrorCode {
    /// Every code, in classification priority order
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::BoundaryViolation,
        ErrorCode::RateLimit,
        ErrorCode::TimeoutError,
        ErrorCode::ServiceUnavailable,
        ErrorCode::InternalServerError,
        ErrorCode::NetworkError,
        ErrorCode::ValidationError,
        ErrorCode::UnknownError,
    ];

    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::RateLimit => "RATE_LIMIT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::BoundaryViolation => "BOUNDARY_VIOLATION",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| CoreError::ConfigurationError(format!("Unknown error code: {}", s)))
    }
}

lazy_static! {
    static ref BOUNDARY_PATTERN: Regex = Regex::new(r"(?i)boundary violation").unwrap();
    static ref RATE_LIMIT_PATTERN: Regex =
        Regex::new(r"(?i)rate.?limit|too many requests|\b429\b|quota exceeded").unwrap();
    static ref TIMEOUT_PATTERN: Regex =
        Regex::new(r"(?i)timed?\s*out|ETIMEDOUT|deadline exceeded").unwrap();
    static ref SERVICE_UNAVAILABLE_PATTERN: Regex =
        Regex::new(r"(?i)service unavailable|temporarily unavailable|\b503\b|overloaded").unwrap();
    static ref INTERNAL_SERVER_PATTERN: Regex =
        Regex::new(r"(?i)internal server error|\b500\b").unwrap();
    static ref NETWORK_PATTERN: Regex = Regex::new(
        r"(?i)network|ECONNREFUSED|ECONNRESET|ENOTFOUND|connection\s+(refused|reset|closed)|socket|dns"
    )
    .unwrap();
    static ref VALIDATION_PATTERN: Regex =
        Regex::new(r"(?i)validation|invalid|malformed|schema").unwrap();

    // Transient failures worth re-attempting at the call site
    static ref RETRYABLE_PATTERN: Regex = Regex::new(
        r"(?i)network|ECONNREFUSED|ECONNRESET|ENOTFOUND|socket|timed?\s*out|ETIMEDOUT|rate.?limit|too many requests|\b5\d\d\b|service unavailable|bad gateway"
    )
    .unwrap();
}

/// Map a free-form error message to a stable code.
pub fn classify_message(message: &str) -> ErrorCode {
    let patterns: [(&Regex, ErrorCode); 7] = [
        (&BOUNDARY_PATTERN, ErrorCode::BoundaryViolation),
        (&RATE_LIMIT_PATTERN, ErrorCode::RateLimit),
        (&TIMEOUT_PATTERN, ErrorCode::TimeoutError),
        (&SERVICE_UNAVAILABLE_PATTERN, ErrorCode::ServiceUnavailable),
        (&INTERNAL_SERVER_PATTERN, ErrorCode::InternalServerError),
        (&NETWORK_PATTERN, ErrorCode::NetworkError),
        (&VALIDATION_PATTERN, ErrorCode::ValidationError),
    ];

    patterns
        .iter()
        .find(|(pattern, _)| pattern.is_match(message))
        .map(|(_, code)| *code)
        .unwrap_or(ErrorCode::UnknownError)
}

/// Whether a message looks like a transient network/timeout/rate-limit/5xx failure.
pub fn matches_retryable_pattern(message: &str) -> bool {
    RETRYABLE_PATTERN.is_match(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        let cases = [
            ("Boundary violation detected", ErrorCode::BoundaryViolation),
            ("429 Too Many Requests", ErrorCode::RateLimit),
            ("rate limit exceeded for key", ErrorCode::RateLimit),
            ("operation timed out after 30s", ErrorCode::TimeoutError),
            ("Timeout waiting for planner", ErrorCode::TimeoutError),
            ("HTTP 503 Service Unavailable", ErrorCode::ServiceUnavailable),
            ("500 Internal Server Error", ErrorCode::InternalServerError),
            ("connection refused by peer", ErrorCode::NetworkError),
            ("ENOTFOUND api.example.com", ErrorCode::NetworkError),
            ("invalid instruction payload", ErrorCode::ValidationError),
            ("the planner is sad", ErrorCode::UnknownError),
        ];

        for (message, expected) in cases {
            assert_eq!(classify_message(message), expected, "message: {message}");
        }
    }

    #[test]
    fn test_retryable_patterns() {
        assert!(matches_retryable_pattern("upstream returned 502"));
        assert!(matches_retryable_pattern("socket hang up"));
        assert!(matches_retryable_pattern("Request timed out"));
        assert!(!matches_retryable_pattern("invalid instruction payload"));
        assert!(!matches_retryable_pattern("boundary violation"));
    }

    #[test]
    fn test_code_names_parse_case_insensitively() {
        assert_eq!("rate_limit".parse::<ErrorCode>().unwrap(), ErrorCode::RateLimit);
        assert_eq!(" TIMEOUT_ERROR ".parse::<ErrorCode>().unwrap(), ErrorCode::TimeoutError);
        assert!("NOT_A_CODE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_codes_serialize_to_wire_names() {
        let json = serde_json::to_string(&ErrorCode::InternalServerError).unwrap();
        assert_eq!(json, "\"INTERNAL_SERVER_ERROR\"");
        for code in ErrorCode::ALL {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
    }
}
