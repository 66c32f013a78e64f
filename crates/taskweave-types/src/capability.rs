//! Capability error taxonomy.
//!
//! Capabilities (agents, tools, any async unit of work) report failures as a
//! `CapabilityError` tagged with an `ErrorCategory`. Retry policies and the
//! circuit breaker classify failures by category, never by message text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a capability failure.
///
/// Serialized as a plain snake_case string. Unknown strings round-trip
/// through `Other` so user-defined categories can be used in `retry_on`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCategory {
    /// Temporary failure; trying again is expected to help.
    Transient,
    /// The invocation exceeded its deadline.
    Timeout,
    /// The downstream service asked us to slow down.
    RateLimited,
    /// The request itself is malformed. Retrying will not help.
    InvalidInput,
    /// The requested resource does not exist.
    NotFound,
    /// Unexpected failure inside the capability.
    Internal,
    /// Any other, user-defined category.
    Other(String),
}

impl ErrorCategory {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Other(s) => s.as_str(),
        }
    }

    /// Whether a failure of this category counts against a circuit breaker.
    ///
    /// Caller mistakes (`invalid_input`, `not_found`) say nothing about the
    /// health of the downstream capability.
    pub fn trips_circuit(&self) -> bool {
        !matches!(self, ErrorCategory::InvalidInput | ErrorCategory::NotFound)
    }
}

impl From<String> for ErrorCategory {
    fn from(s: String) -> Self {
        match s.as_str() {
            "transient" => ErrorCategory::Transient,
            "timeout" => ErrorCategory::Timeout,
            "rate_limited" => ErrorCategory::RateLimited,
            "invalid_input" => ErrorCategory::InvalidInput,
            "not_found" => ErrorCategory::NotFound,
            "internal" => ErrorCategory::Internal,
            _ => ErrorCategory::Other(s),
        }
    }
}

impl From<&str> for ErrorCategory {
    fn from(s: &str) -> Self {
        ErrorCategory::from(s.to_string())
    }
}

impl From<ErrorCategory> for String {
    fn from(category: ErrorCategory) -> Self {
        category.as_str().to_string()
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure reported by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category}: {message}")]
pub struct CapabilityError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CapabilityError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }
}
