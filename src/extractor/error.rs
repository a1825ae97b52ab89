//! Extraction error taxonomy.
//!
//! Item-level errors are captured on the item record and never abort
//! sibling items. Only [`ExtractError::Transient`] is retried.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cause of a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    RateLimited,
    Network,
}

impl TransientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors an extraction item can terminate with.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ExtractError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Transient failure ({kind}): {message}")]
    Transient { kind: TransientKind, message: String },

    #[error("Permanent failure: {message}")]
    Permanent { message: String },

    #[error("Cancelled before start")]
    Cancelled,

    #[error("Infrastructure fault: {message}")]
    Infrastructure { message: String },
}

impl ExtractError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Transient { kind: TransientKind::Timeout, message: message.into() }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::Transient { kind: TransientKind::RateLimited, message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient { kind: TransientKind::Network, message: message.into() }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure { message: message.into() }
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Stable label used in metrics and summaries.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Cancelled => "cancelled",
            Self::Infrastructure { .. } => "infrastructure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(ExtractError::timeout("slow").is_retryable());
        assert!(ExtractError::rate_limited("429").is_retryable());
        assert!(ExtractError::network("reset").is_retryable());
        assert!(!ExtractError::permanent("gone").is_retryable());
        assert!(!ExtractError::validation("empty").is_retryable());
        assert!(!ExtractError::Cancelled.is_retryable());
        assert!(!ExtractError::infrastructure("panic").is_retryable());
    }

    #[test]
    fn display_includes_kind() {
        let err = ExtractError::timeout("no answer in 30ms");
        assert_eq!(err.to_string(), "Transient failure (timeout): no answer in 30ms");
    }

    #[test]
    fn serializes_with_category_tag() {
        let json = serde_json::to_value(ExtractError::permanent("not found")).unwrap();
        assert_eq!(json["category"], "permanent");
        assert_eq!(json["message"], "not found");
    }
}
