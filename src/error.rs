//! Error handling for the posture pipeline
//!
//! Every external call returns an outcome carrying an error classification;
//! retry decisions are made from the classification, never from unwinding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification used by retry and scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Timeouts, 429s, 5xx responses. Retried with backoff.
    Transient,
    /// Expired or rejected credentials. Stops scheduling for the data source.
    Credential,
    /// Permanent connector rejection, e.g. an unsupported operation. The job
    /// fails without retry.
    Permanent,
    /// Malformed records from a connector. The record is skipped, the batch continues.
    Schema,
    /// Torn snapshot detected during a context load. Retried once.
    Consistency,
    /// Unrecoverable process-level failure, e.g. store unreachable at startup.
    Fatal,
}

#[derive(Error, Debug)]
pub enum PostureError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown index '{index}' on collection '{collection}'")]
    UnknownIndex { collection: String, index: String },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Connector error ({class:?}): {message}")]
    Connector { class: ErrorClass, message: String },

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Stale context snapshot for data source {0}")]
    TornSnapshot(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Queue drain timed out after {0} ms")]
    DrainTimeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PostureError {
    /// Classification of this error for retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            PostureError::Connector { class, .. } => *class,
            PostureError::TornSnapshot(_) => ErrorClass::Consistency,
            PostureError::Store(_) | PostureError::Queue(_) | PostureError::Cache(_) => {
                ErrorClass::Transient
            }
            PostureError::Serialization(_) => ErrorClass::Schema,
            PostureError::Configuration(_) | PostureError::DrainTimeout(_) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    /// Shorthand for a classified connector failure.
    pub fn connector(class: ErrorClass, message: impl Into<String>) -> Self {
        PostureError::Connector {
            class,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

impl From<serde_json::Error> for PostureError {
    fn from(err: serde_json::Error) -> Self {
        PostureError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<redis::RedisError> for PostureError {
    fn from(err: redis::RedisError) -> Self {
        PostureError::Cache(format!("Redis error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PostureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_errors_keep_their_classification() {
        let err = PostureError::connector(ErrorClass::Credential, "token expired");
        assert_eq!(err.class(), ErrorClass::Credential);
        assert!(!err.is_retryable());

        let err = PostureError::connector(ErrorClass::Transient, "429 from upstream");
        assert!(err.is_retryable());
    }

    #[test]
    fn torn_snapshot_is_a_consistency_failure() {
        let err = PostureError::TornSnapshot("ds-1".to_string());
        assert_eq!(err.class(), ErrorClass::Consistency);
    }
}
