use serde::Serialize;
use thiserror::Error;

use crate::model::{PermanentId, WindowId};

/// Error types for durable storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "type", content = "message")]
pub enum StorageError {
    #[error("failed to read spaces: {0}")]
    ReadError(String),
    #[error("failed to write spaces: {0}")]
    WriteError(String),
    #[error("failed to parse spaces: {0}")]
    ParseError(String),
    #[error("failed to serialize spaces: {0}")]
    SerializeError(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::ReadError(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::ParseError(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failures surfaced at the mutation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "type", content = "message")]
pub enum SpaceError {
    /// Bad input; never retried automatically.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The request was read against an older version of the record.
    #[error("version conflict: expected {expected}, current {current}")]
    Conflict { expected: u64, current: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    /// A durable write failed and the change was rolled back.
    #[error("persistence failed: {0}")]
    Io(String),
    /// The host window/tab API refused the call.
    #[error("host error: {0}")]
    HostApi(String),
    /// The engine did not admit or answer the request in time.
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("engine unavailable")]
    Unavailable,
}

impl SpaceError {
    pub fn space_not_found(id: &PermanentId) -> Self {
        SpaceError::NotFound(format!("space {}", id))
    }

    pub fn window_not_found(id: WindowId) -> Self {
        SpaceError::NotFound(format!("no space for window {}", id))
    }

    /// Short machine-readable name, used in wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            SpaceError::Validation(_) => "validation",
            SpaceError::Conflict { .. } => "conflict",
            SpaceError::NotFound(_) => "notFound",
            SpaceError::Io(_) => "io",
            SpaceError::HostApi(_) => "hostApi",
            SpaceError::Timeout(_) => "timeout",
            SpaceError::Unavailable => "unavailable",
        }
    }

    /// Whether the same request may succeed if sent again. Conflicts need a
    /// re-read first, so they do not count.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SpaceError::Io(_) | SpaceError::Timeout(_) | SpaceError::Unavailable
        )
    }
}

impl From<StorageError> for SpaceError {
    fn from(e: StorageError) -> Self {
        SpaceError::Io(e.to_string())
    }
}

impl From<SpaceError> for String {
    fn from(e: SpaceError) -> Self {
        e.to_string()
    }
}

pub type SpaceResult<T> = Result<T, SpaceError>;

/// Failures while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_both_versions() {
        let err = SpaceError::Conflict {
            expected: 3,
            current: 4,
        };
        assert_eq!(err.to_string(), "version conflict: expected 3, current 4");
        assert_eq!(err.kind(), "conflict");
        assert!(!err.is_retryable(), "conflicts need a re-read, not a blind retry");
    }

    #[test]
    fn test_storage_error_becomes_retryable_io() {
        let err: SpaceError = StorageError::WriteError("disk full".to_string()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_errors_serialize_with_type_tag() {
        let json = serde_json::to_value(SpaceError::Validation("empty name".into())).unwrap();
        assert_eq!(json["type"], "Validation");
        assert_eq!(json["message"], "empty name");
    }
}
