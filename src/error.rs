//! Error handling for the chat server

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Chat server error types
#[derive(Debug, Error)]
pub enum ChatError {
    /// Socket-level failures (read, write, accept, bind)
    #[error("Network error: {0}")]
    Network(String),
    /// Malformed or unexpected protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),
    /// Persistence layer failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Resource limit exceeded
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
    /// Server internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            ChatError::Network(_) => 1000,
            ChatError::Protocol(_) => 1003,
            ChatError::Auth(_) => 1002,
            ChatError::Store(_) => 1013,
            ChatError::Timeout(_) => 1011,
            ChatError::ResourceLimit(_) => 1012,
            ChatError::Internal(_) => 1009,
        }
    }

    /// Whether the session that hit this error has to be torn down.
    ///
    /// Protocol, auth and store failures are answered on the wire instead.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ChatError::Network(_) | ChatError::Timeout(_) | ChatError::Internal(_)
        )
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        ChatError::Network(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        ChatError::Protocol(msg.into())
    }

    /// Create an authentication error
    pub fn auth<T: Into<String>>(msg: T) -> Self {
        ChatError::Auth(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        ChatError::Timeout(msg.into())
    }

    /// Create a resource limit error
    pub fn resource_limit<T: Into<String>>(msg: T) -> Self {
        ChatError::ResourceLimit(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        ChatError::Internal(msg.into())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Network(format!("IO error: {}", err))
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::Internal(format!("Task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            ChatError::network("a"),
            ChatError::protocol("a"),
            ChatError::auth("a"),
            ChatError::Store(StoreError::UnknownRoom("a".into())),
            ChatError::timeout("a"),
            ChatError::resource_limit("a"),
            ChatError::internal("a"),
        ];

        let mut codes: Vec<u32> = errors.iter().map(ChatError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_io_error_maps_to_network() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: ChatError = io.into();
        assert!(matches!(err, ChatError::Network(_)));
        assert!(err.is_session_fatal());
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_resource_limit_display() {
        let err = ChatError::resource_limit("64 connections");
        assert_eq!(err.code(), 1012);
        assert_eq!(err.to_string(), "Resource limit exceeded: 64 connections");
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn test_protocol_error_is_recoverable() {
        assert!(!ChatError::protocol("bad frame").is_session_fatal());
        assert!(!ChatError::auth("nope").is_session_fatal());
    }
}
