//! Error types for the Tor client
//!
//! Every error maps onto one of four failure classes ([`ErrorKind`]):
//! - Protocol: the peer or document is broken; the circuit or consensus
//!   involved is discarded, never the whole client
//! - TransientNetwork: retry against another relay or directory server
//! - ResourceExhausted: nothing usable right now; try again later
//! - Configuration: caller input was invalid; fail fast

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Coarse failure class used by retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Protocol,
    TransientNetwork,
    ResourceExhausted,
    Configuration,
    Internal,
}

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionRefused = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    UnexpectedCell = 201,
    DigestMismatch = 202,
    HandshakeFailed = 203,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    StreamFailed = 303,
    StreamRefused = 304,
    ConnectFailed = 305,

    // Security errors (4xx)
    CertificateError = 400,
    ConsensusError = 401,
    EntropyError = 402,
    AuthVerificationFailed = 403,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Directory/Consensus errors (6xx)
    DirectoryError = 600,
    ConsensusStale = 601,
    NoRelaysAvailable = 602,
    HiddenServiceError = 603,

    // Storage errors (7xx)
    StorageError = 700,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidFingerprint = 801,
    Unsupported = 802,

    // Internal errors (9xx)
    InternalError = 900,
    ResourceExhausted = 901,
    AlreadyInProgress = 902,
}

/// Main error type for the Tor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Network error: {0}")]
    Network(String),

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Digest mismatch in relay cell")]
    DigestMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Circuit closed: {0}")]
    CircuitClosed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream refused by exit: reason={reason} ({reason_name})")]
    StreamRefused { reason: u8, reason_name: String },

    #[error("Connect failed after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    // ===== Security Errors =====
    #[error("Certificate verification failed: {0}")]
    CertificateError(String),

    #[error("Consensus verification failed: {0}")]
    ConsensusError(String),

    #[error("Entropy/RNG failure: {0}")]
    EntropyError(String),

    #[error("Auth verification failed: {0}")]
    AuthVerificationFailed(String),

    #[error("Crypto: {0}")]
    Crypto(String),

    // ===== Directory Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Consensus is stale (expired)")]
    ConsensusStale,

    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    #[error("Hidden service error: {0}")]
    HiddenService(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::ConnectionFailed(_) | TorError::Network(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout(_) => ErrorCode::ConnectionTimeout,
            TorError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,

            TorError::ProtocolError(_) | TorError::ParseError(_) => ErrorCode::ProtocolViolation,
            TorError::UnexpectedCell { .. } => ErrorCode::UnexpectedCell,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,

            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } | TorError::CircuitClosed(_) => {
                ErrorCode::CircuitDestroyed
            }
            TorError::Stream(_) => ErrorCode::StreamFailed,
            TorError::StreamRefused { .. } => ErrorCode::StreamRefused,
            TorError::ConnectFailed { .. } => ErrorCode::ConnectFailed,

            TorError::CertificateError(_) => ErrorCode::CertificateError,
            TorError::ConsensusError(_) => ErrorCode::ConsensusError,
            TorError::EntropyError(_) => ErrorCode::EntropyError,
            TorError::AuthVerificationFailed(_) => ErrorCode::AuthVerificationFailed,
            TorError::Crypto(_) => ErrorCode::CryptoError,

            TorError::Directory(_) => ErrorCode::DirectoryError,
            TorError::ConsensusStale => ErrorCode::ConsensusStale,
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            TorError::HiddenService(_) => ErrorCode::HiddenServiceError,

            TorError::Storage(_) => ErrorCode::StorageError,

            TorError::InvalidConfig(_) => ErrorCode::ConfigError,
            TorError::InvalidFingerprint(_) => ErrorCode::InvalidFingerprint,
            TorError::Unsupported(_) => ErrorCode::Unsupported,

            TorError::Internal(_) | TorError::InvalidState(_) => ErrorCode::InternalError,
            TorError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            TorError::AlreadyInProgress(_) => ErrorCode::AlreadyInProgress,
        }
    }

    /// Failure class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TorError::ProtocolError(_)
            | TorError::UnexpectedCell { .. }
            | TorError::DigestMismatch
            | TorError::HandshakeFailed(_)
            | TorError::ParseError(_)
            | TorError::CertificateError(_)
            | TorError::ConsensusError(_)
            | TorError::AuthVerificationFailed(_)
            | TorError::Crypto(_) => ErrorKind::Protocol,

            TorError::ConnectionFailed(_)
            | TorError::Timeout(_)
            | TorError::ConnectionRefused(_)
            | TorError::Network(_)
            | TorError::CircuitBuildFailed(_)
            | TorError::CircuitDestroyed { .. }
            | TorError::CircuitClosed(_)
            | TorError::Stream(_)
            | TorError::StreamRefused { .. }
            | TorError::ConnectFailed { .. }
            | TorError::Directory(_)
            | TorError::ConsensusStale
            | TorError::HiddenService(_) => ErrorKind::TransientNetwork,

            TorError::NoRelaysAvailable(_)
            | TorError::ResourceExhausted(_)
            | TorError::AlreadyInProgress(_) => ErrorKind::ResourceExhausted,

            TorError::InvalidConfig(_)
            | TorError::InvalidFingerprint(_)
            | TorError::Unsupported(_)
            | TorError::Storage(_) => ErrorKind::Configuration,

            TorError::EntropyError(_) | TorError::Internal(_) | TorError::InvalidState(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this error is fatal to the object it occurred on
    ///
    /// A fatal error on a circuit means the circuit is destroyed; on a
    /// consensus it means the document is rejected. The client itself
    /// keeps running.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Internal)
    }

    /// Whether this error can be retried with different relays
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientNetwork | ErrorKind::ResourceExhausted
        )
    }

    /// Whether this error requires user action (configuration change, etc.)
    pub fn requires_user_action(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }

    /// Create a StreamRefused error from a RELAY_END reason byte
    pub fn stream_refused(reason: u8) -> Self {
        let reason_name = match reason {
            1 => "MISC",
            2 => "RESOLVEFAILED",
            3 => "CONNECTREFUSED",
            4 => "EXITPOLICY",
            5 => "DESTROY",
            6 => "DONE",
            7 => "TIMEOUT",
            8 => "NOROUTE",
            9 => "HIBERNATING",
            10 => "INTERNAL",
            11 => "RESOURCELIMIT",
            12 => "CONNRESET",
            13 => "TORPROTOCOL",
            14 => "NOTDIRECTORY",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::StreamRefused {
            reason,
            reason_name,
        }
    }
}

impl From<std::io::Error> for TorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TorError::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused => TorError::ConnectionRefused(err.to_string()),
            _ => TorError::Network(err.to_string()),
        }
    }
}

impl From<TorError> for std::io::Error {
    fn from(err: TorError) -> Self {
        let kind = match &err {
            TorError::Timeout(_) => std::io::ErrorKind::TimedOut,
            TorError::ConnectionRefused(_) => std::io::ErrorKind::ConnectionRefused,
            TorError::CircuitClosed(_) | TorError::CircuitDestroyed { .. } => {
                std::io::ErrorKind::ConnectionAborted
            }
            TorError::StreamRefused { .. } => std::io::ErrorKind::ConnectionRefused,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<tokio::time::error::Elapsed> for TorError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorError::Timeout("deadline elapsed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(TorError::DigestMismatch.kind(), ErrorKind::Protocol);
        assert_eq!(TorError::Timeout("build".into()).kind(), ErrorKind::TransientNetwork);
        assert_eq!(
            TorError::NoRelaysAvailable("exit".into()).kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            TorError::InvalidFingerprint("zz".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TorError::CertificateError("test".into()).is_fatal());
        assert!(TorError::ConsensusError("test".into()).is_fatal());
        assert!(TorError::DigestMismatch.is_fatal());

        assert!(!TorError::ConnectionFailed("test".into()).is_fatal());
        assert!(!TorError::Timeout("build".into()).is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::ConnectionFailed("test".into()).is_retryable());
        assert!(TorError::Timeout("build".into()).is_retryable());
        assert!(TorError::CircuitBuildFailed("test".into()).is_retryable());
        assert!(TorError::ResourceExhausted("window".into()).is_retryable());

        assert!(!TorError::CertificateError("test".into()).is_retryable());
        assert!(!TorError::InvalidConfig("test".into()).is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TorError::ConnectionFailed("test".into()).code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(TorError::Timeout("build".into()).code(), ErrorCode::ConnectionTimeout);
        assert_eq!(
            TorError::CertificateError("test".into()).code(),
            ErrorCode::CertificateError
        );
    }

    #[test]
    fn test_reason_names() {
        match TorError::circuit_destroyed(10) {
            TorError::CircuitDestroyed { reason_name, .. } => assert_eq!(reason_name, "TIMEOUT"),
            other => panic!("unexpected {other:?}"),
        }
        match TorError::stream_refused(4) {
            TorError::StreamRefused { reason_name, .. } => assert_eq!(reason_name, "EXITPOLICY"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(TorError::from(io), TorError::Timeout(_)));

        let back: std::io::Error = TorError::CircuitClosed("gone".into()).into();
        assert_eq!(back.kind(), std::io::ErrorKind::ConnectionAborted);
    }
}
