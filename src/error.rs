//! Error types for peerwire
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for peerwire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,
    Serialization = 204,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    BindFailed = 302,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    FrameTooLarge = 402,

    // Peer and caller misuse errors (5xx)
    DuplicatePeer = 500,
    UnknownPeer = 501,
    SelfRegistration = 502,
    GroupMismatch = 503,
    CommunicatorStopped = 504,
    CallerMisuse = 505,

    // Payload errors (6xx)
    PayloadAborted = 600,
    OperationTimeout = 601,

    // Discovery errors (7xx)
    DiscoveryTimeout = 700,
    DiscoveryFailed = 701,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Peer errors
            600..=699 => 60, // Payload errors
            700..=799 => 70, // Discovery errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for peerwire
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encoding error on the wire
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not bind a listening socket
    #[error("Failed to bind {address}")]
    BindFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Connection failed
    #[error("Failed to connect to {address}: {message}")]
    ConnectionFailed { address: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Malformed message
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Frame exceeds the wire limit
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ─────────────────────────────────────────────────────────────
    // Peer Errors
    // ─────────────────────────────────────────────────────────────

    /// Peer registered twice on the same communicator
    #[error("Peer {peer} is already registered")]
    DuplicatePeer { peer: String },

    /// Operation on a peer this communicator does not know
    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    /// A communicator cannot register itself
    #[error("Cannot register own connection info {peer} as a peer")]
    SelfRegistration { peer: String },

    /// Peer belongs to a different run
    #[error("Peer {peer} belongs to group '{actual}', expected '{expected}'")]
    GroupMismatch {
        peer: String,
        expected: String,
        actual: String,
    },

    /// Use after `stop()`
    #[error("Communicator has been stopped")]
    CommunicatorStopped,

    /// API used in a way its contract forbids
    #[error("Invalid use: {message}")]
    CallerMisuse { message: String },

    // ─────────────────────────────────────────────────────────────
    // Payload Errors
    // ─────────────────────────────────────────────────────────────

    /// Payload was never acknowledged before its abort deadline
    #[error("Payload {sequence_number} to {peer} aborted: {reason}")]
    PayloadAborted {
        peer: String,
        sequence_number: u64,
        reason: String,
    },

    /// A bounded wait ran out
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // ─────────────────────────────────────────────────────────────
    // Discovery Errors
    // ─────────────────────────────────────────────────────────────

    /// Not every peer was found in time
    #[error("Discovery timed out after {timeout_ms}ms with {found} of {expected} peers")]
    DiscoveryTimeout {
        expected: usize,
        found: usize,
        timeout_ms: u64,
    },

    /// Generic discovery failure
    #[error("Discovery failed: {message}")]
    DiscoveryFailed { message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::Serialization,

            Error::BindFailed { .. } => ErrorCode::BindFailed,
            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,

            Error::DuplicatePeer { .. } => ErrorCode::DuplicatePeer,
            Error::UnknownPeer { .. } => ErrorCode::UnknownPeer,
            Error::SelfRegistration { .. } => ErrorCode::SelfRegistration,
            Error::GroupMismatch { .. } => ErrorCode::GroupMismatch,
            Error::CommunicatorStopped => ErrorCode::CommunicatorStopped,
            Error::CallerMisuse { .. } => ErrorCode::CallerMisuse,

            Error::PayloadAborted { .. } => ErrorCode::PayloadAborted,
            Error::Timeout { .. } => ErrorCode::OperationTimeout,

            Error::DiscoveryTimeout { .. } => ErrorCode::DiscoveryTimeout,
            Error::DiscoveryFailed { .. } => ErrorCode::DiscoveryFailed,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Transient failures a caller may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::Timeout { .. }
                | Error::DiscoveryTimeout { .. }
                | Error::Io(_)
        )
    }

    /// Protocol violations and misuse are raised immediately and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::DuplicatePeer { .. }
                | Error::SelfRegistration { .. }
                | Error::GroupMismatch { .. }
                | Error::CommunicatorStopped
                | Error::CallerMisuse { .. }
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'peerwire config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'peerwire config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::BindFailed { .. } => Some(
                "Another process may be using this port. Choose a different port or use 0 for an ephemeral one."
            ),
            Error::ConnectionFailed { .. } => Some(
                "Check that the peer is running and reachable from this host."
            ),

            Error::ProtocolVersion { .. } => Some(
                "All instances of a run must use compatible peerwire versions. Run 'peerwire version' on each node."
            ),

            Error::DuplicatePeer { .. } => Some(
                "Each peer may be registered only once per communicator."
            ),
            Error::GroupMismatch { .. } => Some(
                "Make sure every instance of the run uses the same group identifier."
            ),
            Error::CommunicatorStopped => Some(
                "Create a new communicator; a stopped one cannot be reused."
            ),

            Error::PayloadAborted { .. } => Some(
                "The peer did not acknowledge in time. Increase 'payload_abort_timeout_ms' or check the peer's health."
            ),
            Error::DiscoveryTimeout { .. } => Some(
                "Not all instances started in time. Check 'number_of_nodes', 'instances_per_node' and the discovery address."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Error::CallerMisuse {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::DuplicatePeer.as_str(), "E500");
        assert_eq!(ErrorCode::PayloadAborted.as_str(), "E600");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::BindFailed.exit_code(), 30);
        assert_eq!(ErrorCode::FrameTooLarge.exit_code(), 40);
        assert_eq!(ErrorCode::UnknownPeer.exit_code(), 50);
        assert_eq!(ErrorCode::DiscoveryTimeout.exit_code(), 70);
    }

    #[test]
    fn test_protocol_violations_are_fatal_not_retryable() {
        let err = Error::DuplicatePeer { peer: "a".into() };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(Error::CommunicatorStopped.is_fatal());
        assert!(Error::misuse("leader without value").is_fatal());
    }

    #[test]
    fn test_timeouts_are_retryable() {
        assert!(Error::timeout("wait_for_peers", Duration::from_secs(2)).is_retryable());
        assert!(Error::DiscoveryTimeout { expected: 3, found: 1, timeout_ms: 10 }.is_retryable());
        assert!(!Error::config_not_found("/test").is_retryable());
    }

    #[test]
    fn test_payload_aborted_display() {
        let err = Error::PayloadAborted {
            peer: "worker-1".into(),
            sequence_number: 7,
            reason: "abort timeout".into(),
        };
        let text = err.to_string();
        assert!(text.contains("worker-1"));
        assert!(text.contains('7'));
        assert_eq!(err.code(), ErrorCode::PayloadAborted);
    }

    #[test]
    fn test_timeout_constructor_records_millis() {
        match Error::timeout("peers", Duration::from_millis(1500)) {
            Error::Timeout { operation, timeout_ms } => {
                assert_eq!(operation, "peers");
                assert_eq!(timeout_ms, 1500);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/node.toml");
        let formatted = err.format_for_terminal();
        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("config init"));
    }

    #[test]
    fn test_format_for_log() {
        let formatted = Error::UnknownPeer { peer: "x".into() }.format_for_log();
        assert!(formatted.contains("[E501]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
