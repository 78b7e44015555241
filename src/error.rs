//! # Error Handling
//!
//! This module provides the error types for Quorum Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── DatabaseError         - Transaction or statement failed       │
//! │  │   ├── StorageNotFound       - Row not found                         │
//! │  │   └── StorageCorrupted      - Stored data failed to parse           │
//! │  │                                                                      │
//! │  ├── Limit Errors                                                      │
//! │  │   ├── BookmarkLimitExceeded - Bookmark ceiling reached              │
//! │  │   └── QueueFull             - Action queue at capacity              │
//! │  │                                                                      │
//! │  ├── Queue Errors                                                      │
//! │  │   ├── HandlerFailure        - A task handler raised                 │
//! │  │   ├── HandlerNotRegistered  - No handler for a task type            │
//! │  │   └── TaskNotFound          - Queue task id unknown                 │
//! │  │                                                                      │
//! │  ├── Backup Errors                                                     │
//! │  │   ├── InvalidFormat         - Not a valid backup file               │
//! │  │   ├── DecryptionFailed      - Wrong account or corrupt file         │
//! │  │   ├── EncryptionFailed      - Export encryption failed              │
//! │  │   └── BackupInProgress      - Concurrent backup operation           │
//! │  │                                                                      │
//! │  ├── Transport Errors                                                  │
//! │  │   ├── TransportClosed       - Send attempted on closed transport    │
//! │  │   └── TransportError        - Transport-level failure               │
//! │  │                                                                      │
//! │  └── Data Errors                                                       │
//! │      ├── InvalidSpace          - Space invariant violated              │
//! │      ├── ConversationNotFound  - Conversation doesn't exist            │
//! │      └── MessageNotFound       - Message doesn't exist                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deduplicated enqueues and stuck-task recoveries are *not* errors: the
//! former is a normal [`EnqueueOutcome`](crate::queue::EnqueueOutcome)
//! variant, the latter is informational logging.

use thiserror::Error;

/// Result type alias for Quorum Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quorum Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to users.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Storage Errors (100-199)
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Item not found in storage
    #[error("Item not found: {0}")]
    StorageNotFound(String),

    /// Data corruption detected
    #[error("Data corruption detected: {0}")]
    StorageCorrupted(String),

    // ========================================================================
    // Limit Errors (200-299)
    // ========================================================================

    /// The bookmark ceiling was reached; nothing was written
    #[error("Bookmark limit reached ({0} max). Remove a bookmark first.")]
    BookmarkLimitExceeded(usize),

    /// The action queue is at capacity even after pruning
    #[error("Action queue is full. Please try again later.")]
    QueueFull,

    // ========================================================================
    // Queue Errors (300-399)
    // ========================================================================

    /// A task handler raised; the task is retained as failed
    #[error("Task handler failed: {0}")]
    HandlerFailure(String),

    /// No handler registered for a task type
    #[error("No handler registered for task type: {0}")]
    HandlerNotRegistered(String),

    /// Queue task id unknown
    #[error("Queue task not found: {0}")]
    TaskNotFound(i64),

    // ========================================================================
    // Backup Errors (400-499)
    // ========================================================================

    /// File is not a valid backup (wrong version, missing fields, bad hex)
    #[error("Invalid backup file: {0}")]
    InvalidFormat(String),

    /// AEAD decryption failed: wrong account or corrupted file
    #[error("Backup decryption failed: {0}")]
    DecryptionFailed(String),

    /// Export encryption failed
    #[error("Backup encryption failed: {0}")]
    EncryptionFailed(String),

    /// A backup export or import is already running
    #[error("A backup operation is already in progress.")]
    BackupInProgress,

    // ========================================================================
    // Transport Errors (500-599)
    // ========================================================================

    /// Send attempted while the transport is closed
    #[error("Transport is closed.")]
    TransportClosed,

    /// Transport-level failure
    #[error("Transport error: {0}")]
    TransportError(String),

    // ========================================================================
    // Data Errors (600-699)
    // ========================================================================

    /// Space invariant violated (e.g. dangling default channel)
    #[error("Invalid space: {0}")]
    InvalidSpace(String),

    /// Conversation not found
    #[error("Conversation not found.")]
    ConversationNotFound,

    /// Message not found
    #[error("Message not found.")]
    MessageNotFound,

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Storage
    /// - 200-299: Limits
    /// - 300-399: Queue
    /// - 400-499: Backup
    /// - 500-599: Transport
    /// - 600-699: Data
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Storage (100-199)
            Error::DatabaseError(_) => 100,
            Error::StorageNotFound(_) => 101,
            Error::StorageCorrupted(_) => 102,

            // Limits (200-299)
            Error::BookmarkLimitExceeded(_) => 200,
            Error::QueueFull => 201,

            // Queue (300-399)
            Error::HandlerFailure(_) => 300,
            Error::HandlerNotRegistered(_) => 301,
            Error::TaskNotFound(_) => 302,

            // Backup (400-499)
            Error::InvalidFormat(_) => 400,
            Error::DecryptionFailed(_) => 401,
            Error::EncryptionFailed(_) => 402,
            Error::BackupInProgress => 403,

            // Transport (500-599)
            Error::TransportClosed => 500,
            Error::TransportError(_) => 501,

            // Data (600-699)
            Error::InvalidSpace(_) => 600,
            Error::ConversationNotFound => 601,
            Error::MessageNotFound => 602,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
            Error::DeserializationError(_) => 902,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying
    /// or by waiting for connectivity.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed
                | Error::TransportError(_)
                | Error::QueueFull
                | Error::BackupInProgress
                | Error::HandlerFailure(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
