//! Result codes surfaced by the transfer client, plus error categorization
//! backing its reconnect decisions.
//!
//! Protocol-level outcomes are a discriminated status rather than an error
//! type: callers branch on them (resume, retry, surface to the operator)
//! instead of unwinding.

use std::io;

/// Outcome of a transfer-protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Operation completed.
    Success,
    /// Discovery is still polling; call again.
    Continue,
    /// Idle timeout, reconnect attempts exhausted.
    Timeout,
    /// Server answered that the file could not be opened.
    FileDoesntExist,
    /// Socket setup failed.
    SocketError,
    /// Connection established.
    Connected,
    /// Generic failure (write-side abort, malformed reply).
    Error,
    /// Server lost the directory backing the requested name.
    BaseDirLost,
    /// A checkpoint MD5 did not match the received payload.
    Hash,
    /// Client-side state error (no connection, no sink).
    IntError,
    /// Connection lost and not recoverable.
    ConnLost,
}

impl TransferStatus {
    pub fn is_success(self) -> bool {
        self == TransferStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Success => "SUCCESS",
            TransferStatus::Continue => "CONTINUE",
            TransferStatus::Timeout => "TIMEOUT",
            TransferStatus::FileDoesntExist => "FILE_DOESNT_EXIST",
            TransferStatus::SocketError => "SOCKET_ERROR",
            TransferStatus::Connected => "CONNECTED",
            TransferStatus::Error => "ERROR",
            TransferStatus::BaseDirLost => "BASE_DIR_LOST",
            TransferStatus::Hash => "HASH",
            TransferStatus::IntError => "INT_ERROR",
            TransferStatus::ConnLost => "CONN_LOST",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a connection-level error for reconnect decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient failure; reconnect and resume may succeed.
    Retryable,
    /// Permanent failure; reconnecting will not help.
    Fatal,
}

/// Categorize an IO error observed on the transfer connection.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput => ErrorCategory::Fatal,

        // Unknown errors default to fatal to avoid reconnect loops.
        _ => ErrorCategory::Fatal,
    }
}
