//! Error types for the log playout machine.

use thiserror::Error;

/// Errors reported by playout operations and collaborators.
#[derive(Error, Debug)]
pub enum PlayoutError {
    #[error("line {line} out of range (log has {len} lines)")]
    LineOutOfRange { line: usize, len: usize },

    #[error("line {0} is already playing")]
    AlreadyPlaying(usize),

    #[error("invalid state for line {line}: {reason}")]
    InvalidState { line: usize, reason: String },

    /// Deck pool exhausted.
    #[error("no deck available to play line {0}")]
    NoDeckAvailable(usize),

    #[error("line {0} has no playable event")]
    NotPlayable(usize),

    #[error("audio engine error: {0}")]
    Audio(String),

    #[error("macro error: {0}")]
    Macro(String),

    #[error("log '{0}' not found")]
    UnknownLog(String),

    #[error("no log loaded")]
    NoLog,

    #[error("malformed log line: {0}")]
    MalformedLine(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience Result type using [`PlayoutError`].
pub type Result<T> = std::result::Result<T, PlayoutError>;
