// src/error.rs
// ---------------------------------------------------------------------------
// Error sum type shared by every subsystem. Per-game errors are collected
// into a report by the caller rather than bubbled as Err; only per-file
// and cancellation errors are meant to propagate out of a transform.
// ---------------------------------------------------------------------------

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed pgn at offset {offset}: {reason}")]
    MalformedPgn { offset: u64, reason: String },

    #[error("truncated game starting at offset {offset}")]
    TruncatedGame { offset: u64 },

    #[error("index corrupt: {reason}")]
    IndexCorrupt { reason: String },

    #[error("index version {found} too new (supported <= {supported})")]
    IndexVersionTooNew { found: u32, supported: u32 },

    #[error("companion index missing for {path}")]
    MissingCompanionIndex { path: PathBuf },

    #[error("engine timeout during {stage}")]
    EngineTimeout { stage: String },

    #[error("engine protocol error: {reason}")]
    EngineProtocol { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("target path locked after {attempts} attempts: {path}")]
    TargetLocked { path: PathBuf, attempts: u32 },

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}

/// A non-fatal error attached to a specific game, collected by transforms
/// into a `Report` rather than surfaced as a hard failure.
#[derive(Debug, Clone)]
pub struct GameError {
    pub game_index: u64,
    pub offset: u64,
    pub message: String,
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "game #{} @{}: {}", self.game_index, self.offset, self.message)
    }
}
