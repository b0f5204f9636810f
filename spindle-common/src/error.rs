//! Error types for the spindle engine
//!
//! Defines the engine-wide error taxonomy using thiserror. Transient
//! resolution/fetch failures are recovered locally by the playback
//! machinery; quota and configuration errors are always surfaced to
//! the caller.

use thiserror::Error;

/// Why a track reference could not be resolved into track metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// Reference shape is not one this resolver handles
    Unsupported,
    /// Reference was understood but nothing was found behind it
    NotFound,
    /// Transport failure talking to the source
    Network,
}

impl std::fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionKind::Unsupported => "unsupported",
            ResolutionKind::NotFound => "not found",
            ResolutionKind::Network => "network",
        };
        write!(f, "{}", s)
    }
}

/// Main error type for the spindle engine
#[derive(Error, Debug)]
pub enum Error {
    /// Track reference could not be resolved into metadata
    #[error("Resolution error ({kind}): {reference}")]
    Resolution {
        kind: ResolutionKind,
        reference: String,
    },

    /// Cache or network failure while fetching audio bytes
    #[error("Fetch error for {track_id}: {reason}")]
    Fetch { track_id: String, reason: String },

    /// Queue per-add or per-user limit exceeded; nothing was enqueued
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// No autofill source yielded any candidate
    #[error("Autofill exhausted: no source yielded candidates")]
    AutofillExhausted,

    /// Voice/audio transport failure, fatal to the current session
    #[error("Sink error: {0}")]
    Sink(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Named playlist does not exist for this guild
    #[error("Playlist not found: {0}")]
    PlaylistNotFound(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Guild has no running scheduling unit
    #[error("Guild not active: {0}")]
    GuildNotActive(u64),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a resolution failure
    pub fn resolution(kind: ResolutionKind, reference: impl Into<String>) -> Self {
        Error::Resolution {
            kind,
            reference: reference.into(),
        }
    }

    /// Shorthand for a fetch failure
    pub fn fetch(track_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Fetch {
            track_id: track_id.into(),
            reason: reason.into(),
        }
    }

    /// True for failures the playback loop recovers from by skipping
    /// to the next candidate (bounded), rather than reporting upward.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Resolution { .. } | Error::Fetch { .. })
    }
}

/// Convenience Result type using the spindle Error
pub type Result<T> = std::result::Result<T, Error>;
