//! Failure taxonomy for the coordination core.
//!
//! Every fallible operation returns a stable failure kind plus a
//! human-readable message. The transport boundary maps kinds to status
//! codes; the core never formats HTTP responses itself.

use thiserror::Error;

/// Errors surfaced by the coordination core.
#[derive(Error, Debug)]
pub enum CoordError {
    /// Missing or malformed input, rejected before any store access.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No usable credential was presented.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The requester is not allowed to perform the operation. Also covers
    /// race-lost conditional writes: the loser of a stale-precondition race
    /// observes this kind, never a silent overwrite.
    #[error("not allowed: {0}")]
    Forbidden(String),

    /// A referenced conversation, message, or identity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Anything else, including persisted-store failures.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl CoordError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

pub type CoordResult<T> = Result<T, CoordError>;
