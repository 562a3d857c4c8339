use thiserror::Error;

/// Status codes surfaced through the public API and the event callbacks.
///
/// These are deliberately a closed set: hosts are expected to match on them
/// (retry on `Backpressure`, give up on `Failed`, ...), so they live in a
/// dedicated enum rather than behind an opaque error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArdpError {
    #[error("operation failed")]
    Failed,
    #[error("socket would block")]
    WouldBlock,
    #[error("buffer capacity exceeded")]
    OutOfMemory,
    #[error("timed out")]
    Timeout,
    #[error("send window exhausted")]
    Backpressure,
    #[error("ttl expired before transmission")]
    TtlExpired,
    #[error("connection in invalid state")]
    InvalidState,
    #[error("invalid data")]
    InvalidData,
}

pub type ArdpResult<T> = Result<T, ArdpError>;

/// Completion status handed to event callbacks. `Ok(())` is the normal case;
/// the error carries the reason a connect, send or delivery went bad.
pub type Status = Result<(), ArdpError>;
