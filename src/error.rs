// Error kinds per the broker's error handling design: TransientRetry is
// handled inline by callers (it never escapes as a returned error — see
// each module's polling loop) so it is not a variant here; the remaining
// five map directly onto spec-level failure categories.

use std::io;

use thiserror::Error;

/// Broker-level error classification.
///
/// `TransientRetry` (EAGAIN/EINTR on non-blocking I/O) is intentionally not
/// a variant: every call site that can observe it loops or defers to the
/// next tick instead of constructing an error value.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Quota exceeded, duplicate name, malformed message, or unknown host.
    /// The offending client's socket is closed; this is logged rate-limited,
    /// not surfaced to the client.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A pending handshake or in-flight request exceeded its wall-clock
    /// budget and its resources were reclaimed.
    #[error("timed out waiting for {0}")]
    TimedOut(String),

    /// EOF or a hard transport error on an established channel.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// Allocation failure, FD exhaustion, or another resource limit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Startup failure or an unrecoverable internal inconsistency.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Wraps a raw I/O error that doesn't fit a more specific category.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// True for the non-blocking "try again" conditions a poll loop should
    /// treat as "no data yet" rather than propagate.
    pub fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}
