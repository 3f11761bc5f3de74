use resp_core::ReaderError;

/// Client-level error delivered to continuations and the `on_error` hook.
///
/// Owned and cloneable so the same condition can be reported to several
/// continuations independently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed RESP on one of the transports.
    #[error(transparent)]
    Protocol(#[from] ReaderError),
    /// Transport-level failure (connect, read, write, or remote close).
    #[error("{0}")]
    Io(String),
    /// An `-ERR …` reply from the server, delivered to the continuation
    /// that owned the command.
    #[error("{0}")]
    Server(String),
    /// Argument validation failure.
    #[error("{0}")]
    Usage(String),
    /// A command was issued while the client was not fully connected.
    #[error("command: Not connected")]
    NotConnected,
    /// A pub/sub or timer event arrived for a subscription whose channels
    /// have not all been acknowledged yet.
    #[error("event received but not initialized")]
    NotInitialized,
    /// Queued continuation dropped by `disconnect()` while the
    /// fail-dropped-commands policy is enabled.
    #[error("disconnected")]
    Disconnected,
}
