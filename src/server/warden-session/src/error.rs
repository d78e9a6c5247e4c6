//! Session error types.

use thiserror::Error;

/// Errors that can occur on the agent channel.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Frame or payload could not be encoded/decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Transport I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The presented peer certificate did not verify.
    #[error("peer rejected: {0}")]
    PeerRejected(String),

    /// No agent binding matches the presented identity.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// Agent binding is suspended or revoked.
    #[error("agent not active: {0}")]
    AgentNotActive(String),

    /// Peer went silent past the dead-peer cutoff.
    #[error("peer timed out")]
    PeerTimeout,

    /// Session is shutting down.
    #[error("session closed")]
    Closed,

    /// Internal engine failure surfaced to the transport layer.
    #[error("internal error: {0}")]
    Internal(String),
}
