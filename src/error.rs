//! Error types returned by the session manager.

use std::io;

use thiserror::Error;

/// Failures reported to the caller of a [`Session`](crate::session::Session) operation.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("RTP/RTCP manager already prepared")]
    AlreadyPrepared,

    #[error("RTP/RTCP manager not prepared")]
    NotPrepared,

    #[error("RTP/RTCP manager not started")]
    NotStarted,

    #[error("no free RTP/RTCP port pair in [{start}, {stop}) after {attempts} attempts")]
    BindingExhausted { start: u16, stop: u16, attempts: u8 },

    #[error("failed to create RTP transport: {0}")]
    TransportCreate(#[source] io::Error),

    #[error("invalid host:port [{host}:{port}]")]
    Resolve { host: String, port: u16 },

    #[error("failed to start RTP transport: {0}")]
    TransportStart(#[source] io::Error),

    #[error("SRTP protect failed: {0}")]
    Protect(String),

    #[error("RTP send failed: {0}")]
    Send(#[source] io::Error),

    #[error("short write: {sent} of {expected} bytes sent")]
    ShortWrite { sent: usize, expected: usize },

    #[error("NAT traversal failed: {0}")]
    Nat(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ManagerError {
    /// Operation called in the wrong lifecycle state.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ManagerError::AlreadyPrepared | ManagerError::NotPrepared | ManagerError::NotStarted
        )
    }
}

/// Why a single inbound datagram was dropped. Never fatal to the session.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("SRTP unprotect failed: {0}")]
    Unprotect(String),

    #[error("RTP deframing failed: {0}")]
    Deframe(String),

    #[error("datagram on unknown socket {0}")]
    UnknownSocket(crate::transport::SocketId),

    #[error("no RTP consumer registered")]
    NoConsumer,
}

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;
