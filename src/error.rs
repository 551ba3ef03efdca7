//! Error types for sessions and alert delivery

use thiserror::Error;

/// Why a single session ended abnormally.
///
/// Failures never escape the session task; the acceptor only sees that the
/// task finished.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The SSH transport could not be set up with the peer.
    #[error("SSH negotiation failed: {0}")]
    Negotiation(String),

    /// A handshake step did not happen inside its wait window.
    #[error("handshake timeout: {0}")]
    HandshakeTimeout(&'static str),

    /// The transport went away before the shell was granted.
    #[error("transport closed during handshake")]
    HandshakeClosed,

    /// The peer sent more than the allowed bytes without a carriage return.
    #[error("command line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The peer closed the channel during the command loop.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Operator-facing failure class.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Negotiation(_) | Self::HandshakeTimeout(_) | Self::HandshakeClosed => {
                "HandshakeFailure"
            }
            Self::LineTooLong(_) | Self::PeerClosed | Self::Io(_) => "IOFailure",
        }
    }

    /// True if the failure happened before the shell was granted.
    pub fn is_handshake(&self) -> bool {
        self.class() == "HandshakeFailure"
    }
}

/// Alert delivery failures. Always logged and swallowed by the notifier.
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("alert credentials unreadable: {0}")]
    Credentials(String),

    #[error("alert transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("alert relay rejected the message with status {0}")]
    Rejected(u16),
}
