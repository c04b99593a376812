//! Error taxonomy shared by the transport, the channel layer and the
//! download core.

use std::path::PathBuf;
use thiserror::Error;

/// `bininja` client error.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer rejected the connection handshake.
    #[error("connection refused by {host}: {reason}")]
    ConnectionRefused { host: String, reason: String },

    /// Socket or framing failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer refused to open a new virtual channel.
    #[error("channel declined by peer: {0}")]
    ChannelDeclined(String),

    /// No response within the deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// A blocking wait was abandoned on request.
    #[error("interrupted while {0}")]
    Interrupted(String),

    /// The download destination cannot be opened.
    #[error("could not access download target \"{}\": {source}", path.display())]
    TargetInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected or undecodable packet for the receiving role.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Data on the control path that matches no known frame.
    #[error("malicious input: {0}")]
    MaliciousInput(String),

    #[error("channel {0} is closed")]
    ChannelClosed(u32),

    #[error("not connected")]
    NotConnected,

    /// Session key arrangement or frame sealing failed.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn timeout(what: impl Into<String>) -> Self {
        Error::Timeout(what.into())
    }

    pub fn interrupted(what: impl Into<String>) -> Self {
        Error::Interrupted(what.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }
}
