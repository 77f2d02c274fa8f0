use std::{io, path::PathBuf};

use thiserror::Error;

pub type TransferResult<T> = Result<T, TransferError>;

/// Failures of a transfer session or of an engine operation.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A length, count or size field was malformed, a name was not valid
    /// UTF-16, or the stream ended early. The connection is abandoned.
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    #[error("connection failure: {0}")]
    ConnectionFailure(#[from] io::Error),

    #[error("storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("not connected to a relay")]
    NotConnected,

    #[error("receiver index {index} is not in the roster ({roster_len} peers)")]
    RosterResolutionFailure { index: usize, roster_len: usize },

    #[error("no receivers selected")]
    NoReceivers,

    #[error("host `{0}` is not in the roster")]
    UnknownPeer(String),

    #[error("already running")]
    AlreadyRunning,
}

impl TransferError {
    pub fn framing(message: impl Into<String>) -> Self {
        Self::ProtocolFraming(message.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Maps an error from reading the wire. A stream that ends in the middle
    /// of a field is a framing error, anything else is the connection's
    /// fault.
    pub fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::framing("stream ended before the announced data")
        } else {
            Self::ConnectionFailure(err)
        }
    }

    pub fn is_framing(&self) -> bool {
        matches!(self, Self::ProtocolFraming(_))
    }

    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailure(_))
    }
}
