use std::io;
use thiserror::Error;
use crate::gate::status::GateStatus;
use crate::hub::AddressPair;

/// Failures reported by a [crate::hub::Hub]
#[derive(Debug, Error)]
pub enum HubError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("I/O timed out")]
    Timeout,

    #[error("connection closed by peer")]
    Closed,

    #[error("no connection for {0}")]
    UnknownPair(AddressPair),
}

impl HubError {
    /// A fatal error means the connection is gone for good, while other errors may go away if
    ///  the operation is retried
    pub fn is_fatal(&self) -> bool {
        match self {
            HubError::Io(e) => matches!(e.kind(),
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof
            ),
            HubError::Timeout => false,
            HubError::Closed => true,
            HubError::UnknownPair(_) => true,
        }
    }
}

/// Failures that are surfaced to a gate's delegate
#[derive(Debug, Error)]
pub enum GateError {
    #[error("departure expired before it could be sent")]
    Expired,

    #[error("sending failed after {attempts} attempts: {cause}")]
    RetriesExhausted {
        attempts: u32,
        cause: HubError,
    },

    #[error("gate was terminated")]
    Cancelled,

    #[error("connection is not usable in status {status:?}")]
    ConnectionLost {
        status: GateStatus,
    },

    #[error("protocol desynchronized, dropped {dropped} bytes")]
    Desync {
        dropped: usize,
    },
}
