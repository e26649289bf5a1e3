//! Error types shared by the transport, channel and endpoint layers.

use thiserror::Error;

/// Errors produced by tcp-handoff.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A read returned zero bytes while part of a message was still expected.
    #[error("peer disconnected with {remaining} of {expected} bytes outstanding")]
    PeerDisconnected { expected: usize, remaining: usize },

    /// The listening socket failed to accept.
    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    #[error("channel has no open socket")]
    NotOpen,

    #[error("accept called on an endpoint that is not the master")]
    NotMaster,

    #[error("unexpected header options {0:#04x}")]
    UnexpectedOpts(u8),

    #[error("control message with options {opts:#04x} carried {len} payload bytes")]
    UnexpectedPayload { opts: u8, len: usize },

    #[error("handoff reply carried {0} bytes, expected 2")]
    BadPortReply(usize),

    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),

    #[error("unable to resolve host '{0}'")]
    Resolve(String),

    #[error("buffer accounting mismatch: {0} bytes still allocated after release")]
    BufferLeak(usize),

    #[error("fork failed: {0}")]
    Fork(std::io::Error),
}

impl Error {
    /// Whether the error came from the transport rather than the protocol.
    ///
    /// Transport failures are the ones a client recovers from with
    /// `reconnect()`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Accept(_) | Error::PeerDisconnected { .. } | Error::NotOpen
        )
    }

    /// Peer closed the connection between messages rather than inside one.
    ///
    /// Only a disconnect before the first header byte qualifies; payload
    /// reads count the header in `expected`.
    pub fn is_clean_disconnect(&self) -> bool {
        matches!(
            self,
            Error::PeerDisconnected { expected, remaining } if expected == remaining
        )
    }

    /// Raw OS error code, if the failure carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) | Error::Accept(e) | Error::Fork(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        let disconnect = Error::PeerDisconnected {
            expected: 10,
            remaining: 4,
        };
        assert!(disconnect.is_transport());
        assert!(!Error::BadPortReply(3).is_transport());
        assert!(!Error::UnexpectedOpts(0x80).is_transport());
    }

    #[test]
    fn test_clean_disconnect() {
        let between = Error::PeerDisconnected {
            expected: 5,
            remaining: 5,
        };
        let inside = Error::PeerDisconnected {
            expected: 5,
            remaining: 2,
        };
        assert!(between.is_clean_disconnect());
        assert!(!inside.is_clean_disconnect());
        assert!(!Error::NotOpen.is_clean_disconnect());
    }

    #[test]
    fn test_raw_os_error() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
        assert_eq!(Error::NotOpen.raw_os_error(), None);
    }
}
