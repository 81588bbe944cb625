use std::fmt;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type returned on failed peer connections.
///
/// These errors are local to a single peer: they end that peer's connection
/// (or connection attempt) but never affect other peers or the transfer.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The outbound TCP connection was not established within the dial
    /// timeout.
    DialTimeout,
    /// The outbound TCP connection was refused or otherwise failed.
    Dial(IoError),
    /// The peer's handshake was malformed or was not received in time.
    HandshakeRejected(&'static str),
    /// Peer's info hash did not match ours.
    InvalidInfoHash,
    /// The peer sent a message that could not be decoded or that is not
    /// valid in the current state of the connection.
    ProtocolViolation(&'static str),
    /// The peer announced a piece index outside the transfer.
    InvalidPieceIndex,
    /// No message was received from the peer within the peer timeout.
    Timeout,
    /// The channel on which the peer's writer task was listening died.
    Channel,
    /// A connection with the peer is already registered.
    AlreadyConnected,
    /// A connection attempt to the peer is already under way.
    DialInProgress,
    /// An IO error ocurred.
    Io(IoError),
}

impl fmt::Display for PeerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            DialTimeout => write!(fmt, "dial timed out"),
            Dial(e) => write!(fmt, "dial failed: {}", e),
            HandshakeRejected(reason) => {
                write!(fmt, "handshake rejected: {}", reason)
            }
            InvalidInfoHash => write!(fmt, "invalid info hash"),
            ProtocolViolation(reason) => {
                write!(fmt, "protocol violation: {}", reason)
            }
            InvalidPieceIndex => write!(fmt, "invalid piece index"),
            Timeout => write!(fmt, "peer timed out"),
            Channel => write!(fmt, "channel error"),
            AlreadyConnected => write!(fmt, "peer already connected"),
            DialInProgress => write!(fmt, "peer dial already in progress"),
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl std::error::Error for PeerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PeerError::Dial(e) | PeerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for PeerError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
