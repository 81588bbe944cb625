pub use bincode::Error as PersistenceError;
pub use serde_bencode::Error as BencodeError;
pub use tokio::io::Error as IoError;

pub use crate::{peer::error::PeerError, tracker::TrackerError};

use std::{convert::From, fmt};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
///
/// Errors that only concern a single peer connection are reported as
/// [`PeerError`] and wrapped here when they surface through the public API.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Bencode(BencodeError),
    /// The metainfo is well-formed bencode but semantically invalid (e.g. the
    /// piece count doesn't match the content length).
    InvalidMetainfo,
    /// The metainfo `pieces` field is not a concatenation of 20 byte hashes.
    InvalidPieces,
    /// A piece index outside the transfer was given.
    InvalidPieceIndex,
    /// The content on disk or the restored state disagrees with the metainfo.
    ContentMismatch,
    /// Reading or writing content or state failed.
    Io(IoError),
    /// The persisted state blob could not be encoded or decoded.
    Persistence(PersistenceError),
    Peer(PeerError),
    Tracker(TrackerError),
    /// The client was shut down and accepts no new connections.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Bencode(e) => write!(f, "{}", e),
            InvalidMetainfo => write!(f, "invalid metainfo"),
            InvalidPieces => write!(f, "invalid metainfo pieces field"),
            InvalidPieceIndex => write!(f, "invalid piece index"),
            ContentMismatch => {
                write!(f, "content does not match transfer metadata")
            }
            Io(e) => write!(f, "{}", e),
            Persistence(e) => write!(f, "persisted state: {}", e),
            Peer(e) => write!(f, "{}", e),
            Tracker(e) => write!(f, "{}", e),
            Shutdown => write!(f, "client is shut down"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Bencode(e) => Some(e),
            Io(e) => Some(e),
            Persistence(e) => Some(e),
            Peer(e) => Some(e),
            Tracker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<BencodeError> for Error {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<PersistenceError> for Error {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}

impl From<PeerError> for Error {
    fn from(e: PeerError) -> Self {
        Self::Peer(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}
