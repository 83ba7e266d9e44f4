//! Error taxonomy for the download engine. One enum, surfaced to callers only
//! for the terminal cases listed in its doc comments; everything else is
//! absorbed by the scheduler (deactivation + retry) per spec §7.

use crate::peer::PeerId;

/// Terminal and per-peer errors the core can produce.
///
/// Only [`Error::NoPeersReachable`], [`Error::NoMetadata`],
/// [`Error::ChunkExhausted`], [`Error::IntegrityError`] and
/// [`Error::Cancelled`] are ever returned from a top-level download call;
/// the others are constructed internally and absorbed by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no peers reachable")]
    NoPeersReachable,

    #[error("no metadata: no connected peer answered the metadata request")]
    NoMetadata,

    #[error("transport error with peer {peer}: {cause}")]
    Transport { peer: PeerId, cause: String },

    #[error("chunk {index} timed out on peer {peer}")]
    ChunkTimeout { peer: PeerId, index: u64 },

    #[error("chunk {index} exhausted its retry budget across the peer set")]
    ChunkExhausted { index: u64 },

    #[error("integrity error: expected {expected}, got {actual}")]
    IntegrityError { expected: String, actual: String },

    #[error("download cancelled")]
    Cancelled,

    #[error("port mapping failed via {protocol}: {cause}")]
    MappingError { protocol: String, cause: String },

    #[error("all traversal methods exhausted for peer {peer}")]
    AllMethodsExhausted { peer: PeerId },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("message encode/decode error: {0}")]
    Wire(#[from] crate::wire::WireError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_message() {
        let e = Error::Validation("missing digest".into());
        assert_eq!(e.to_string(), "validation error: missing digest");
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
