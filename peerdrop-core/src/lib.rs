//! `peerdrop_core`: a multi-peer, content-addressed chunk download engine
//! with pluggable NAT-traversal transport negotiation.
//!
//! The crate is organized around the pipeline a single download walks
//! through: address classification and connection plumbing
//! ([`address`], [`connector`], [`portmap`], [`punch`]) feed the traversal
//! orchestrator ([`orchestrator`]), which hands the scheduler
//! ([`scheduler`]) a live [`connection::Connection`] per peer. The
//! scheduler drives chunk requests over the wire protocol ([`wire`]) and
//! hands completed bytes to the file assembler ([`assembler`]), verifying
//! the finished file's digest before returning it.

pub mod address;
pub mod assembler;
pub mod connection;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod peer;
pub mod portmap;
pub mod punch;
pub mod registry;
pub mod scheduler;
pub mod signaling;
pub mod wire;

pub use assembler::Assembler;
pub use connection::{Connection, Transport};
pub use endpoint::{Endpoint, Protocol, TransportMethod};
pub use error::{Error, Result};
pub use orchestrator::{OrchestratorOptions, OrchestratorOutcome};
pub use peer::{PeerId, PeerStats};
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use scheduler::{
    DownloadHandle, DownloadRequest, PeerState, PeerStatusCallback, PeerTarget, ProgressCallback,
    SchedulerOptions,
};
pub use signaling::{InMemorySignaling, SignalingChannel};
pub use wire::{decode_chunk_payload, encode_chunk_payload, WireMessage};
