//! Torshare Core - Shared types, protocol, and utilities
//!
//! This crate provides the building blocks for moving a file between two
//! peers over Tor: chunked storage, the stop-and-wait transfer protocol,
//! password-based file encryption, and the transport abstraction.

pub mod chunk;
pub mod crypto;
pub mod error;
pub mod proto;
pub mod tor_transport;
pub mod transport;
pub mod types;

pub use chunk::ChunkStore;
pub use error::{Error, Result};
pub use tor_transport::{TorConfig, TorTransport};
pub use transport::TransportProvider;
pub use types::*;

/// Default chunk size: 1 MiB
pub const CHUNK_SIZE: u32 = 1024 * 1024;

/// Largest chunk size a receiver will accept in a handshake
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;
