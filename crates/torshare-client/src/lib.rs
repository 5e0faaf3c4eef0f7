//! Torshare Client Library
//!
//! Sender and receiver roles of the transfer protocol, the inbound
//! connection listener, configuration, and the local transfer history.

pub mod config;
pub mod history;
pub mod listener;
pub mod receiver;
pub mod sender;

pub use listener::ConnectionListener;
pub use receiver::{ActiveDestinations, OnFileReceived, Receiver, SessionOutcome};
pub use sender::{Sender, TransferReport};

/// Run filesystem-heavy work off the async reactor
pub(crate) async fn blocking<F, R>(f: F) -> torshare_core::Result<R>
where
    F: FnOnce() -> torshare_core::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| torshare_core::Error::Io(std::io::Error::other(e)))?
}
