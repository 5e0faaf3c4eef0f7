//! Transport abstraction for anonymized peer connections
//!
//! The protocol layer only needs stream sockets. This trait lets the Tor
//! SOCKS transport be swapped for a plain TCP stand-in in tests and in
//! `--direct` mode.

use crate::Result;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Supplier of anonymized stream sockets
#[allow(async_fn_in_trait)]
pub trait TransportProvider: Send + Sync {
    /// A socket attached to the local proxy, not yet connected to a peer
    type Socket: Send;
    /// A stream connected end-to-end to the peer
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Make sure the local proxy is reachable, polling up to `timeout`.
    ///
    /// Idempotent: returns immediately if it is already up.
    async fn ensure_ready(&self, timeout: Duration) -> Result<()>;

    /// Open a socket routed through the proxy
    async fn open_socket(&self) -> Result<Self::Socket>;

    /// Ask the proxy to connect `socket` to `address:port`
    async fn connect(&self, socket: Self::Socket, address: &str, port: u16) -> Result<Self::Stream>;

    /// Request a new circuit. Best effort; failure never affects transfers in flight.
    async fn renew_circuit(&self) -> Result<()>;
}

pub mod direct {
    //! Plain TCP transport without any proxy

    use super::*;
    use crate::Error;
    use tokio::net::TcpStream;

    /// Connects straight to the peer. Used by tests and `--direct` mode.
    #[derive(Debug, Clone)]
    pub struct DirectTransport {
        connect_timeout: Duration,
    }

    impl DirectTransport {
        pub fn new(connect_timeout: Duration) -> Self {
            Self { connect_timeout }
        }
    }

    impl Default for DirectTransport {
        fn default() -> Self {
            Self::new(Duration::from_secs(30))
        }
    }

    impl TransportProvider for DirectTransport {
        type Socket = ();
        type Stream = TcpStream;

        async fn ensure_ready(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn open_socket(&self) -> Result<()> {
            Ok(())
        }

        async fn connect(&self, _socket: (), address: &str, port: u16) -> Result<TcpStream> {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect((address, port))).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    Ok(stream)
                }
                Ok(Err(e)) => Err(Error::TransportUnavailable(format!(
                    "connect to {}:{} failed: {}",
                    address, port, e
                ))),
                Err(_) => Err(Error::TransportUnavailable(format!(
                    "connect to {}:{} timed out",
                    address, port
                ))),
            }
        }

        async fn renew_circuit(&self) -> Result<()> {
            tracing::debug!("Direct transport has no circuits to renew");
            Ok(())
        }
    }

}
