//! Inbound connection listener

use crate::receiver::{Receiver, SessionOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use torshare_core::Result;

/// Accepts connections and runs one receiver session per connection
pub struct ConnectionListener {
    listener: TcpListener,
    receiver: Arc<Receiver>,
    sessions: Arc<Semaphore>,
}

impl ConnectionListener {
    /// Bind the listening socket; at most `max_sessions` sessions run at once
    pub async fn bind(
        addr: impl ToSocketAddrs,
        receiver: Receiver,
        max_sessions: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            receiver: Arc::new(receiver),
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `cancel` fires, then wait for running sessions to end.
    ///
    /// A failed session is logged and never stops the loop.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Listening on {}", self.local_addr()?);
        let mut tasks = JoinSet::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Session task failed: {}", e);
                    }
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.sessions.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tracing::debug!("Accepted connection from {}", peer);
            let receiver = self.receiver.clone();
            let session_cancel = cancel.child_token();
            tasks.spawn(async move {
                let _permit = permit;
                match receiver.handle(stream, session_cancel).await {
                    Ok(SessionOutcome::Received { path, .. }) => {
                        tracing::debug!("Session from {} stored {}", peer, path.display());
                    }
                    Ok(outcome) => {
                        tracing::debug!("Session from {} ended: {:?}", peer, outcome);
                    }
                    Err(e) => {
                        tracing::warn!("Session from {} failed: {}", peer, e);
                    }
                }
            });
        }

        tracing::info!("Listener stopping, waiting for {} session(s)", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Session task failed: {}", e);
            }
        }
        Ok(())
    }
}
