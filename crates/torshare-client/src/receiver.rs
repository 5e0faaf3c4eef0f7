//! Receiver role
//!
//! Handles one inbound connection: validates the handshake, stores chunks
//! in a staging file, and verifies the checksum before moving the file
//! into the download directory.

use crate::blocking;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use torshare_core::chunk::{self, ChunkStore};
use torshare_core::proto::{Channel, ReceiverMessage, SenderMessage};
use torshare_core::{crypto, Error, FileMetadata, Result};

/// Called after a file has been verified and moved into place
pub type OnFileReceived = Arc<dyn Fn(&Path, &FileMetadata) + Send + Sync>;

/// How a session ended, when it did not fail outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// File verified and stored at `path`
    Received { path: PathBuf, metadata: FileMetadata },
    /// Checksum did not match; nothing was kept
    ChecksumMismatch,
    /// Sender did not finish with TRANSFER_COMPLETE
    Incomplete,
    /// Another session already owns the destination
    Busy,
    /// Peer closed without sending anything
    Idle,
}

/// Destination paths currently being written by some session
#[derive(Debug, Clone, Default)]
pub struct ActiveDestinations {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ActiveDestinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for the lifetime of the returned guard, or `None` if taken
    pub fn claim(&self, path: &Path) -> Option<DestinationGuard> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(path.to_path_buf()) {
            return None;
        }
        Some(DestinationGuard {
            owner: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_active(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

/// Releases a claimed destination on drop
#[derive(Debug)]
pub struct DestinationGuard {
    owner: ActiveDestinations,
    path: PathBuf,
}

impl Drop for DestinationGuard {
    fn drop(&mut self) {
        self.owner
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

/// Receiver side of the transfer protocol, shared by all sessions
#[derive(Clone)]
pub struct Receiver {
    download_dir: PathBuf,
    io_timeout: Duration,
    active: ActiveDestinations,
    on_received: Option<OnFileReceived>,
}

impl Receiver {
    pub fn new(download_dir: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            download_dir: download_dir.into(),
            io_timeout,
            active: ActiveDestinations::new(),
            on_received: None,
        }
    }

    /// Register the file-received notification
    pub fn on_received(mut self, callback: OnFileReceived) -> Self {
        self.on_received = Some(callback);
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn active(&self) -> &ActiveDestinations {
        &self.active
    }

    /// Serve one connection until the session ends or `cancel` fires.
    ///
    /// The stream is closed on return either way.
    pub async fn handle<S>(&self, stream: S, cancel: CancellationToken) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut channel = Channel::new(stream, self.io_timeout);
        let outcome = tokio::select! {
            outcome = self.session(&mut channel) => outcome,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let _ = channel.shutdown().await;
        outcome
    }

    async fn session<S>(&self, channel: &mut Channel<S>) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(line) = channel.recv_line().await? else {
            return Ok(SessionOutcome::Idle);
        };

        // Malformed or unknown requests close without a reply
        let metadata = match SenderMessage::decode(&line)? {
            SenderMessage::Handshake(metadata) => metadata,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected handshake, got {:?}",
                    other
                )))
            }
        };

        let dest = self.download_dir.join(metadata.filename());
        let Some(_guard) = self.active.claim(&dest) else {
            tracing::warn!("Rejecting {}: already being received", dest.display());
            channel.reply(ReceiverMessage::Busy).await?;
            return Ok(SessionOutcome::Busy);
        };

        let store = ChunkStore::new(metadata.chunk_size())?;
        let staging = chunk::staging_path(&dest);
        {
            let staging = staging.clone();
            blocking(move || store.begin(&staging)).await?;
        }

        tracing::info!(
            "Receiving {} ({} bytes, {} chunks, encrypted: {})",
            metadata.filename(),
            metadata.filesize(),
            metadata.total_chunks(),
            metadata.encrypted()
        );

        let outcome = self
            .receive_file(channel, store, &metadata, &staging, &dest)
            .await;
        match outcome {
            Ok(SessionOutcome::Received { .. }) => {}
            _ => {
                if let Err(e) = store.discard(&staging) {
                    tracing::warn!("Failed to remove {}: {}", staging.display(), e);
                }
            }
        }
        outcome
    }

    async fn receive_file<S>(
        &self,
        channel: &mut Channel<S>,
        store: ChunkStore,
        metadata: &FileMetadata,
        staging: &Path,
        dest: &Path,
    ) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        channel.reply(ReceiverMessage::Ready).await?;

        let mut received_chunks = 0u64;
        while received_chunks < metadata.total_chunks() {
            let line = channel.recv_line().await?.ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "peer closed after {} of {} chunks",
                    received_chunks,
                    metadata.total_chunks()
                ))
            })?;

            let envelope = match SenderMessage::decode(&line)? {
                SenderMessage::ChunkHeader(envelope) => envelope,
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "expected chunk header, got {:?}",
                        other
                    )))
                }
            };
            if metadata.envelope(envelope.index) != Some(envelope) {
                return Err(Error::ProtocolViolation(format!(
                    "chunk header {:?} does not fit the announced file",
                    envelope
                )));
            }

            let data = channel.recv_payload(envelope.size as usize).await?;
            let index = envelope.index;
            let written = {
                let staging = staging.to_path_buf();
                blocking(move || store.write_chunk(&staging, index, &data)).await
            };

            match written {
                Ok(()) => {
                    channel
                        .reply(ReceiverMessage::ChunkAck { index, ok: true })
                        .await?;
                    received_chunks += 1;
                    tracing::debug!(index, received_chunks, "Stored chunk");
                }
                Err(e) => {
                    let _ = channel
                        .reply(ReceiverMessage::ChunkAck { index, ok: false })
                        .await;
                    return Err(e);
                }
            }
        }

        let completion = channel.recv_line().await?;
        if !matches!(
            completion.as_deref().map(SenderMessage::decode),
            Some(Ok(SenderMessage::Complete))
        ) {
            tracing::warn!("{}: no completion after last chunk", metadata.filename());
            let _ = channel.reply(ReceiverMessage::Incomplete).await;
            return Ok(SessionOutcome::Incomplete);
        }

        let actual = {
            let staging = staging.to_path_buf();
            blocking(move || crypto::checksum(&staging)).await?
        };
        if actual != metadata.checksum() {
            tracing::warn!(
                "Checksum mismatch for {}: expected {}, got {}",
                metadata.filename(),
                metadata.checksum(),
                actual
            );
            channel.reply(ReceiverMessage::ChecksumMismatch).await?;
            return Ok(SessionOutcome::ChecksumMismatch);
        }

        {
            let staging = staging.to_path_buf();
            let dest = dest.to_path_buf();
            let total = metadata.total_chunks();
            if let Err(e) = blocking(move || store.reassemble(&staging, &dest, total)).await {
                let _ = channel.reply(ReceiverMessage::Incomplete).await;
                return Err(e);
            }
        }

        channel.reply(ReceiverMessage::Success).await?;
        tracing::info!("Received {} -> {}", metadata.filename(), dest.display());

        if let Some(callback) = &self.on_received {
            callback(dest, metadata);
        }

        Ok(SessionOutcome::Received {
            path: dest.to_path_buf(),
            metadata: metadata.clone(),
        })
    }
}
