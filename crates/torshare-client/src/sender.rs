//! Sender role
//!
//! Pushes one file to a receiver over a single stream: handshake, then
//! strictly sequential stop-and-wait chunks, then the completion exchange.

use crate::blocking;
use std::path::Path;
use std::time::{Duration, Instant};
use torshare_core::proto::{Channel, ReceiverMessage, SenderMessage};
use torshare_core::{ChunkStore, Error, FileMetadata, Result, TransportProvider};

/// Outcome of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Metadata that was announced to the receiver
    pub metadata: FileMetadata,
    /// Wall time from connect to SUCCESS
    pub elapsed: Duration,
}

impl TransferReport {
    /// Average throughput in bytes per second
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return self.metadata.filesize() as f64;
        }
        self.metadata.filesize() as f64 / secs
    }
}

/// Sends files through a transport provider
pub struct Sender<'a, T: TransportProvider> {
    transport: &'a T,
    store: ChunkStore,
    io_timeout: Duration,
}

impl<'a, T: TransportProvider> Sender<'a, T> {
    /// Create a sender splitting files into `chunk_size` pieces
    pub fn new(transport: &'a T, chunk_size: u32, io_timeout: Duration) -> Result<Self> {
        Ok(Self {
            transport,
            store: ChunkStore::new(chunk_size)?,
            io_timeout,
        })
    }

    /// Transfer the file at `path` to `address:port`.
    ///
    /// `encrypted` only labels the bytes; encrypt the file beforehand.
    /// `progress` is called with `(bytes_sent, total_bytes)` after every
    /// acknowledged chunk.
    pub async fn send_file<P>(
        &self,
        path: &Path,
        address: &str,
        port: u16,
        encrypted: bool,
        progress: P,
    ) -> Result<TransferReport>
    where
        P: Fn(u64, u64),
    {
        let metadata = {
            let store = self.store;
            let path = path.to_path_buf();
            blocking(move || store.metadata(&path, encrypted)).await?
        }
        .ok_or_else(|| Error::NotFound(path.display().to_string()))?;

        tracing::info!(
            "Sending {} ({}, {} chunks) to {}:{}",
            metadata.filename(),
            torshare_core::format_size(metadata.filesize()),
            metadata.total_chunks(),
            address,
            port
        );

        let started = Instant::now();
        let socket = self.transport.open_socket().await?;
        let stream = self.transport.connect(socket, address, port).await?;
        let mut channel = Channel::new(stream, self.io_timeout);

        self.handshake(&mut channel, &metadata).await?;

        let mut sent = 0u64;
        for index in 0..metadata.total_chunks() {
            self.send_chunk(&mut channel, path, &metadata, index).await?;
            sent += metadata.chunk_len(index).unwrap_or(0) as u64;
            progress(sent, metadata.filesize());
        }

        channel.send(&SenderMessage::Complete).await?;
        let result = channel.recv_line().await?;
        let _ = channel.shutdown().await;

        match result.as_deref().map(ReceiverMessage::decode) {
            Some(Ok(ReceiverMessage::Success)) => {
                let elapsed = started.elapsed();
                tracing::info!("Transfer of {} complete in {:.1?}", metadata.filename(), elapsed);
                Ok(TransferReport { metadata, elapsed })
            }
            Some(Ok(ReceiverMessage::ChecksumMismatch)) => Err(Error::ChecksumMismatch {
                expected: metadata.checksum().to_string(),
                actual: "rejected by receiver".to_string(),
            }),
            Some(_) => Err(Error::ProtocolViolation(format!(
                "transfer not accepted: {:?}",
                result.unwrap_or_default()
            ))),
            None => Err(Error::ProtocolViolation(
                "receiver closed before reporting a result".to_string(),
            )),
        }
    }

    async fn handshake(
        &self,
        channel: &mut Channel<T::Stream>,
        metadata: &FileMetadata,
    ) -> Result<()> {
        channel
            .send(&SenderMessage::Handshake(metadata.clone()))
            .await?;

        // A silent or vanished receiver is a rejection like any other reply
        let reply = channel
            .recv_line()
            .await
            .map_err(|e| Error::HandshakeRejected(e.to_string()))?;
        match reply {
            Some(line) if matches!(ReceiverMessage::decode(&line), Ok(ReceiverMessage::Ready)) => {
                tracing::debug!("Receiver ready for {}", metadata.filename());
                Ok(())
            }
            Some(line) => Err(Error::HandshakeRejected(line)),
            None => Err(Error::HandshakeRejected("connection closed".to_string())),
        }
    }

    async fn send_chunk(
        &self,
        channel: &mut Channel<T::Stream>,
        path: &Path,
        metadata: &FileMetadata,
        index: u64,
    ) -> Result<()> {
        let data = {
            let store = self.store;
            let path = path.to_path_buf();
            blocking(move || store.read_chunk(&path, index)).await?
        };

        let envelope = metadata.envelope(index).ok_or_else(|| Error::ChunkIo {
            index,
            reason: "index out of range".to_string(),
        })?;
        if data.len() != envelope.size as usize {
            // File changed underneath us since the checksum was taken
            return Err(Error::ChunkIo {
                index,
                reason: format!("read {} bytes, expected {}", data.len(), envelope.size),
            });
        }

        channel.send(&SenderMessage::ChunkHeader(envelope)).await?;
        channel.send_payload(&data).await?;

        let ack = channel
            .recv_line()
            .await
            .map_err(|e| Error::ChunkAckMismatch {
                index,
                got: e.to_string(),
            })?;
        match ack.as_deref().map(ReceiverMessage::decode) {
            Some(Ok(ReceiverMessage::ChunkAck { index: acked, ok: true })) if acked == index => {
                tracing::debug!(index, size = envelope.size, "Chunk acknowledged");
                Ok(())
            }
            _ => Err(Error::ChunkAckMismatch {
                index,
                got: ack.unwrap_or_else(|| "<closed>".to_string()),
            }),
        }
    }
}
