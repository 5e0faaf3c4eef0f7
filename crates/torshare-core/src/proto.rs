//! Wire protocol: control messages and framing
//!
//! One stream carries two kinds of frames:
//!
//! ```text
//! control:  <UTF-8 line>\n          JSON object or literal token
//! payload:  <size raw bytes>        only right after a chunk header
//! ```
//!
//! ```text
//! sender -> receiver   {"action":"send_file","filename":..,"filesize":..,"chunks":..,
//!                       "checksum":..,"chunk_size":..,"encrypted":..}
//! receiver -> sender   READY | BUSY
//! sender -> receiver   {"index":..,"size":..,"final":..} + payload
//! receiver -> sender   CHUNK_<index>_OK | CHUNK_<index>_FAIL
//! sender -> receiver   TRANSFER_COMPLETE
//! receiver -> sender   SUCCESS | CHECKSUM_MISMATCH | TRANSFER_INCOMPLETE
//! ```

use crate::{ChunkEnvelope, Error, FileMetadata, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// The only action a handshake may carry
pub const ACTION_SEND_FILE: &str = "send_file";

/// Upper bound on one control line
pub const MAX_CONTROL_LINE: usize = 64 * 1024;

const READY: &str = "READY";
const BUSY: &str = "BUSY";
const TRANSFER_COMPLETE: &str = "TRANSFER_COMPLETE";
const SUCCESS: &str = "SUCCESS";
const CHECKSUM_MISMATCH: &str = "CHECKSUM_MISMATCH";
const TRANSFER_INCOMPLETE: &str = "TRANSFER_INCOMPLETE";

/// Messages sent by the sender role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderMessage {
    Handshake(FileMetadata),
    ChunkHeader(ChunkEnvelope),
    Complete,
}

/// Messages sent by the receiver role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverMessage {
    Ready,
    /// Another session is already writing the same destination
    Busy,
    ChunkAck { index: u64, ok: bool },
    Success,
    ChecksumMismatch,
    Incomplete,
}

/// JSON shape of the handshake frame
#[derive(Debug, Serialize, Deserialize)]
struct HandshakeFrame {
    action: String,
    filename: String,
    filesize: u64,
    chunks: u64,
    checksum: String,
    chunk_size: u32,
    encrypted: bool,
}

#[derive(Deserialize)]
struct ActionTag {
    action: Option<String>,
}

impl SenderMessage {
    /// Encode as one newline-terminated control line
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut line = match self {
            SenderMessage::Handshake(meta) => serde_json::to_vec(&HandshakeFrame {
                action: ACTION_SEND_FILE.to_string(),
                filename: meta.filename().to_string(),
                filesize: meta.filesize(),
                chunks: meta.total_chunks(),
                checksum: meta.checksum().to_string(),
                chunk_size: meta.chunk_size(),
                encrypted: meta.encrypted(),
            })?,
            SenderMessage::ChunkHeader(envelope) => serde_json::to_vec(envelope)?,
            SenderMessage::Complete => TRANSFER_COMPLETE.as_bytes().to_vec(),
        };
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one control line (without its newline)
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim();
        if line == TRANSFER_COMPLETE {
            return Ok(SenderMessage::Complete);
        }
        if !line.starts_with('{') {
            return Err(Error::ProtocolViolation(format!("unexpected token {:?}", line)));
        }

        let tag: ActionTag = serde_json::from_str(line)
            .map_err(|e| Error::ProtocolViolation(format!("malformed control frame: {}", e)))?;

        match tag.action.as_deref() {
            None => {
                let envelope: ChunkEnvelope = serde_json::from_str(line)
                    .map_err(|e| Error::ProtocolViolation(format!("malformed chunk header: {}", e)))?;
                Ok(SenderMessage::ChunkHeader(envelope))
            }
            Some(ACTION_SEND_FILE) => {
                let frame: HandshakeFrame = serde_json::from_str(line)
                    .map_err(|e| Error::ProtocolViolation(format!("malformed handshake: {}", e)))?;
                let meta = FileMetadata::new(
                    frame.filename,
                    frame.filesize,
                    frame.chunk_size,
                    frame.checksum,
                    frame.encrypted,
                )?;
                if meta.total_chunks() != frame.chunks {
                    return Err(Error::InvalidMetadata(format!(
                        "chunks {} does not match filesize {} / chunk_size {}",
                        frame.chunks,
                        meta.filesize(),
                        meta.chunk_size()
                    )));
                }
                Ok(SenderMessage::Handshake(meta))
            }
            Some(other) => Err(Error::ProtocolViolation(format!("unknown action {:?}", other))),
        }
    }
}

impl ReceiverMessage {
    /// Encode as one newline-terminated control line
    pub fn encode(&self) -> Vec<u8> {
        format!("{}\n", self).into_bytes()
    }

    /// Decode one control line (without its newline)
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim();
        let msg = match line {
            READY => ReceiverMessage::Ready,
            BUSY => ReceiverMessage::Busy,
            SUCCESS => ReceiverMessage::Success,
            CHECKSUM_MISMATCH => ReceiverMessage::ChecksumMismatch,
            TRANSFER_INCOMPLETE => ReceiverMessage::Incomplete,
            _ => parse_ack(line)
                .ok_or_else(|| Error::ProtocolViolation(format!("unexpected token {:?}", line)))?,
        };
        Ok(msg)
    }
}

fn parse_ack(line: &str) -> Option<ReceiverMessage> {
    let rest = line.strip_prefix("CHUNK_")?;
    let (index, ok) = if let Some(index) = rest.strip_suffix("_OK") {
        (index, true)
    } else {
        (rest.strip_suffix("_FAIL")?, false)
    };
    // Reject signs and whitespace that `parse` would otherwise accept
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(ReceiverMessage::ChunkAck {
        index: index.parse().ok()?,
        ok,
    })
}

impl fmt::Display for ReceiverMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverMessage::Ready => f.write_str(READY),
            ReceiverMessage::Busy => f.write_str(BUSY),
            ReceiverMessage::ChunkAck { index, ok: true } => write!(f, "CHUNK_{}_OK", index),
            ReceiverMessage::ChunkAck { index, ok: false } => write!(f, "CHUNK_{}_FAIL", index),
            ReceiverMessage::Success => f.write_str(SUCCESS),
            ReceiverMessage::ChecksumMismatch => f.write_str(CHECKSUM_MISMATCH),
            ReceiverMessage::Incomplete => f.write_str(TRANSFER_INCOMPLETE),
        }
    }
}

/// Framed view over one peer stream.
///
/// Every read is bounded by `timeout`; expiry is a protocol violation.
pub struct Channel<S> {
    stream: BufReader<S>,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            timeout,
        }
    }

    /// Write raw control-line bytes and flush
    pub async fn send_line(&mut self, line: &[u8]) -> Result<()> {
        self.stream.write_all(line).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, msg: &SenderMessage) -> Result<()> {
        let line = msg.encode()?;
        self.send_line(&line).await
    }

    pub async fn reply(&mut self, msg: ReceiverMessage) -> Result<()> {
        self.send_line(&msg.encode()).await
    }

    /// Write a chunk payload
    pub async fn send_payload(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one control line, accumulating across reads until `\n`.
    ///
    /// Returns `None` if the peer closed the stream before sending anything.
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        let timeout = self.timeout;
        let mut buf = Vec::new();
        let limit = MAX_CONTROL_LINE as u64 + 1;

        let n = tokio::time::timeout(timeout, (&mut self.stream).take(limit).read_until(b'\n', &mut buf))
            .await
            .map_err(|_| Error::ProtocolViolation(format!("no control message within {:?}", timeout)))??;

        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            if buf.len() > MAX_CONTROL_LINE {
                return Err(Error::ProtocolViolation(format!(
                    "control line exceeds {} bytes",
                    MAX_CONTROL_LINE
                )));
            }
            return Err(Error::ProtocolViolation(
                "peer closed mid control line".to_string(),
            ));
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| Error::ProtocolViolation(format!("control line is not UTF-8: {}", e)))
    }

    /// Read exactly `size` payload bytes
    pub async fn recv_payload(&mut self, size: usize) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let mut data = vec![0u8; size];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut data)).await {
            Ok(Ok(_)) => Ok(data),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
                Error::ProtocolViolation(format!("peer closed before {} payload bytes arrived", size)),
            ),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::ProtocolViolation(format!(
                "payload not received within {:?}",
                timeout
            ))),
        }
    }

    /// Flush and shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_handshake_frame() {
        let meta = FileMetadata::new("movie.mkv", 3000, 1024, SUM, true).unwrap();
        let line = SenderMessage::Handshake(meta.clone()).encode().unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["action"], "send_file");
        assert_eq!(value["filename"], "movie.mkv");
        assert_eq!(value["filesize"], 3000);
        assert_eq!(value["chunks"], 3);
        assert_eq!(value["chunk_size"], 1024);
        assert_eq!(value["encrypted"], true);

        let text = std::str::from_utf8(&line).unwrap();
        assert_eq!(SenderMessage::decode(text).unwrap(), SenderMessage::Handshake(meta));
    }

    #[test]
    fn test_handshake_rejects_inconsistent_chunks() {
        let line = format!(
            r#"{{"action":"send_file","filename":"a","filesize":10,"chunks":5,"checksum":"{}","chunk_size":4,"encrypted":false}}"#,
            SUM
        );
        assert!(matches!(SenderMessage::decode(&line), Err(Error::InvalidMetadata(_))));

        let traversal = format!(
            r#"{{"action":"send_file","filename":"../a","filesize":10,"chunks":3,"checksum":"{}","chunk_size":4,"encrypted":false}}"#,
            SUM
        );
        assert!(SenderMessage::decode(&traversal).is_err());
    }

    #[test]
    fn test_unknown_action() {
        let err = SenderMessage::decode(r#"{"action":"list_files"}"#).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn test_sender_tokens() {
        assert_eq!(SenderMessage::Complete.encode().unwrap(), b"TRANSFER_COMPLETE\n");
        assert_eq!(SenderMessage::decode("TRANSFER_COMPLETE").unwrap(), SenderMessage::Complete);
        assert_eq!(
            SenderMessage::decode(r#"{"index":2,"size":7,"final":true}"#).unwrap(),
            SenderMessage::ChunkHeader(ChunkEnvelope { index: 2, size: 7, is_final: true })
        );
        assert!(SenderMessage::decode("HELLO").is_err());
    }

    #[test]
    fn test_receiver_tokens() {
        let cases = [
            ("READY", ReceiverMessage::Ready),
            ("BUSY", ReceiverMessage::Busy),
            ("SUCCESS", ReceiverMessage::Success),
            ("CHECKSUM_MISMATCH", ReceiverMessage::ChecksumMismatch),
            ("TRANSFER_INCOMPLETE", ReceiverMessage::Incomplete),
            ("CHUNK_0_OK", ReceiverMessage::ChunkAck { index: 0, ok: true }),
            ("CHUNK_17_FAIL", ReceiverMessage::ChunkAck { index: 17, ok: false }),
        ];
        for (text, msg) in cases {
            assert_eq!(ReceiverMessage::decode(text).unwrap(), msg);
            assert_eq!(msg.encode(), format!("{}\n", text).into_bytes());
        }

        for bad in ["NOT_READY", "CHUNK__OK", "CHUNK_+1_OK", "CHUNK_1_MAYBE", ""] {
            assert!(ReceiverMessage::decode(bad).is_err(), "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_channel_accumulates_split_lines() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = Channel::new(server, Duration::from_secs(5));

        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(b"{\"index\":0,").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"\"size\":3,\"final\":true}\nab").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"cTRANSFER_COMPLETE\n").await.unwrap();
            client
        });

        let header = server.recv_line().await.unwrap().unwrap();
        assert_eq!(
            SenderMessage::decode(&header).unwrap(),
            SenderMessage::ChunkHeader(ChunkEnvelope { index: 0, size: 3, is_final: true })
        );
        assert_eq!(server.recv_payload(3).await.unwrap(), b"abc");
        assert_eq!(server.recv_line().await.unwrap().unwrap(), "TRANSFER_COMPLETE");

        drop(writer.await.unwrap());
        assert!(server.recv_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_short_payload() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = Channel::new(server, Duration::from_secs(5));
        {
            let mut client = client;
            client.write_all(b"12").await.unwrap();
        }
        let err = server.recv_payload(5).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_channel_read_timeout() {
        let (_client, server) = tokio::io::duplex(64);
        let mut server = Channel::new(server, Duration::from_millis(50));
        let err = server.recv_line().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_channel_oversized_line() {
        let (client, server) = tokio::io::duplex(MAX_CONTROL_LINE * 2);
        let mut server = Channel::new(server, Duration::from_secs(5));
        let mut client = client;
        client.write_all(&vec![b'x'; MAX_CONTROL_LINE + 10]).await.unwrap();
        let err = server.recv_line().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
