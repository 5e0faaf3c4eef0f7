//! Integration tests for the Torshare client
//!
//! These tests use the direct transport over loopback TCP to exercise the
//! full sender/receiver exchange without a running Tor.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use torshare_client::{ActiveDestinations, ConnectionListener, Receiver, Sender};
use torshare_core::proto::{Channel, ReceiverMessage, SenderMessage};
use torshare_core::transport::direct::DirectTransport;
use torshare_core::{chunk, crypto, Error, FileMetadata};

const MIB: u32 = 1024 * 1024;
const TIMEOUT: Duration = Duration::from_secs(10);

type Received = Arc<Mutex<Vec<(PathBuf, FileMetadata)>>>;

struct RunningListener {
    port: u16,
    received: Received,
    active: ActiveDestinations,
    cancel: CancellationToken,
    handle: JoinHandle<torshare_core::Result<()>>,
}

impl RunningListener {
    async fn start(download_dir: &Path) -> Self {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let receiver = Receiver::new(download_dir, TIMEOUT).on_received(Arc::new(
            move |path: &Path, metadata: &FileMetadata| {
                sink.lock()
                    .unwrap()
                    .push((path.to_path_buf(), metadata.clone()));
            },
        ));
        let active = receiver.active().clone();

        let listener = ConnectionListener::bind("127.0.0.1:0", receiver, 4)
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listener.run(cancel.clone()));

        Self { port, received, active, cancel, handle }
    }

    async fn stop(self) -> Vec<(PathBuf, FileMetadata)> {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
        let received = self.received.lock().unwrap().clone();
        received
    }
}

/// Receiver stand-in driven by the test instead of the real receiver role
async fn fake_receiver<F, Fut>(script: F) -> (u16, JoinHandle<Vec<String>>)
where
    F: FnOnce(Channel<tokio::net::TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Vec<String>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        script(Channel::new(sock, TIMEOUT)).await
    });
    (port, handle)
}

/// Collect remaining control lines until the peer hangs up
async fn drain(channel: &mut Channel<tokio::net::TcpStream>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(Some(line)) = channel.recv_line().await {
        lines.push(line);
    }
    lines
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Three 1 MiB chunks arrive intact and the receiver reports SUCCESS
#[tokio::test]
async fn test_unencrypted_transfer() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("video.bin");
    std::fs::write(&source, patterned(3 * MIB as usize)).unwrap();

    let listener = RunningListener::start(dst_dir.path()).await;
    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, MIB, TIMEOUT).unwrap();

    let report = sender
        .send_file(&source, "127.0.0.1", listener.port, false, |_, _| {})
        .await
        .unwrap();
    assert_eq!(report.metadata.total_chunks(), 3);

    let received = listener.stop().await;
    assert_eq!(received.len(), 1);
    let (path, metadata) = &received[0];
    assert_eq!(path, &dst_dir.path().join("video.bin"));
    assert_eq!(metadata.total_chunks(), 3);
    assert!(!metadata.encrypted());

    assert_eq!(
        crypto::checksum(path).unwrap(),
        crypto::checksum(&source).unwrap()
    );
    assert!(!chunk::staging_path(path).exists());
    assert!(!chunk::inventory_path(&chunk::staging_path(path)).exists());
}

/// The receiver stores the ciphertext container, which decrypts to the original
#[tokio::test]
async fn test_encrypted_transfer() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let plain = src_dir.path().join("note.txt");
    let container = src_dir.path().join("note.txt.encrypted");
    std::fs::write(&plain, b"ten bytes!").unwrap();
    crypto::encrypt_file(&plain, &container, "correct horse").unwrap();

    let listener = RunningListener::start(dst_dir.path()).await;
    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, MIB, TIMEOUT).unwrap();

    let report = sender
        .send_file(&container, "127.0.0.1", listener.port, true, |_, _| {})
        .await
        .unwrap();
    assert!(report.metadata.encrypted());

    let received = listener.stop().await;
    let (path, metadata) = &received[0];
    assert!(metadata.encrypted());

    let received_sum = crypto::checksum(path).unwrap();
    assert_eq!(received_sum, crypto::checksum(&container).unwrap());
    assert_ne!(received_sum, crypto::checksum(&plain).unwrap());

    let restored = dst_dir.path().join("note.txt");
    crypto::decrypt_file(path, &restored, "correct horse").unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), b"ten bytes!");
}

/// A withheld acknowledgment stops the sender before the next chunk
#[tokio::test]
async fn test_missing_ack_aborts() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("four.bin");
    std::fs::write(&source, patterned(4000)).unwrap();

    let (port, fake) = fake_receiver(|mut channel| async move {
        channel.recv_line().await.unwrap().unwrap();
        channel.reply(ReceiverMessage::Ready).await.unwrap();

        for expected in 0..3u64 {
            let line = channel.recv_line().await.unwrap().unwrap();
            let SenderMessage::ChunkHeader(env) = SenderMessage::decode(&line).unwrap() else {
                panic!("Expected chunk header, got {}", line);
            };
            assert_eq!(env.index, expected);
            channel.recv_payload(env.size as usize).await.unwrap();

            // Acknowledge chunks 0 and 1; repeat the previous ack for chunk 2
            let acked = expected.min(1);
            channel
                .reply(ReceiverMessage::ChunkAck { index: acked, ok: true })
                .await
                .unwrap();
        }
        drain(&mut channel).await
    })
    .await;

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, TIMEOUT).unwrap();
    let err = sender
        .send_file(&source, "127.0.0.1", port, false, |_, _| {})
        .await
        .unwrap_err();

    match err {
        Error::ChunkAckMismatch { index, got } => {
            assert_eq!(index, 2);
            assert_eq!(got, "CHUNK_1_OK");
        }
        other => panic!("Expected ChunkAckMismatch, got {:?}", other),
    }

    let after = fake.await.unwrap();
    assert!(after.is_empty(), "sender kept talking: {:?}", after);
}

/// Anything but READY aborts before the first chunk header
#[tokio::test]
async fn test_handshake_rejected() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("small.txt");
    std::fs::write(&source, b"hello").unwrap();

    let (port, fake) = fake_receiver(|mut channel| async move {
        channel.recv_line().await.unwrap().unwrap();
        channel.send_line(b"NOT_READY\n").await.unwrap();
        drain(&mut channel).await
    })
    .await;

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, TIMEOUT).unwrap();
    let err = sender
        .send_file(&source, "127.0.0.1", port, false, |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeRejected(ref got) if got == "NOT_READY"));

    assert!(fake.await.unwrap().is_empty());
}

/// A wrong declared checksum yields CHECKSUM_MISMATCH and no notification
#[tokio::test]
async fn test_checksum_mismatch() {
    let dir = TempDir::new().unwrap();
    let listener = RunningListener::start(dir.path()).await;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", listener.port))
        .await
        .unwrap();
    let mut peer = Channel::new(stream, TIMEOUT);

    let bogus = "0".repeat(64);
    let meta = FileMetadata::new("tampered.txt", 5, 1024, bogus, false).unwrap();
    peer.send(&SenderMessage::Handshake(meta.clone())).await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "READY");

    peer.send(&SenderMessage::ChunkHeader(meta.envelope(0).unwrap()))
        .await
        .unwrap();
    peer.send_payload(b"hello").await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "CHUNK_0_OK");

    peer.send(&SenderMessage::Complete).await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "CHECKSUM_MISMATCH");
    assert!(peer.recv_line().await.unwrap().is_none());

    let dest = dir.path().join("tampered.txt");
    assert!(listener.stop().await.is_empty());
    assert!(!dest.exists());
    assert!(!chunk::staging_path(&dest).exists());
}

/// A failed transfer of `movie` leaves a received `movie.part` alone
#[tokio::test]
async fn test_failed_transfer_spares_part_named_file() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("movie.part");
    std::fs::write(&source, patterned(2500)).unwrap();

    let listener = RunningListener::start(dst_dir.path()).await;
    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, TIMEOUT).unwrap();
    sender
        .send_file(&source, "127.0.0.1", listener.port, false, |_, _| {})
        .await
        .unwrap();

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", listener.port))
        .await
        .unwrap();
    let mut peer = Channel::new(stream, TIMEOUT);
    let meta = FileMetadata::new("movie", 5, 1024, "0".repeat(64), false).unwrap();
    peer.send(&SenderMessage::Handshake(meta.clone())).await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "READY");
    peer.send(&SenderMessage::ChunkHeader(meta.envelope(0).unwrap()))
        .await
        .unwrap();
    peer.send_payload(b"movie").await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "CHUNK_0_OK");
    peer.send(&SenderMessage::Complete).await.unwrap();
    assert_eq!(peer.recv_line().await.unwrap().unwrap(), "CHECKSUM_MISMATCH");
    assert!(peer.recv_line().await.unwrap().is_none());

    let received = listener.stop().await;
    assert_eq!(received.len(), 1);
    assert!(!dst_dir.path().join("movie").exists());
    assert_eq!(
        std::fs::read(dst_dir.path().join("movie.part")).unwrap(),
        patterned(2500)
    );
}

/// A receiver that stops answering mid-transfer surfaces as a missing ack
#[tokio::test]
async fn test_silent_receiver_times_out_on_ack() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("four.bin");
    std::fs::write(&source, patterned(4000)).unwrap();

    let (port, fake) = fake_receiver(|mut channel| async move {
        channel.recv_line().await.unwrap().unwrap();
        channel.reply(ReceiverMessage::Ready).await.unwrap();

        for expected in 0..3u64 {
            let line = channel.recv_line().await.unwrap().unwrap();
            let SenderMessage::ChunkHeader(env) = SenderMessage::decode(&line).unwrap() else {
                panic!("Expected chunk header, got {}", line);
            };
            channel.recv_payload(env.size as usize).await.unwrap();
            if expected < 2 {
                channel
                    .reply(ReceiverMessage::ChunkAck { index: expected, ok: true })
                    .await
                    .unwrap();
            }
        }
        // Hold the connection open until the sender gives up
        drain(&mut channel).await
    })
    .await;

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, Duration::from_millis(300)).unwrap();
    let err = sender
        .send_file(&source, "127.0.0.1", port, false, |_, _| {})
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::ChunkAckMismatch { index: 2, .. }),
        "unexpected error: {:?}",
        err
    );

    assert!(fake.await.unwrap().is_empty());
}

/// No reply to the handshake is a rejection, not a bare protocol error
#[tokio::test]
async fn test_silent_receiver_rejects_handshake() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("small.txt");
    std::fs::write(&source, b"hello").unwrap();

    let (port, fake) = fake_receiver(|mut channel| async move {
        channel.recv_line().await.unwrap().unwrap();
        drain(&mut channel).await
    })
    .await;

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, Duration::from_millis(300)).unwrap();
    let err = sender
        .send_file(&source, "127.0.0.1", port, false, |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeRejected(_)), "unexpected error: {:?}", err);

    assert!(fake.await.unwrap().is_empty());
}

/// A second session for a destination already in flight gets BUSY
#[tokio::test]
async fn test_busy_destination() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("shared.txt");
    std::fs::write(&source, b"contended").unwrap();

    let listener = RunningListener::start(dst_dir.path()).await;
    let guard = listener
        .active
        .claim(&dst_dir.path().join("shared.txt"))
        .unwrap();

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, TIMEOUT).unwrap();
    let err = sender
        .send_file(&source, "127.0.0.1", listener.port, false, |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HandshakeRejected(ref got) if got == "BUSY"));

    drop(guard);
    sender
        .send_file(&source, "127.0.0.1", listener.port, false, |_, _| {})
        .await
        .unwrap();

    assert_eq!(listener.stop().await.len(), 1);
}

/// Failed sessions do not stop the accept loop
#[tokio::test]
async fn test_listener_survives_bad_session() {
    let src_dir = TempDir::new().unwrap();
    let dst_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("after.txt");
    std::fs::write(&source, patterned(3000)).unwrap();

    let listener = RunningListener::start(dst_dir.path()).await;

    {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", listener.port))
            .await
            .unwrap();
        let mut peer = Channel::new(stream, TIMEOUT);
        peer.send_line(b"this is not json\n").await.unwrap();
        assert!(peer.recv_line().await.unwrap().is_none());
    }

    let transport = DirectTransport::default();
    let sender = Sender::new(&transport, 1024, TIMEOUT).unwrap();
    sender
        .send_file(&source, "127.0.0.1", listener.port, false, |_, _| {})
        .await
        .unwrap();

    let received = listener.stop().await;
    assert_eq!(received.len(), 1);
    assert_eq!(
        std::fs::read(&received[0].0).unwrap(),
        std::fs::read(&source).unwrap()
    );
}
