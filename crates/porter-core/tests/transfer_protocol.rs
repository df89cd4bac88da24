//! End-to-end tests of the transfer protocol: a live server thread on an
//! ephemeral loopback port, exercised through the public client API.

use porter_core::checksum::Md5Window;
use porter_core::client::{NoFreeSpaceCallback, TransferClient};
use porter_core::errors::TransferStatus;
use porter_core::protocol::{
    CHECKPOINT_DIST, ID_FILESIZE, ID_GET_FILE_RESUME_HASH,
};
use porter_core::server::FileServer;
use porter_core::session::SessionRegistry;
use porter_core::stack::FrameStack;
use porter_core::wire::WireReader;
use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn start_server(root: Option<PathBuf>, sessions: Arc<SessionRegistry>) -> SocketAddr {
    let server = FileServer::bind("127.0.0.1:0", root, sessions, None).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });
    addr
}

fn connected_client(addr: SocketAddr, version: u8) -> TransferClient {
    let mut client = TransferClient::new(version, "test-identity");
    client.set_server_timeout(Duration::from_secs(2));
    client.set_reconnection_timeout(Duration::from_secs(2));
    assert_eq!(client.connect(addr), TransferStatus::Connected);
    client
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_small_download_hashed() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), b"hello transfer").unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );

    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("hello.txt", &mut sink, true),
        TransferStatus::Success
    );
    assert_eq!(sink.into_inner(), b"hello transfer");
}

#[test]
fn test_checkpointed_download_spans_boundaries() {
    // 1.5 MiB: boundaries at 512 KiB, 1024 KiB and 1536 KiB, three trailers.
    let content = patterned(3 * CHECKPOINT_DIST as usize / 2);
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("big.bin"), &content).unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );

    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("big.bin", &mut sink, true),
        TransferStatus::Success
    );
    let result = sink.into_inner();
    assert_eq!(result.len(), content.len());
    assert_eq!(result, content);
    // Payload plus the FILESIZE header and three 16-byte trailers.
    assert_eq!(
        client.transferred_bytes(),
        content.len() as u64 + 9 + 3 * 16
    );
}

#[test]
fn test_zero_byte_file_is_immediate_success() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("empty"), b"").unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );

    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("empty", &mut sink, true),
        TransferStatus::Success
    );
    assert!(sink.into_inner().is_empty());
}

#[test]
fn test_missing_file_and_missing_root() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );
    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("nope.bin", &mut sink, true),
        TransferStatus::FileDoesntExist
    );

    let addr = start_server(None, Arc::new(SessionRegistry::new()));
    let mut client = connected_client(addr, 2);
    assert_eq!(
        client.get_file("whatever", &mut sink, true),
        TransferStatus::BaseDirLost
    );
}

#[test]
fn test_unhashed_and_legacy_protocol_downloads() {
    let content = patterned(700 * 1024);
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("plain.bin"), &content).unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );

    // Version 2 client with hashing disabled drops to resumable-plain.
    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("plain.bin", &mut sink, false),
        TransferStatus::Success
    );
    assert_eq!(sink.into_inner(), content);

    // Version 0 client.
    let mut client = connected_client(addr, 0);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("plain.bin", &mut sink, true),
        TransferStatus::Success
    );
    assert_eq!(sink.into_inner(), content);
}

#[test]
fn test_list_returns_session_entries() {
    let sessions = Arc::new(SessionRegistry::new());
    sessions.inject("alpha|1|7", 1, None, vec![0xAA, 0xBB]);
    sessions.inject("beta|1|7", 1, None, vec![0xCC]);
    let addr = start_server(None, Arc::clone(&sessions));

    let mut client = connected_client(addr, 2);
    let entries = client.get_list().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "alpha|1|7");
    assert_eq!(entries[0].data, vec![0xAA, 0xBB]);
    assert_eq!(entries[1].name, "beta|1|7");
}

#[test]
fn test_empty_list() {
    let addr = start_server(None, Arc::new(SessionRegistry::new()));
    let mut client = connected_client(addr, 2);
    assert!(client.get_list().unwrap().is_empty());
}

struct FailingSink {
    inner: Cursor<Vec<u8>>,
    budget: usize,
}

impl Write for FailingSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let allowed = buf.len().min(self.budget);
        self.budget -= allowed;
        self.inner.write(&buf[..allowed])
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FailingSink {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

struct DeclineWait;

impl NoFreeSpaceCallback for DeclineWait {
    fn handle_no_free_space(&mut self, _remote_fn: &str) -> bool {
        false
    }
}

#[test]
fn test_full_sink_aborts_when_callback_declines() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("data.bin"), patterned(64 * 1024)).unwrap();
    let addr = start_server(
        Some(dir.path().to_path_buf()),
        Arc::new(SessionRegistry::new()),
    );

    let mut client = connected_client(addr, 2);
    client.set_nofreespace_callback(Box::new(DeclineWait));
    let mut sink = FailingSink {
        inner: Cursor::new(Vec::new()),
        budget: 10 * 1024,
    };
    assert_eq!(
        client.get_file("data.bin", &mut sink, true),
        TransferStatus::Error
    );
}

/// Reads one framed request from the stream.
fn read_request(stream: &mut TcpStream) -> (u8, String, Option<u64>) {
    let mut stack = FrameStack::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "client closed while a request was expected");
        stack.add_data(&buf[..n]);
        if let Some(packet) = stack.next_packet().unwrap() {
            let mut r = WireReader::new(&packet);
            let tag = r.get_u8().unwrap();
            let remote_fn = r.get_str().unwrap();
            let _identity = r.get_str().unwrap();
            let offset = (r.remaining() >= 8).then(|| r.get_u64().unwrap());
            return (tag, remote_fn, offset);
        }
    }
}

fn send_filesize(stream: &mut TcpStream, size: u64) {
    let mut header = vec![ID_FILESIZE];
    header.extend_from_slice(&size.to_le_bytes());
    stream.write_all(&header).unwrap();
}

/// Streams `content[from..to]` with correct trailers at absolute checkpoint
/// boundaries.
fn stream_window(stream: &mut TcpStream, content: &[u8], from: u64, to: u64) {
    let size = content.len() as u64;
    let mut pos = from;
    let mut md5 = Md5Window::new();
    let mut next_cp = ((pos / CHECKPOINT_DIST + 1) * CHECKPOINT_DIST).min(size);
    while pos < to {
        let end = next_cp.min(to);
        let chunk = &content[pos as usize..end as usize];
        stream.write_all(chunk).unwrap();
        md5.update(chunk);
        pos = end;
        if pos == next_cp {
            stream.write_all(&md5.finish_reset()).unwrap();
            if next_cp == size {
                break;
            }
            next_cp = (next_cp + CHECKPOINT_DIST).min(size);
        }
    }
    stream.flush().unwrap();
}

#[test]
fn test_resume_after_connection_loss_restarts_at_checkpoint() {
    let content = patterned(3 * CHECKPOINT_DIST as usize / 2); // 1.5 MiB
    let size = content.len() as u64;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_content = content.clone();
    let handle = thread::spawn(move || {
        // First connection: one full window, its trailer, then 188 KiB of
        // the second window, then a hard drop.
        let (mut stream, _) = listener.accept().unwrap();
        let (_, _, offset) = read_request(&mut stream);
        assert_eq!(offset, None);
        send_filesize(&mut stream, size);
        stream_window(&mut stream, &server_content, 0, CHECKPOINT_DIST + 188 * 1024);
        drop(stream);

        // Second connection: the client must come back at the checkpoint.
        let (mut stream, _) = listener.accept().unwrap();
        let (tag, _, offset) = read_request(&mut stream);
        assert_eq!(tag, ID_GET_FILE_RESUME_HASH);
        assert_eq!(offset, Some(CHECKPOINT_DIST));
        send_filesize(&mut stream, size);
        stream_window(&mut stream, &server_content, CHECKPOINT_DIST, size);
    });

    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("resume.bin", &mut sink, true),
        TransferStatus::Success
    );
    assert_eq!(sink.into_inner(), content);
    handle.join().unwrap();
}

#[test]
fn test_corrupted_window_is_detected() {
    let content = patterned(CHECKPOINT_DIST as usize);
    let size = content.len() as u64;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server_content = content;
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_request(&mut stream);
        send_filesize(&mut stream, size);
        // Payload and trailer disagree: hash the real bytes, send a flipped
        // copy.
        let mut md5 = Md5Window::new();
        md5.update(&server_content);
        let mut corrupted = server_content.clone();
        corrupted[1000] ^= 0xFF;
        stream.write_all(&corrupted).unwrap();
        stream.write_all(&md5.finish_reset()).unwrap();
        let _ = stream.flush();

        // The client reconnects once to reset buffers before reporting.
        if let Ok((stream, _)) = listener.accept() {
            drop(stream);
        }
    });

    let mut client = connected_client(addr, 2);
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("corrupt.bin", &mut sink, true),
        TransferStatus::Hash
    );
    handle.join().unwrap();
}

#[test]
fn test_timeout_when_server_disappears() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(stream);
        // Listener dropped: reconnects are refused.
    });

    let mut client = connected_client(addr, 2);
    client.set_server_timeout(Duration::from_millis(500));
    client.set_reconnection_timeout(Duration::from_millis(300));
    let mut sink = Cursor::new(Vec::new());
    assert_eq!(
        client.get_file("gone.bin", &mut sink, true),
        TransferStatus::Timeout
    );
    handle.join().unwrap();
}
