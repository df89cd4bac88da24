//! File server answering the transfer protocol.
//!
//! Requests arrive as framed packets; responses are raw bytes. Names
//! containing `|` address injected pipe sessions, everything else resolves
//! beneath the served root directory. The hashed download variant emits a
//! 16-byte MD5 trailer after every checkpoint boundary; boundaries are
//! absolute multiples of the checkpoint distance, so a resumed request
//! produces trailers at the same positions as the original one.

use crate::checksum::Md5Window;
use crate::metadata::TokenTranslator;
use crate::protocol::{
    CHECKPOINT_DIST, ID_BASE_DIR_LOST, ID_COULDNT_OPEN, ID_FILESIZE, ID_GAMELIST, ID_GET_FILE,
    ID_GET_FILE_RESUME, ID_GET_FILE_RESUME_HASH, ID_GET_GAMELIST, ID_PING, ID_PONG,
    PROTOCOL_VERSION,
};
use crate::session::SessionRegistry;
use crate::stack::FrameStack;
use crate::tar::TarMember;
use crate::wire::{WireReader, WireWriter};
use eyre::{bail, Context as _, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;

const STREAM_CHUNK: usize = 64 * 1024;

pub struct FileServer {
    listener: TcpListener,
    root: Option<PathBuf>,
    sessions: Arc<SessionRegistry>,
    tokens: Option<Arc<dyn TokenTranslator>>,
}

impl FileServer {
    pub fn bind(
        addr: impl ToSocketAddrs,
        root: Option<PathBuf>,
        sessions: Arc<SessionRegistry>,
        tokens: Option<Arc<dyn TokenTranslator>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).context("binding transfer listener")?;
        Ok(FileServer {
            listener,
            root,
            sessions,
            tokens,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails; one thread per client.
    pub fn run(&self) -> Result<()> {
        info!(
            "transfer server listening on {}",
            self.listener.local_addr()?
        );
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let root = self.root.clone();
                    let sessions = Arc::clone(&self.sessions);
                    let tokens = self.tokens.clone();
                    thread::spawn(move || handle_connection(stream, root, sessions, tokens));
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(
    mut stream: TcpStream,
    root: Option<PathBuf>,
    sessions: Arc<SessionRegistry>,
    tokens: Option<Arc<dyn TokenTranslator>>,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    let _ = stream.set_nodelay(true);
    debug!("connection from {peer}");

    let mut stack = FrameStack::new();
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("connection to {peer} ended: {e}");
                break;
            }
        };
        stack.add_data(&buf[..n]);

        loop {
            let packet = match stack.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping {peer}: {e}");
                    return;
                }
            };
            if let Err(e) = handle_request(
                &mut stream,
                &packet,
                root.as_deref(),
                &sessions,
                tokens.as_deref(),
            ) {
                debug!("request from {peer} failed: {e}");
                return;
            }
        }
    }
}

fn handle_request(
    stream: &mut TcpStream,
    packet: &[u8],
    root: Option<&Path>,
    sessions: &SessionRegistry,
    tokens: Option<&dyn TokenTranslator>,
) -> Result<()> {
    let mut r = WireReader::new(packet);
    let tag = r.get_u8()?;
    match tag {
        ID_GET_FILE | ID_GET_FILE_RESUME | ID_GET_FILE_RESUME_HASH => {
            let remote_fn = r.get_str()?;
            let identity = r.get_str()?;
            let offset = if r.remaining() >= 8 { r.get_u64()? } else { 0 };
            let hashed = tag == ID_GET_FILE_RESUME_HASH;
            debug!("'{identity}' requests '{remote_fn}' from offset {offset}");
            serve_file(stream, &remote_fn, offset, hashed, root, sessions, tokens)
        }
        ID_GET_GAMELIST => {
            let identity = r.get_str()?;
            debug!("'{identity}' requests the entry list");
            serve_list(stream, sessions)
        }
        other => bail!("unknown request tag {other}"),
    }
}

enum ServeSource {
    Disk(File),
    Session {
        member: Arc<TarMember>,
        key: String,
        backupnum: i32,
    },
}

enum Resolved {
    NotFound,
    BaseDirLost,
    Source(ServeSource, u64),
}

fn resolve(remote_fn: &str, root: Option<&Path>, sessions: &SessionRegistry) -> Resolved {
    if remote_fn.contains('|') {
        let backupnum = session_backupnum(remote_fn);
        return match sessions.retrieve(remote_fn, backupnum) {
            Some(entry) => match entry.member {
                Some(member) => {
                    let size = member.size().max(0) as u64;
                    Resolved::Source(
                        ServeSource::Session {
                            member,
                            key: remote_fn.to_string(),
                            backupnum,
                        },
                        size,
                    )
                }
                // Directories, symlinks and specials carry no payload.
                None => Resolved::NotFound,
            },
            None => Resolved::NotFound,
        };
    }

    let Some(root) = root else {
        return Resolved::BaseDirLost;
    };
    if !root.is_dir() {
        return Resolved::BaseDirLost;
    }
    let Some(path) = resolve_disk_path(root, remote_fn) else {
        return Resolved::NotFound;
    };
    match File::open(&path) {
        Ok(file) => match file.metadata() {
            Ok(meta) if meta.is_file() => Resolved::Source(ServeSource::Disk(file), meta.len()),
            _ => Resolved::NotFound,
        },
        Err(_) => Resolved::NotFound,
    }
}

/// Join a requested name onto the served root, refusing any component that
/// could escape it.
fn resolve_disk_path(root: &Path, remote_fn: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for comp in Path::new(remote_fn).components() {
        match comp {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

fn session_backupnum(key: &str) -> i32 {
    let mut parts = key.rsplitn(3, '|');
    let _fn_random = parts.next();
    parts
        .next()
        .and_then(|num| num.parse().ok())
        .unwrap_or(0)
}

impl ServeSource {
    fn read_at(&mut self, pos: u64, want: usize) -> Result<Vec<u8>> {
        match self {
            ServeSource::Disk(file) => {
                file.seek(SeekFrom::Start(pos))?;
                let mut chunk = vec![0u8; want];
                let n = file.read(&mut chunk)?;
                chunk.truncate(n);
                Ok(chunk)
            }
            ServeSource::Session { member, .. } => member.read_at(pos as i64, want),
        }
    }
}

fn serve_file(
    stream: &mut TcpStream,
    remote_fn: &str,
    offset: u64,
    hashed: bool,
    root: Option<&Path>,
    sessions: &SessionRegistry,
    tokens: Option<&dyn TokenTranslator>,
) -> Result<()> {
    let (mut source, size) = match resolve(remote_fn, root, sessions) {
        Resolved::NotFound => {
            stream.write_all(&[ID_COULDNT_OPEN])?;
            return Ok(());
        }
        Resolved::BaseDirLost => {
            stream.write_all(&[ID_BASE_DIR_LOST])?;
            return Ok(());
        }
        Resolved::Source(source, size) => (source, size),
    };

    let mut header = [0u8; 9];
    header[0] = ID_FILESIZE;
    header[1..].copy_from_slice(&size.to_le_bytes());
    stream.write_all(&header)?;

    let mut pos = offset.min(size);
    let mut md5 = Md5Window::new();
    let mut next_checkpoint = if hashed {
        ((pos / CHECKPOINT_DIST + 1) * CHECKPOINT_DIST).min(size)
    } else {
        size
    };

    while pos < size {
        let want = (next_checkpoint - pos).min(STREAM_CHUNK as u64) as usize;
        let data = source.read_at(pos, want)?;
        if data.is_empty() {
            bail!("source for '{remote_fn}' truncated at {pos}");
        }
        stream.write_all(&data)?;
        md5.update(&data);
        pos += data.len() as u64;

        if pos == next_checkpoint {
            if hashed {
                stream.write_all(&md5.finish_reset())?;
            }
            if next_checkpoint == size {
                break;
            }
            next_checkpoint = (next_checkpoint + CHECKPOINT_DIST).min(size);
        }
    }
    stream.flush()?;

    // A fully served session member advances the archive chain: register
    // the next entries and retire the served one.
    if let ServeSource::Session {
        member,
        key,
        backupnum,
    } = source
    {
        if pos >= size {
            let report = member.drain_and_report(sessions, tokens);
            debug!(
                "session '{key}' served, {} report bytes, {} sessions registered",
                report.len(),
                sessions.len()
            );
            sessions.remove(&key, backupnum);
        }
    }

    Ok(())
}

fn serve_list(stream: &mut TcpStream, sessions: &SessionRegistry) -> Result<()> {
    let entries = sessions.list();
    let mut head = WireWriter::new();
    head.put_u8(ID_GAMELIST);
    head.put_u32(entries.len() as u32);
    FrameStack::send(stream, head.as_slice())?;
    for (name, metadata) in entries {
        FrameStack::send(stream, name.as_bytes())?;
        FrameStack::send(stream, &metadata)?;
    }
    Ok(())
}

/// Answers one-byte discovery probes with the protocol version and the
/// server's human-readable name.
pub struct DiscoveryResponder {
    sock: UdpSocket,
    name: String,
}

impl DiscoveryResponder {
    pub fn bind(addr: SocketAddr, name: impl Into<String>) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("creating discovery responder socket")?;
        socket
            .set_reuse_address(true)
            .context("setting SO_REUSEADDR")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("binding discovery responder to {addr}"))?;
        Ok(DiscoveryResponder {
            sock: socket.into(),
            name: name.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub fn run(&self) -> Result<()> {
        info!(
            "discovery responder '{}' on {}",
            self.name,
            self.sock.local_addr()?
        );
        let mut reply = vec![ID_PONG, PROTOCOL_VERSION];
        reply.extend_from_slice(self.name.as_bytes());

        let mut buf = [0u8; 64];
        loop {
            let (n, from) = match self.sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    warn!("discovery receive failed: {e}");
                    continue;
                }
            };
            if n >= 1 && buf[0] == ID_PING {
                debug!("ping from {from}");
                if let Err(e) = self.sock.send_to(&reply, from) {
                    warn!("pong to {from} failed: {e}");
                }
            }
        }
    }
}
