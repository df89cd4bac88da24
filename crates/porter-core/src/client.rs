//! Resumable, hash-verified file-transfer client.
//!
//! Two protocols: a one-byte UDP probe for discovering servers on the local
//! network, and a framed request / raw response TCP protocol for downloads.
//! Downloads survive connection loss: the client reconnects, re-issues the
//! request at the last good position and, on protocol version 2, verifies a
//! 16-byte MD5 trailer after every 512 KiB checkpoint window.

use crate::checksum::Md5Window;
use crate::errors::{categorize_io_error, ErrorCategory, TransferStatus};
use crate::protocol::{
    CHECKPOINT_DIST, CONNECT_TIMEOUT, DISCOVERY_TIMEOUT, ID_BASE_DIR_LOST, ID_COULDNT_OPEN,
    ID_FILESIZE, ID_GAMELIST, ID_GET_FILE, ID_GET_FILE_RESUME, ID_GET_FILE_RESUME_HASH,
    ID_GET_GAMELIST, ID_PING, ID_PONG, PROTOCOL_VERSION, RECONNECTION_TIMEOUT, RECONNECT_TRIES,
    SERVER_TIMEOUT, TCP_PORT, UDP_PORT, UDP_SOURCE_PORT,
};
use crate::stack::FrameStack;
use crate::wire::WireWriter;
use eyre::{Context as _, Result};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

const BUFSIZE: usize = 32 * 1024;

/// Supplies replacement connections after a loss, e.g. through a tunnel.
pub trait ReconnectionCallback: Send {
    fn new_connection(&mut self) -> Option<TcpStream>;
}

/// Consulted when the sink cannot absorb more bytes. Return true to wait
/// ten seconds and retry, false to abort the transfer.
pub trait NoFreeSpaceCallback: Send {
    fn handle_no_free_space(&mut self, remote_fn: &str) -> bool;
}

/// Paces the stream; called with the byte count of every received block.
/// Throttlers survive reconnects.
pub trait Throttler: Send {
    fn throttle(&mut self, bytes: usize);
}

/// One entry of a server's list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Body,
    HashTail,
}

enum ReadOutcome {
    Data(usize),
    /// Idle timeout or recoverable loss; reconnect and resume.
    Lost,
    /// Unrecoverable socket failure.
    Failed,
}

pub struct TransferClient {
    sock: Option<TcpStream>,
    udp_socks: Vec<UdpSocket>,
    servers: Vec<SocketAddr>,
    server_names: Vec<String>,
    wrong_version_servers: Vec<SocketAddr>,
    max_version: u8,
    server_addr: Option<SocketAddr>,
    protocol_version: u8,
    identity: String,
    discovery_start: Option<Instant>,
    discovery_timeout: Duration,
    reconnection_timeout: Duration,
    server_timeout: Duration,
    tcp_port: u16,
    udp_port: u16,
    stack: FrameStack,
    transferred_bytes: u64,
    throttlers: Vec<Box<dyn Throttler>>,
    reconnection_callback: Option<Box<dyn ReconnectionCallback>>,
    nofreespace_callback: Option<Box<dyn NoFreeSpaceCallback>>,
}

impl TransferClient {
    /// Client without discovery sockets; connect explicitly.
    pub fn new(protocol_version: u8, identity: impl Into<String>) -> Self {
        TransferClient {
            sock: None,
            udp_socks: Vec::new(),
            servers: Vec::new(),
            server_names: Vec::new(),
            wrong_version_servers: Vec::new(),
            max_version: 0,
            server_addr: None,
            protocol_version,
            identity: identity.into(),
            discovery_start: None,
            discovery_timeout: DISCOVERY_TIMEOUT,
            reconnection_timeout: RECONNECTION_TIMEOUT,
            server_timeout: SERVER_TIMEOUT,
            tcp_port: TCP_PORT,
            udp_port: UDP_PORT,
            stack: FrameStack::new(),
            transferred_bytes: 0,
            throttlers: Vec::new(),
            reconnection_callback: None,
            nofreespace_callback: None,
        }
    }

    /// Client with a broadcast-capable UDP socket for server discovery.
    pub fn with_discovery(protocol_version: u8, identity: impl Into<String>) -> Result<Self> {
        Self::with_discovery_port(protocol_version, identity, UDP_SOURCE_PORT)
    }

    pub fn with_discovery_port(
        protocol_version: u8,
        identity: impl Into<String>,
        source_port: u16,
    ) -> Result<Self> {
        let mut client = Self::new(protocol_version, identity);
        client.udp_socks.push(bind_discovery_socket(source_port)?);
        Ok(client)
    }

    /// Override the well-known target ports (daemon configs may move them).
    pub fn set_target_ports(&mut self, tcp_port: u16, udp_port: u16) {
        self.tcp_port = tcp_port;
        self.udp_port = udp_port;
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn set_discovery_timeout(&mut self, timeout: Duration) {
        self.discovery_timeout = timeout;
    }

    pub fn set_reconnection_timeout(&mut self, timeout: Duration) {
        self.reconnection_timeout = timeout;
    }

    pub fn set_server_timeout(&mut self, timeout: Duration) {
        self.server_timeout = timeout;
    }

    pub fn set_reconnection_callback(&mut self, callback: Box<dyn ReconnectionCallback>) {
        self.reconnection_callback = Some(callback);
    }

    pub fn set_nofreespace_callback(&mut self, callback: Box<dyn NoFreeSpaceCallback>) {
        self.nofreespace_callback = Some(callback);
    }

    pub fn add_throttler(&mut self, throttler: Box<dyn Throttler>) {
        self.throttlers.push(throttler);
    }

    // ---- discovery -------------------------------------------------------

    /// Drive server discovery. With `start` true, transmit a PING from every
    /// discovery socket to the broadcast address, all local addresses and
    /// the supplied hints, then return `Continue`. Subsequent calls poll
    /// with one-second granularity, collecting PONG replies, until the
    /// discovery deadline expires with `Timeout`.
    pub fn poll_servers(&mut self, start: bool, hints: &[Ipv4Addr]) -> TransferStatus {
        if self.udp_socks.is_empty() {
            return TransferStatus::SocketError;
        }

        if start {
            self.max_version = 0;
            self.servers.clear();
            self.server_names.clear();
            self.wrong_version_servers.clear();

            let ping = [ID_PING];
            for sock in &self.udp_socks {
                let broadcast = SocketAddrV4::new(Ipv4Addr::BROADCAST, self.udp_port);
                if let Err(e) = sock.send_to(&ping, broadcast) {
                    warn!("discovery broadcast failed: {e}");
                }
                for addr in local_addresses() {
                    let _ = sock.send_to(&ping, SocketAddrV4::new(addr, self.udp_port));
                }
                for hint in hints {
                    if let Err(e) = sock.send_to(&ping, SocketAddrV4::new(*hint, self.udp_port)) {
                        warn!("discovery probe to {hint} failed: {e}");
                    }
                }
            }

            self.discovery_start = Some(Instant::now());
            return TransferStatus::Continue;
        }

        let mut buf = [0u8; 1024];
        for sock in &self.udp_socks {
            // Block up to the poll granularity for the first reply, then
            // drain whatever else is queued.
            let mut wait = Duration::from_secs(1);
            loop {
                let _ = sock.set_read_timeout(Some(wait));
                match sock.recv_from(&mut buf) {
                    Ok((n, from)) if n > 2 && buf[0] == ID_PONG => {
                        let version = buf[1];
                        let name = String::from_utf8_lossy(&buf[2..n]).into_owned();
                        debug!("pong from {from}: version {version} '{name}'");
                        if version == PROTOCOL_VERSION {
                            if !self.servers.contains(&from) {
                                self.servers.push(from);
                                self.server_names.push(name);
                            }
                        } else if !self.wrong_version_servers.contains(&from) {
                            self.wrong_version_servers.push(from);
                        }
                        if version > self.max_version {
                            self.max_version = version;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
                wait = Duration::from_millis(50);
            }
        }

        let expired = self
            .discovery_start
            .is_none_or(|start| start.elapsed() > self.discovery_timeout);
        if expired {
            TransferStatus::Timeout
        } else {
            TransferStatus::Continue
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    pub fn wrong_version_servers(&self) -> &[SocketAddr] {
        &self.wrong_version_servers
    }

    /// Highest protocol version observed during discovery.
    pub fn max_version(&self) -> u8 {
        self.max_version
    }

    // ---- connection ------------------------------------------------------

    pub fn connect(&mut self, addr: SocketAddr) -> TransferStatus {
        self.server_addr = Some(addr);
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.sock = Some(stream);
                TransferStatus::Connected
            }
            Err(e) => {
                warn!("connecting to {addr} failed: {e}");
                self.sock = None;
                TransferStatus::Error
            }
        }
    }

    /// Adopt an already established connection.
    pub fn connect_stream(&mut self, stream: TcpStream) -> TransferStatus {
        self.server_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        self.sock = Some(stream);
        TransferStatus::Connected
    }

    pub fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    /// Bytes received across all connections of this client.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    fn reconnect(&mut self) -> bool {
        self.sock = None;
        self.stack.reset();

        let deadline = Instant::now() + self.reconnection_timeout;
        loop {
            let stream = match self.reconnection_callback.as_mut() {
                Some(callback) => callback.new_connection(),
                None => self
                    .server_addr
                    .and_then(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).ok()),
            };

            if let Some(stream) = stream {
                let _ = stream.set_nodelay(true);
                self.sock = Some(stream);
                debug!("reconnected successfully");
                return true;
            }
            if Instant::now() >= deadline {
                warn!("reconnecting failed");
                return false;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let result = {
            let Some(sock) = self.sock.as_mut() else {
                return ReadOutcome::Lost;
            };
            let _ = sock.set_read_timeout(Some(self.server_timeout));
            sock.read(buf)
        };
        match result {
            Ok(0) => ReadOutcome::Lost,
            Ok(n) => {
                self.transferred_bytes += n as u64;
                for throttler in &mut self.throttlers {
                    throttler.throttle(n);
                }
                ReadOutcome::Data(n)
            }
            Err(e) => match categorize_io_error(&e) {
                ErrorCategory::Retryable => ReadOutcome::Lost,
                ErrorCategory::Fatal => {
                    error!("transfer connection failed: {e}");
                    ReadOutcome::Failed
                }
            },
        }
    }

    fn send_file_request(&mut self, version: u8, remote_fn: &str, offset: Option<u64>) -> bool {
        let tag = match version {
            0 => ID_GET_FILE,
            1 => ID_GET_FILE_RESUME,
            _ => ID_GET_FILE_RESUME_HASH,
        };
        let mut payload = WireWriter::new();
        payload.put_u8(tag);
        payload.put_str(remote_fn);
        payload.put_str(&self.identity);
        if let Some(offset) = offset {
            payload.put_u64(offset);
        }
        match self.sock.as_mut() {
            Some(sock) => FrameStack::send(sock, payload.as_slice()).is_ok(),
            None => false,
        }
    }

    // ---- download --------------------------------------------------------

    /// Download `remote_fn` into `file`.
    ///
    /// `hashed` false caps the session at protocol version 1 (no checkpoint
    /// trailers). The sink is seeked on every resume, so it must be
    /// positioned at offset zero initially.
    pub fn get_file<W: Write + Seek>(
        &mut self,
        remote_fn: &str,
        file: &mut W,
        hashed: bool,
    ) -> TransferStatus {
        if self.sock.is_none() {
            return TransferStatus::IntError;
        }

        let mut version = self.protocol_version;
        if !hashed && version > 1 {
            version = 1;
        }

        if !self.send_file_request(version, remote_fn, None) {
            return TransferStatus::SocketError;
        }

        let mut filesize: u64 = 0;
        let mut received: u64 = 0;
        let mut next_checkpoint: u64 = CHECKPOINT_DIST;
        let mut last_checkpoint: u64 = 0;
        let mut firstpacket = true;
        let mut tries = RECONNECT_TRIES;

        let mut state = BodyState::Body;
        let mut hash_buf = [0u8; 16];
        let mut hash_missing: usize = 0;
        let mut md5 = Md5Window::new();
        let mut buf = vec![0u8; BUFSIZE];

        loop {
            let mut n = match self.read_some(&mut buf) {
                ReadOutcome::Data(n) => n,
                ReadOutcome::Failed => return TransferStatus::ConnLost,
                ReadOutcome::Lost => {
                    debug!("server idle or connection lost, reconnecting");
                    tries -= 1;
                    if !self.reconnect() || tries <= 0 {
                        info!("download of '{remote_fn}' timed out");
                        return TransferStatus::Timeout;
                    }

                    if version > 1 {
                        // Bytes past the last verified checkpoint cannot be
                        // trusted; restart the window there.
                        received = last_checkpoint;
                    }
                    if file.seek(SeekFrom::Start(received)).is_err() {
                        return TransferStatus::Error;
                    }
                    let offset = if version > 0 && !firstpacket {
                        Some(received)
                    } else {
                        None
                    };
                    if !self.send_file_request(version, remote_fn, offset) {
                        warn!("re-sending download request failed");
                    }
                    if version > 0 {
                        firstpacket = true;
                    }
                    md5 = Md5Window::new();
                    state = BodyState::Body;
                    continue;
                }
            };

            let mut off = 0usize;

            if firstpacket {
                match buf[0] {
                    ID_COULDNT_OPEN => return TransferStatus::FileDoesntExist,
                    ID_BASE_DIR_LOST => return TransferStatus::BaseDirLost,
                    ID_FILESIZE => {
                        while n < 9 {
                            match self.read_some(&mut buf[n..]) {
                                ReadOutcome::Data(more) => n += more,
                                _ => return TransferStatus::Error,
                            }
                        }
                        filesize = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                        off = 9;
                        debug!("'{remote_fn}' has {filesize} bytes");
                        if filesize == 0 {
                            return TransferStatus::Success;
                        }
                        if version > 1 {
                            if filesize < next_checkpoint {
                                next_checkpoint = filesize;
                            }
                        } else {
                            next_checkpoint = filesize;
                        }
                    }
                    other => {
                        warn!("unexpected response byte {other:#x}");
                        return TransferStatus::Error;
                    }
                }
                firstpacket = false;
            }

            if state == BodyState::HashTail && off < n {
                let take = (n - off).min(hash_missing);
                hash_buf[16 - hash_missing..16 - hash_missing + take]
                    .copy_from_slice(&buf[off..off + take]);
                off += take;
                hash_missing -= take;

                if hash_missing == 0 {
                    if md5.finish_reset() != hash_buf {
                        error!("checkpoint digest mismatch downloading '{remote_fn}'");
                        self.reconnect();
                        return TransferStatus::Hash;
                    }
                    state = BodyState::Body;
                    if received >= filesize {
                        return TransferStatus::Success;
                    }
                }
            }

            if state == BodyState::Body && off < n {
                let mut written = off;
                let mut write_remaining = next_checkpoint - received;
                loop {
                    while written < n && write_remaining > 0 {
                        let want = write_remaining.min((n - written) as u64) as usize;
                        let count = match file.write(&buf[written..written + want]) {
                            Ok(count) => count,
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
                            Err(e) => {
                                debug!("sink write failed: {e}");
                                0
                            }
                        };
                        md5.update(&buf[written..written + count]);
                        written += count;
                        write_remaining -= count as u64;
                        received += count as u64;

                        if count < want {
                            let wait = match self.nofreespace_callback.as_mut() {
                                Some(callback) => callback.handle_no_free_space(remote_fn),
                                None => true,
                            };
                            if !wait {
                                error!("no space left for '{remote_fn}', aborting");
                                self.reconnect();
                                return TransferStatus::Error;
                            }
                            warn!("sink cannot absorb more bytes, waiting");
                            thread::sleep(Duration::from_secs(10));
                        }
                    }

                    if write_remaining == 0 && version > 1 {
                        // A checkpoint boundary was reached: slide the
                        // window and take the 16-byte trailer.
                        if next_checkpoint < filesize {
                            last_checkpoint = next_checkpoint;
                        }
                        next_checkpoint = (next_checkpoint + CHECKPOINT_DIST).min(filesize);

                        let take = (n - written).min(16);
                        hash_buf[..take].copy_from_slice(&buf[written..written + take]);
                        written += take;
                        if take < 16 {
                            hash_missing = 16 - take;
                            state = BodyState::HashTail;
                            break;
                        }
                        if md5.finish_reset() != hash_buf {
                            error!("checkpoint digest mismatch downloading '{remote_fn}'");
                            self.reconnect();
                            return TransferStatus::Hash;
                        }
                        if received >= filesize {
                            return TransferStatus::Success;
                        }
                        write_remaining = next_checkpoint - received;
                        if written >= n {
                            break;
                        }
                    } else {
                        break;
                    }
                }

                if received >= filesize && state == BodyState::Body {
                    return TransferStatus::Success;
                }
            }
        }
    }

    // ---- list retrieval --------------------------------------------------

    /// Fetch the server's entry list: a framed count followed by one name
    /// packet and one content packet per entry.
    pub fn get_list(&mut self) -> std::result::Result<Vec<ListEntry>, TransferStatus> {
        if self.sock.is_none() {
            return Err(TransferStatus::IntError);
        }

        let mut payload = WireWriter::new();
        payload.put_u8(ID_GET_GAMELIST);
        payload.put_str(&self.identity);
        {
            let sock = self.sock.as_mut().expect("checked above");
            if FrameStack::send(sock, payload.as_slice()).is_err() {
                return Err(TransferStatus::SocketError);
            }
        }
        self.stack.reset();

        let timeout = Duration::from_secs(10);
        let mut expected: Option<u32> = None;
        let mut pending_name: Option<String> = None;
        let mut entries = Vec::new();
        let mut buf = vec![0u8; BUFSIZE];

        loop {
            let n = {
                let sock = self.sock.as_mut().expect("checked above");
                let _ = sock.set_read_timeout(Some(timeout));
                match sock.read(&mut buf) {
                    Ok(0) => return Err(TransferStatus::Error),
                    Ok(n) => n,
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        return Err(TransferStatus::Timeout)
                    }
                    Err(_) => return Err(TransferStatus::Error),
                }
            };
            self.transferred_bytes += n as u64;
            self.stack.add_data(&buf[..n]);

            loop {
                let packet = match self.stack.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("malformed list reply: {e}");
                        return Err(TransferStatus::Error);
                    }
                };

                match expected {
                    None => {
                        if packet.len() >= 5 && packet[0] == ID_GAMELIST {
                            let count =
                                u32::from_le_bytes(packet[1..5].try_into().expect("checked len"));
                            if count == 0 {
                                return Ok(entries);
                            }
                            expected = Some(count);
                        } else {
                            return Err(TransferStatus::Error);
                        }
                    }
                    Some(count) => match pending_name.take() {
                        None => {
                            pending_name = Some(String::from_utf8_lossy(&packet).into_owned())
                        }
                        Some(name) => {
                            entries.push(ListEntry { name, data: packet });
                            if entries.len() as u32 == count {
                                return Ok(entries);
                            }
                        }
                    },
                }
            }
        }
    }
}

fn bind_discovery_socket(source_port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating discovery socket")?;
    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;
    socket.set_broadcast(true).context("setting SO_BROADCAST")?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, source_port);
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding discovery socket to {bind_addr}"))?;
    Ok(socket.into())
}

/// IPv4 addresses the local hostname resolves to; unicast PING targets in
/// addition to the broadcast.
fn local_addresses() -> Vec<Ipv4Addr> {
    let Ok(name) = hostname::get() else {
        return Vec::new();
    };
    let Some(name) = name.to_str().map(str::to_owned) else {
        return Vec::new();
    };
    match (name.as_str(), 0u16).to_socket_addrs() {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}
