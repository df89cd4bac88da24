//! Wire-level constants shared by the transfer client and the file server.

use std::time::Duration;

/// Protocol generation carried in PONG replies and negotiated per client.
/// 0: plain downloads, 1: resumable offsets, 2: resumable + MD5 checkpoints.
pub const PROTOCOL_VERSION: u8 = 2;

/// Default TCP port the file server listens on.
pub const TCP_PORT: u16 = 35623;
/// UDP port discovery probes are sent to.
pub const UDP_PORT: u16 = 35622;
/// Source port discovery sockets bind to.
pub const UDP_SOURCE_PORT: u16 = 35621;

// Request tags (framed) and response tags (first raw byte).
pub const ID_GET_GAMELIST: u8 = 1;
pub const ID_GAMELIST: u8 = 2;
pub const ID_GET_FILE: u8 = 3;
pub const ID_COULDNT_OPEN: u8 = 4;
pub const ID_FILESIZE: u8 = 5;
pub const ID_BASE_DIR_LOST: u8 = 6;
pub const ID_GET_FILE_RESUME: u8 = 7;
pub const ID_GET_FILE_RESUME_HASH: u8 = 8;
pub const ID_PING: u8 = 9;
pub const ID_PONG: u8 = 10;

/// Leading byte of a member metadata blob.
pub const ID_METADATA_V1: u8 = 1;
/// Leading byte of an entry-announce record in a drain report.
pub const ID_ENTRY_RECORD: u8 = 2;

/// Distance between MD5 checkpoints in the hashed transfer protocol.
pub const CHECKPOINT_DIST: u64 = 512 * 1024;

/// Idle cutoff before the client attempts a reconnect.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard deadline on one reconnection attempt sequence.
pub const RECONNECTION_TIMEOUT: Duration = Duration::from_secs(300);
/// Reconnects attempted before a download is abandoned.
pub const RECONNECT_TRIES: i32 = 5000;
/// Connect timeout for a single TCP dial.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(not(debug_assertions))]
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
#[cfg(debug_assertions)]
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);
