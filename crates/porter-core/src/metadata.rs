//! Per-member metadata blobs consumed by the file server's peers.
//!
//! A blob is three concatenated sections, each terminated by an Adler-32
//! over the section bytes: the typed filename, the common attributes
//! (varints plus an opaque access token), and an OS-specific attribute
//! serialization. Multi-byte integers are little-endian throughout.

use crate::checksum::adler32;
use crate::protocol::ID_METADATA_V1;
use crate::tar::TarEntry;
use crate::wire::WireWriter;

/// Maps ownership and permissions to an opaque access-policy token.
///
/// Injected at construction; an absent translator yields an empty token.
pub trait TokenTranslator: Send + Sync {
    fn translate(&self, uid: i64, gid: i64, mode: i64) -> String;
}

#[cfg(any(not(unix), test))]
const WINDOWS_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Unix seconds to Windows FILETIME (100 ns ticks since 1601).
#[cfg(any(not(unix), test))]
fn windows_filetime(unix_secs: i64) -> u64 {
    (unix_secs + WINDOWS_EPOCH_OFFSET).max(0) as u64 * 10_000_000
}

/// Serialize the metadata blob for one archive entry.
pub fn build_metadata(entry: &TarEntry, tokens: Option<&dyn TokenTranslator>) -> Vec<u8> {
    let mut w = WireWriter::new();

    // Filename section. The leading blob tag is not covered by the
    // section checksum.
    w.put_u8(ID_METADATA_V1);
    let fn_start = w.len();
    let kind = if entry.is_dir && entry.is_symlink {
        "l"
    } else if entry.is_dir {
        "d"
    } else {
        "f"
    };
    w.put_str(&format!("{}{}", kind, entry.name));
    let sum = adler32(&w.as_slice()[fn_start..]);
    w.put_u32(sum);

    // Common section.
    let common_start = w.len();
    w.put_u8(1);
    w.put_varint(0);
    w.put_varint(entry.mtime.max(0) as u64);
    w.put_varint(0);
    w.put_varint(0);
    w.put_varint(0);
    match tokens {
        Some(translator) => w.put_str(&translator.translate(entry.uid, entry.gid, entry.mode)),
        None => w.put_str(""),
    }
    let sum = adler32(&w.as_slice()[common_start..]);
    w.put_u32(sum);

    // OS-specific section.
    let os_start = w.len();
    write_os_section(&mut w, entry);
    let sum = adler32(&w.as_slice()[os_start..]);
    w.put_u32(sum);

    w.into_bytes()
}

#[cfg(unix)]
fn write_os_section(w: &mut WireWriter, entry: &TarEntry) {
    w.put_varint(entry.dev.max(0) as u64);
    w.put_varint(entry.mode.max(0) as u64);
    w.put_varint(entry.uid.max(0) as u64);
    w.put_varint(entry.gid.max(0) as u64);
    w.put_varint(entry.size.max(0) as u64);
    w.put_varint(entry.mtime.max(0) as u64);
    w.put_str(&entry.symlink_target);
    w.put_i64(0);
}

#[cfg(not(unix))]
fn write_os_section(w: &mut WireWriter, entry: &TarEntry) {
    w.put_u8(1);
    w.put_u32(0); // attributes
    w.put_varint(0); // creation time
    w.put_varint(0); // last access time
    w.put_varint(windows_filetime(entry.mtime));
    w.put_varint(windows_filetime(entry.mtime));
    w.put_u8(0);
}
