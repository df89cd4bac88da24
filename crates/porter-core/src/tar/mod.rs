//! Streaming demultiplexer for tar archives arriving over a pipe.
//!
//! A [`TarMember`] exposes one archive entry at a time as a seekable,
//! digest-tracked sub-file of the underlying [`PipeSource`]. Advancing to
//! the next entry decodes the following header in place; payloads are never
//! copied out of the pipe window. Members sharing a source serialize at the
//! source, so a member must not hold its own lock across pipe I/O: inputs
//! are snapshotted under the lock, the read runs unlocked, and the digest
//! and cursor are committed afterwards.

pub mod header;

use crate::metadata::{build_metadata, TokenTranslator};
use crate::pipe::PipeSource;
use crate::protocol::ID_ENTRY_RECORD;
use crate::session::{normalize_entry_name, session_key, SessionRegistry};
use crate::wire::WireWriter;
use eyre::{bail, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::sync::Arc;
use std::time::Instant;

pub use header::{DecodedHeader, NumericValue, BLOCK_SIZE};

/// Descriptor of the archive entry a member currently exposes.
#[derive(Debug, Clone, Default)]
pub struct TarEntry {
    pub name: String,
    pub size: i64,
    pub pos: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub is_special: bool,
    pub symlink_target: String,
    pub mode: i64,
    pub uid: i64,
    pub gid: i64,
    pub mtime: i64,
    pub dev: i64,
    pub available: bool,
}

impl TarEntry {
    fn from_header(header: DecodedHeader) -> Self {
        TarEntry {
            name: header.name,
            size: header.size,
            pos: 0,
            is_dir: header.is_dir,
            is_symlink: header.is_symlink,
            is_special: header.is_special,
            symlink_target: header.symlink_target,
            mode: header.mode,
            uid: header.uid,
            gid: header.gid,
            mtime: header.mtime,
            dev: header.dev,
            available: true,
        }
    }

    /// Regular-file entries carry payload; everything else is metadata-only.
    pub fn is_regular(&self) -> bool {
        !self.is_dir && !self.is_symlink && !self.is_special
    }
}

struct MemberState {
    entry: TarEntry,
    /// Absolute pipe offset where the current payload begins.
    payload_offset: u64,
    sha: Sha512,
    /// Set once a successor member has been carved off for injection.
    has_next: bool,
}

/// One archive entry, readable as an independent sub-file of the pipe.
pub struct TarMember {
    source: Arc<PipeSource>,
    backupnum: i32,
    fn_random: i64,
    output_fn: String,
    state: Mutex<MemberState>,
}

fn round_up(n: u64, multiple: u64) -> u64 {
    n.div_ceil(multiple) * multiple
}

impl TarMember {
    /// Spawn the archive-producing command and position before the first
    /// entry; call [`TarMember::switch_next`] to expose it.
    pub fn open(
        cmd: &str,
        backupnum: i32,
        fn_random: i64,
        output_fn: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self::with_source(
            PipeSource::spawn(cmd)?,
            backupnum,
            fn_random,
            output_fn,
        ))
    }

    pub fn with_source(
        source: Arc<PipeSource>,
        backupnum: i32,
        fn_random: i64,
        output_fn: impl Into<String>,
    ) -> Self {
        TarMember {
            source,
            backupnum,
            fn_random,
            output_fn: output_fn.into(),
            state: Mutex::new(MemberState {
                entry: TarEntry::default(),
                payload_offset: 0,
                sha: Sha512::new(),
                has_next: false,
            }),
        }
    }

    /// Share the source and current position into a new member with a fresh
    /// digest. Used when an entry is handed to the session registry while
    /// this member keeps scanning.
    fn snapshot(&self) -> TarMember {
        let s = self.state.lock();
        TarMember {
            source: Arc::clone(&self.source),
            backupnum: self.backupnum,
            fn_random: self.fn_random,
            output_fn: self.output_fn.clone(),
            state: Mutex::new(MemberState {
                entry: s.entry.clone(),
                payload_offset: s.payload_offset,
                sha: Sha512::new(),
                has_next: false,
            }),
        }
    }

    /// Read up to `max` bytes at the member cursor, advancing it.
    pub fn read(&self, max: usize) -> Result<Vec<u8>> {
        let pos = self.state.lock().entry.pos;
        let data = self.read_window(pos, max)?;
        let mut s = self.state.lock();
        s.sha.update(&data);
        s.entry.pos += data.len() as i64;
        Ok(data)
    }

    /// Read up to `max` bytes at `pos` within the payload, leaving the
    /// member cursor in place.
    pub fn read_at(&self, pos: i64, max: usize) -> Result<Vec<u8>> {
        let data = self.read_window(pos, max)?;
        self.state.lock().sha.update(&data);
        Ok(data)
    }

    fn read_window(&self, pos: i64, max: usize) -> Result<Vec<u8>> {
        let (payload_offset, size, available) = {
            let s = self.state.lock();
            (s.payload_offset, s.entry.size, s.entry.available)
        };
        if !available {
            bail!("no archive entry is currently exposed");
        }
        if self.source.has_error() {
            bail!("pipe source for '{}' failed", self.source.command());
        }
        if pos < 0 {
            bail!("negative read position {pos}");
        }

        let remaining = (size - pos).max(0) as u64;
        let want = (max as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(Vec::new());
        }

        let data = self.source.read_at(payload_offset + pos as u64, want);
        if data.len() < want && self.source.has_error() {
            bail!("pipe source for '{}' failed", self.source.command());
        }
        Ok(data)
    }

    /// Reposition the member cursor. Fails outside `[0, size]`.
    pub fn seek(&self, pos: i64) -> bool {
        let target = {
            let mut s = self.state.lock();
            if pos < 0 || pos > s.entry.size {
                return false;
            }
            s.entry.pos = pos;
            s.payload_offset + pos as u64
        };
        self.source.seek(target)
    }

    pub fn size(&self) -> i64 {
        self.state.lock().entry.size
    }

    pub fn name(&self) -> String {
        self.state.lock().entry.name.clone()
    }

    pub fn entry(&self) -> TarEntry {
        self.state.lock().entry.clone()
    }

    /// SHA-512 over every payload byte served so far.
    pub fn payload_digest(&self) -> [u8; 64] {
        let sha = self.state.lock().sha.clone();
        sha.finalize().into()
    }

    /// Advance to the next archive entry.
    ///
    /// Returns `Ok(None)` at the end-of-archive marker (two zero blocks).
    /// Truncation, a checksum mismatch or a lone zero block poison the
    /// source and return an error.
    pub fn switch_next(&self) -> Result<Option<TarEntry>> {
        let (payload_offset, prev_size) = {
            let s = self.state.lock();
            (s.payload_offset, s.entry.size)
        };
        let header_offset = payload_offset + round_up(prev_size.max(0) as u64, BLOCK_SIZE as u64);

        let block = self.read_block(header_offset)?;
        let block = if header::is_zero_block(&block) {
            let second = self.read_block(header_offset + BLOCK_SIZE as u64)?;
            if header::is_zero_block(&second) {
                debug!("end of archive after {} bytes", header_offset);
                return Ok(None);
            }
            self.source.set_error();
            bail!("malformed archive: lone zero block followed by data");
        } else {
            block
        };

        if !header::checksum_matches(&block) {
            self.source.set_error();
            bail!("tar header checksum mismatch at offset {header_offset}");
        }

        let decoded = header::decode(&block);
        let mut s = self.state.lock();
        s.payload_offset = header_offset + BLOCK_SIZE as u64;
        s.entry = TarEntry::from_header(decoded);
        Ok(Some(s.entry.clone()))
    }

    fn read_block(&self, offset: u64) -> Result<Vec<u8>> {
        let block = self.source.read_at(offset, BLOCK_SIZE);
        if block.len() != BLOCK_SIZE {
            self.source.set_error();
            bail!(
                "truncated archive: {} header bytes at offset {offset}",
                block.len()
            );
        }
        Ok(block)
    }

    /// Serialized metadata for the current entry.
    pub fn metadata_blob(&self, tokens: Option<&dyn TokenTranslator>) -> Vec<u8> {
        build_metadata(&self.state.lock().entry, tokens)
    }

    /// Finalize the running digest, then walk the remaining archive entries,
    /// registering one session per entry. Directories, symlinks and specials
    /// are registered metadata-only and the walk continues; the first
    /// regular file is handed over as a live successor member and the walk
    /// stops there, since the pipe cannot advance past an unserved payload.
    ///
    /// The returned report carries `[0x01][sha512]`, one tagged record per
    /// announced entry, and, once the archive is exhausted, the child's
    /// accumulated stderr.
    pub fn drain_and_report(
        &self,
        sessions: &SessionRegistry,
        tokens: Option<&dyn TokenTranslator>,
    ) -> Vec<u8> {
        let digest: [u8; 64] = {
            let mut s = self.state.lock();
            let sha = std::mem::replace(&mut s.sha, Sha512::new());
            sha.finalize().into()
        };
        let mut report = vec![1u8];
        report.extend_from_slice(&digest);

        loop {
            let entry = match self.switch_next() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!("archive scan stopped: {err}");
                    break;
                }
            };

            let name = normalize_entry_name(&entry.name);
            let full_name = if name.is_empty() {
                self.output_fn.clone()
            } else {
                format!("{}/{}", self.output_fn, name)
            };

            let mut record = WireWriter::new();
            record.put_str(&full_name);
            record.put_u8(entry.is_dir as u8);
            record.put_u8(entry.is_symlink as u8);
            record.put_u8(entry.is_special as u8);
            record.put_str(&entry.symlink_target);
            record.put_varint(entry.size.max(0) as u64);
            record.put_u32(self.fn_random as u32);

            report.push(ID_ENTRY_RECORD);
            report.extend_from_slice(&(record.len() as u32).to_le_bytes());
            report.extend_from_slice(record.as_slice());

            let remote_fn = session_key(&self.output_fn, &name, self.backupnum, self.fn_random);
            let metadata = build_metadata(&entry, tokens);

            if entry.is_regular() {
                let successor = self.snapshot();
                self.state.lock().has_next = true;
                sessions.inject(&remote_fn, self.backupnum, Some(successor), metadata);
                return report;
            }
            sessions.inject(&remote_fn, self.backupnum, None, metadata);
        }

        report.extend_from_slice(&self.source.stderr_output());
        report
    }

    /// Exit code of the producing child. A member that handed off a
    /// successor reports success; the chain is still alive.
    pub fn exit_code(&self) -> Option<i32> {
        if self.state.lock().has_next {
            Some(0)
        } else {
            self.source.exit_code()
        }
    }

    /// Abandon the child unless a successor member still draws on it.
    pub fn force_exit(&self) {
        if !self.state.lock().has_next {
            self.source.force_exit();
        }
    }

    pub fn has_error(&self) -> bool {
        self.source.has_error()
    }

    pub fn last_activity(&self) -> Instant {
        self.source.last_activity()
    }

    pub fn stderr_output(&self) -> Vec<u8> {
        self.source.stderr_output()
    }

    pub fn add_user(&self) {
        self.source.add_user();
    }

    pub fn remove_user(&self) {
        self.source.remove_user();
    }

    pub fn has_user(&self) -> bool {
        self.source.has_user()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::header::tests::build_header;
    use super::*;
    use std::io::Write;

    fn archive_from_blocks(blocks: &[&[u8]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for block in blocks {
            file.write_all(block).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn member_over(file: &tempfile::NamedTempFile) -> TarMember {
        let cmd = format!("cat {}", file.path().display());
        TarMember::open(&cmd, 1, 77, "backup.tar").unwrap()
    }

    fn padded(payload: &[u8]) -> Vec<u8> {
        let mut block = payload.to_vec();
        block.resize(payload.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
        block
    }

    #[test]
    fn test_empty_archive_ends_without_error() {
        let file = archive_from_blocks(&[&[0u8; BLOCK_SIZE], &[0u8; BLOCK_SIZE]]);
        let member = member_over(&file);
        assert!(member.switch_next().unwrap().is_none());
        assert!(!member.has_error());
    }

    #[test]
    fn test_lone_zero_block_is_malformed() {
        let header = build_header("late.txt", 0, b'0', true, "");
        let file = archive_from_blocks(&[&[0u8; BLOCK_SIZE], &header]);
        let member = member_over(&file);
        assert!(member.switch_next().is_err());
        assert!(member.has_error());
    }

    #[test]
    fn test_truncated_header_is_an_error() {
        let file = archive_from_blocks(&[&[1u8; 100]]);
        let member = member_over(&file);
        assert!(member.switch_next().is_err());
        assert!(member.has_error());
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let mut header = build_header("x", 0, b'0', true, "");
        header[20] = b'!';
        let file = archive_from_blocks(&[&header, &[0u8; BLOCK_SIZE], &[0u8; BLOCK_SIZE]]);
        let member = member_over(&file);
        assert!(member.switch_next().is_err());
    }

    #[test]
    fn test_prefixed_entry_reads_and_digests() {
        let header = build_header("c.txt", 3, b'0', true, "a/b");
        let file = archive_from_blocks(&[
            &header,
            &padded(b"xyz"),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);

        let entry = member.switch_next().unwrap().unwrap();
        assert_eq!(entry.name, "a/b/c.txt");
        assert!(!entry.is_dir);
        assert_eq!(entry.size, 3);

        assert_eq!(member.read(16).unwrap(), b"xyz");
        let expected: [u8; 64] = Sha512::digest(b"xyz").into();
        assert_eq!(member.payload_digest(), expected);

        assert!(member.switch_next().unwrap().is_none());
    }

    #[test]
    fn test_read_at_partition_matches_payload_digest() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let header = build_header("fox.txt", payload.len() as u64, b'0', true, "");
        let file = archive_from_blocks(&[
            &header,
            &padded(payload),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);
        member.switch_next().unwrap().unwrap();

        // Arbitrary partition of the payload, including a clamped tail read.
        let mut collected = Vec::new();
        for (pos, len) in [(0i64, 10usize), (10, 1), (11, 20), (31, 100)] {
            collected.extend(member.read_at(pos, len).unwrap());
        }
        assert_eq!(collected, payload);

        let expected: [u8; 64] = Sha512::digest(payload).into();
        assert_eq!(member.payload_digest(), expected);
    }

    #[test]
    fn test_reads_clamp_at_member_boundary() {
        let header = build_header("small", 5, b'0', true, "");
        let file = archive_from_blocks(&[
            &header,
            &padded(b"hello"),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);
        member.switch_next().unwrap().unwrap();

        assert_eq!(member.read(3).unwrap(), b"hel");
        // Request far past the payload: only the remainder comes back.
        assert_eq!(member.read(BLOCK_SIZE).unwrap(), b"lo");
        assert!(member.read(1).unwrap().is_empty());
        assert!(member.read_at(5, 10).unwrap().is_empty());
        assert!(member.read_at(9, 10).unwrap().is_empty());
    }

    #[test]
    fn test_seek_bounds() {
        let header = build_header("s", 5, b'0', true, "");
        let file = archive_from_blocks(&[
            &header,
            &padded(b"01234"),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);
        member.switch_next().unwrap().unwrap();

        assert!(member.seek(2));
        assert_eq!(member.read(2).unwrap(), b"23");
        assert!(member.seek(5));
        assert!(!member.seek(6));
        assert!(!member.seek(-1));
    }

    #[test]
    fn test_multiple_entries_with_padding() {
        let first = build_header("one.bin", 600, b'0', true, "");
        let body_one: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let second = build_header("two.bin", 7, b'0', true, "");
        let file = archive_from_blocks(&[
            &first,
            &padded(&body_one),
            &second,
            &padded(b"seven!!"),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);

        let entry = member.switch_next().unwrap().unwrap();
        assert_eq!((entry.name.as_str(), entry.size), ("one.bin", 600));
        assert_eq!(member.read(1024).unwrap(), body_one);

        let entry = member.switch_next().unwrap().unwrap();
        assert_eq!((entry.name.as_str(), entry.size), ("two.bin", 7));
        assert_eq!(member.read(7).unwrap(), b"seven!!");

        assert!(member.switch_next().unwrap().is_none());
    }

    #[test]
    fn test_unavailable_member_rejects_reads() {
        let file = archive_from_blocks(&[&[0u8; BLOCK_SIZE], &[0u8; BLOCK_SIZE]]);
        let member = member_over(&file);
        assert!(member.read(4).is_err());
    }

    #[test]
    fn test_skipping_unread_payload() {
        // switch_next must step over the previous payload even if nobody
        // read a byte of it.
        let first = build_header("skipped", 100, b'0', true, "");
        let second = build_header("wanted", 2, b'0', true, "");
        let file = archive_from_blocks(&[
            &first,
            &padded(&[7u8; 100]),
            &second,
            &padded(b"ok"),
            &[0u8; BLOCK_SIZE],
            &[0u8; BLOCK_SIZE],
        ]);
        let member = member_over(&file);
        member.switch_next().unwrap().unwrap();
        let entry = member.switch_next().unwrap().unwrap();
        assert_eq!(entry.name, "wanted");
        assert_eq!(member.read(4).unwrap(), b"ok");
    }

    mod report {
        use super::*;

        #[test]
        fn test_drain_registers_sessions_and_chains() {
            let dir_header = build_header("data/", 0, b'5', true, "");
            let file_header = build_header("data/a.bin", 4, b'0', true, "");
            let trailing = build_header("data/b.bin", 2, b'0', true, "");
            let file = archive_from_blocks(&[
                &dir_header,
                &file_header,
                &padded(b"abcd"),
                &trailing,
                &padded(b"zz"),
                &[0u8; BLOCK_SIZE],
                &[0u8; BLOCK_SIZE],
            ]);
            let member = member_over(&file);
            let sessions = SessionRegistry::new();

            let report = member.drain_and_report(&sessions, None);
            assert_eq!(report[0], 1);
            // Digest of an untouched member is the digest of no bytes.
            let empty: [u8; 64] = Sha512::digest(b"").into();
            assert_eq!(&report[1..65], &empty);

            // The directory is metadata-only; the first regular file got a
            // live successor and the scan stopped before b.bin.
            let dir_entry = sessions.retrieve("backup.tar/data|1|77", 1).unwrap();
            assert!(dir_entry.member.is_none());
            assert!(!dir_entry.metadata.is_empty());
            let file_entry = sessions.retrieve("backup.tar/data/a.bin|1|77", 1).unwrap();
            let successor = file_entry.member.expect("live member");
            assert_eq!(successor.read(8).unwrap(), b"abcd");
            assert_eq!(member.exit_code(), Some(0));

            // Serving finished: draining the successor announces b.bin.
            let report = successor.drain_and_report(&sessions, None);
            let digest: [u8; 64] = Sha512::digest(b"abcd").into();
            assert_eq!(&report[1..65], &digest);
            let next = sessions.retrieve("backup.tar/data/b.bin|1|77", 1).unwrap();
            assert_eq!(next.member.expect("live member").read(4).unwrap(), b"zz");
        }
    }
}
