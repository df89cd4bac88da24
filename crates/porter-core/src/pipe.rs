//! Random-access view over a child process's stdout.
//!
//! A `PipeSource` spawns a command, pulls its stdout through a bounded
//! reader thread, and retains a window of recently produced bytes so that
//! downstream consumers can issue absolute-offset reads slightly behind the
//! stream head. Offsets that have already left the window fail; the pipe
//! cannot rewind.
//!
//! The source is jointly owned (`Arc`) by every live archive member carved
//! out of it; the child is reaped when the last owner drops.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use eyre::{Context, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Stdout is pulled in chunks of this size.
const READ_CHUNK: usize = 64 * 1024;
/// Chunks buffered ahead of the consumer before the reader thread blocks.
const READAHEAD_CHUNKS: usize = 16;
/// Bytes retained behind the active read position for absolute-offset reads.
const RETAIN_BEHIND: u64 = 8 * 1024 * 1024;

struct Window {
    child: Child,
    rx: Receiver<std::io::Result<Vec<u8>>>,
    /// Absolute offset of `buf[0]`.
    base_offset: u64,
    buf: Vec<u8>,
    /// Cursor of the sequential-read view.
    seq_pos: u64,
    eof: bool,
    exit_code: Option<i32>,
}

impl Window {
    fn high(&self) -> u64 {
        self.base_offset + self.buf.len() as u64
    }

    /// Discard window bytes far behind the read in progress. Readers that
    /// fall more than the retained span behind the newest read lose their
    /// position.
    fn trim(&mut self, min_keep: u64) {
        let floor = min_keep.saturating_sub(RETAIN_BEHIND);
        if floor > self.base_offset {
            let drop = (floor - self.base_offset) as usize;
            self.buf.drain(..drop);
            self.base_offset = floor;
        }
    }
}

pub struct PipeSource {
    cmd: String,
    window: Mutex<Window>,
    stderr: Arc<Mutex<Vec<u8>>>,
    has_error: AtomicBool,
    users: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl PipeSource {
    /// Spawn `cmd` through the platform shell and begin draining its output.
    pub fn spawn(cmd: &str) -> Result<Arc<Self>> {
        let mut child = shell_command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning pipe command '{cmd}'"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre::eyre!("child has no stdout handle"))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre::eyre!("child has no stderr handle"))?;

        let (tx, rx) = bounded(READAHEAD_CHUNKS);
        thread::spawn(move || {
            let mut stdout = stdout;
            loop {
                let mut chunk = vec![0u8; READ_CHUNK];
                match stdout.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        chunk.truncate(n);
                        if tx.send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        let stderr = Arc::new(Mutex::new(Vec::new()));
        let stderr_sink = Arc::clone(&stderr);
        thread::spawn(move || {
            let mut child_stderr = child_stderr;
            let mut chunk = [0u8; 4096];
            while let Ok(n) = child_stderr.read(&mut chunk) {
                if n == 0 {
                    break;
                }
                stderr_sink.lock().extend_from_slice(&chunk[..n]);
            }
        });

        debug!("pipe source started: {cmd}");

        Ok(Arc::new(Self {
            cmd: cmd.to_string(),
            window: Mutex::new(Window {
                child,
                rx,
                base_offset: 0,
                buf: Vec::new(),
                seq_pos: 0,
                eof: false,
                exit_code: None,
            }),
            stderr,
            has_error: AtomicBool::new(false),
            users: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        }))
    }

    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// Read up to `max` bytes at an absolute stream offset. Returns a short
    /// or empty buffer at end of stream or after an error.
    pub fn read_at(&self, offset: u64, max: usize) -> Vec<u8> {
        if self.has_error.load(Ordering::Acquire) {
            return Vec::new();
        }

        let mut w = self.window.lock();
        if offset < w.base_offset {
            warn!(
                "pipe read at {} behind retained window base {}",
                offset, w.base_offset
            );
            self.set_error();
            return Vec::new();
        }

        self.fill_to(&mut w, offset, offset + max as u64);

        let high = w.high();
        if offset >= high {
            return Vec::new();
        }
        let start = (offset - w.base_offset) as usize;
        let end = ((offset + max as u64).min(high) - w.base_offset) as usize;
        let out = w.buf[start..end].to_vec();
        drop(w);

        *self.last_activity.lock() = Instant::now();
        out
    }

    /// Read up to `max` bytes at the sequential cursor and advance it.
    pub fn read(&self, max: usize) -> Vec<u8> {
        let pos = self.window.lock().seq_pos;
        let out = self.read_at(pos, max);
        self.window.lock().seq_pos = pos + out.len() as u64;
        out
    }

    /// Reposition the sequential cursor. Offsets behind the retained window
    /// cannot be served again.
    pub fn seek(&self, offset: u64) -> bool {
        let mut w = self.window.lock();
        if offset < w.base_offset {
            return false;
        }
        w.seq_pos = offset;
        true
    }

    fn fill_to(&self, w: &mut Window, min_keep: u64, end: u64) {
        // Polling receive: a blocking recv would pin the window lock while
        // the child stalls, and force_exit could never break the read.
        while !w.eof && w.high() < end {
            match w.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(chunk)) => {
                    w.buf.extend_from_slice(&chunk);
                    w.trim(min_keep);
                }
                Ok(Err(e)) => {
                    warn!("pipe command '{}' read failed: {e}", self.cmd);
                    w.eof = true;
                    self.set_error();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.has_error.load(Ordering::Acquire) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    w.eof = true;
                }
            }
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    pub fn set_error(&self) {
        self.has_error.store(true, Ordering::Release);
    }

    /// Instant of the most recent successful read.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Stderr accumulated from the child since the last call.
    pub fn stderr_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.stderr.lock())
    }

    /// Exit code, once the child has terminated. `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        let mut w = self.window.lock();
        if w.exit_code.is_some() {
            return w.exit_code;
        }
        match w.child.try_wait() {
            Ok(Some(status)) => {
                w.exit_code = Some(status.code().unwrap_or(-1));
                w.exit_code
            }
            _ => None,
        }
    }

    /// Abandon the child: mark the stream failed, kill and reap the process.
    pub fn force_exit(&self) {
        self.set_error();
        let mut w = self.window.lock();
        w.eof = true;
        if w.exit_code.is_none() {
            let _ = w.child.kill();
            if let Ok(status) = w.child.wait() {
                w.exit_code = Some(status.code().unwrap_or(-1));
            }
        }
    }

    pub fn add_user(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_user(&self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn has_user(&self) -> bool {
        self.users.load(Ordering::Acquire) > 0
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        let w = self.window.get_mut();
        if w.exit_code.is_none() {
            let _ = w.child.kill();
            let _ = w.child.wait();
        }
    }
}

#[cfg(unix)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}
