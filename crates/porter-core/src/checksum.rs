//! Checksum and hashing utilities for the transfer plane.

use md5::{Context, Digest};

const ADLER_MOD: u32 = 65521;

/// Adler-32 over a buffer, seeded with the standard initial value.
///
/// Used to terminate each section of a member metadata blob. Processes in
/// runs of 5552 bytes, the largest count for which the accumulators cannot
/// overflow before the modulo step.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

/// Streaming MD5 over one checkpoint window.
///
/// The hashed transfer protocol emits a 16-byte MD5 trailer after every
/// checkpoint boundary; both sides hash the payload window and restart.
pub struct Md5Window {
    ctx: Context,
}

impl Md5Window {
    pub fn new() -> Self {
        Self {
            ctx: Context::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.consume(data);
    }

    /// Finalize the current window and reset for the next one.
    pub fn finish_reset(&mut self) -> [u8; 16] {
        let ctx = std::mem::replace(&mut self.ctx, Context::new());
        let Digest(digest) = ctx.compute();
        digest
    }
}

impl Default for Md5Window {
    fn default() -> Self {
        Self::new()
    }
}
