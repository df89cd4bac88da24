//! Length-delimited packet framing over a reliable byte stream.
//!
//! Requests and the list reply travel as framed packets (u32-LE length,
//! then the payload); file payload bytes are streamed raw outside the
//! framer. The receive side reassembles packets from arbitrarily fragmented
//! reads.

use eyre::{bail, Result};
use std::io::Write;

/// Upper bound on a single framed packet. Anything larger is a protocol
/// violation, not data.
const MAX_PACKET_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct FrameStack {
    buf: Vec<u8>,
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one framed packet to the stream.
    pub fn send(stream: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
        stream.write_all(&(payload.len() as u32).to_le_bytes())?;
        stream.write_all(payload)?;
        stream.flush()
    }

    /// Feed received bytes into the reassembly buffer.
    pub fn add_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete packet, if one has been assembled.
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_PACKET_SIZE {
            bail!("framed packet of {} bytes exceeds protocol limit", len);
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let packet = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(packet))
    }

    /// Discard any partially assembled state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
