//! Length-prefixed JSON framing.
//!
//! A frame is a little-endian `i32` byte count followed by that many bytes of
//! UTF-8 JSON. The same [`Transport`] offers two receive operations with
//! different suspension contracts:
//!
//! * [`Transport::receive`] blocks (up to the socket's read timeout) until a
//!   whole frame has arrived.
//! * [`Transport::poll`] never waits. It moves whatever bytes are readable
//!   right now into the partial-frame accumulator and returns `Ok(None)` until
//!   the frame is complete.
//!
//! Both operate on the same accumulator, so a frame that started arriving
//! while polling can be finished by a blocking receive after the owning
//! instance switches modes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde_json::Value;
use std::io::{self, Read, Write};

use crate::error::{HarnessError, Result};

const LEN_BYTES: usize = 4;
const READ_CHUNK: usize = 64 * 1024;

pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    let len = i32::try_from(payload.len())
        .map_err(|_| HarnessError::protocol(format!("frame too large: {} bytes", payload.len())))?;
    let mut frame = Vec::with_capacity(LEN_BYTES + payload.len());
    frame.write_i32::<LittleEndian>(len)?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode_payload(bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| HarnessError::protocol(format!("malformed frame payload: {e}")))
}

// =============================================================================
// Partial Frame Accumulator
// =============================================================================

#[derive(Debug, Default)]
struct PartialFrame {
    buf: Vec<u8>,
    /// Payload length, once the length prefix has fully arrived.
    expected: Option<usize>,
}

impl PartialFrame {
    fn remaining(&self) -> usize {
        match self.expected {
            None => LEN_BYTES - self.buf.len(),
            Some(len) => len - self.buf.len(),
        }
    }

    /// Called once `remaining()` hits zero. Returns the payload when the
    /// completed stage was the payload itself.
    fn complete_stage(&mut self) -> Result<Option<Vec<u8>>> {
        match self.expected {
            None => {
                let len = self.buf.as_slice().read_i32::<LittleEndian>()?;
                self.buf.clear();
                let len = usize::try_from(len)
                    .map_err(|_| HarnessError::protocol(format!("negative frame length {len}")))?;
                self.expected = Some(len);
                Ok(None)
            }
            Some(_) => {
                self.expected = None;
                Ok(Some(std::mem::take(&mut self.buf)))
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.expected.is_none() && self.buf.is_empty()
    }
}

// =============================================================================
// Transport
// =============================================================================

pub struct Transport<S> {
    stream: S,
    partial: PartialFrame,
}

impl<S: Read + Write> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            partial: PartialFrame::default(),
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Swaps in a fresh stream and drops any half-received frame.
    pub fn replace_stream(&mut self, stream: S) -> S {
        self.partial = PartialFrame::default();
        std::mem::replace(&mut self.stream, stream)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn has_partial_frame(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Writes the length prefix and payload with a single `write_all`.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let frame = encode_frame(msg)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until a full frame has been read.
    pub fn receive(&mut self) -> Result<Value> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let want = self.partial.remaining();
            if want == 0 {
                if let Some(payload) = self.partial.complete_stage()? {
                    return decode_payload(&payload);
                }
                continue;
            }
            let limit = want.min(chunk.len());
            match self.stream.read(&mut chunk[..limit]) {
                Ok(0) => {
                    let what = if self.partial.expected.is_none() {
                        "message length"
                    } else {
                        "message"
                    };
                    return Err(HarnessError::protocol(format!(
                        "connection closed before full {what} was received"
                    )));
                }
                Ok(n) => self.partial.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads whatever is available without waiting. `Ok(None)` means the
    /// frame has not fully arrived yet; call again later.
    ///
    /// Never reads past the end of the current frame, so back-to-back frames
    /// come out one per completed call.
    pub fn poll(&mut self) -> Result<Option<Value>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let want = self.partial.remaining();
            if want == 0 {
                if let Some(payload) = self.partial.complete_stage()? {
                    return decode_payload(&payload).map(Some);
                }
                continue;
            }
            let limit = want.min(chunk.len());
            match self.stream.read(&mut chunk[..limit]) {
                // nothing readable right now
                Ok(0) => return Ok(None),
                Ok(n) => self.partial.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
