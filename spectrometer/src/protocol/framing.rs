//! Byte-stuffed framing used on the serial link
//!
//! A frame on the wire looks like:
//!
//! ```text
//! 10 02 <seq> <node> <len_lo> <len_hi> <stuffed payload> 10 03
//! ```
//!
//! Every `0x10` in the payload is doubled; the header goes out as is. The
//! length field carries the stuffed payload length on transmit. Received
//! frames are unstuffed from the head onwards, and replies from the
//! instrument declare the unstuffed length.

use tracing::{debug, trace, warn};

use crate::error::{Result, SpectrometerError};

/// Escape byte. Followed by `START`, `END` or another `MARKER`.
pub const MARKER: u8 = 0x10;
/// Second byte of a frame head.
pub const START: u8 = 0x02;
/// Second byte of a frame trailer.
pub const END: u8 = 0x03;

/// `[seq, node, len_lo, len_hi]` after unstuffing.
const BODY_HEADER_SIZE: usize = 4;

/// Received bytes retained while waiting for a frame to complete.
const MAX_BUFFERED: usize = 2 * (u16::MAX as usize + 8);

/// Double every `0x10` in `payload`.
pub fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8);
    for &byte in payload {
        out.push(byte);
        if byte == MARKER {
            out.push(MARKER);
        }
    }
    out
}

/// Build a complete frame for `payload` with sequence number `seq`.
///
/// Fails without producing anything if the stuffed payload does not fit the
/// 16-bit length field.
pub fn encode_frame(seq: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let stuffed = stuff(payload);
    let len = u16::try_from(stuffed.len())
        .map_err(|_| SpectrometerError::MessageTooLong(stuffed.len()))?;
    let len = len.to_le_bytes();

    let mut frame = Vec::with_capacity(stuffed.len() + 12);
    frame.extend_from_slice(&[MARKER, START]);
    frame.extend_from_slice(&[seq, 0, len[0], len[1]]);
    frame.extend_from_slice(&stuffed);
    frame.extend_from_slice(&[MARKER, END]);
    Ok(frame)
}

/// An unstuffed frame as received from the instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub seq: u8,
    pub node: u8,
    pub declared_len: u16,
    pub payload: Vec<u8>,
}

impl RawFrame {
    fn from_body(body: &[u8]) -> Self {
        Self {
            seq: body[0],
            node: body[1],
            declared_len: u16::from_le_bytes([body[2], body[3]]),
            payload: body[BODY_HEADER_SIZE..].to_vec(),
        }
    }
}

enum Scan {
    /// Frame trailer not seen yet.
    Incomplete,
    /// Escape followed by an unknown byte.
    Invalid,
    Complete { body: Vec<u8>, consumed: usize },
}

/// Reassembles frames from a byte stream.
///
/// Bytes are retained across calls so a frame split over several reads is
/// completed on a later call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        trace!("rx {:02x?}", bytes);
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFERED {
            let excess = self.buffer.len() - MAX_BUFFERED;
            warn!("Receive buffer overflow, dropping {} bytes", excess);
            self.buffer.drain(..excess);
        }
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for a frame to complete.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            match self.buffer.iter().position(|&b| b == MARKER) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            if self.buffer.len() < 2 {
                return None;
            }
            if self.buffer[1] != START {
                debug!("Not a frame head, resyncing");
                self.buffer.drain(..1);
                continue;
            }

            match self.scan() {
                Scan::Incomplete => return None,
                Scan::Invalid => {
                    debug!("Invalid escape in frame, resyncing");
                    self.buffer.drain(..1);
                }
                Scan::Complete { body, consumed } => {
                    self.buffer.drain(..consumed);
                    if body.len() < BODY_HEADER_SIZE {
                        warn!("Dropping frame with {} byte body", body.len());
                        continue;
                    }
                    return Some(RawFrame::from_body(&body));
                }
            }
        }
    }

    /// Unstuff the frame whose head sits at the start of the buffer.
    fn scan(&self) -> Scan {
        let mut body = Vec::new();
        let mut i = 2;
        while i < self.buffer.len() {
            let byte = self.buffer[i];
            if byte != MARKER {
                body.push(byte);
                i += 1;
                continue;
            }
            match self.buffer.get(i + 1) {
                None => return Scan::Incomplete,
                Some(&MARKER) => {
                    body.push(MARKER);
                    i += 2;
                }
                Some(&END) => {
                    return Scan::Complete {
                        body,
                        consumed: i + 2,
                    }
                }
                Some(_) => return Scan::Invalid,
            }
        }
        Scan::Incomplete
    }
}
