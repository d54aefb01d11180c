//! Serial transport using the byte-stuffed frame protocol
//!
//! The port runs at 115200 baud, 8N1, with RTS/CTS flow control. Each command
//! is sent as one frame carrying an 8-bit sequence number; the reply frame
//! echoes it, and anything with a different sequence number is discarded.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, trace, warn};

use super::Transport;
use crate::error::{Result, SpectrometerError};
use crate::protocol::{encode_frame, FrameDecoder, RawFrame, ERROR_TAG};

/// Line rate fixed by the instrument firmware.
pub const BAUD_RATE: u32 = 115_200;

const READ_CHUNK: usize = 1024;

/// Byte stream underneath the framing layer.
///
/// Implemented for real serial ports; tests substitute an in-memory link.
pub trait SerialLink: Read + Write + Send {
    /// Bound the next `read` call.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }
}

/// Framed serial link to an instrument.
pub struct SerialTransport<L: SerialLink = Box<dyn SerialPort>> {
    link: L,
    decoder: FrameDecoder,
    next_seq: u8,
}

impl SerialTransport {
    /// Open and configure the serial device at `path`, dropping stale input.
    pub fn open(path: &str) -> Result<Self> {
        info!("Opening serial port {}", path);
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Hardware)
            .timeout(Duration::from_millis(1000))
            .open()?;
        port.clear(ClearBuffer::All)?;
        Ok(Self::new(port))
    }
}

impl<L: SerialLink> SerialTransport<L> {
    /// Wrap an already configured link.
    pub fn new(link: L) -> Self {
        Self {
            link,
            decoder: FrameDecoder::new(),
            next_seq: 0,
        }
    }

    /// Sequence number the next frame will carry.
    pub fn next_seq(&self) -> u8 {
        self.next_seq
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Sequence number of the most recently sent frame.
    fn last_seq(&self) -> u8 {
        self.next_seq.wrapping_sub(1)
    }

    /// Turn a matching frame into a reply payload.
    fn frame_payload(frame: RawFrame) -> Result<Vec<u8>> {
        let declared = usize::from(frame.declared_len);
        if declared == 0 {
            // Error frame: a single error code byte
            if frame.payload.len() != 1 {
                return Err(SpectrometerError::InvalidReply(format!(
                    "invalid length for error frame ({} != 1)",
                    frame.payload.len()
                )));
            }
            warn!("Device reported error {}", frame.payload[0]);
            return Ok(vec![ERROR_TAG, frame.payload[0]]);
        }
        if declared != frame.payload.len() {
            warn!(
                "Dropping frame {}: declared length {} but carried {}",
                frame.seq,
                declared,
                frame.payload.len()
            );
            return Err(SpectrometerError::FrameLength {
                declared,
                actual: frame.payload.len(),
            });
        }
        Ok(frame.payload)
    }
}

impl<L: SerialLink> Transport for SerialTransport<L> {
    fn write_message(&mut self, message: &[u8]) -> Result<()> {
        let frame = encode_frame(self.next_seq, message)?;
        debug!("Sending frame {} ({} byte payload)", self.next_seq, message.len());
        trace!("tx {:02x?}", frame);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.link.write_all(&frame)?;
        self.link.flush()?;
        Ok(())
    }

    fn read_message(
        &mut self,
        timeout: Duration,
        _expected_size: usize,
        _expected_tag: u8,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let expected = self.last_seq();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            while let Some(frame) = self.decoder.next_frame() {
                if frame.seq != expected {
                    debug!(
                        "Discarding frame with sequence {} (waiting for {})",
                        frame.seq, expected
                    );
                    continue;
                }
                debug!("Received frame {} ({} bytes)", frame.seq, frame.payload.len());
                return Self::frame_payload(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SpectrometerError::Timeout(timeout));
            }
            self.link.set_read_timeout(remaining)?;
            match self.link.read(&mut chunk) {
                Ok(n) => self.decoder.push(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Err(SpectrometerError::Timeout(timeout));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// In-memory link for exercising the framing layer without hardware.
///
/// Reads are served from queued chunks or errors; an empty queue reads as a
/// timeout.
#[derive(Debug, Default)]
pub struct LoopbackLink {
    pub incoming: VecDeque<std::io::Result<Vec<u8>>>,
    pub written: Vec<u8>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by a later read.
    pub fn queue(&mut self, bytes: impl Into<Vec<u8>>) {
        self.incoming.push_back(Ok(bytes.into()));
    }

    /// Fail a later read with `kind`.
    pub fn queue_error(&mut self, kind: ErrorKind) {
        self.incoming.push_back(Err(kind.into()));
    }
}

impl Read for LoopbackLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut chunk = match self.incoming.pop_front() {
            Some(next) => next?,
            None => return Err(ErrorKind::TimedOut.into()),
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.incoming.push_front(Ok(chunk.split_off(n)));
        }
        Ok(n)
    }
}

impl Write for LoopbackLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SerialLink for LoopbackLink {
    fn set_read_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn transport() -> SerialTransport<LoopbackLink> {
        SerialTransport::new(LoopbackLink::new())
    }

    /// Reply frame as the instrument sends it: unstuffed payload length.
    fn reply(seq: u8, payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() as u16).to_le_bytes();
        let mut body = vec![seq, 0, len[0], len[1]];
        body.extend_from_slice(payload);
        let mut frame = vec![0x10, 0x02];
        frame.extend(crate::protocol::stuff(&body));
        frame.extend_from_slice(&[0x10, 0x03]);
        frame
    }

    #[test]
    fn test_write_frames_and_increments_sequence() {
        let mut t = transport();
        t.write_message(&[0x01]).unwrap();
        t.write_message(&[0x09, 0x00]).unwrap();
        assert_eq!(
            t.link().written,
            vec![
                0x10, 0x02, 0, 0, 1, 0, 0x01, 0x10, 0x03, //
                0x10, 0x02, 1, 0, 2, 0, 0x09, 0x00, 0x10, 0x03,
            ]
        );
        assert_eq!(t.next_seq(), 2);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut t = transport();
        for _ in 0..256 {
            t.write_message(&[0x06]).unwrap();
        }
        assert_eq!(t.next_seq(), 0);
    }

    #[test]
    fn test_oversized_message_not_sent() {
        let mut t = transport();
        let err = t.write_message(&vec![0x10; 0x8000]).unwrap_err();
        assert!(matches!(err, SpectrometerError::MessageTooLong(0x10000)));
        assert!(t.link().written.is_empty());
        assert_eq!(t.next_seq(), 0);
    }

    #[test]
    fn test_read_matching_reply() {
        let mut t = transport();
        t.write_message(&[0x08, 0, 0, 0, 0x10, 0]).unwrap();
        t.link_mut().queue(reply(0, &[0x88]));
        assert_eq!(t.read_message(TIMEOUT, 1, 0x88).unwrap(), vec![0x88]);
    }

    #[test]
    fn test_read_discards_stale_sequence() {
        let mut t = transport();
        t.write_message(&[0x01]).unwrap();
        t.write_message(&[0x06]).unwrap();
        let mut stream = reply(0, &[0x81, 0x00]);
        stream.extend(reply(1, &[0x86, 0x01]));
        t.link_mut().queue(stream);
        assert_eq!(t.read_message(TIMEOUT, 2, 0x86).unwrap(), vec![0x86, 0x01]);
    }

    #[test]
    fn test_read_reassembles_split_reply() {
        let mut t = transport();
        t.write_message(&[0x04, 1]).unwrap();
        let frame = reply(0, &[0x83, 0x10, 0x10, 0x20]);
        let (a, b) = frame.split_at(5);
        t.link_mut().queue(a.to_vec());
        t.link_mut().queue(b.to_vec());
        assert_eq!(
            t.read_message(TIMEOUT, 0, 0x83).unwrap(),
            vec![0x83, 0x10, 0x10, 0x20]
        );
    }

    #[test]
    fn test_error_frame_becomes_error_reply() {
        let mut t = transport();
        t.write_message(&[0x07, 1, 1]).unwrap();
        t.link_mut()
            .queue(vec![0x10, 0x02, 0, 0, 0, 0, 0x04, 0x10, 0x03]);
        assert_eq!(t.read_message(TIMEOUT, 1, 0x87).unwrap(), vec![0x00, 0x04]);
    }

    #[test]
    fn test_length_mismatch_reported() {
        let mut t = transport();
        t.write_message(&[0x09, 0]).unwrap();
        t.link_mut()
            .queue(vec![0x10, 0x02, 0, 0, 3, 0, 0x89, 0x10, 0x03]);
        let err = t.read_message(TIMEOUT, 1, 0x89).unwrap_err();
        assert!(matches!(
            err,
            SpectrometerError::FrameLength {
                declared: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_read_retries_after_interrupt() {
        let mut t = transport();
        t.write_message(&[0x06]).unwrap();
        t.link_mut().queue_error(ErrorKind::Interrupted);
        t.link_mut().queue(reply(0, &[0x86, 0x01]));
        assert_eq!(t.read_message(TIMEOUT, 2, 0x86).unwrap(), vec![0x86, 0x01]);
        assert!(t.link().incoming.is_empty());
    }

    #[test]
    fn test_read_surfaces_link_errors() {
        let mut t = transport();
        t.write_message(&[0x06]).unwrap();
        t.link_mut().queue_error(ErrorKind::BrokenPipe);
        assert!(matches!(
            t.read_message(TIMEOUT, 2, 0x86),
            Err(SpectrometerError::Io(e)) if e.kind() == ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn test_read_times_out() {
        let mut t = transport();
        t.write_message(&[0x01]).unwrap();
        let err = t.read_message(TIMEOUT, 327, 0x81).unwrap_err();
        assert!(matches!(err, SpectrometerError::Timeout(_)));
    }
}
