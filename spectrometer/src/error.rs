//! Error types for spectrometer communication.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a spectrometer.
///
/// The variants fall into a few groups: configuration errors (bad indices,
/// ranges or password length, reported before anything is transmitted),
/// protocol errors (empty, short or mis-sized replies and device error codes),
/// consistency violations in decoded data, and transport I/O failures.
///
/// [`UnexpectedReply`](Self::UnexpectedReply) is kept distinct from the other
/// protocol errors so callers can match on it; the EEPROM write maps it to
/// [`IncorrectPassword`](Self::IncorrectPassword).
#[derive(Error, Debug)]
pub enum SpectrometerError {
    /// Low-level I/O error on the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to open or configure the serial port.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB transfer or enumeration failure.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// No matching instrument was found.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The requested backend was not compiled in.
    #[error("Unsupported backend: {0}")]
    Unsupported(String),

    /// No reply arrived within the timeout.
    #[error("Timeout waiting for reply ({0:?})")]
    Timeout(Duration),

    /// The transport returned a reply without any bytes.
    #[error("Empty reply")]
    EmptyReply,

    /// The reply size differs from the size the command always produces.
    #[error("Incorrect reply size ({actual} != {expected})")]
    ReplySize {
        /// Size the command should produce
        expected: usize,
        /// Size actually received
        actual: usize,
    },

    /// The instrument answered with an error frame.
    #[error("Device returned error: {code}")]
    DeviceError {
        /// Error code reported by the firmware
        code: u8,
    },

    /// The reply tag does not belong to the command that was sent.
    #[error("Incorrect reply: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedReply {
        /// Reply tag the command should produce
        expected: u8,
        /// Tag actually received
        actual: u8,
    },

    /// The instrument refused an EEPROM write.
    #[error("Incorrect password")]
    IncorrectPassword,

    /// EEPROM passwords are exactly 15 bytes.
    #[error("Incorrect password size ({0} != 15)")]
    PasswordLength(usize),

    /// The framed message does not fit the 16-bit length field.
    #[error("Message too long ({0} >= 65536)")]
    MessageTooLong(usize),

    /// A serial frame declared a different length than it carried.
    #[error("Incorrect message length ({declared} != {actual})")]
    FrameLength {
        /// Length in the frame header
        declared: usize,
        /// Length of the decoded payload
        actual: usize,
    },

    /// The status blob describes an instrument this driver cannot handle.
    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    /// A reply had the right tag but nonsensical content.
    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    /// Argument rejected before anything was sent to the instrument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Sample reply declares a pixel range other than the configured one.
    #[error(
        "Consistency check failed for data range: configured [{min}, {max}), \
         received [{data_min}, {data_max})"
    )]
    RangeMismatch {
        /// Configured first pixel
        min: usize,
        /// Configured end pixel (exclusive)
        max: usize,
        /// First pixel declared by the reply
        data_min: usize,
        /// End pixel declared by the reply (exclusive)
        data_max: usize,
    },

    /// Raw sample values are always multiples of 4.
    #[error("Raw sample {raw:#06x} at pixel {index} is not a multiple of 4")]
    UnalignedSample {
        /// Pixel index of the offending sample (extra pixels count from 0)
        index: usize,
        /// Raw 16-bit value
        raw: u16,
    },

    /// Sample reply is shorter than its header implies.
    #[error("Sample reply too short ({actual} < {expected})")]
    ShortReply {
        /// Bytes required by the declared range
        expected: usize,
        /// Bytes received
        actual: usize,
    },

    /// `end_read` called without a preceding `start_read`.
    #[error("No measurement armed")]
    NotArmed,

    /// An asynchronous read owns the transport until it is joined.
    #[error("Asynchronous read in progress")]
    ReadInProgress,

    /// Cancel or join requested without an outstanding asynchronous read.
    #[error("No asynchronous read in progress")]
    NoReadInProgress,

    /// The asynchronous read worker panicked and took the transport with it.
    #[error("Read worker panicked")]
    WorkerPanicked,

    /// The transport was lost with a panicked worker.
    #[error("Transport lost")]
    TransportLost,

    /// Configuration file could not be parsed or written.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl SpectrometerError {
    /// True for a reply tag mismatch, the one recoverable protocol error.
    pub fn is_unexpected_reply(&self) -> bool {
        matches!(self, SpectrometerError::UnexpectedReply { .. })
    }

    /// True for consistency violations in decoded sample data.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            SpectrometerError::RangeMismatch { .. }
                | SpectrometerError::UnalignedSample { .. }
                | SpectrometerError::ShortReply { .. }
        )
    }
}

/// Result type for spectrometer operations.
pub type Result<T> = std::result::Result<T, SpectrometerError>;
