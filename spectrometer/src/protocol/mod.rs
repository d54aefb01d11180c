//! Wire protocol for the spectrometer command set
//!
//! Every exchange is a command message whose first byte is the command tag,
//! answered by a reply whose first byte is the reply tag. Reply tags are the
//! command tag with the high bit set, except that both measurement commands
//! answer with the sample tag `0x83`. A reply whose first byte is `0x00` is an
//! error frame carrying the firmware error code in its second byte.
//!
//! | Command              | Tag  | Reply | Reply size |
//! |----------------------|------|-------|------------|
//! | read status          | 0x01 | 0x81  | 327        |
//! | write EEPROM         | 0x02 | 0x82  | 1          |
//! | start measurement    | 0x03 | 0x83  | variable   |
//! | read next channel    | 0x04 | 0x83  | variable   |
//! | read digital input   | 0x06 | 0x86  | 2          |
//! | set digital output   | 0x07 | 0x87  | 1          |
//! | configure range      | 0x08 | 0x88  | 1          |
//! | set external trigger | 0x09 | 0x89  | 1          |
//! | set fixed strobe     | 0x0A | 0x8A  | 1          |
//! | set strobe count     | 0x0B | 0x8B  | 1          |

pub mod framing;
pub mod packed_float;

pub use framing::{encode_frame, stuff, FrameDecoder, RawFrame};
pub use packed_float::PackedF32;

use strum::Display;

/// Size of the read-status reply including its tag byte.
pub const STATUS_SIZE: usize = 327;

/// First byte of a device error frame.
pub const ERROR_TAG: u8 = 0x00;

/// Reply tag shared by both measurement commands.
pub const SAMPLE_TAG: u8 = 0x83;

/// Sample replies start with `[tag, ?, min LE16, (max - 1) LE16]`.
pub const SAMPLE_HEADER_SIZE: usize = 6;

/// Largest channel count an instrument may report.
pub const MAX_CHANNELS: usize = 7;

/// Calibration slots stored in the EEPROM, independent of the channel count.
pub const EEPROM_SLOTS: usize = 8;

/// EEPROM write passwords are exactly this long.
pub const PASSWORD_LEN: usize = 15;

/// Number of digital output lines.
pub const MAX_DIGITAL: usize = 10;

/// Command tags understood by the instrument firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum Command {
    #[strum(serialize = "read status")]
    ReadStatus = 0x01,
    #[strum(serialize = "write EEPROM")]
    WriteEeprom = 0x02,
    #[strum(serialize = "start measurement")]
    StartMeasurement = 0x03,
    #[strum(serialize = "read next channel")]
    ReadNextChannel = 0x04,
    #[strum(serialize = "read digital input")]
    ReadDigitalInput = 0x06,
    #[strum(serialize = "set digital output")]
    SetDigitalOutput = 0x07,
    #[strum(serialize = "configure range")]
    ConfigureRange = 0x08,
    #[strum(serialize = "set external trigger")]
    SetExternalTrigger = 0x09,
    #[strum(serialize = "set fixed strobe")]
    SetFixedStrobe = 0x0A,
    #[strum(serialize = "set strobe count")]
    SetStrobeCount = 0x0B,
}

impl Command {
    /// First byte of the command message.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// First byte of a successful reply.
    pub fn reply_tag(self) -> u8 {
        match self {
            Command::StartMeasurement | Command::ReadNextChannel => SAMPLE_TAG,
            other => other.tag() | 0x80,
        }
    }

    /// Fixed reply size, or 0 when the size depends on the configured range.
    pub fn reply_size(self) -> usize {
        match self {
            Command::ReadStatus => STATUS_SIZE,
            Command::StartMeasurement | Command::ReadNextChannel => 0,
            Command::ReadDigitalInput => 2,
            _ => 1,
        }
    }

    /// Look up a command by its tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let command = match tag {
            0x01 => Command::ReadStatus,
            0x02 => Command::WriteEeprom,
            0x03 => Command::StartMeasurement,
            0x04 => Command::ReadNextChannel,
            0x06 => Command::ReadDigitalInput,
            0x07 => Command::SetDigitalOutput,
            0x08 => Command::ConfigureRange,
            0x09 => Command::SetExternalTrigger,
            0x0A => Command::SetFixedStrobe,
            0x0B => Command::SetStrobeCount,
            _ => return None,
        };
        Some(command)
    }
}

/// `[0x03, ms LE16, average LE16]`
pub fn start_measurement(integration_ms: u16, average: u16) -> [u8; 5] {
    let ms = integration_ms.to_le_bytes();
    let avg = average.to_le_bytes();
    [
        Command::StartMeasurement.tag(),
        ms[0],
        ms[1],
        avg[0],
        avg[1],
    ]
}

/// `[0x04, channel]`
pub fn read_next_channel(channel: u8) -> [u8; 2] {
    [Command::ReadNextChannel.tag(), channel]
}

/// `[0x08, channel, min LE16, (max - 1) LE16]`
///
/// `max` must be non-zero.
pub fn configure_range(channel: u8, min: u16, max: u16) -> [u8; 6] {
    let lo = min.to_le_bytes();
    let hi = max.saturating_sub(1).to_le_bytes();
    [
        Command::ConfigureRange.tag(),
        channel,
        lo[0],
        lo[1],
        hi[0],
        hi[1],
    ]
}

/// `[0x07, line, value]`
pub fn set_digital_output(line: u8, value: bool) -> [u8; 3] {
    [Command::SetDigitalOutput.tag(), line, value as u8]
}

/// `[0x0B, count LE16]`
pub fn set_strobe_count(count: u16) -> [u8; 3] {
    let c = count.to_le_bytes();
    [Command::SetStrobeCount.tag(), c[0], c[1]]
}

/// Single-flag commands: external trigger and fixed strobe.
pub fn set_flag(command: Command, value: bool) -> [u8; 2] {
    [command.tag(), value as u8]
}
