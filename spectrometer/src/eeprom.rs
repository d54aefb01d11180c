//! Instrument status blob and EEPROM contents
//!
//! The read-status reply is a fixed 327-byte image of the configuration
//! EEPROM preceded by the reply tag:
//!
//! | Offset          | Size | Field                                   |
//! |-----------------|------|-----------------------------------------|
//! | 0x00            | 1    | reply tag                               |
//! | 0x01            | 64   | version string                          |
//! | 0x41            | 2    | device id (LE)                          |
//! | 0x43            | 1    | channel count (at most 7)               |
//! | 0x44            | 2    | pixel count (LE, at most 0x800)         |
//! | 0x46            | 1    | sensor code                             |
//! | 0x47 + i * 0x20 | 32   | calibration record `i`, eight in total  |
//!
//! A calibration record holds seven packed floats (five wavelength fit
//! terms, gain and offset), the LE16 start pixel and the LE16 last pixel.
//!
//! Writing uses the same body after a preamble of the command tag, the
//! 15-byte password and a reserved zero byte.

use bytemuck::{bytes_of, Pod, Zeroable};
use tracing::debug;

use crate::channel::{PixelLayout, FULL_SENSOR_PIXELS};
use crate::error::{Result, SpectrometerError};
use crate::protocol::{
    Command, PackedF32, EEPROM_SLOTS, MAX_CHANNELS, PASSWORD_LEN, STATUS_SIZE,
};

/// Wavelength fit terms, gain and offset.
pub const CALIBRATION_TERMS: usize = 7;

/// Polynomial terms used for the pixel to wavelength fit.
pub const WAVELENGTH_TERMS: usize = 5;

/// Calibration record as stored in the EEPROM.
///
/// Total size: 32 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ChannelRecord {
    pub calibration: [PackedF32; CALIBRATION_TERMS],
    pub start: [u8; 2],
    /// Last pixel of the range, inclusive
    pub stop_inclusive: [u8; 2],
}

/// EEPROM image shared by the status reply and the write command.
///
/// Total size: 326 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct EepromBody {
    pub version: [u8; 64],
    pub device_id: [u8; 2],
    pub num_channels: u8,
    pub num_pixels: [u8; 2],
    pub sensor: u8,
    pub channels: [ChannelRecord; EEPROM_SLOTS],
}

/// Read-status reply.
///
/// Total size: 327 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StatusBlob {
    pub tag: u8,
    pub body: EepromBody,
}

/// Write-EEPROM command.
///
/// Total size: 343 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct WriteEepromCommand {
    pub tag: u8,
    pub password: [u8; PASSWORD_LEN],
    pub reserved: u8,
    pub body: EepromBody,
}

impl WriteEepromCommand {
    pub const SIZE: usize = 343;
}

/// One calibration slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CalibrationRecord {
    /// Five wavelength fit terms, gain, offset
    pub coefficients: [f32; CALIBRATION_TERMS],
    /// First pixel
    pub start: u16,
    /// End pixel (exclusive)
    pub stop: u16,
}

impl CalibrationRecord {
    fn from_raw(raw: &ChannelRecord) -> Self {
        Self {
            coefficients: raw.calibration.map(PackedF32::to_f32),
            start: u16::from_le_bytes(raw.start),
            stop: u16::from_le_bytes(raw.stop_inclusive).wrapping_add(1),
        }
    }

    fn to_raw(self) -> ChannelRecord {
        ChannelRecord {
            calibration: self.coefficients.map(PackedF32::from_f32),
            start: self.start.to_le_bytes(),
            stop_inclusive: self.stop.wrapping_sub(1).to_le_bytes(),
        }
    }

    /// Wavelength of `pixel` from the polynomial fit terms.
    pub fn wavelength(&self, pixel: usize) -> f64 {
        let x = pixel as f64;
        self.coefficients[..WAVELENGTH_TERMS]
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * x + f64::from(c))
    }

    pub fn gain(&self) -> f32 {
        self.coefficients[5]
    }

    pub fn offset(&self) -> f32 {
        self.coefficients[6]
    }
}

/// Decoded EEPROM contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Eeprom {
    pub version: [u8; 64],
    pub device_id: u16,
    pub sensor: u8,
    pub channels: [CalibrationRecord; EEPROM_SLOTS],
}

impl Default for Eeprom {
    fn default() -> Self {
        Self {
            version: [0; 64],
            device_id: 0,
            sensor: 0,
            channels: [CalibrationRecord::default(); EEPROM_SLOTS],
        }
    }
}

impl Eeprom {
    /// Decode the EEPROM image.
    pub fn from_body(body: &EepromBody) -> Self {
        Self {
            version: body.version,
            device_id: u16::from_le_bytes(body.device_id),
            sensor: body.sensor,
            channels: body.channels.map(|raw| CalibrationRecord::from_raw(&raw)),
        }
    }

    /// Encode the EEPROM image for an instrument with the given geometry.
    pub fn to_body(&self, num_channels: u8, layout: PixelLayout) -> EepromBody {
        EepromBody {
            version: self.version,
            device_id: self.device_id.to_le_bytes(),
            num_channels,
            num_pixels: (layout.reported() as u16).to_le_bytes(),
            sensor: self.sensor,
            channels: self.channels.map(CalibrationRecord::to_raw),
        }
    }

    /// Version string up to the first NUL, without trailing padding.
    pub fn version_string(&self) -> String {
        let end = self.version.iter().position(|&b| b == 0).unwrap_or(64);
        String::from_utf8_lossy(&self.version[..end])
            .trim_end()
            .to_string()
    }

    /// Store `version`, truncated to 64 bytes and NUL padded.
    pub fn set_version(&mut self, version: &str) {
        self.version = [0; 64];
        let bytes = version.as_bytes();
        let n = bytes.len().min(64);
        self.version[..n].copy_from_slice(&bytes[..n]);
    }

    /// Build the write command, rejecting bad passwords before anything is sent.
    pub fn write_command(
        &self,
        password: &[u8],
        num_channels: u8,
        layout: PixelLayout,
    ) -> Result<Vec<u8>> {
        let password: [u8; PASSWORD_LEN] = password
            .try_into()
            .map_err(|_| SpectrometerError::PasswordLength(password.len()))?;
        let command = WriteEepromCommand {
            tag: Command::WriteEeprom.tag(),
            password,
            reserved: 0,
            body: self.to_body(num_channels, layout),
        };
        Ok(bytes_of(&command).to_vec())
    }
}

/// Parsed read-status reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub eeprom: Eeprom,
    pub num_channels: usize,
    pub layout: PixelLayout,
}

impl DeviceStatus {
    /// Parse and sanity check a 327-byte status reply.
    pub fn parse(reply: &[u8]) -> Result<Self> {
        let blob: &StatusBlob = bytemuck::try_from_bytes(reply).map_err(|_| {
            SpectrometerError::InvalidStatus(format!(
                "status is {} bytes, expected {}",
                reply.len(),
                STATUS_SIZE
            ))
        })?;
        let body = &blob.body;

        let num_channels = usize::from(body.num_channels);
        if num_channels > MAX_CHANNELS {
            return Err(SpectrometerError::InvalidStatus(format!(
                "invalid number of channels ({} > {})",
                num_channels, MAX_CHANNELS
            )));
        }
        let reported = usize::from(u16::from_le_bytes(body.num_pixels));
        if reported > FULL_SENSOR_PIXELS {
            return Err(SpectrometerError::InvalidStatus(format!(
                "invalid number of pixels ({:#x} > {:#x})",
                reported, FULL_SENSOR_PIXELS
            )));
        }

        let status = Self {
            eeprom: Eeprom::from_body(body),
            num_channels,
            layout: PixelLayout::from_reported(reported),
        };
        debug!(
            "Status: {} channels, {} pixels + {} extra",
            status.num_channels, status.layout.pixel_count, status.layout.extra_pixels
        );
        Ok(status)
    }

    /// Encode as a read-status reply.
    pub fn to_reply(&self) -> Vec<u8> {
        let blob = StatusBlob {
            tag: Command::ReadStatus.reply_tag(),
            body: self
                .eeprom
                .to_body(self.num_channels as u8, self.layout),
        };
        bytes_of(&blob).to_vec()
    }
}
