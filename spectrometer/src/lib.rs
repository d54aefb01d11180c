//! Driver for multi-channel fiber-optic spectrometers.
//!
//! The instrument is reached over a byte-stuffed serial link, a USB bulk
//! link, or a software emulation. All three carry the same command set: a
//! status blob describing the channels and their EEPROM calibration, pixel
//! range configuration, timed measurements returning one sample block per
//! channel, and a handful of digital I/O and trigger settings.
//!
//! # Features
//!
//! - `usb` - USB bulk backend (requires libusb-1.0)
//!
//! # Layout
//!
//! - [`transport`] - serial, USB and emulated links behind the [`Transport`] trait
//! - [`protocol`] - command tags, frame encoding and packed floats
//! - [`command`] - command/reply exchange and reply validation
//! - [`eeprom`] - status blob and EEPROM layout
//! - [`channel`] - pixel ranges and sample decoding
//! - [`device`] - the [`Spectrometer`] driver and its measurement cycle
//! - [`config`] - JSON device configuration

pub mod channel;
pub mod command;
pub mod config;
pub mod device;
pub mod eeprom;
pub mod error;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, PixelLayout, SampleBlock};
pub use config::{ChannelConfig, DeviceConfig, IjkingTable};
pub use device::{Backend, ReadOutcome, Spectrometer};
pub use eeprom::{CalibrationRecord, DeviceStatus, Eeprom};
pub use error::{Result, SpectrometerError};
pub use transport::{Emulation, EmulationConfig, MessageLog, Transport};
