//! Multi-channel spectrometer driver
//!
//! [`Spectrometer`] owns the transport to one instrument and the decoded
//! state of its channels. Opening a device reads the status blob, creates one
//! [`Channel`] per reported channel, applies the pixel ranges stored in the
//! EEPROM and disables the external trigger.
//!
//! # Measurements
//!
//! A measurement cycle is started with [`start_read`](Spectrometer::start_read)
//! and collected with [`end_read`](Spectrometer::end_read), or in the
//! background with [`end_read_async`](Spectrometer::end_read_async) followed
//! by [`join_read_async`](Spectrometer::join_read_async) or
//! [`cancel_read_async`](Spectrometer::cancel_read_async).
//!
//! ```no_run
//! use spectrometer::{Backend, DeviceConfig, Spectrometer};
//! use std::time::Duration;
//!
//! let mut spec = Spectrometer::open(
//!     Backend::Serial("/dev/ttyUSB0".into()),
//!     &DeviceConfig::default(),
//! )?;
//! spec.set_integration_time(Duration::from_millis(50));
//! spec.start_read()?;
//! spec.end_read()?;
//! println!("Pixel 100: {:?}", spec.channel(0)?.sample(100));
//! # Ok::<(), spectrometer::SpectrometerError>(())
//! ```
//!
//! # Emulation
//!
//! [`Backend::Emulation`] runs the full driver against a software instrument:
//!
//! ```
//! use spectrometer::{Backend, DeviceConfig, EmulationConfig, Spectrometer};
//!
//! let spec = Spectrometer::open(
//!     Backend::Emulation(EmulationConfig::default()),
//!     &DeviceConfig::default(),
//! )?;
//! assert_eq!(spec.num_channels(), 2);
//! assert_eq!(spec.pixel_count(), 2034);
//! # Ok::<(), spectrometer::SpectrometerError>(())
//! ```

mod measurement;

pub use measurement::ReadOutcome;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::channel::{Channel, PixelLayout};
use crate::command::exchange;
use crate::config::DeviceConfig;
use crate::eeprom::{DeviceStatus, Eeprom, CALIBRATION_TERMS};
use crate::error::{Result, SpectrometerError};
use crate::protocol::{self, Command, EEPROM_SLOTS, MAX_DIGITAL};
use crate::transport::{Emulation, EmulationConfig, SerialTransport, Transport};
use measurement::PendingRead;

/// Where to find the instrument.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Serial device path, e.g. `/dev/ttyUSB0`
    Serial(String),
    /// The `skip`-th USB device with the given ids
    Usb { vendor: u16, product: u16, skip: usize },
    /// Software instrument
    Emulation(EmulationConfig),
}

impl Backend {
    /// Open the transport for this backend.
    pub fn connect(self) -> Result<Box<dyn Transport>> {
        match self {
            Backend::Serial(path) => Ok(Box::new(SerialTransport::open(&path)?)),
            #[cfg(feature = "usb")]
            Backend::Usb {
                vendor,
                product,
                skip,
            } => Ok(Box::new(crate::transport::UsbTransport::open(
                vendor, product, skip,
            )?)),
            #[cfg(not(feature = "usb"))]
            Backend::Usb { .. } => Err(SpectrometerError::Unsupported(
                "USB support not compiled in (enable the `usb` feature)".into(),
            )),
            Backend::Emulation(config) => Ok(Box::new(Emulation::new(config))),
        }
    }
}

/// Transport and channel state; moved into the worker during an
/// asynchronous read.
pub(crate) struct Instrument {
    transport: Box<dyn Transport>,
    channels: Vec<Channel>,
}

impl Instrument {
    /// Exchange a fixed-size command.
    fn request(&mut self, command: Command, message: &[u8]) -> Result<Vec<u8>> {
        exchange(
            self.transport.as_mut(),
            message,
            command.reply_tag(),
            command.reply_size(),
            Duration::ZERO,
        )
    }
}

/// Driver for one spectrometer.
pub struct Spectrometer {
    /// `None` while an asynchronous read owns it
    instrument: Option<Instrument>,
    pending: Option<PendingRead>,
    layout: PixelLayout,
    num_channels: usize,
    eeprom: Eeprom,
    integration_time: Duration,
    average: u16,
    digital: [bool; MAX_DIGITAL],
    external_trigger: bool,
    fixed_strobe: bool,
    strobe: u16,
    /// Integration time of the cycle started by `start_read`
    armed: Option<Duration>,
    last_measurement: Option<DateTime<Utc>>,
    measured_integration_time: Option<Duration>,
}

impl Spectrometer {
    /// Connect to an instrument and initialize it.
    pub fn open(backend: Backend, config: &DeviceConfig) -> Result<Self> {
        debug!("Opening {:?}", backend);
        Self::with_transport(backend.connect()?, config)
    }

    /// Initialize an instrument over an already open transport.
    pub fn with_transport(mut transport: Box<dyn Transport>, config: &DeviceConfig) -> Result<Self> {
        let reply = exchange(
            transport.as_mut(),
            &[Command::ReadStatus.tag()],
            Command::ReadStatus.reply_tag(),
            Command::ReadStatus.reply_size(),
            Duration::ZERO,
        )?;
        let status = DeviceStatus::parse(&reply)?;
        let DeviceStatus {
            eeprom,
            num_channels,
            layout,
        } = status;
        info!(
            "Spectrometer '{}' (id {}): {} channels, {} pixels, {} extra, sensor {}",
            eeprom.version_string(),
            eeprom.device_id,
            num_channels,
            layout.pixel_count,
            layout.extra_pixels,
            eeprom.sensor
        );

        let mut channels = Vec::with_capacity(num_channels);
        for i in 0..num_channels {
            let (nonlinear, ijking) = config.channel_corrections(i, layout)?;
            channels.push(Channel::new(i as u8, layout).with_corrections(nonlinear, ijking));
        }

        let mut spec = Self {
            instrument: Some(Instrument {
                transport,
                channels,
            }),
            pending: None,
            layout,
            num_channels,
            eeprom,
            integration_time: config.integration_time,
            average: config.average,
            digital: [false; MAX_DIGITAL],
            external_trigger: false,
            fixed_strobe: false,
            strobe: 0,
            armed: None,
            last_measurement: None,
            measured_integration_time: None,
        };

        for i in 0..num_channels {
            let record = spec.eeprom.channels[i];
            let (min, max) = (usize::from(record.start), usize::from(record.stop));
            match spec.set_range(i, min, max) {
                Ok(()) => {}
                Err(SpectrometerError::InvalidArgument(reason)) => {
                    warn!("Channel {} left disabled: {}", i, reason);
                }
                Err(e) => return Err(e),
            }
        }

        spec.set_external_trigger(false)?;
        Ok(spec)
    }

    /// Transport and channels, unless an asynchronous read holds them.
    fn instrument(&mut self) -> Result<&mut Instrument> {
        if self.pending.is_some() {
            return Err(SpectrometerError::ReadInProgress);
        }
        self.instrument
            .as_mut()
            .ok_or(SpectrometerError::TransportLost)
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.num_channels {
            return Err(SpectrometerError::InvalidArgument(format!(
                "channel {} out of range (device has {})",
                channel, self.num_channels
            )));
        }
        Ok(())
    }

    fn check_slot(slot: usize) -> Result<()> {
        if slot >= EEPROM_SLOTS {
            return Err(SpectrometerError::InvalidArgument(format!(
                "calibration slot {} out of range (0..{})",
                slot, EEPROM_SLOTS
            )));
        }
        Ok(())
    }

    // ==================== Geometry ====================

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Usable pixels per channel.
    pub fn pixel_count(&self) -> usize {
        self.layout.pixel_count
    }

    /// Extra (dark) pixels per channel.
    pub fn extra_pixels(&self) -> usize {
        self.layout.extra_pixels
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    /// Decoded state of `channel`.
    pub fn channel(&self, channel: usize) -> Result<&Channel> {
        self.check_channel(channel)?;
        Ok(&self.channels()?[channel])
    }

    /// All channels, in device order.
    pub fn channels(&self) -> Result<&[Channel]> {
        if self.pending.is_some() {
            return Err(SpectrometerError::ReadInProgress);
        }
        self.instrument
            .as_ref()
            .map(|inst| inst.channels.as_slice())
            .ok_or(SpectrometerError::TransportLost)
    }

    /// Configure the pixel range `[min, max)` of `channel`.
    ///
    /// On success the EEPROM snapshot's start and stop follow the new range.
    pub fn set_range(&mut self, channel: usize, min: usize, max: usize) -> Result<()> {
        self.check_channel(channel)?;
        self.layout.validate_range(min, max)?;
        let message = protocol::configure_range(channel as u8, min as u16, max as u16);

        let inst = self.instrument()?;
        inst.request(Command::ConfigureRange, &message)?;
        inst.channels[channel].set_range(min, max);

        let record = &mut self.eeprom.channels[channel];
        record.start = min as u16;
        record.stop = max as u16;
        debug!("Channel {} range [{}, {})", channel, min, max);
        Ok(())
    }

    // ==================== EEPROM ====================

    /// EEPROM contents read at initialization, with local edits.
    pub fn eeprom(&self) -> &Eeprom {
        &self.eeprom
    }

    /// Calibration coefficient `which` (0..7) of slot `channel` (0..8).
    pub fn calibration(&self, channel: usize, which: usize) -> Result<f32> {
        Self::check_slot(channel)?;
        if which >= CALIBRATION_TERMS {
            return Err(SpectrometerError::InvalidArgument(format!(
                "calibration index {} out of range (0..{})",
                which, CALIBRATION_TERMS
            )));
        }
        Ok(self.eeprom.channels[channel].coefficients[which])
    }

    /// Change a calibration coefficient locally; see [`write_eeprom`](Self::write_eeprom).
    pub fn set_calibration(&mut self, channel: usize, which: usize, value: f32) -> Result<()> {
        self.calibration(channel, which)?;
        self.eeprom.channels[channel].coefficients[which] = value;
        Ok(())
    }

    /// Start pixel stored in slot `channel`.
    pub fn start(&self, channel: usize) -> Result<u16> {
        Self::check_slot(channel)?;
        Ok(self.eeprom.channels[channel].start)
    }

    pub fn set_start(&mut self, channel: usize, start: u16) -> Result<()> {
        Self::check_slot(channel)?;
        self.eeprom.channels[channel].start = start;
        Ok(())
    }

    /// Stop pixel (exclusive) stored in slot `channel`.
    pub fn stop(&self, channel: usize) -> Result<u16> {
        Self::check_slot(channel)?;
        Ok(self.eeprom.channels[channel].stop)
    }

    pub fn set_stop(&mut self, channel: usize, stop: u16) -> Result<()> {
        Self::check_slot(channel)?;
        self.eeprom.channels[channel].stop = stop;
        Ok(())
    }

    /// Write the EEPROM snapshot back to the instrument.
    ///
    /// The password must be exactly 15 bytes; nothing is sent otherwise.
    pub fn write_eeprom(&mut self, password: &[u8]) -> Result<()> {
        let message = self
            .eeprom
            .write_command(password, self.num_channels as u8, self.layout)?;
        match self.instrument()?.request(Command::WriteEeprom, &message) {
            Ok(_) => {
                info!("EEPROM written");
                Ok(())
            }
            Err(e) if e.is_unexpected_reply() => Err(SpectrometerError::IncorrectPassword),
            Err(e) => Err(e),
        }
    }

    /// Wavelength of every usable pixel of `channel`.
    pub fn wavelengths(&self, channel: usize) -> Result<Vec<f64>> {
        self.check_channel(channel)?;
        let record = &self.eeprom.channels[channel];
        Ok((0..self.layout.pixel_count)
            .map(|pixel| record.wavelength(pixel))
            .collect())
    }

    // ==================== Measurement Settings ====================

    pub fn integration_time(&self) -> Duration {
        self.integration_time
    }

    /// Takes effect at the next [`start_read`](Self::start_read).
    pub fn set_integration_time(&mut self, time: Duration) {
        self.integration_time = time;
    }

    pub fn average(&self) -> u16 {
        self.average
    }

    /// Number of spectra the instrument averages per measurement.
    pub fn set_average(&mut self, average: u16) {
        self.average = average;
    }

    /// Timestamp of the first reply of the last completed measurement.
    pub fn last_measurement(&self) -> Option<DateTime<Utc>> {
        self.last_measurement
    }

    /// Integration time of the last completed measurement.
    pub fn measured_integration_time(&self) -> Option<Duration> {
        self.measured_integration_time
    }

    // ==================== Digital I/O and Triggering ====================

    /// Set digital output `which` (0..10).
    pub fn set_digital(&mut self, which: usize, value: bool) -> Result<()> {
        if which >= MAX_DIGITAL {
            return Err(SpectrometerError::InvalidArgument(format!(
                "digital output {} out of range (0..{})",
                which, MAX_DIGITAL
            )));
        }
        let message = protocol::set_digital_output(which as u8, value);
        self.instrument()?
            .request(Command::SetDigitalOutput, &message)?;
        self.digital[which] = value;
        Ok(())
    }

    /// Last value written to digital output `which`.
    pub fn digital(&self, which: usize) -> Result<bool> {
        self.digital.get(which).copied().ok_or_else(|| {
            SpectrometerError::InvalidArgument(format!(
                "digital output {} out of range (0..{})",
                which, MAX_DIGITAL
            ))
        })
    }

    /// Read the digital input line.
    pub fn digital_input(&mut self) -> Result<bool> {
        let reply = self
            .instrument()?
            .request(Command::ReadDigitalInput, &[Command::ReadDigitalInput.tag()])?;
        match reply[1] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SpectrometerError::InvalidReply(format!(
                "digital input value {}",
                other
            ))),
        }
    }

    pub fn set_external_trigger(&mut self, enabled: bool) -> Result<()> {
        let message = protocol::set_flag(Command::SetExternalTrigger, enabled);
        self.instrument()?
            .request(Command::SetExternalTrigger, &message)?;
        self.external_trigger = enabled;
        Ok(())
    }

    pub fn external_trigger(&self) -> bool {
        self.external_trigger
    }

    pub fn set_fixed_strobe(&mut self, enabled: bool) -> Result<()> {
        let message = protocol::set_flag(Command::SetFixedStrobe, enabled);
        self.instrument()?
            .request(Command::SetFixedStrobe, &message)?;
        self.fixed_strobe = enabled;
        Ok(())
    }

    pub fn fixed_strobe(&self) -> bool {
        self.fixed_strobe
    }

    /// Number of strobe pulses per measurement.
    pub fn set_strobe(&mut self, count: u16) -> Result<()> {
        let message = protocol::set_strobe_count(count);
        self.instrument()?
            .request(Command::SetStrobeCount, &message)?;
        self.strobe = count;
        Ok(())
    }

    pub fn strobe(&self) -> u16 {
        self.strobe
    }
}

impl Drop for Spectrometer {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Cancelling outstanding read on drop");
            pending.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageLog;

    fn emulated() -> (Spectrometer, MessageLog) {
        let emu = Emulation::default();
        let log = emu.log();
        let spec = Spectrometer::with_transport(Box::new(emu), &DeviceConfig::default()).unwrap();
        (spec, log)
    }

    #[test]
    fn test_init_sequence() {
        let (spec, log) = emulated();
        assert_eq!(
            log.messages(),
            vec![
                vec![0x01],
                vec![0x08, 0, 0, 0, 0xF1, 0x07],
                vec![0x08, 1, 0, 0, 0xF1, 0x07],
                vec![0x09, 0],
            ]
        );
        assert_eq!(spec.channel(1).unwrap().range_max(), 2034);
        assert!(!spec.external_trigger());
        assert_eq!(spec.integration_time(), Duration::from_millis(100));
        assert_eq!(spec.average(), 1);
    }

    #[test]
    fn test_calibration_accessors() {
        let (mut spec, _) = emulated();
        assert_eq!(spec.calibration(7, 0).unwrap(), 200.0);
        spec.set_calibration(3, 6, 0.5).unwrap();
        assert_eq!(spec.calibration(3, 6).unwrap(), 0.5);
        assert!(spec.calibration(8, 0).is_err());
        assert!(spec.calibration(0, 7).is_err());
        assert!(spec.set_calibration(0, 7, 1.0).is_err());

        spec.set_start(5, 10).unwrap();
        spec.set_stop(5, 20).unwrap();
        assert_eq!(spec.start(5).unwrap(), 10);
        assert_eq!(spec.stop(5).unwrap(), 20);
        assert!(spec.start(8).is_err());
        assert!(spec.set_stop(8, 1).is_err());
    }

    #[test]
    fn test_set_range_updates_eeprom() {
        let (mut spec, log) = emulated();
        spec.set_range(1, 100, 200).unwrap();
        assert_eq!(log.last(), Some(vec![0x08, 1, 100, 0, 199, 0]));
        assert_eq!(spec.start(1).unwrap(), 100);
        assert_eq!(spec.stop(1).unwrap(), 200);
        assert_eq!(spec.channel(1).unwrap().range_min(), 100);
    }

    #[test]
    fn test_set_range_rejects_before_sending() {
        let (mut spec, log) = emulated();
        let before = log.len();
        assert!(spec.set_range(0, 2034, 2034).is_err());
        assert!(spec.set_range(0, 0, 0).is_err());
        assert!(spec.set_range(0, 0, 2035).is_err());
        assert!(spec.set_range(2, 0, 10).is_err());
        assert_eq!(log.len(), before);
        assert_eq!(spec.channel(0).unwrap().range_max(), 2034);
    }

    #[test]
    fn test_settings_commands() {
        let (mut spec, log) = emulated();
        spec.set_strobe(0x0203).unwrap();
        assert_eq!(log.last(), Some(vec![0x0B, 0x03, 0x02]));
        assert_eq!(spec.strobe(), 0x0203);

        spec.set_fixed_strobe(true).unwrap();
        assert_eq!(log.last(), Some(vec![0x0A, 1]));
        assert!(spec.fixed_strobe());

        spec.set_external_trigger(true).unwrap();
        assert_eq!(log.last(), Some(vec![0x09, 1]));
        assert!(spec.external_trigger());
    }

    #[test]
    fn test_wavelengths() {
        let (spec, _) = emulated();
        let wl = spec.wavelengths(0).unwrap();
        assert_eq!(wl.len(), 2034);
        approx::assert_relative_eq!(wl[0], 200.0);
        approx::assert_relative_eq!(wl[10], 204.0, epsilon = 1e-4);
        assert!(spec.wavelengths(2).is_err());
    }

    #[cfg(not(feature = "usb"))]
    #[test]
    fn test_usb_backend_without_feature() {
        let backend = Backend::Usb {
            vendor: 0x1992,
            product: 0x0667,
            skip: 0,
        };
        assert!(matches!(
            backend.connect(),
            Err(SpectrometerError::Unsupported(_))
        ));
    }
}
