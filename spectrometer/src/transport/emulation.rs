//! Software instrument for running without hardware
//!
//! Answers every command the way the firmware would: a full status blob,
//! sample blocks whose header matches the range last configured for the
//! channel, and single-byte acknowledgements for everything else. Written
//! messages are recorded in a [`MessageLog`] that can be inspected while the
//! transport is owned by a device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::Transport;
use crate::channel::PixelLayout;
use crate::eeprom::{CalibrationRecord, DeviceStatus, Eeprom, WriteEepromCommand};
use crate::error::{Result, SpectrometerError};
use crate::protocol::{
    Command, EEPROM_SLOTS, ERROR_TAG, PASSWORD_LEN, SAMPLE_HEADER_SIZE, SAMPLE_TAG,
};

/// Error code returned for commands the emulated firmware does not know.
pub const UNKNOWN_COMMAND: u8 = 0x01;

/// Shared record of every message written to an emulated instrument.
#[derive(Debug, Clone, Default)]
pub struct MessageLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl MessageLog {
    fn push(&self, message: &[u8]) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_vec());
    }

    /// Copy of all messages written so far, oldest first.
    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Vec<u8>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Behaviour of an emulated instrument.
#[derive(Debug, Clone)]
pub struct EmulationConfig {
    /// Contents returned by the read-status command
    pub status: DeviceStatus,
    /// Raw value of every sample, before the division by 4
    pub sample_value: u16,
    /// EEPROM writes with any other password are refused
    pub password: Option<[u8; PASSWORD_LEN]>,
    /// Value reported by the digital input
    pub digital_input: bool,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        let mut eeprom = Eeprom::default();
        eeprom.set_version("emulation device");
        let layout = PixelLayout::from_reported(0x800);
        eeprom.channels = [CalibrationRecord {
            coefficients: [200.0, 0.4, 0.0, 0.0, 0.0, 1.0, 0.0],
            start: 0,
            stop: layout.pixel_count as u16,
        }; EEPROM_SLOTS];
        Self {
            status: DeviceStatus {
                eeprom,
                num_channels: 2,
                layout,
            },
            sample_value: 0,
            password: None,
            digital_input: false,
        }
    }
}

#[derive(Debug)]
enum Pending {
    Status,
    Sample { channel: usize, ready_at: Instant },
    /// Tag and size taken from the read request
    Generic,
    Raw(Vec<u8>),
}

/// Emulated instrument.
#[derive(Debug)]
pub struct Emulation {
    config: EmulationConfig,
    ranges: [(usize, usize); EEPROM_SLOTS],
    pending: VecDeque<Pending>,
    log: MessageLog,
}

impl Default for Emulation {
    fn default() -> Self {
        Self::new(EmulationConfig::default())
    }
}

impl Emulation {
    pub fn new(config: EmulationConfig) -> Self {
        let ranges = config
            .status
            .eeprom
            .channels
            .map(|c| (usize::from(c.start), usize::from(c.stop)));
        Self {
            config,
            ranges,
            pending: VecDeque::new(),
            log: MessageLog::default(),
        }
    }

    /// Handle on the log of written messages.
    pub fn log(&self) -> MessageLog {
        self.log.clone()
    }

    pub fn config(&self) -> &EmulationConfig {
        &self.config
    }

    fn handle(&mut self, message: &[u8]) -> Option<Pending> {
        let tag = *message.first()?;
        let Some(command) = Command::from_tag(tag) else {
            warn!("Emulation: unknown command {:#04x}", tag);
            return Some(Pending::Raw(vec![ERROR_TAG, UNKNOWN_COMMAND]));
        };
        debug!("Emulation: {}", command);

        let pending = match command {
            Command::ReadStatus => Pending::Status,
            Command::WriteEeprom => self.write_eeprom(message),
            Command::StartMeasurement => {
                let ms = match message {
                    [_, lo, hi, ..] => u64::from(u16::from_le_bytes([*lo, *hi])),
                    _ => 0,
                };
                let channel = (0..self.config.status.num_channels)
                    .find(|&ch| self.ranges[ch].1 > self.ranges[ch].0)?;
                Pending::Sample {
                    channel,
                    ready_at: Instant::now() + Duration::from_millis(ms),
                }
            }
            Command::ReadNextChannel => Pending::Sample {
                channel: usize::from(*message.get(1)?),
                ready_at: Instant::now(),
            },
            Command::ConfigureRange => {
                if let [_, ch, min_lo, min_hi, max_lo, max_hi] = *message {
                    let min = usize::from(u16::from_le_bytes([min_lo, min_hi]));
                    let max = usize::from(u16::from_le_bytes([max_lo, max_hi])) + 1;
                    if let Some(range) = self.ranges.get_mut(usize::from(ch)) {
                        *range = (min, max);
                    }
                }
                Pending::Generic
            }
            Command::ReadDigitalInput => Pending::Raw(vec![
                command.reply_tag(),
                self.config.digital_input as u8,
            ]),
            _ => Pending::Generic,
        };
        Some(pending)
    }

    fn write_eeprom(&mut self, message: &[u8]) -> Pending {
        let Ok(cmd) = bytemuck::try_from_bytes::<WriteEepromCommand>(message) else {
            warn!("Emulation: EEPROM write of {} bytes", message.len());
            return Pending::Raw(vec![ERROR_TAG, UNKNOWN_COMMAND]);
        };
        if let Some(password) = self.config.password {
            if cmd.password != password {
                debug!("Emulation: refusing EEPROM write");
                return Pending::Raw(vec![Command::WriteEeprom.tag()]);
            }
        }
        self.config.status.eeprom = Eeprom::from_body(&cmd.body);
        Pending::Raw(vec![Command::WriteEeprom.reply_tag()])
    }

    fn sample_reply(&self, channel: usize) -> Vec<u8> {
        let (min, max) = self.ranges.get(channel).copied().unwrap_or((0, 0));
        let count = self.config.status.layout.extra_pixels + max.saturating_sub(min);
        let mut reply = Vec::with_capacity(SAMPLE_HEADER_SIZE + 2 * count);
        reply.extend_from_slice(&[SAMPLE_TAG, 0]);
        reply.extend_from_slice(&(min as u16).to_le_bytes());
        reply.extend_from_slice(&(max as u16).wrapping_sub(1).to_le_bytes());
        let sample = self.config.sample_value.to_le_bytes();
        for _ in 0..count {
            reply.extend_from_slice(&sample);
        }
        reply
    }
}

impl Transport for Emulation {
    fn write_message(&mut self, message: &[u8]) -> Result<()> {
        trace!("Emulation rx {:02x?}", message);
        self.log.push(message);
        // Replies to earlier requests are never delivered after a new one
        self.pending.clear();
        if let Some(pending) = self.handle(message) {
            self.pending.push_back(pending);
        }
        Ok(())
    }

    fn read_message(
        &mut self,
        timeout: Duration,
        expected_size: usize,
        expected_tag: u8,
    ) -> Result<Vec<u8>> {
        let reply = match self.pending.pop_front() {
            Some(Pending::Status) => self.config.status.to_reply(),
            Some(Pending::Sample { channel, ready_at }) => {
                let wait = ready_at.saturating_duration_since(Instant::now());
                if wait > timeout {
                    thread::sleep(timeout);
                    self.pending
                        .push_front(Pending::Sample { channel, ready_at });
                    return Err(SpectrometerError::Timeout(timeout));
                }
                thread::sleep(wait);
                self.sample_reply(channel)
            }
            Some(Pending::Generic) => {
                let mut reply = vec![0u8; expected_size.max(1)];
                reply[0] = expected_tag;
                reply
            }
            Some(Pending::Raw(reply)) => reply,
            None => {
                thread::sleep(timeout);
                return Err(SpectrometerError::Timeout(timeout));
            }
        };
        trace!("Emulation tx {} bytes", reply.len());
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    const TIMEOUT: Duration = Duration::from_millis(20);

    #[test]
    fn test_status_reply() {
        let mut emu = Emulation::default();
        emu.write_message(&[0x01]).unwrap();
        let reply = emu.read_message(TIMEOUT, 327, 0x81).unwrap();
        assert_eq!(reply.len(), 327);
        assert_eq!(reply[0], 0x81);
        assert_eq!(reply[0x43], 2);
        assert_eq!(&reply[0x44..0x46], &[0x00, 0x08]);
        // Channel 0 last pixel
        assert_eq!(&reply[0x47 + 0x1E..0x47 + 0x20], &[0xF1, 0x07]);
    }

    #[test]
    fn test_generic_reply_uses_expected_tag() {
        let mut emu = Emulation::default();
        emu.write_message(&[0x09, 0]).unwrap();
        assert_eq!(emu.read_message(TIMEOUT, 1, 0x89).unwrap(), vec![0x89]);
    }

    #[test]
    fn test_sample_reply_follows_configured_range() {
        let mut emu = Emulation::new(EmulationConfig {
            sample_value: 40,
            ..Default::default()
        });
        emu.write_message(&protocol::configure_range(1, 5, 9)).unwrap();
        emu.read_message(TIMEOUT, 1, 0x88).unwrap();

        emu.write_message(&protocol::read_next_channel(1)).unwrap();
        let reply = emu.read_message(TIMEOUT, 0, 0x83).unwrap();
        assert_eq!(&reply[..6], &[0x83, 0, 5, 0, 8, 0]);
        assert_eq!(reply.len(), 6 + 2 * (14 + 4));
        assert_eq!(&reply[6..8], &[40, 0]);
    }

    #[test]
    fn test_start_measurement_reply_waits_for_integration() {
        let mut emu = Emulation::default();
        emu.write_message(&protocol::start_measurement(60, 1)).unwrap();
        assert!(matches!(
            emu.read_message(TIMEOUT, 0, 0x83),
            Err(SpectrometerError::Timeout(_))
        ));
        let reply = emu
            .read_message(Duration::from_millis(200), 0, 0x83)
            .unwrap();
        assert_eq!(reply[0], 0x83);
    }

    #[test]
    fn test_new_request_discards_stale_reply() {
        let mut emu = Emulation::default();
        emu.write_message(&[0x01]).unwrap();
        emu.write_message(&[0x0A, 1]).unwrap();
        assert_eq!(emu.read_message(TIMEOUT, 1, 0x8A).unwrap(), vec![0x8A]);
        assert!(emu.read_message(TIMEOUT, 1, 0x8A).is_err());
    }

    #[test]
    fn test_unknown_command_is_device_error() {
        let mut emu = Emulation::default();
        emu.write_message(&[0x05]).unwrap();
        assert_eq!(
            emu.read_message(TIMEOUT, 1, 0x85).unwrap(),
            vec![0x00, UNKNOWN_COMMAND]
        );
    }

    #[test]
    fn test_log_records_messages() {
        let mut emu = Emulation::default();
        let log = emu.log();
        emu.write_message(&[0x01]).unwrap();
        emu.write_message(&[0x06]).unwrap();
        assert_eq!(log.messages(), vec![vec![0x01], vec![0x06]]);
        assert_eq!(log.last(), Some(vec![0x06]));
        log.clear();
        assert!(log.is_empty());
    }
}
