//! Hardware transports
//!
//! A transport moves whole messages between the driver and the instrument.
//! The serial backend frames and escapes them, the USB backend sends them
//! as raw bulk transfers, and the emulation backend answers them in software.

pub mod emulation;
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

pub use emulation::{Emulation, EmulationConfig, MessageLog};
pub use serial::{SerialLink, SerialTransport};
#[cfg(feature = "usb")]
pub use usb::UsbTransport;

use std::time::Duration;

use crate::error::Result;

/// Message-level link to an instrument.
pub trait Transport: Send {
    /// Send one command message.
    fn write_message(&mut self, message: &[u8]) -> Result<()>;

    /// Block up to `timeout` for the next reply.
    ///
    /// `expected_size` (0 when variable) and `expected_tag` describe the reply
    /// the caller is waiting for. Backends that cannot delimit messages on
    /// their own may use them; validation is left to the caller.
    fn read_message(
        &mut self,
        timeout: Duration,
        expected_size: usize,
        expected_tag: u8,
    ) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_message(&mut self, message: &[u8]) -> Result<()> {
        (**self).write_message(message)
    }

    fn read_message(
        &mut self,
        timeout: Duration,
        expected_size: usize,
        expected_tag: u8,
    ) -> Result<Vec<u8>> {
        (**self).read_message(timeout, expected_size, expected_tag)
    }
}
