//! USB bulk transport
//!
//! Messages go out unframed on the single bulk OUT endpoint of the first
//! interface; each reply arrives as one bulk IN transfer.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, info, trace, warn};

use super::Transport;
use crate::error::{Result, SpectrometerError};

/// Timeout for each bulk OUT transfer.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest reply the instrument sends in one transfer.
const READ_BUFFER_SIZE: usize = 6000;

/// Endpoints of the instrument's first interface.
#[derive(Debug, Clone, Copy)]
struct Endpoints {
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
}

/// Bulk-transfer link to an instrument.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    endpoints: Endpoints,
}

impl UsbTransport {
    /// Open the `skip`-th instrument matching `vendor`/`product`.
    ///
    /// The device is reset and re-enumerated before its interface is claimed.
    pub fn open(vendor: u16, product: u16, skip: usize) -> Result<Self> {
        let context = Context::new()?;

        let (device, _) = find_device(&context, vendor, product, skip)?;
        match device.open() {
            Ok(mut handle) => {
                if let Err(e) = handle.reset() {
                    warn!("Unable to reset USB device: {}", e);
                }
            }
            Err(e) => warn!("Unable to open USB device for reset: {}", e),
        }

        let (device, endpoints) = find_device(&context, vendor, product, skip)?;
        let mut handle = device.open()?;
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        handle.claim_interface(endpoints.interface)?;

        info!(
            "Opened USB device {:04x}:{:04x} (skip {}), bulk in {:#04x}, bulk out {:#04x}",
            vendor, product, skip, endpoints.bulk_in, endpoints.bulk_out
        );
        Ok(Self { handle, endpoints })
    }
}

/// Locate the device and its bulk endpoints.
fn find_device(
    context: &Context,
    vendor: u16,
    product: u16,
    skip: usize,
) -> Result<(Device<Context>, Endpoints)> {
    let devices = context.devices()?;
    let mut matches = devices.iter().filter(|device| {
        device
            .device_descriptor()
            .map(|desc| desc.vendor_id() == vendor && desc.product_id() == product)
            .unwrap_or(false)
    });

    let device = matches.nth(skip).ok_or_else(|| {
        SpectrometerError::DeviceNotFound(format!(
            "USB device {:04x}:{:04x};{}",
            vendor, product, skip
        ))
    })?;
    let endpoints = bulk_endpoints(&device)?;
    Ok((device, endpoints))
}

/// Exactly one bulk IN and one bulk OUT endpoint on the first interface.
fn bulk_endpoints(device: &Device<Context>) -> Result<Endpoints> {
    let config = device.config_descriptor(0)?;
    let interface = config
        .interfaces()
        .next()
        .ok_or_else(|| SpectrometerError::InvalidStatus("USB device has no interface".into()))?;
    let setting = interface
        .descriptors()
        .next()
        .ok_or_else(|| SpectrometerError::InvalidStatus("USB interface has no setting".into()))?;

    let mut bulk_in = None;
    let mut bulk_out = None;
    for endpoint in setting.endpoint_descriptors() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        let (slot, name) = match endpoint.direction() {
            Direction::In => (&mut bulk_in, "input"),
            Direction::Out => (&mut bulk_out, "output"),
        };
        if slot.replace(endpoint.address()).is_some() {
            return Err(SpectrometerError::InvalidStatus(format!(
                "invalid device: more than one {} endpoint",
                name
            )));
        }
    }

    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => Ok(Endpoints {
            interface: setting.interface_number(),
            bulk_in,
            bulk_out,
        }),
        _ => Err(SpectrometerError::InvalidStatus(
            "invalid device: missing bulk endpoint".into(),
        )),
    }
}

impl Transport for UsbTransport {
    fn write_message(&mut self, message: &[u8]) -> Result<()> {
        trace!("usb tx {:02x?}", message);
        let mut done = 0;
        while done < message.len() {
            let n = self
                .handle
                .write_bulk(self.endpoints.bulk_out, &message[done..], WRITE_TIMEOUT)?;
            if n == 0 {
                return Err(SpectrometerError::Usb(rusb::Error::Io));
            }
            done += n;
        }
        Ok(())
    }

    fn read_message(
        &mut self,
        timeout: Duration,
        _expected_size: usize,
        _expected_tag: u8,
    ) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let n = match self
            .handle
            .read_bulk(self.endpoints.bulk_in, &mut buffer, timeout)
        {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Err(SpectrometerError::Timeout(timeout)),
            Err(e) => return Err(e.into()),
        };
        buffer.truncate(n);
        trace!("usb rx {} bytes", n);
        Ok(buffer)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.endpoints.interface) {
            debug!("Failed to release USB interface: {}", e);
        }
    }
}
