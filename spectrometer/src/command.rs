//! Command/reply exchange with reply validation

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, SpectrometerError};
use crate::protocol::ERROR_TAG;
use crate::transport::Transport;

/// How long to wait for any reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Send `command` (if non-empty), sleep `pause`, then read and validate the reply.
///
/// `expected_size` of 0 accepts a reply of any length.
pub fn exchange(
    transport: &mut dyn Transport,
    command: &[u8],
    expected_tag: u8,
    expected_size: usize,
    pause: Duration,
) -> Result<Vec<u8>> {
    if !command.is_empty() {
        debug!("Sending command {:#04x} ({} bytes)", command[0], command.len());
        transport.write_message(command)?;
    }
    if !pause.is_zero() {
        thread::sleep(pause);
    }
    let reply = transport.read_message(REPLY_TIMEOUT, expected_size, expected_tag)?;
    validate_reply(&reply, expected_tag, expected_size)?;
    Ok(reply)
}

/// Check a reply for emptiness, size, device errors and tag, in that order.
pub fn validate_reply(reply: &[u8], expected_tag: u8, expected_size: usize) -> Result<()> {
    let Some(&tag) = reply.first() else {
        return Err(SpectrometerError::EmptyReply);
    };

    let is_error_frame = reply.len() == 2 && tag == ERROR_TAG;
    if expected_size != 0 && reply.len() != expected_size && !is_error_frame {
        return Err(SpectrometerError::ReplySize {
            expected: expected_size,
            actual: reply.len(),
        });
    }

    if tag == ERROR_TAG {
        let code = reply.get(1).copied().unwrap_or_default();
        warn!("Device returned error {}", code);
        return Err(SpectrometerError::DeviceError { code });
    }

    if tag != expected_tag {
        warn!(
            "Unexpected reply tag {:#04x} (expected {:#04x})",
            tag, expected_tag
        );
        return Err(SpectrometerError::UnexpectedReply {
            expected: expected_tag,
            actual: tag,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Emulation;

    #[test]
    fn test_validate_order() {
        assert!(matches!(
            validate_reply(&[], 0x81, 327),
            Err(SpectrometerError::EmptyReply)
        ));
        assert!(matches!(
            validate_reply(&[0x81, 0], 0x81, 327),
            Err(SpectrometerError::ReplySize {
                expected: 327,
                actual: 2
            })
        ));
        // Two-byte error frames bypass the size check
        assert!(matches!(
            validate_reply(&[0x00, 7], 0x81, 327),
            Err(SpectrometerError::DeviceError { code: 7 })
        ));
        assert!(matches!(
            validate_reply(&[0x00, 7, 0], 0x88, 1),
            Err(SpectrometerError::ReplySize { .. })
        ));
        let err = validate_reply(&[0x02], 0x82, 1).unwrap_err();
        assert!(err.is_unexpected_reply());
        assert!(validate_reply(&[0x88], 0x88, 1).is_ok());
    }

    #[test]
    fn test_variable_size_accepted() {
        assert!(validate_reply(&[0x83, 0, 0, 0, 0, 0, 4, 0], 0x83, 0).is_ok());
        assert!(validate_reply(&[0x83], 0x83, 0).is_ok());
    }

    #[test]
    fn test_exchange_with_emulation() {
        let mut emu = Emulation::default();
        let log = emu.log();
        let reply = exchange(&mut emu, &[0x0B, 5, 0], 0x8B, 1, Duration::ZERO).unwrap();
        assert_eq!(reply, vec![0x8B]);
        assert_eq!(log.messages(), vec![vec![0x0B, 5, 0]]);
    }

    #[test]
    fn test_exchange_without_command_sends_nothing() {
        let mut emu = Emulation::default();
        let log = emu.log();
        emu.write_message(&[0x06]).unwrap();
        let reply = exchange(&mut emu, &[], 0x86, 2, Duration::from_millis(5)).unwrap();
        assert_eq!(reply, vec![0x86, 0]);
        assert_eq!(log.len(), 1);
    }
}
