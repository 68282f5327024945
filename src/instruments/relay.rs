//! K1 power relay abstraction.
//!
//! The original drove a GPIO hat coil directly (`original_source/hardware.py`
//! via gpiozero); this gateway instead targets the USB-serial ASCII relay
//! boards the pack's other examples use, behind an explicit backend
//! selection (`Config::relay_backend`). Missing hardware should not take the
//! process down: callers fall back to the mock backend at startup.

use std::io::Write;
use std::time::Duration;

use tracing::warn;

use crate::error::GwResult;

pub trait RelayDriver: Send {
    fn set_drive(&mut self, on: bool) -> GwResult<()>;
    fn get_drive(&self) -> bool;
    fn get_pin_level(&self) -> Option<bool>;
}

/// USB-serial ASCII relay board: writes a single configurable byte per
/// state, no response expected.
pub struct SerialRelay {
    port: Box<dyn serialport::SerialPort>,
    on_byte: u8,
    off_byte: u8,
    drive: bool,
}

impl SerialRelay {
    pub fn open(path: &str, baud: u32, on_byte: u8, off_byte: u8, boot_settle: Duration) -> GwResult<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| crate::error::GwError::Io(std::io::Error::other(e)))?;
        std::thread::sleep(boot_settle);
        Ok(SerialRelay { port, on_byte, off_byte, drive: false })
    }
}

impl RelayDriver for SerialRelay {
    fn set_drive(&mut self, on: bool) -> GwResult<()> {
        let byte = if on { self.on_byte } else { self.off_byte };
        self.port.write_all(&[byte]).map_err(crate::error::GwError::Io)?;
        self.drive = on;
        Ok(())
    }

    fn get_drive(&self) -> bool {
        self.drive
    }

    fn get_pin_level(&self) -> Option<bool> {
        None
    }
}

/// In-memory relay used in tests and whenever hardware is unavailable.
#[derive(Default)]
pub struct MockRelay {
    drive: bool,
}

impl RelayDriver for MockRelay {
    fn set_drive(&mut self, on: bool) -> GwResult<()> {
        self.drive = on;
        Ok(())
    }

    fn get_drive(&self) -> bool {
        self.drive
    }

    fn get_pin_level(&self) -> Option<bool> {
        Some(self.drive)
    }
}

/// Relay control wired off entirely; every operation is a no-op.
#[derive(Default)]
pub struct DisabledRelay;

impl RelayDriver for DisabledRelay {
    fn set_drive(&mut self, _on: bool) -> GwResult<()> {
        Ok(())
    }

    fn get_drive(&self) -> bool {
        false
    }

    fn get_pin_level(&self) -> Option<bool> {
        None
    }
}

/// Builds the configured backend, falling back to the mock backend (with a
/// logged warning) if serial hardware fails to open.
pub fn open_backend(
    backend: crate::config::RelayBackend,
    port: &str,
    baud: u32,
    on_byte: u8,
    off_byte: u8,
    boot_settle: Duration,
) -> Box<dyn RelayDriver> {
    match backend {
        crate::config::RelayBackend::Disabled => Box::new(DisabledRelay),
        crate::config::RelayBackend::Mock => Box::new(MockRelay::default()),
        crate::config::RelayBackend::Serial => {
            match SerialRelay::open(port, baud, on_byte, off_byte, boot_settle) {
                Ok(drv) => Box::new(drv),
                Err(e) => {
                    warn!(error = %e, port, "relay serial backend unavailable, falling back to mock");
                    Box::new(MockRelay::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_relay_tracks_drive() {
        let mut r = MockRelay::default();
        assert!(!r.get_drive());
        r.set_drive(true).unwrap();
        assert!(r.get_drive());
        assert_eq!(r.get_pin_level(), Some(true));
    }

    #[test]
    fn disabled_relay_never_reports_on() {
        let mut r = DisabledRelay;
        r.set_drive(true).unwrap();
        assert!(!r.get_drive());
        assert_eq!(r.get_pin_level(), None);
    }
}
