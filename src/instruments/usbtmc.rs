//! `/dev/usbtmc*` character-device SCPI transport.
//!
//! Fallback path used when no VISA/ASRL resource is available. Grounded on
//! `original_source/usbtmc_file.py`: blocking open, deadline-based reads via
//! `select`/`poll`, termination-aware accumulation with a safety cap.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use crate::error::{GwError, GwResult};
use crate::instruments::ScpiTransport;

const READ_SAFETY_CAP: usize = 256 * 1024;

pub struct UsbTmcTransport {
    file: File,
    timeout: Duration,
    read_termination: u8,
    write_termination: &'static str,
}

impl UsbTmcTransport {
    pub fn open(path: &str, timeout: Duration) -> GwResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).map_err(GwError::Io)?;
        Ok(UsbTmcTransport { file, timeout, read_termination: b'\n', write_termination: "\n" })
    }

    fn wait_readable(&self, deadline: Instant) -> GwResult<bool> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let mut pfd = libc::pollfd { fd: self.file.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(GwError::Io(std::io::Error::last_os_error()));
        }
        Ok(rc > 0)
    }
}

impl ScpiTransport for UsbTmcTransport {
    fn write_line(&mut self, line: &str) -> GwResult<()> {
        let mut s = line.to_string();
        if !s.ends_with(self.write_termination) {
            s.push_str(self.write_termination);
        }
        self.file.write_all(s.as_bytes()).map_err(GwError::Io)
    }

    fn read_line(&mut self) -> GwResult<String> {
        let deadline = Instant::now() + self.timeout;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            if !self.wait_readable(deadline)? {
                return Err(GwError::Timeout("usbtmc read timeout".to_string()));
            }
            let mut chunk = [0u8; 4096];
            let n = self.file.read(&mut chunk).map_err(GwError::Io)?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.iter().position(|&b| b == self.read_termination) {
                buf.truncate(pos + 1);
                break;
            }
            if buf.len() > READ_SAFETY_CAP {
                break;
            }
        }
        let s = String::from_utf8_lossy(&buf);
        Ok(s.trim_end_matches(['\r', '\n']).to_string())
    }

    fn reset_input(&mut self) -> GwResult<()> {
        // No discard ioctl wired up for the character-device path; draining
        // happens naturally on the next read.
        Ok(())
    }
}
