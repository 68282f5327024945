//! Echo-tolerant SCPI line I/O and DMM dialect detection.
//!
//! Grounded on `original_source/bk5491b.py` (`BK5491B`) and the dialect
//! candidate-building logic in `original_source/device_comm.py`.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{GwError, GwResult};
use crate::frames::dmm::MmeterFunc;
use crate::instruments::ScpiTransport;

pub struct SerialScpiTransport {
    port: Box<dyn SerialPort>,
}

impl SerialScpiTransport {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> GwResult<Self> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| GwError::Io(std::io::Error::other(e)))?;
        Ok(SerialScpiTransport { port })
    }
}

impl ScpiTransport for SerialScpiTransport {
    fn write_line(&mut self, line: &str) -> GwResult<()> {
        let mut s = line.trim().to_string();
        s.push('\n');
        self.port.write_all(s.as_bytes()).map_err(GwError::Io)?;
        let _ = self.port.flush();
        Ok(())
    }

    fn read_line(&mut self) -> GwResult<String> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(GwError::Timeout("scpi read timeout".to_string()));
                }
                Err(e) => return Err(GwError::Io(e)),
            }
        }
        Ok(String::from_utf8_lossy(&buf).trim_end_matches('\r').to_string())
    }

    fn reset_input(&mut self) -> GwResult<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| GwError::Io(std::io::Error::other(e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpiDialect {
    Func,
    Conf,
}

#[derive(Debug, Default, Clone)]
pub struct FetchResult {
    pub primary: Option<f64>,
    pub secondary: Option<f64>,
    pub raw: String,
}

/// Thin SCPI helper around any [`ScpiTransport`], generalized from the
/// teacher's per-command builder style into a reusable write/query/drain
/// surface shared by the DMM, AFG, and e-load handles.
pub struct ScpiLink {
    transport: Box<dyn ScpiTransport>,
}

impl ScpiLink {
    pub fn new(transport: Box<dyn ScpiTransport>) -> Self {
        ScpiLink { transport }
    }

    pub fn write(&mut self, cmd: &str, clear_input: bool) -> GwResult<()> {
        if clear_input {
            let _ = self.transport.reset_input();
        }
        self.transport.write_line(cmd)
    }

    /// Writes `cmd` and returns the first non-empty line that is not an
    /// echo of the command (full echo, or echo with whitespace removed).
    pub fn query_line(&mut self, cmd: &str, read_lines: usize) -> GwResult<String> {
        let _ = self.transport.reset_input();
        self.transport.write_line(cmd)?;

        let echo = cmd.trim().to_ascii_uppercase().replace(' ', "");
        for _ in 0..read_lines.max(1) {
            let line = self.transport.read_line()?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let upper = trimmed.to_ascii_uppercase().replace(' ', "");
            if upper == echo || upper.starts_with(&echo) {
                continue;
            }
            return Ok(trimmed.to_string());
        }
        Ok(String::new())
    }

    pub fn system_error(&mut self) -> GwResult<String> {
        self.query_line(":SYSTem:ERRor?", 6)
    }

    /// Drains the error queue until an empty line or a "no error" response
    /// is seen, or `max_n` reads have been issued.
    pub fn drain_errors(&mut self, max_n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..max_n.max(1) {
            let line = self.system_error().unwrap_or_default();
            let line = line.trim().to_string();
            if line.is_empty() {
                break;
            }
            let upper = line.to_ascii_uppercase();
            let is_clean = upper.starts_with('0') || upper.contains("NO ERROR");
            out.push(line);
            if is_clean {
                break;
            }
        }
        out
    }

    pub fn is_clean(&mut self) -> bool {
        let errs = self.drain_errors(16);
        errs.is_empty() || errs.last().map(|e| {
            let u = e.to_ascii_uppercase();
            u.starts_with('0') || u.contains("NO ERROR")
        }).unwrap_or(true)
    }

    /// Parses up to two floats from a fetch response; any magnitude greater
    /// than 1e36 is overload and becomes NaN.
    pub fn fetch_values(&mut self, cmd: &str) -> GwResult<FetchResult> {
        let line = self.query_line(cmd, 6)?;
        if line.is_empty() {
            return Ok(FetchResult { primary: None, secondary: None, raw: String::new() });
        }
        let nums = extract_floats(&line);
        let overload = |v: f64| if v.abs() > 1e36 { f64::NAN } else { v };
        Ok(FetchResult {
            primary: nums.first().copied().map(overload),
            secondary: nums.get(1).copied().map(overload),
            raw: line,
        })
    }
}

fn extract_floats(s: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut token = String::new();
    let flush = |token: &mut String, out: &mut Vec<f64>| {
        if let Ok(v) = token.parse::<f64>() {
            out.push(v);
        }
        token.clear();
    };
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' || c == '+' || c == '-' || c == 'e' || c == 'E' {
            token.push(c);
        } else {
            flush(&mut token, &mut out);
        }
    }
    flush(&mut token, &mut out);
    out
}

/// FUNC-style primary function selection commands.
pub fn func_to_scpi_func(func: MmeterFunc) -> &'static str {
    match func {
        MmeterFunc::Vdc => ":FUNCtion VOLTage:DC",
        MmeterFunc::Vac => ":FUNCtion VOLTage:AC",
        MmeterFunc::Idc => ":FUNCtion CURRent:DC",
        MmeterFunc::Iac => ":FUNCtion CURRent:AC",
        MmeterFunc::Res => ":FUNCtion RESistance",
        MmeterFunc::Freq => ":FUNCtion FREQuency",
        MmeterFunc::Period => ":FUNCtion PERiod",
        MmeterFunc::Diode => ":FUNCtion DIODe",
        MmeterFunc::Cont => ":FUNCtion CONTinuity",
    }
}

/// CONF-style primary function selection commands. Not every function has a
/// CONF-style mapping; callers must handle `None`.
pub fn func_to_scpi_conf(func: MmeterFunc) -> Option<&'static str> {
    Some(match func {
        MmeterFunc::Vdc => "CONF:VOLT:DC",
        MmeterFunc::Vac => "CONF:VOLT:AC",
        MmeterFunc::Idc => "CONF:CURR:DC",
        MmeterFunc::Iac => "CONF:CURR:AC",
        MmeterFunc::Res => "CONF:RES",
        MmeterFunc::Freq => "CONF:FREQ",
        _ => return None,
    })
}

/// Subsystem prefix used for RANGE/AUTO-RANGE/NPLC/REF in FUNC-style.
pub fn func_range_prefix(func: MmeterFunc) -> Option<&'static str> {
    Some(match func {
        MmeterFunc::Vdc => ":VOLTage:DC",
        MmeterFunc::Vac => ":VOLTage:AC",
        MmeterFunc::Idc => ":CURRent:DC",
        MmeterFunc::Iac => ":CURRent:AC",
        MmeterFunc::Res => ":RESistance",
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeTransport {
        written: Vec<String>,
        to_read: VecDeque<String>,
    }

    impl ScpiTransport for FakeTransport {
        fn write_line(&mut self, line: &str) -> GwResult<()> {
            self.written.push(line.to_string());
            Ok(())
        }
        fn read_line(&mut self) -> GwResult<String> {
            Ok(self.to_read.pop_front().unwrap_or_default())
        }
        fn reset_input(&mut self) -> GwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn query_line_skips_full_echo() {
        let t = FakeTransport { written: vec![], to_read: VecDeque::from([":FETCH?".into(), "1.234".into()]) };
        let mut link = ScpiLink::new(Box::new(t));
        let line = link.query_line(":FETCH?", 6).unwrap();
        assert_eq!(line, "1.234");
    }

    #[test]
    fn query_line_skips_space_stripped_echo() {
        let t = FakeTransport { written: vec![], to_read: VecDeque::from([":FETCH ?".into(), "9.9E37".into()]) };
        let mut link = ScpiLink::new(Box::new(t));
        let line = link.query_line(":FETCH?", 6).unwrap();
        assert_eq!(line, "9.9E37");
    }

    #[test]
    fn fetch_values_overload_becomes_nan() {
        let t = FakeTransport { written: vec![], to_read: VecDeque::from(["9.91E37,1.0".into()]) };
        let mut link = ScpiLink::new(Box::new(t));
        let r = link.fetch_values(":FETCh?").unwrap();
        assert!(r.primary.unwrap().is_nan());
        assert_eq!(r.secondary, Some(1.0));
    }

    #[test]
    fn drain_errors_stops_on_no_error() {
        let t = FakeTransport {
            written: vec![],
            to_read: VecDeque::from(["-221,\"Settings conflict\"".into(), "0,No error".into()]),
        };
        let mut link = ScpiLink::new(Box::new(t));
        let errs = link.drain_errors(16);
        assert_eq!(errs.len(), 2);
        assert!(errs[1].to_ascii_uppercase().contains("NO ERROR"));
    }
}
