//! Byte Command Protocol (BCP) over USB-serial: an alternate CAN transport
//! for adapters that don't present as a SocketCAN interface.
//!
//! Grounded on `original_source/rmcanview.py`: `SOF`/`LEN`/`CMD`/`DATA`/
//! `CHKSUM`/`EOF` framing, incremental resyncing parser, CiA bitrate-to-code
//! table, and the 0x58 (reset) / 0x57 (set bitrate) / 0x5B (set active mode)
//! setup handshake.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::can::backend::{CanBackend, CanFrame};
use crate::error::{GwError, GwResult};

pub const SOF: u8 = 0x43;
pub const EOF: u8 = 0x0D;

const CMD_DATA_STD: u8 = 0x00;
const CMD_DATA_EXT: u8 = 0x02;
const CMD_REMOTE_STD: u8 = 0x04;
const CMD_REMOTE_EXT: u8 = 0x06;
const CMD_RESET: u8 = 0x58;
const CMD_SET_BITRATE: u8 = 0x57;
const CMD_SET_MODE: u8 = 0x5B;

fn xor_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc ^ b)
}

pub fn build_cmd(cmd: u8, data: &[u8]) -> Vec<u8> {
    let length = (1 + data.len()) as u8;
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.push(SOF);
    frame.push(length);
    frame.push(cmd);
    frame.extend_from_slice(data);
    let chk = xor_checksum(&frame);
    frame.push(chk);
    frame.push(EOF);
    frame
}

/// CiA-301 bitrate-to-adapter-code table used by the 0x57 setup command.
pub fn cia_bitrate_code(bitrate: u32) -> Option<u8> {
    Some(match bitrate {
        10_000 => 0x00,
        20_000 => 0x01,
        50_000 => 0x02,
        100_000 => 0xFE,
        125_000 => 0x03,
        250_000 => 0x04,
        500_000 => 0x05,
        800_000 => 0x06,
        1_000_000 => 0x07,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCmd {
    pub cmd: u8,
    pub data: Vec<u8>,
}

/// Incremental, resyncing parser for the byte-command framing.
#[derive(Default)]
pub struct ByteCmdParser {
    buf: VecDeque<u8>,
}

impl ByteCmdParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DecodedCmd> {
        self.buf.extend(chunk.iter().copied());
        let mut out = Vec::new();

        loop {
            let sof_pos = self.buf.iter().position(|&b| b == SOF);
            let Some(pos) = sof_pos else {
                self.buf.clear();
                return out;
            };
            for _ in 0..pos {
                self.buf.pop_front();
            }

            if self.buf.len() < 3 {
                return out;
            }

            let length = self.buf[1] as usize;
            let total_len = length + 4;
            if self.buf.len() < total_len {
                return out;
            }

            let frame: Vec<u8> = self.buf.iter().take(total_len).copied().collect();
            for _ in 0..total_len {
                self.buf.pop_front();
            }

            if frame[total_len - 1] != EOF {
                continue;
            }
            let chk = frame[total_len - 2];
            let calc = xor_checksum(&frame[..total_len - 2]);
            if chk != calc {
                continue;
            }

            out.push(DecodedCmd { cmd: frame[2], data: frame[3..total_len - 2].to_vec() });
        }
    }
}

fn decode_can_message(dec: &DecodedCmd) -> Option<CanFrame> {
    match dec.cmd {
        CMD_DATA_STD | 0x01 => {
            if dec.data.len() < 2 {
                return None;
            }
            let payload = if dec.cmd == 0x01 {
                if dec.data.len() < 6 {
                    return None;
                }
                &dec.data[2..dec.data.len() - 4]
            } else {
                &dec.data[2..]
            };
            if payload.len() > 8 {
                return None;
            }
            let arb_id = u16::from_be_bytes([dec.data[0], dec.data[1]]) as u32 & 0x7FF;
            Some(CanFrame { arbitration_id: arb_id, extended: false, data: payload.to_vec() })
        }
        CMD_DATA_EXT | 0x03 => {
            if dec.data.len() < 4 {
                return None;
            }
            let payload = if dec.cmd == 0x03 {
                if dec.data.len() < 8 {
                    return None;
                }
                &dec.data[4..dec.data.len() - 4]
            } else {
                &dec.data[4..]
            };
            if payload.len() > 8 {
                return None;
            }
            let arb_id = u32::from_be_bytes([dec.data[0], dec.data[1], dec.data[2], dec.data[3]])
                & crate::ids::EXTENDED_ID_MASK;
            Some(CanFrame { arbitration_id: arb_id, extended: true, data: payload.to_vec() })
        }
        // Remote frames carry no payload the gateway consumes.
        CMD_REMOTE_STD | 0x05 | CMD_REMOTE_EXT | 0x07 => None,
        _ => None,
    }
}

pub struct BcpBackend {
    port: Box<dyn serialport::SerialPort>,
    parser: ByteCmdParser,
    rx: mpsc::Receiver<CanFrame>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    reader_handle: Option<thread::JoinHandle<()>>,
}

impl BcpBackend {
    pub fn open(path: &str, serial_baud: u32, can_bitrate: u32, do_setup: bool) -> GwResult<Self> {
        let mut port = serialport::new(path, serial_baud)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| GwError::Io(std::io::Error::other(e)))?;
        let _ = port.clear(serialport::ClearBuffer::All);

        let mut parser = ByteCmdParser::new();
        send_raw(&mut port, CMD_RESET, &[]);
        drain_quick(&mut port, &mut parser, Duration::from_millis(250));

        if do_setup {
            setup(&mut port, &mut parser, can_bitrate);
        }

        let (tx, rx) = mpsc::channel();
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader_handle = spawn_reader(port.try_clone().map_err(|e| GwError::Io(std::io::Error::other(e)))?, tx, stop.clone());

        Ok(BcpBackend { port, parser, rx, stop, reader_handle: Some(reader_handle) })
    }
}

fn send_raw(port: &mut Box<dyn serialport::SerialPort>, cmd: u8, data: &[u8]) {
    let frame = build_cmd(cmd, data);
    if let Err(e) = port.write_all(&frame) {
        warn!(error = %e, cmd, "BCP: failed to send command");
    }
    let _ = port.flush();
}

fn drain_quick(port: &mut Box<dyn serialport::SerialPort>, parser: &mut ByteCmdParser, dur: Duration) {
    let deadline = std::time::Instant::now() + dur;
    let mut buf = [0u8; 256];
    while std::time::Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                let _ = parser.feed(&buf[..n]);
            }
            Err(_) => return,
        }
    }
}

fn setup(port: &mut Box<dyn serialport::SerialPort>, parser: &mut ByteCmdParser, bitrate: u32) {
    match cia_bitrate_code(bitrate) {
        Some(code) => {
            send_raw(port, CMD_SET_BITRATE, &[code, 0, 0, 0, 0]);
            drain_quick(port, parser, Duration::from_millis(250));
        }
        None => warn!(bitrate, "BCP: unsupported CAN bitrate, skipping adapter bitrate setup"),
    }
    send_raw(port, CMD_SET_MODE, &[0x00]);
    drain_quick(port, parser, Duration::from_millis(250));
}

fn spawn_reader(
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<CanFrame>,
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("bcp-rx".to_string())
        .spawn(move || {
            let mut parser = ByteCmdParser::new();
            let mut buf = [0u8; 256];
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        for dec in parser.feed(&buf[..n]) {
                            if let Some(frame) = decode_can_message(&dec) {
                                let _ = tx.send(frame);
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(_) => break,
                }
            }
        })
        .expect("spawn bcp-rx thread")
}

impl CanBackend for BcpBackend {
    fn send(&mut self, frame: &CanFrame) -> GwResult<()> {
        if frame.data.len() > 8 {
            return Err(GwError::Protocol("CAN data length > 8 not supported".to_string()));
        }
        let (cmd, id_bytes): (u8, Vec<u8>) = if frame.extended {
            (CMD_DATA_EXT, (frame.arbitration_id & crate::ids::EXTENDED_ID_MASK).to_be_bytes().to_vec())
        } else {
            (CMD_DATA_STD, ((frame.arbitration_id & 0x7FF) as u16).to_be_bytes().to_vec())
        };
        let mut payload = id_bytes;
        payload.extend_from_slice(&frame.data);
        let out = build_cmd(cmd, &payload);
        self.port.write_all(&out).map_err(GwError::Io)?;
        self.port.flush().map_err(GwError::Io)
    }

    fn recv(&mut self, timeout: Duration) -> GwResult<Option<CanFrame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(GwError::Io(std::io::Error::other("bcp reader thread exited"))),
        }
    }

    fn set_filters(&mut self, _filters: &[crate::can::backend::CanFilterSpec]) -> GwResult<()> {
        // The serial byte protocol has no hardware filter concept; the RX
        // loop's own control-ID check does the filtering instead.
        Ok(())
    }

    fn shutdown(&mut self) -> GwResult<()> {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
        let _ = &self.parser;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_frame_with_correct_checksum() {
        let f = build_cmd(0x58, &[]);
        assert_eq!(f[0], SOF);
        assert_eq!(f[1], 1);
        assert_eq!(f[2], 0x58);
        assert_eq!(f[4], EOF);
    }

    #[test]
    fn parser_decodes_single_frame() {
        let frame = build_cmd(CMD_DATA_EXT, &[0x0C, 0xFF, 0xE7, 0x27, 1, 2, 3]);
        let mut p = ByteCmdParser::new();
        let out = p.feed(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd, CMD_DATA_EXT);
        let msg = decode_can_message(&out[0]).unwrap();
        assert!(msg.extended);
        assert_eq!(msg.arbitration_id, 0x0CFFE727);
        assert_eq!(msg.data, vec![1, 2, 3]);
    }

    #[test]
    fn parser_resyncs_after_garbage_and_corrupt_frame() {
        let good = build_cmd(CMD_RESET, &[]);
        let mut corrupt = build_cmd(CMD_RESET, &[0xAA]);
        let last = corrupt.len() - 2;
        corrupt[last] ^= 0xFF; // flip checksum byte
        let mut stream = vec![0x00, 0x11];
        stream.extend_from_slice(&corrupt);
        stream.extend_from_slice(&good);

        let mut p = ByteCmdParser::new();
        let out = p.feed(&stream);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].cmd, CMD_RESET);
    }

    #[test]
    fn decodes_29bit_extended_data_frame_from_byte_stream() {
        // 29-bit extended data frame with a 6-byte payload
        let chk = xor_checksum(&[0x43, 0x0B, 0x02, 0x00, 0x00, 0x01, 0x7F, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let stream = [0x43, 0x0B, 0x02, 0x00, 0x00, 0x01, 0x7F, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, chk, 0x0D];
        let mut p = ByteCmdParser::new();
        let out = p.feed(&stream);
        assert_eq!(out.len(), 1);
        let msg = decode_can_message(&out[0]).unwrap();
        assert!(msg.extended);
        assert_eq!(msg.arbitration_id, 0x0000017F);
        assert_eq!(msg.data, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn cia_table_covers_standard_rates_and_rejects_unknown() {
        assert_eq!(cia_bitrate_code(250_000), Some(0x04));
        assert_eq!(cia_bitrate_code(1_000_000), Some(0x07));
        assert_eq!(cia_bitrate_code(33_333), None);
    }
}
