//! SocketCAN backend: brings the interface up via `ip link` (best effort,
//! sudo fallback) then talks to it through the `socketcan` crate.
//!
//! Grounded on `original_source/can_comm.py::setup_can_interface` /
//! `shutdown_can_interface`.

use std::process::Command;
use std::time::Duration;

use socketcan::{CanFilter, CanFrame as SockFrame, EmbeddedFrame, ExtendedId, Frame, Socket, SocketOptions};

use crate::can::backend::{CanBackend, CanFilterSpec, CanFrame};
use crate::error::{GwError, GwResult};

pub struct SocketCanBackend {
    socket: socketcan::CanSocket,
    channel: String,
    do_setup: bool,
}

impl SocketCanBackend {
    pub fn open(channel: &str, bitrate: u32, do_setup: bool) -> GwResult<Self> {
        if do_setup {
            bring_up(channel, bitrate);
        }

        let socket = socketcan::CanSocket::open(channel)
            .map_err(|e| GwError::Io(std::io::Error::other(format!("CAN open '{channel}' failed: {e}"))))?;
        socket
            .set_read_timeout(Duration::from_millis(200))
            .map_err(GwError::Io)?;

        Ok(SocketCanBackend { socket, channel: channel.to_string(), do_setup })
    }
}

fn bring_up(channel: &str, bitrate: u32) {
    let attempts: [&[&str]; 2] = [
        &["ip", "link", "set", channel, "up", "type", "can", "bitrate"],
        &["sudo", "ip", "link", "set", channel, "up", "type", "can", "bitrate"],
    ];
    let bitrate_s = bitrate.to_string();
    for base in attempts {
        let mut args: Vec<&str> = base.to_vec();
        args.push(&bitrate_s);
        let (cmd, rest) = args.split_first().unwrap();
        match Command::new(cmd).args(rest).output() {
            Ok(out) if out.status.success() => return,
            Ok(_) => continue,
            Err(_) => continue,
        }
    }
}

fn bring_down(channel: &str) {
    for cmd in [
        vec!["ip", "link", "set", channel, "down"],
        vec!["sudo", "ip", "link", "set", channel, "down"],
    ] {
        let (head, rest) = cmd.split_first().unwrap();
        if Command::new(head).args(rest).output().is_ok() {
            break;
        }
    }
}

impl CanBackend for SocketCanBackend {
    fn send(&mut self, frame: &CanFrame) -> GwResult<()> {
        let id = ExtendedId::new(frame.arbitration_id)
            .ok_or_else(|| GwError::Protocol(format!("invalid extended id {:#x}", frame.arbitration_id)))?;
        let sock_frame = SockFrame::new(id, &frame.data)
            .ok_or_else(|| GwError::Protocol("frame data too long".to_string()))?;
        self.socket.write_frame(&sock_frame).map_err(GwError::Io)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> GwResult<Option<CanFrame>> {
        let _ = self.socket.set_read_timeout(timeout);
        match self.socket.read_frame() {
            Ok(f) => {
                let extended = f.is_extended();
                Ok(Some(CanFrame {
                    arbitration_id: f.raw_id() & crate::ids::EXTENDED_ID_MASK,
                    extended,
                    data: f.data().to_vec(),
                }))
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(GwError::Io(e)),
        }
    }

    fn set_filters(&mut self, filters: &[CanFilterSpec]) -> GwResult<()> {
        let kernel_filters: Vec<CanFilter> =
            filters.iter().map(|f| CanFilter::new(f.can_id, f.can_mask)).collect();
        self.socket.set_filters(&kernel_filters).map_err(GwError::Io)
    }

    fn shutdown(&mut self) -> GwResult<()> {
        if self.do_setup {
            bring_down(&self.channel);
        }
        Ok(())
    }
}
