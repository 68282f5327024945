//! Transport-agnostic CAN backend surface.
//!
//! Both the SocketCAN path and the Byte Command Protocol (BCP) USB-serial
//! path implement this trait, so the RX loop, TX scheduler, and command
//! worker never need to know which physical transport is in use.

use std::time::Duration;

use crate::error::GwResult;

#[derive(Debug, Clone)]
pub struct CanFrame {
    pub arbitration_id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn extended(arbitration_id: u32, data: &[u8]) -> Self {
        CanFrame {
            arbitration_id: arbitration_id & crate::ids::EXTENDED_ID_MASK,
            extended: true,
            data: data.to_vec(),
        }
    }
}

/// One kernel-filter entry: `can_mask` is normally `0x1FFFFFFF` (exact-match
/// on the 29-bit ID).
#[derive(Debug, Clone, Copy)]
pub struct CanFilterSpec {
    pub can_id: u32,
    pub can_mask: u32,
}

pub trait CanBackend: Send {
    fn send(&mut self, frame: &CanFrame) -> GwResult<()>;

    /// Blocks up to `timeout` for the next inbound frame. `Ok(None)` means
    /// the wait elapsed with nothing to deliver.
    fn recv(&mut self, timeout: Duration) -> GwResult<Option<CanFrame>>;

    /// Pushes an ID/mask filter list down into the backend, if it supports
    /// kernel-side filtering. Backends that can't filter in hardware should
    /// return `Ok(())` and let the RX loop's software filter do the work.
    fn set_filters(&mut self, filters: &[CanFilterSpec]) -> GwResult<()>;

    fn shutdown(&mut self) -> GwResult<()>;
}
