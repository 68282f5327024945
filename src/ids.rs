//! 29-bit arbitration IDs for control and readback frames.

pub const LOAD_CTRL: u32 = 0x0CFF_0400;
pub const RLY_CTRL: u32 = 0x0CFF_0500;
pub const MMETER_CTRL: u32 = 0x0CFF_0600;
pub const MMETER_CTRL_EXT: u32 = 0x0CFF_0601;
pub const AFG_CTRL: u32 = 0x0CFF_0700;
pub const AFG_CTRL_EXT: u32 = 0x0CFF_0701;
pub const MRSIGNAL_CTRL: u32 = 0x0CFF_0800;

pub const ELOAD_READ: u32 = 0x0CFF_0003;
pub const MMETER_READ: u32 = 0x0CFF_0004;
pub const AFG_READ: u32 = 0x0CFF_0005;
pub const AFG_READ_EXT: u32 = 0x0CFF_0006;
pub const MRSIGNAL_READ_STATUS: u32 = 0x0CFF_0007;
pub const MRSIGNAL_READ_INPUT: u32 = 0x0CFF_0008;
pub const MMETER_READ_EXT: u32 = 0x0CFF_0009;
pub const MMETER_STATUS: u32 = 0x0CFF_000A;

pub const PAT_J_BASE: u32 = 0x0CFF_E727;
pub const PAT_J_STRIDE: u32 = 0x100;
pub const PAT_J_COUNT: u32 = 6;

/// Mask applied to any raw (possibly EFF-flagged) SocketCAN identifier on
/// ingress, normalizing to the pure 29-bit arbitration ID.
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// The fixed set of IDs the RX loop forwards to the command worker. Any
/// other traffic (including PAT_Jx) is observed for bus-load/watchdog
/// purposes only and then dropped.
pub fn control_ids() -> [u32; 7] {
    [
        RLY_CTRL,
        AFG_CTRL,
        AFG_CTRL_EXT,
        MMETER_CTRL,
        MMETER_CTRL_EXT,
        LOAD_CTRL,
        MRSIGNAL_CTRL,
    ]
}

/// Index of a PAT_Jx arbitration ID into `0..PAT_J_COUNT`, or `None` if the
/// ID does not belong to the PAT_J0..PAT_J5 stride.
pub fn pat_j_index(arb_id: u32) -> Option<u32> {
    let delta = arb_id.checked_sub(PAT_J_BASE)?;
    if delta % PAT_J_STRIDE != 0 {
        return None;
    }
    let idx = delta / PAT_J_STRIDE;
    (idx < PAT_J_COUNT).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_index_roundtrip() {
        for i in 0..PAT_J_COUNT {
            let id = PAT_J_BASE + i * PAT_J_STRIDE;
            assert_eq!(pat_j_index(id), Some(i));
        }
        assert_eq!(pat_j_index(PAT_J_BASE - 1), None);
        assert_eq!(pat_j_index(PAT_J_BASE + 1), None);
    }
}
