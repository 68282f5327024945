//! Electronic load control frame (6 bytes) and its readback frame.
//!
//! Byte 0 bit-packs `{enable, mode, short}`; bytes 2-3 and 4-5 are
//! little-endian u16 setpoints in milliamps / milliohms. Field masks are
//! pinned to the original device-command processor rather than re-derived,
//! since exact bit positions are otherwise unstated.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EloadMode {
    Curr,
    Res,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EloadCmd {
    pub enable: bool,
    pub mode: EloadMode,
    pub short: bool,
    pub current_ma: u16,
    pub resistance_mohm: u16,
}

pub fn decode(data: &[u8]) -> Option<EloadCmd> {
    if data.len() < 6 {
        return None;
    }
    let b0 = data[0];
    let enable = (b0 & 0x0C) == 0x04;
    let mode = if (b0 & 0x30) == 0x10 { EloadMode::Res } else { EloadMode::Curr };
    let short = (b0 & 0xC0) == 0x40;
    let current_ma = u16::from_le_bytes([data[2], data[3]]);
    let resistance_mohm = u16::from_le_bytes([data[4], data[5]]);
    Some(EloadCmd {
        enable,
        mode,
        short,
        current_ma,
        resistance_mohm,
    })
}

/// Readback payload: `{volts u16 mV, current u16 mA}`, zero-padded to 8 bytes.
pub fn encode_readback(load_volts_mv: u16, load_current_ma: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&load_volts_mv.to_le_bytes());
    out[2..4].copy_from_slice(&load_current_ma.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_turn_on_sequence() {
        // turn-on in CURR mode at 1 A
        let cmd = decode(&[0x04, 0x00, 0xE8, 0x03, 0x00, 0x00]).unwrap();
        assert!(cmd.enable);
        assert_eq!(cmd.mode, EloadMode::Curr);
        assert!(!cmd.short);
        assert_eq!(cmd.current_ma, 1000);
    }

    #[test]
    fn decodes_mode_change_with_short() {
        // switch to RES mode with short enabled
        let cmd = decode(&[0x50, 0x00, 0x00, 0x00, 0xD0, 0x07]).unwrap();
        assert!(!cmd.enable);
        assert_eq!(cmd.mode, EloadMode::Res);
        assert!(cmd.short);
        assert_eq!(cmd.resistance_mohm, 2000);
    }

    #[test]
    fn rejects_short_payload() {
        assert_eq!(decode(&[0x04, 0x00, 0xE8]), None);
    }
}
