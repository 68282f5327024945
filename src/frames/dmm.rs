//! Multimeter control frames: legacy `{mode, range}` and the extended
//! op-code tree, plus the three DMM readback payloads.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmeterFunc {
    Vdc,
    Vac,
    Idc,
    Iac,
    Res,
    Freq,
    Period,
    Diode,
    Cont,
}

impl MmeterFunc {
    pub fn from_u8(v: u8) -> Option<MmeterFunc> {
        Some(match v {
            0 => MmeterFunc::Vdc,
            1 => MmeterFunc::Vac,
            2 => MmeterFunc::Idc,
            3 => MmeterFunc::Iac,
            4 => MmeterFunc::Res,
            5 => MmeterFunc::Freq,
            6 => MmeterFunc::Period,
            7 => MmeterFunc::Diode,
            8 => MmeterFunc::Cont,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            MmeterFunc::Vdc => 0,
            MmeterFunc::Vac => 1,
            MmeterFunc::Idc => 2,
            MmeterFunc::Iac => 3,
            MmeterFunc::Res => 4,
            MmeterFunc::Freq => 5,
            MmeterFunc::Period => 6,
            MmeterFunc::Diode => 7,
            MmeterFunc::Cont => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MmeterFunc::Vdc => "VDC",
            MmeterFunc::Vac => "VAC",
            MmeterFunc::Idc => "IDC",
            MmeterFunc::Iac => "IAC",
            MmeterFunc::Res => "RES",
            MmeterFunc::Freq => "FREQ",
            MmeterFunc::Period => "PER",
            MmeterFunc::Diode => "DIODE",
            MmeterFunc::Cont => "CONT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyCmd {
    pub mode: u8,
    pub range: u8,
}

pub fn decode_legacy(data: &[u8]) -> Option<LegacyCmd> {
    if data.len() < 2 {
        return None;
    }
    Some(LegacyCmd { mode: data[0], range: data[1] })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtOp {
    SetFunction,
    SetAutorange,
    SetRange,
    SetNplc,
    SecondaryEnable,
    SecondaryFunction,
    TrigSource,
    BusTrigger,
    RelativeEnable,
    RelativeAcquire,
    Unknown(u8),
}

impl ExtOp {
    pub fn from_u8(v: u8) -> ExtOp {
        match v {
            0x01 => ExtOp::SetFunction,
            0x02 => ExtOp::SetAutorange,
            0x03 => ExtOp::SetRange,
            0x04 => ExtOp::SetNplc,
            0x05 => ExtOp::SecondaryEnable,
            0x06 => ExtOp::SecondaryFunction,
            0x07 => ExtOp::TrigSource,
            0x08 => ExtOp::BusTrigger,
            0x09 => ExtOp::RelativeEnable,
            0x0A => ExtOp::RelativeAcquire,
            other => ExtOp::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtCmd {
    pub op: ExtOp,
    pub arg0: u8,
    pub arg1: u8,
    pub arg2: u8,
    pub value: f32,
}

/// `arg0 == 0xFF` means "apply to the currently selected function".
pub const ARG0_CURRENT_FUNC: u8 = 0xFF;

pub fn decode_ext(data: &[u8]) -> Option<ExtCmd> {
    if data.is_empty() {
        return None;
    }
    let op = ExtOp::from_u8(data[0]);
    let arg0 = data.get(1).copied().unwrap_or(0);
    let arg1 = data.get(2).copied().unwrap_or(0);
    let arg2 = data.get(3).copied().unwrap_or(0);
    let value = if data.len() >= 8 {
        f32::from_le_bytes([data[4], data[5], data[6], data[7]])
    } else {
        0.0
    };
    Some(ExtCmd { op, arg0, arg1, arg2, value })
}

/// Resolves `arg0` against the currently-selected function.
pub fn target_function(arg0: u8, current: MmeterFunc) -> MmeterFunc {
    if arg0 == ARG0_CURRENT_FUNC {
        current
    } else {
        MmeterFunc::from_u8(arg0).unwrap_or(current)
    }
}

/// Nearest of `{0.1, 1.0, 10.0}` by absolute difference; ties favor the
/// first candidate encountered (0.1).
pub fn quantize_nplc(value: f64) -> f64 {
    const CANDIDATES: [f64; 3] = [0.1, 1.0, 10.0];
    let mut best = CANDIDATES[0];
    let mut best_diff = (value - best).abs();
    for &c in &CANDIDATES[1..] {
        let d = (value - c).abs();
        if d < best_diff {
            best = c;
            best_diff = d;
        }
    }
    best
}

/// Meter legacy readback: u16 mA, zero-padded to 8 bytes.
pub fn encode_meter_legacy(meter_current_ma: u16) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..2].copy_from_slice(&meter_current_ma.to_le_bytes());
    out
}

/// Meter extended readback: f32 primary + f32 secondary (NaN when absent).
pub fn encode_meter_ext(primary: f32, secondary: f32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&primary.to_le_bytes());
    out[4..8].copy_from_slice(&secondary.to_le_bytes());
    out
}

/// Meter status readback: `{func u8, flags u8}`.
pub fn encode_meter_status(func: MmeterFunc, flags: u8) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = func.to_u8();
    out[1] = flags;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantizes_nplc_to_nearest_decade() {
        // f32=9.0 -> 10.0
        assert_eq!(quantize_nplc(9.0), 10.0);
        assert_eq!(quantize_nplc(0.05), 0.1);
        assert_eq!(quantize_nplc(0.5), 1.0);
        assert_eq!(quantize_nplc(3.0), 1.0);
    }

    #[test]
    fn decodes_ext_nplc_scenario() {
        let mut data = vec![0x04, 0xFFu8, 0x00, 0x00];
        data.extend_from_slice(&9.0f32.to_le_bytes());
        let cmd = decode_ext(&data).unwrap();
        assert_eq!(cmd.op, ExtOp::SetNplc);
        assert_eq!(cmd.arg0, ARG0_CURRENT_FUNC);
        assert_eq!(cmd.value, 9.0);
        assert_eq!(target_function(cmd.arg0, MmeterFunc::Vdc), MmeterFunc::Vdc);
    }
}
