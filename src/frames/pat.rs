//! PAT_Jx switching-matrix payload decode (dashboard-only; §6, §9).
//!
//! Twelve 2-bit fields packed little-endian into the low 24 bits of the
//! payload.

pub const FIELD_COUNT: usize = 12;

pub fn decode_payload(data: &[u8]) -> [u8; FIELD_COUNT] {
    let b0 = data.first().copied().unwrap_or(0) as u32;
    let b1 = data.get(1).copied().unwrap_or(0) as u32;
    let b2 = data.get(2).copied().unwrap_or(0) as u32;
    let u24 = b0 | (b1 << 8) | (b2 << 16);
    let mut out = [0u8; FIELD_COUNT];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = ((u24 >> (2 * i)) & 0x3) as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_packed_fields() {
        // pack values [3,2,1,0,3,2,1,0,3,2,1,0] and decode them back
        let values: [u8; FIELD_COUNT] = [3, 2, 1, 0, 3, 2, 1, 0, 3, 2, 1, 0];
        let mut u24: u32 = 0;
        for (i, &v) in values.iter().enumerate() {
            u24 |= (v as u32) << (2 * i);
        }
        let data = [
            (u24 & 0xFF) as u8,
            ((u24 >> 8) & 0xFF) as u8,
            ((u24 >> 16) & 0xFF) as u8,
        ];
        assert_eq!(decode_payload(&data), values);
    }
}
