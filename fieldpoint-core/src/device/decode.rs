//! Register-pair decoding for 32-bit analog values.
//!
//! Modbus transports 16-bit registers; 32-bit values span two of them with a
//! device-specific word order, and some slaves additionally swap the bytes
//! inside each word. Declared transformations pick the combination plus a
//! datatype, rounding and a scale ratio.

use serde_json::Value;

use crate::hwdef::{TransformDef, TransformType, Endianness};

/// Combine a register pair into a raw u32 honoring byte and word order.
pub fn u32_from_registers(regs: [u16; 2], byteorder: Endianness, wordorder: Endianness) -> u32 {
    let [mut hi, mut lo] = match wordorder {
        Endianness::Big => [regs[0], regs[1]],
        Endianness::Little => [regs[1], regs[0]],
    };
    if byteorder == Endianness::Little {
        hi = hi.swap_bytes();
        lo = lo.swap_bytes();
    }
    ((hi as u32) << 16) | (lo as u32)
}

/// Decode a register pair as an IEEE 754 float.
pub fn f32_from_registers(regs: [u16; 2], byteorder: Endianness, wordorder: Endianness) -> f32 {
    f32::from_bits(u32_from_registers(regs, byteorder, wordorder))
}

/// Encode an IEEE 754 float into a register pair.
pub fn f32_to_registers(value: f32, byteorder: Endianness, wordorder: Endianness) -> [u16; 2] {
    let bits = value.to_bits();
    let mut hi = (bits >> 16) as u16;
    let mut lo = bits as u16;
    if byteorder == Endianness::Little {
        hi = hi.swap_bytes();
        lo = lo.swap_bytes();
    }
    match wordorder {
        Endianness::Big => [hi, lo],
        Endianness::Little => [lo, hi],
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Apply a declared transformation to a register pair.
///
/// Float results that are not finite come out as `null` rather than poisoning
/// the snapshot.
pub fn apply_transform(transform: &TransformDef, regs: [u16; 2]) -> Value {
    match transform.datatype {
        TransformType::Float32 => {
            let value = f32_from_registers(regs, transform.byteorder, transform.wordorder) as f64
                * transform.ratio;
            json_number(round_to(value, transform.decimals))
        }
        TransformType::Int32 => {
            let raw = u32_from_registers(regs, transform.byteorder, transform.wordorder) as i32;
            Value::from((raw as f64 * transform.ratio) as i64)
        }
        TransformType::Uint32 => {
            let raw = u32_from_registers(regs, transform.byteorder, transform.wordorder);
            json_number(round_to(raw as f64 * transform.ratio, transform.decimals))
        }
    }
}

/// A finite f64 as a JSON number, `null` otherwise.
pub fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_big_byteorder_big_wordorder() {
        // 123.456 in IEEE 754 is 0x42F6E979.
        let value = f32_from_registers([0x42F6, 0xE979], Endianness::Big, Endianness::Big);
        assert!((value - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_f32_word_order_swap() {
        let value = f32_from_registers([0xE979, 0x42F6], Endianness::Big, Endianness::Little);
        assert!((value - 123.456).abs() < 0.001);
    }

    #[test]
    fn test_f32_roundtrip_all_orders() {
        for byteorder in [Endianness::Big, Endianness::Little] {
            for wordorder in [Endianness::Big, Endianness::Little] {
                let regs = f32_to_registers(-17.25, byteorder, wordorder);
                let back = f32_from_registers(regs, byteorder, wordorder);
                assert_eq!(back, -17.25);
            }
        }
    }

    #[test]
    fn test_transform_uint32_with_ratio() {
        let transform = TransformDef {
            datatype: TransformType::Uint32,
            wordorder: Endianness::Big,
            ratio: 0.1,
            decimals: 1,
            ..TransformDef::default()
        };
        // 0x0001_0000 = 65536 -> 6553.6
        assert_eq!(apply_transform(&transform, [1, 0]), Value::from(6553.6));
    }

    #[test]
    fn test_transform_int32_truncates() {
        let transform = TransformDef {
            datatype: TransformType::Int32,
            wordorder: Endianness::Big,
            ratio: 0.5,
            ..TransformDef::default()
        };
        // -3 * 0.5 = -1.5, truncated toward zero.
        let regs = [0xFFFF, 0xFFFD];
        assert_eq!(apply_transform(&transform, regs), Value::from(-1));
    }

    #[test]
    fn test_nan_becomes_null() {
        let transform = TransformDef::default();
        // Quiet NaN bit pattern, little word order.
        let regs = f32_to_registers(f32::NAN, transform.byteorder, transform.wordorder);
        assert_eq!(apply_transform(&transform, regs), Value::Null);
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 3), 1.235);
        assert_eq!(round_to(-0.0025, 2), -0.0);
    }
}
