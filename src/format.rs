//! The one-byte format catalogue: which encodings exist, how wide they are,
//! and which narrowest format reproduces a series losslessly to six
//! significant decimal digits.

use crate::codec;
use crate::error::{TsdbError, TsdbResult};
use crate::value::Value;

pub const FORMAT_FLOAT: u8 = 0x00;
pub const FORMAT_DOUBLE: u8 = 0x01;
pub const FORMAT_DOUBLE_DEC1: u8 = 0x02;
pub const FORMAT_DOUBLE_DEC2: u8 = 0x03;
pub const FORMAT_DOUBLE_DEC3: u8 = 0x04;
pub const FORMAT_DOUBLE_DEC4: u8 = 0x05;
pub const FORMAT_DOUBLE_DEC5: u8 = 0x06;
pub const FORMAT_DOUBLE_DEC6PLUS: u8 = 0x07;
pub const FORMAT_STRING_U8: u8 = 0x08;
pub const FORMAT_STRING_U16: u8 = 0x09;
pub const FORMAT_STRING_U32: u8 = 0x0A;
pub const FORMAT_STRING_U64: u8 = 0x0B;

/// Shape of a scaled-integer format: fixed byte width, signedness and the
/// power-of-ten divisor applied on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledShape {
    pub byte_count: usize,
    pub signed: bool,
    pub scale: i64,
}

pub fn is_double_family(format_id: u8) -> bool {
    (FORMAT_DOUBLE..=FORMAT_DOUBLE_DEC6PLUS).contains(&format_id)
}

pub fn is_string(format_id: u8) -> bool {
    (FORMAT_STRING_U8..=FORMAT_STRING_U64).contains(&format_id)
}

pub fn string_len_prefix(format_id: u8) -> Option<usize> {
    match format_id {
        FORMAT_STRING_U8 => Some(1),
        FORMAT_STRING_U16 => Some(2),
        FORMAT_STRING_U32 => Some(4),
        FORMAT_STRING_U64 => Some(8),
        _ => None,
    }
}

/// Decode the scaled-integer shape from the id nibbles. High nibble selects
/// width and signedness, low nibble the decimal scale; anything else is not
/// a scaled format.
pub fn scaled_shape(format_id: u8) -> Option<ScaledShape> {
    if format_id == FORMAT_FLOAT || is_double_family(format_id) || is_string(format_id) {
        return None;
    }
    let hi = (format_id >> 4) & 0xF;
    let lo = format_id & 0xF;
    let byte_count = match hi {
        0x1 | 0x9 => 1,
        0x2 | 0xA => 2,
        0x3 | 0xB => 3,
        0x4 | 0xC => 4,
        0x5 | 0xD => 8,
        _ => return None,
    };
    if lo > 3 {
        return None;
    }
    let scale = [1i64, 10, 100, 1000][lo as usize];
    Some(ScaledShape {
        byte_count,
        signed: hi <= 0x5,
        scale,
    })
}

fn c_int_type_name(byte_count: usize, signed: bool) -> &'static str {
    match (byte_count, signed) {
        (1, true) => "int8_t",
        (2, true) => "int16_t",
        (3, true) => "int24_t",
        (4, true) => "int32_t",
        (8, true) => "int64_t",
        (1, false) => "uint8_t",
        (2, false) => "uint16_t",
        (3, false) => "uint24_t",
        (4, false) => "uint32_t",
        _ => "uint64_t",
    }
}

pub fn describe(format_id: u8) -> String {
    match format_id {
        FORMAT_FLOAT => "float".to_string(),
        FORMAT_DOUBLE => "double (display hint: 0 decimals)".to_string(),
        FORMAT_DOUBLE_DEC1 => "double (display hint: 1 decimal)".to_string(),
        FORMAT_DOUBLE_DEC2 => "double (display hint: 2 decimals)".to_string(),
        FORMAT_DOUBLE_DEC3 => "double (display hint: 3 decimals)".to_string(),
        FORMAT_DOUBLE_DEC4 => "double (display hint: 4 decimals)".to_string(),
        FORMAT_DOUBLE_DEC5 => "double (display hint: 5 decimals)".to_string(),
        FORMAT_DOUBLE_DEC6PLUS => "double (display hint: 6+ decimals)".to_string(),
        FORMAT_STRING_U8 => "UTF-8 string with uint8_t length prefix".to_string(),
        FORMAT_STRING_U16 => "UTF-8 string with uint16_t length prefix".to_string(),
        FORMAT_STRING_U32 => "UTF-8 string with uint32_t length prefix".to_string(),
        FORMAT_STRING_U64 => "UTF-8 string with uint64_t length prefix".to_string(),
        _ => match scaled_shape(format_id) {
            None => "unknown".to_string(),
            Some(shape) => {
                let c_type = c_int_type_name(shape.byte_count, shape.signed);
                if shape.scale == 1 {
                    c_type.to_string()
                } else {
                    format!("{} x; value = x / {}.0", c_type, shape.scale)
                }
            }
        },
    }
}

/// Display decimal places implied by a format id; 3 for anything without an
/// explicit hint.
pub fn decimal_places(format_id: Option<u8>) -> u32 {
    let Some(format_id) = format_id else {
        return 3;
    };
    match format_id {
        FORMAT_DOUBLE_DEC1 => 1,
        FORMAT_DOUBLE_DEC2 => 2,
        FORMAT_DOUBLE_DEC3 => 3,
        FORMAT_DOUBLE_DEC4 => 4,
        FORMAT_DOUBLE_DEC5 => 5,
        FORMAT_DOUBLE_DEC6PLUS => 6,
        FORMAT_FLOAT | FORMAT_DOUBLE => 3,
        _ => match scaled_shape(format_id) {
            Some(shape) => match shape.scale {
                10 => 1,
                100 => 2,
                1000 => 3,
                _ => 0,
            },
            None => 3,
        },
    }
}

/// Double format carrying the display hint for a given number of fractional
/// digits in the source literal.
pub fn double_format_for_decimals(decimals: u32) -> u8 {
    match decimals {
        0 => FORMAT_DOUBLE,
        1 => FORMAT_DOUBLE_DEC1,
        2 => FORMAT_DOUBLE_DEC2,
        3 => FORMAT_DOUBLE_DEC3,
        4 => FORMAT_DOUBLE_DEC4,
        5 => FORMAT_DOUBLE_DEC5,
        _ => FORMAT_DOUBLE_DEC6PLUS,
    }
}

/// Half-away-from-zero rounding at `digits` decimal places, used both for
/// the lossless-encoding test and for downsample output rounding.
pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

pub fn is_equal_6_digits(a: f64, b: f64) -> bool {
    round_to(a, 6) == round_to(b, 6)
}

/// Decode one value of the given format from `data` at `offset`.
pub fn read_value(data: &[u8], offset: usize, format_id: u8) -> TsdbResult<(Value, usize)> {
    if format_id == FORMAT_FLOAT {
        let (value, offset) = codec::read_f32(data, offset)?;
        return Ok((Value::Double(value as f64), offset));
    }
    if is_double_family(format_id) {
        let (value, offset) = codec::read_f64(data, offset)?;
        return Ok((Value::Double(value), offset));
    }
    if let Some(len_size) = string_len_prefix(format_id) {
        let (len, offset) = codec::read_scalar(data, offset, len_size, false)
            .map_err(|e| match e {
                TsdbError::Truncated { offset, .. } => TsdbError::Truncated {
                    what: "string length",
                    offset,
                },
                other => other,
            })?;
        let (text, offset) = codec::read_utf8(data, offset, len as usize, "string bytes")?;
        return Ok((Value::Text(text), offset));
    }
    let shape = scaled_shape(format_id).ok_or(TsdbError::UnsupportedFormat(format_id))?;
    let (raw, offset) = codec::read_scalar(data, offset, shape.byte_count, shape.signed)?;
    let value = if shape.scale == 1 {
        raw as f64
    } else {
        raw as f64 / shape.scale as f64
    };
    Ok((Value::Double(value), offset))
}

fn signed_range(byte_count: usize) -> (i128, i128) {
    let bits = byte_count as u32 * 8;
    (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
}

fn unsigned_range(byte_count: usize) -> (i128, i128) {
    let bits = byte_count as u32 * 8;
    (0, (1i128 << bits) - 1)
}

/// Encode a value as the payload bytes of the given format, or `None` when
/// the value cannot be represented losslessly (to six decimal digits) in it.
pub fn encode_value(value: &Value, format_id: u8) -> Option<Vec<u8>> {
    if is_double_family(format_id) {
        let numeric = value.as_f64()?;
        if !numeric.is_finite() {
            return None;
        }
        return Some(numeric.to_le_bytes().to_vec());
    }
    if format_id == FORMAT_FLOAT {
        let numeric = value.as_f64()?;
        if !numeric.is_finite() {
            return None;
        }
        let narrowed = numeric as f32;
        if !is_equal_6_digits(numeric, narrowed as f64) {
            return None;
        }
        return Some(narrowed.to_le_bytes().to_vec());
    }
    if let Some(len_size) = string_len_prefix(format_id) {
        let Value::Text(text) = value else {
            return None;
        };
        let raw = text.as_bytes();
        let max_len = if len_size == 8 {
            u64::MAX as u128
        } else {
            (1u128 << (len_size * 8)) - 1
        };
        if raw.len() as u128 > max_len {
            return None;
        }
        let mut out = (raw.len() as u64).to_le_bytes()[..len_size].to_vec();
        out.extend_from_slice(raw);
        return Some(out);
    }

    let shape = scaled_shape(format_id)?;
    let numeric = value.as_f64()?;
    if !numeric.is_finite() {
        return None;
    }
    let scaled_f = (numeric * shape.scale as f64).round();
    if !scaled_f.is_finite() || scaled_f.abs() > i128::MAX as f64 {
        return None;
    }
    let scaled = scaled_f as i128;
    let (low, high) = if shape.signed {
        signed_range(shape.byte_count)
    } else {
        unsigned_range(shape.byte_count)
    };
    if scaled < low || scaled > high {
        return None;
    }
    let reconstructed = scaled as f64 / shape.scale as f64;
    if !is_equal_6_digits(numeric, reconstructed) {
        return None;
    }

    let mut out = Vec::with_capacity(shape.byte_count);
    match shape.byte_count {
        3 => {
            let raw = if shape.signed && scaled < 0 {
                ((1i128 << 24) + scaled) as u32
            } else {
                scaled as u32
            };
            codec::push_u24(&mut out, raw);
        }
        n => {
            // Two's-complement little-endian bytes of the scaled integer.
            out.extend_from_slice(&(scaled as i64).to_le_bytes()[..n]);
        }
    }
    Some(out)
}

/// Candidate order for the compressor: narrow before wide, unsigned before
/// signed, each width tried at scales 1/10/100/1000 before widening, with
/// float32 slotted ahead of the 8-byte integers.
const FORMAT_CANDIDATES: [u8; 42] = [
    0x90, 0x91, 0x92, 0x93, // uint8
    0x10, 0x11, 0x12, 0x13, // int8
    0xA0, 0xA1, 0xA2, 0xA3, // uint16
    0x20, 0x21, 0x22, 0x23, // int16
    0xB0, 0xB1, 0xB2, 0xB3, // uint24
    0x30, 0x31, 0x32, 0x33, // int24
    0xC0, 0xC1, 0xC2, 0xC3, // uint32
    0x40, 0x41, 0x42, 0x43, // int32
    FORMAT_FLOAT,
    0xD0, 0xD1, 0xD2, 0xD3, // uint64
    0x50, 0x51, 0x52, 0x53, // int64
    FORMAT_DOUBLE,
];

/// Pick the narrowest format that losslessly round-trips every value of the
/// series.
pub fn select_format(series: &str, values: &[Value]) -> TsdbResult<u8> {
    if values.is_empty() {
        return Err(TsdbError::EmptySeries(series.to_string()));
    }

    if values.iter().all(|v| matches!(v, Value::Text(_))) {
        let max_len = values
            .iter()
            .map(|v| match v {
                Value::Text(t) => t.as_bytes().len(),
                Value::Double(_) => 0,
            })
            .max()
            .unwrap_or(0);
        return Ok(if max_len <= 0xFF {
            FORMAT_STRING_U8
        } else if max_len <= 0xFFFF {
            FORMAT_STRING_U16
        } else if max_len <= 0xFFFF_FFFF {
            FORMAT_STRING_U32
        } else {
            FORMAT_STRING_U64
        });
    }

    if values.iter().any(|v| matches!(v, Value::Text(_))) {
        return Err(TsdbError::MixedSeries(series.to_string()));
    }

    for candidate in FORMAT_CANDIDATES {
        if values.iter().all(|v| encode_value(v, candidate).is_some()) {
            return Ok(candidate);
        }
    }
    Ok(FORMAT_DOUBLE)
}
