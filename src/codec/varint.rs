//! Varint and zig-zag encoding over private-use code points
//!
//! Each unit is `U+E000 + byte`, where the byte carries 7 payload bits and
//! bit 0x80 marks continuation. Groups are little-endian.

use super::Cursor;
use crate::error::{EngineError, Result};

/// First code point of the varint unit range
pub const VARINT_BASE: u32 = 0xE000;

/// Last code point of the varint unit range
pub const VARINT_LIMIT: u32 = VARINT_BASE + 0xFF;

const CONTINUATION: u32 = 0x80;
const PAYLOAD_MASK: u64 = 0x7F;

fn unit(byte: u32) -> char {
    // Private-use range is always a valid scalar value
    char::from_u32(VARINT_BASE + byte).unwrap_or('\u{E000}')
}

/// Whether a code point belongs to the varint unit range
pub fn is_varint_unit(c: char) -> bool {
    (VARINT_BASE..=VARINT_LIMIT).contains(&(c as u32))
}

pub fn encode_unsigned(mut value: u64, out: &mut String) {
    loop {
        let byte = (value & PAYLOAD_MASK) as u32;
        value >>= 7;
        if value == 0 {
            out.push(unit(byte));
            return;
        }
        out.push(unit(byte | CONTINUATION));
    }
}

pub fn decode_unsigned(cursor: &mut Cursor<'_>) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let position = cursor.offset();
        let c = cursor
            .next()
            .ok_or_else(|| EngineError::MalformedStream(format!("truncated varint at {}", position)))?;
        if !is_varint_unit(c) {
            return Err(EngineError::MalformedStream(format!(
                "unexpected {:?} inside varint at {}",
                c, position
            )));
        }

        let byte = c as u32 - VARINT_BASE;
        let payload = u64::from(byte) & PAYLOAD_MASK;
        if shift >= 64 || (shift == 63 && payload > 1) {
            return Err(EngineError::MalformedStream(format!(
                "varint overflows 64 bits at {}",
                position
            )));
        }
        value |= payload << shift;

        if byte & CONTINUATION == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn encode_signed(value: i64, out: &mut String) {
    encode_unsigned(zigzag_encode(value), out);
}

pub fn decode_signed(cursor: &mut Cursor<'_>) -> Result<i64> {
    decode_unsigned(cursor).map(zigzag_decode)
}
