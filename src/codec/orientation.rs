//! Orientation glyphs
//!
//! `⓿` for index 0, circled digits `①`..`⑳` for 1..=20, and `∘` followed
//! by a varint for anything larger.

use super::varint::{decode_unsigned, encode_unsigned};
use super::Cursor;
use crate::error::{EngineError, Result};

pub const ZERO_GLYPH: char = '\u{24FF}';
pub const ESCAPE_GLYPH: char = '\u{2218}';

/// Largest index with a dedicated glyph
pub const MAX_DIRECT_INDEX: u32 = 20;

const CIRCLED_ONE: u32 = 0x2460;

pub fn encode_orientation(index: u32, out: &mut String) {
    match index {
        0 => out.push(ZERO_GLYPH),
        1..=MAX_DIRECT_INDEX => {
            out.push(char::from_u32(CIRCLED_ONE + index - 1).unwrap_or(ESCAPE_GLYPH));
        }
        _ => {
            out.push(ESCAPE_GLYPH);
            encode_unsigned(u64::from(index), out);
        }
    }
}

pub fn decode_orientation(cursor: &mut Cursor<'_>) -> Result<u32> {
    let position = cursor.offset();
    let glyph = cursor
        .next()
        .ok_or_else(|| EngineError::MalformedStream(format!("missing orientation at {}", position)))?;

    match glyph {
        ZERO_GLYPH => Ok(0),
        ESCAPE_GLYPH => {
            let value = decode_unsigned(cursor)?;
            u32::try_from(value).map_err(|_| {
                EngineError::MalformedStream(format!("orientation {} out of range at {}", value, position))
            })
        }
        c if (CIRCLED_ONE..CIRCLED_ONE + MAX_DIRECT_INDEX).contains(&(c as u32)) => {
            Ok(c as u32 - CIRCLED_ONE + 1)
        }
        other => Err(EngineError::MalformedStream(format!(
            "invalid orientation glyph {:?} at {}",
            other, position
        ))),
    }
}
