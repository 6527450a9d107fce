//! Polygon placement codec
//!
//! Stream layout, one record after another with no separators:
//!
//! ```text
//! polygon: 'P' <primitive> <orientation> <varint rotation> <zz dx> <zz dy> <zz dz>
//! module:  'M' <varint module index>
//! ```
//!
//! All integers use the varint units from [`varint`]; orientation glyphs
//! are described in [`orientation`].

pub mod orientation;
pub mod varint;

use serde::{Deserialize, Serialize};
use std::str::Chars;

use crate::error::{EngineError, Result};
use crate::registry::SymbolRegistry;

use self::orientation::{decode_orientation, encode_orientation};
use self::varint::{decode_signed, decode_unsigned, encode_signed, encode_unsigned};

/// Leading glyph of a polygon record
pub const POLYGON_TAG: char = 'P';

/// Leading glyph of a module reference
pub const MODULE_TAG: char = 'M';

/// One placed polygon instance on the integer lattice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodedPolygon {
    pub sides: u32,
    pub orientation_index: u32,
    pub rotation_count: u32,
    pub delta: (i32, i32, i32),
}

impl EncodedPolygon {
    pub fn new(sides: u32, orientation_index: u32, rotation_count: u32, delta: (i32, i32, i32)) -> Self {
        Self {
            sides,
            orientation_index,
            rotation_count,
            delta,
        }
    }

    /// Polygon at the origin with default orientation
    pub fn at_origin(sides: u32) -> Self {
        Self::new(sides, 0, 0, (0, 0, 0))
    }
}

/// A decoded stream element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Token {
    Polygon(EncodedPolygon),
    /// Reuse of a previously emitted sub-structure
    Module { index: u64 },
}

/// Character cursor that tracks its position for error messages
pub struct Cursor<'a> {
    chars: Chars<'a>,
    position: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars(),
            position: 0,
        }
    }

    /// Characters consumed so far
    pub fn offset(&self) -> usize {
        self.position
    }

    pub fn is_empty(&self) -> bool {
        self.chars.as_str().is_empty()
    }
}

impl Iterator for Cursor<'_> {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += 1;
        Some(c)
    }
}

/// Encodes polygons and module references against a registry
pub struct PolyformEncoder<'r> {
    registry: &'r SymbolRegistry,
}

impl<'r> PolyformEncoder<'r> {
    pub fn new(registry: &'r SymbolRegistry) -> Self {
        Self { registry }
    }

    /// Append one polygon record to `out`
    pub fn encode_polygon(&self, polygon: &EncodedPolygon, out: &mut String) -> Result<()> {
        let primitive = self.registry.primitive_symbol(polygon.sides)?;
        out.push(POLYGON_TAG);
        out.push(primitive);
        encode_orientation(polygon.orientation_index, out);
        encode_unsigned(u64::from(polygon.rotation_count), out);
        let (dx, dy, dz) = polygon.delta;
        encode_signed(i64::from(dx), out);
        encode_signed(i64::from(dy), out);
        encode_signed(i64::from(dz), out);
        Ok(())
    }

    pub fn encode_polygons<'a, I>(&self, polygons: I) -> Result<String>
    where
        I: IntoIterator<Item = &'a EncodedPolygon>,
    {
        let mut out = String::new();
        for polygon in polygons {
            self.encode_polygon(polygon, &mut out)?;
        }
        Ok(out)
    }

    pub fn encode_module_reference(&self, index: u64) -> String {
        let mut out = String::new();
        push_module_reference(index, &mut out);
        out
    }

    /// Encode a mixed sequence of polygons and module references
    pub fn encode_tokens(&self, tokens: &[Token]) -> Result<String> {
        let mut out = String::new();
        for token in tokens {
            match token {
                Token::Polygon(polygon) => self.encode_polygon(polygon, &mut out)?,
                Token::Module { index } => push_module_reference(*index, &mut out),
            }
        }
        Ok(out)
    }
}

fn push_module_reference(index: u64, out: &mut String) {
    out.push(MODULE_TAG);
    encode_unsigned(index, out);
}

/// Decodes symbol streams produced by [`PolyformEncoder`]
pub struct PolyformDecoder<'r> {
    registry: &'r SymbolRegistry,
}

impl<'r> PolyformDecoder<'r> {
    pub fn new(registry: &'r SymbolRegistry) -> Self {
        Self { registry }
    }

    pub fn decode(&self, stream: &str) -> Result<Vec<Token>> {
        let mut cursor = Cursor::new(stream);
        let mut tokens = Vec::new();

        while let Some(tag) = cursor.next() {
            match tag {
                POLYGON_TAG => tokens.push(Token::Polygon(self.decode_polygon(&mut cursor)?)),
                MODULE_TAG => tokens.push(Token::Module {
                    index: decode_unsigned(&mut cursor)?,
                }),
                other => {
                    return Err(EngineError::MalformedStream(format!(
                        "unknown tag {:?} at {}",
                        other,
                        cursor.offset() - 1
                    )))
                }
            }
        }

        Ok(tokens)
    }

    /// Decode a stream that must hold only polygon records
    pub fn decode_polygons(&self, stream: &str) -> Result<Vec<EncodedPolygon>> {
        self.decode(stream)?
            .into_iter()
            .map(|token| match token {
                Token::Polygon(polygon) => Ok(polygon),
                Token::Module { index } => Err(EngineError::MalformedStream(format!(
                    "unexpected module reference {}",
                    index
                ))),
            })
            .collect()
    }

    fn decode_polygon(&self, cursor: &mut Cursor<'_>) -> Result<EncodedPolygon> {
        let position = cursor.offset();
        let primitive = cursor
            .next()
            .ok_or_else(|| EngineError::MalformedStream(format!("missing primitive at {}", position)))?;
        let sides = self.registry.primitive_sides(primitive)?;
        let orientation_index = decode_orientation(cursor)?;
        let rotation_count = narrow_unsigned(decode_unsigned(cursor)?, "rotation")?;
        let dx = narrow_signed(decode_signed(cursor)?, "dx")?;
        let dy = narrow_signed(decode_signed(cursor)?, "dy")?;
        let dz = narrow_signed(decode_signed(cursor)?, "dz")?;

        Ok(EncodedPolygon {
            sides,
            orientation_index,
            rotation_count,
            delta: (dx, dy, dz),
        })
    }
}

fn narrow_unsigned(value: u64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| EngineError::MalformedStream(format!("{} {} out of range", field, value)))
}

fn narrow_signed(value: i64, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| EngineError::MalformedStream(format!("{} {} out of range", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(registry: &SymbolRegistry, tokens: &[Token]) -> Vec<Token> {
        let encoded = PolyformEncoder::new(registry).encode_tokens(tokens).unwrap();
        PolyformDecoder::new(registry).decode(&encoded).unwrap()
    }

    #[test]
    fn test_triangle_at_origin() {
        let registry = SymbolRegistry::new();
        let triangle = EncodedPolygon::at_origin(3);

        let encoded = PolyformEncoder::new(&registry)
            .encode_polygons([&triangle])
            .unwrap();
        assert_eq!(encoded, "Pc⓿\u{E000}\u{E000}\u{E000}\u{E000}");

        let decoded = PolyformDecoder::new(&registry).decode_polygons(&encoded).unwrap();
        assert_eq!(decoded, vec![triangle]);
    }

    #[test]
    fn test_negative_delta_and_large_rotation() {
        let registry = SymbolRegistry::new();
        let polygon = EncodedPolygon::new(4, 0, 300, (-5, 130, 0));

        let encoded = PolyformEncoder::new(&registry)
            .encode_polygons([&polygon])
            .unwrap();
        // rotation and dy each need two units
        assert_eq!(encoded.chars().count(), 3 + 2 + 1 + 2 + 1);

        let decoded = PolyformDecoder::new(&registry).decode_polygons(&encoded).unwrap();
        assert_eq!(decoded[0].rotation_count, 300);
        assert_eq!(decoded[0].delta, (-5, 130, 0));
    }

    #[test]
    fn test_mixed_stream_round_trip() {
        let registry = SymbolRegistry::new();
        let tokens = vec![
            Token::Polygon(EncodedPolygon::new(20, 21, 0, (i32::MIN, i32::MAX, -1))),
            Token::Module { index: 0 },
            Token::Polygon(EncodedPolygon::new(7, 13, u32::MAX, (1, -1, 64))),
            Token::Module { index: 1 << 40 },
        ];

        assert_eq!(round_trip(&registry, &tokens), tokens);
    }

    #[test]
    fn test_every_primitive_round_trips() {
        let registry = SymbolRegistry::new();
        let tokens: Vec<Token> = registry
            .iter_primitives()
            .map(|(sides, _)| Token::Polygon(EncodedPolygon::new(sides, sides % 5, sides * 40, (-(sides as i32), 0, 9))))
            .collect();

        assert_eq!(round_trip(&registry, &tokens), tokens);
    }

    #[test]
    fn test_unsupported_sides_fail_encoding() {
        let registry = SymbolRegistry::new();
        let err = PolyformEncoder::new(&registry)
            .encode_polygons([&EncodedPolygon::at_origin(2)])
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedPolygon(2)));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let registry = SymbolRegistry::new();
        let err = PolyformDecoder::new(&registry).decode("X").unwrap_err();
        assert!(matches!(err, EngineError::MalformedStream(_)));
    }

    #[test]
    fn test_cursor_offset_through_mutable_borrow() {
        let mut cursor = Cursor::new("abc");
        let borrowed = &mut cursor;
        assert_eq!(borrowed.next(), Some('a'));
        assert_eq!(borrowed.offset(), 1);
        assert!(!borrowed.is_empty());
    }

    #[test]
    fn test_unknown_tag_reports_offset() {
        let registry = SymbolRegistry::new();
        let stream = "Pc⓿\u{E000}\u{E000}\u{E000}\u{E000}X";
        match PolyformDecoder::new(&registry).decode(stream).unwrap_err() {
            EngineError::MalformedStream(message) => assert!(message.ends_with("at 7"), "{}", message),
            other => panic!("unexpected: {}", other),
        }
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let registry = SymbolRegistry::new();
        let encoded = PolyformEncoder::new(&registry)
            .encode_polygons([&EncodedPolygon::new(5, 2, 300, (1, 2, 3))])
            .unwrap();
        let truncated: String = encoded.chars().take(5).collect();

        let err = PolyformDecoder::new(&registry).decode(&truncated).unwrap_err();
        assert!(matches!(err, EngineError::MalformedStream(_)));
    }

    #[test]
    fn test_out_of_range_delta_is_malformed() {
        let registry = SymbolRegistry::new();
        let mut stream = String::from("Pc⓿");
        encode_unsigned(0, &mut stream);
        encode_signed(i64::from(i32::MAX) + 1, &mut stream);
        encode_signed(0, &mut stream);
        encode_signed(0, &mut stream);

        let err = PolyformDecoder::new(&registry).decode(&stream).unwrap_err();
        assert!(matches!(err, EngineError::MalformedStream(_)));
    }
}
