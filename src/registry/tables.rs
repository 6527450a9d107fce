//! Fixed primitive and pair symbol tables
//!
//! Generated once on first use and immutable afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

/// Smallest supported polygon
pub const MIN_SIDES: u32 = 3;

/// Largest supported polygon
pub const MAX_SIDES: u32 = 20;

/// Legacy canonical ordering: side count -> primitive code point.
/// Kept stable so previously written streams keep decoding.
const PRIMITIVE_ORDER: [(u32, char); 18] = [
    (11, 'a'),
    (13, 'b'),
    (3, 'c'),
    (15, 'd'),
    (5, 'e'),
    (17, 'f'),
    (7, 'g'),
    (19, 'h'),
    (9, 'i'),
    (20, 'j'),
    (4, 'k'),
    (6, 'l'),
    (8, 'm'),
    (10, 'n'),
    (12, 'o'),
    (14, 'p'),
    (16, 'q'),
    (18, 'r'),
];

/// Pair slots: lowercase Greek, uppercase Greek, Latin-1 capitals
const PAIR_POOL: &str = concat!(
    "αβγδεζηθικλμνξοπρστυφχψω",
    "ΑΒΓΔΕΖΗΘΙΚΛΜΝΞΟΠΡΣΤΥΦΧΨΩ",
    "ÀÁÂÃÄÅÆÇÈÉÊËÌÍÎÏÐÑÒÓÔÕÖØÙÚÛÜÝÞß",
);

/// Number of pre-allocated pair slots
pub const PAIR_POOL_SIZE: usize = 79;

pub(crate) struct SymbolTables {
    pub primitive_by_sides: BTreeMap<u32, char>,
    pub sides_by_primitive: HashMap<char, u32>,
    pub pair_by_members: HashMap<(char, char), char>,
    pub members_by_pair: HashMap<char, (char, char)>,
    /// Pair slots in allocation order
    pub pair_order: Vec<((char, char), char)>,
}

/// Order a primitive pair by code point
pub(crate) fn normalize_pair(a: char, b: char) -> (char, char) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub(crate) fn tables() -> &'static SymbolTables {
    static TABLES: OnceLock<SymbolTables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn build_tables() -> SymbolTables {
    let primitive_by_sides: BTreeMap<u32, char> = PRIMITIVE_ORDER.iter().copied().collect();
    let sides_by_primitive: HashMap<char, u32> = PRIMITIVE_ORDER
        .iter()
        .map(|&(sides, symbol)| (symbol, sides))
        .collect();

    // Unordered pairs by ascending side count until the pool runs dry
    let primitives: Vec<char> = primitive_by_sides.values().copied().collect();
    let mut slots = PAIR_POOL.chars();
    let mut pair_order = Vec::with_capacity(PAIR_POOL_SIZE);
    'outer: for (i, &a) in primitives.iter().enumerate() {
        for &b in &primitives[i..] {
            match slots.next() {
                Some(slot) => pair_order.push((normalize_pair(a, b), slot)),
                None => break 'outer,
            }
        }
    }

    let pair_by_members = pair_order.iter().copied().collect();
    let members_by_pair = pair_order
        .iter()
        .map(|&(members, slot)| (slot, members))
        .collect();

    SymbolTables {
        primitive_by_sides,
        sides_by_primitive,
        pair_by_members,
        members_by_pair,
        pair_order,
    }
}

/// Render an allocation index in subscript digits
pub fn to_subscript(value: usize) -> String {
    const SUBSCRIPTS: [char; 10] = ['₀', '₁', '₂', '₃', '₄', '₅', '₆', '₇', '₈', '₉'];
    value
        .to_string()
        .chars()
        .filter_map(|digit| digit.to_digit(10))
        .map(|digit| SUBSCRIPTS[digit as usize])
        .collect()
}

/// Whether a code point is a subscript digit
pub fn is_subscript(c: char) -> bool {
    ('₀'..='₉').contains(&c)
}
