//! Hierarchical compression tree
//!
//! Side-count sequences become primitive symbols, and adjacent primitives
//! that own a pair slot are folded left to right. The fold is greedy and
//! never backtracks. Cluster, assembly and mega symbols are allocated only
//! when a caller asks for them; the tree does no recurrence detection.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::{EngineError, Result};
use crate::registry::tables::is_subscript;
use crate::registry::{SymbolRegistry, SymbolTier};

/// Output of one compression step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionResult {
    pub symbol: String,
    pub is_new: bool,
    pub encoding: String,
    /// 1 for primitive/pair runs, 2..=4 for cluster, assembly and mega
    pub depth: usize,
}

/// One element recovered from an encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandedElement {
    Sides(u32),
    Tier {
        tier: SymbolTier,
        symbol: String,
        signature: String,
    },
}

pub struct CompressionTree<'r> {
    registry: &'r mut SymbolRegistry,
}

impl<'r> CompressionTree<'r> {
    pub fn new(registry: &'r mut SymbolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SymbolRegistry {
        &*self.registry
    }

    pub fn compress_polygon_sequence(&self, sides: &[u32]) -> Result<CompressionResult> {
        let encoding = collapse_sequence(&*self.registry, sides)?;
        Ok(CompressionResult {
            symbol: encoding.clone(),
            is_new: false,
            encoding,
            depth: 1,
        })
    }

    pub fn compress_cluster(&mut self, signature: &str, flexible: bool) -> CompressionResult {
        let allocation = self.registry.allocate_cluster(signature, flexible);
        tier_result(allocation.symbol, allocation.is_new, 2)
    }

    pub fn compress_assembly(&mut self, signature: &str) -> CompressionResult {
        let allocation = self.registry.allocate_assembly(signature);
        tier_result(allocation.symbol, allocation.is_new, 3)
    }

    pub fn compress_mega(&mut self, signature: &str) -> CompressionResult {
        let allocation = self.registry.allocate_mega(signature);
        tier_result(allocation.symbol, allocation.is_new, 4)
    }

    /// Expand an encoding into side counts and tier references
    pub fn expand(&self, encoding: &str) -> Result<Vec<ExpandedElement>> {
        expand_encoding(&*self.registry, encoding)
    }

    /// Expand an encoding that holds only primitives and pairs
    pub fn expand_to_sides(&self, encoding: &str) -> Result<Vec<u32>> {
        expand_sides(&*self.registry, encoding)
    }

    /// Compress each batch independently
    pub fn stream_encode<'a, I, S>(&'a self, batches: I) -> impl Iterator<Item = Result<String>> + 'a
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: 'a,
        S: AsRef<[u32]>,
    {
        let registry: &'a SymbolRegistry = &*self.registry;
        batches
            .into_iter()
            .map(move |batch| collapse_sequence(registry, batch.as_ref()))
    }

    /// Expand each encoding independently back to side counts
    pub fn stream_decode<'a, I, S>(&'a self, encodings: I) -> impl Iterator<Item = Result<Vec<u32>>> + 'a
    where
        I: IntoIterator<Item = S>,
        I::IntoIter: 'a,
        S: AsRef<str>,
    {
        let registry: &'a SymbolRegistry = &*self.registry;
        encodings
            .into_iter()
            .map(move |encoding| expand_sides(registry, encoding.as_ref()))
    }
}

fn tier_result(symbol: String, is_new: bool, depth: usize) -> CompressionResult {
    CompressionResult {
        encoding: symbol.clone(),
        symbol,
        is_new,
        depth,
    }
}

fn collapse_sequence(registry: &SymbolRegistry, sides: &[u32]) -> Result<String> {
    let primitives = sides
        .iter()
        .map(|&s| registry.primitive_symbol(s))
        .collect::<Result<Vec<char>>>()?;

    let mut encoding = String::with_capacity(primitives.len());
    let mut i = 0;
    while i < primitives.len() {
        let current = primitives[i];
        if let Some(&next) = primitives.get(i + 1) {
            if let Some(pair) = registry.pair_symbol(current, next) {
                encoding.push(pair);
                i += 2;
                continue;
            }
        }
        encoding.push(current);
        i += 1;
    }
    Ok(encoding)
}

fn expand_sides(registry: &SymbolRegistry, encoding: &str) -> Result<Vec<u32>> {
    let mut sides = Vec::new();
    for element in expand_encoding(registry, encoding)? {
        match element {
            ExpandedElement::Sides(s) => sides.push(s),
            ExpandedElement::Tier { symbol, .. } => {
                return Err(EngineError::UnknownSymbol(format!(
                    "{} is a tier symbol, not a primitive run",
                    symbol
                )))
            }
        }
    }
    Ok(sides)
}

fn expand_encoding(registry: &SymbolRegistry, encoding: &str) -> Result<Vec<ExpandedElement>> {
    let mut chars = encoding.chars().peekable();
    let mut elements = Vec::new();

    while let Some(c) = chars.next() {
        if SymbolTier::from_prefix(c).is_some() && chars.peek().copied().is_some_and(is_subscript) {
            let symbol = take_tier_symbol(c, &mut chars);
            let (tier, signature) = registry
                .resolve_tier_symbol(&symbol)
                .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))?;
            elements.push(ExpandedElement::Tier {
                tier,
                signature: signature.to_string(),
                symbol,
            });
        } else if let Ok(sides) = registry.primitive_sides(c) {
            elements.push(ExpandedElement::Sides(sides));
        } else if let Some((a, b)) = registry.pair_members(c) {
            elements.push(ExpandedElement::Sides(registry.primitive_sides(a)?));
            elements.push(ExpandedElement::Sides(registry.primitive_sides(b)?));
        } else {
            return Err(EngineError::UnknownSymbol(c.to_string()));
        }
    }

    Ok(elements)
}

fn take_tier_symbol(prefix: char, chars: &mut Peekable<Chars<'_>>) -> String {
    let mut symbol = String::from(prefix);
    while let Some(&digit) = chars.peek() {
        if !is_subscript(digit) {
            break;
        }
        symbol.push(digit);
        chars.next();
    }
    symbol
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_pairs_fold_greedily() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);

        let result = tree.compress_polygon_sequence(&[3, 3, 4, 4, 5]).unwrap();
        assert_eq!(result.depth, 1);
        assert!(!result.is_new);
        // (3,3) and (4,4) fold, the trailing pentagon stays primitive
        assert_eq!(result.encoding.chars().count(), 3);
        assert_eq!(result.encoding.chars().next(), Some('α'));
        assert!(result.encoding.ends_with('e'));

        assert_eq!(tree.expand_to_sides(&result.encoding).unwrap(), vec![3, 3, 4, 4, 5]);
    }

    #[test]
    fn test_folding_does_not_backtrack() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);

        // (3,4) folds first, leaving 4 alone even though (4,4) also has a slot
        let result = tree.compress_polygon_sequence(&[3, 4, 4]).unwrap();
        let pair = tree.registry().pair_symbol('c', 'k').unwrap();
        assert_eq!(result.encoding, format!("{}k", pair));
    }

    #[test]
    fn test_saturated_pairs_stay_uncollapsed() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);

        // Octagon/nonagon pairs fall beyond the pool
        let result = tree.compress_polygon_sequence(&[8, 9, 9, 10]).unwrap();
        assert_eq!(result.encoding, "miin");
        assert_eq!(tree.expand_to_sides("miin").unwrap(), vec![8, 9, 9, 10]);
    }

    #[test]
    fn test_unsupported_side_count_propagates() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);
        assert!(matches!(
            tree.compress_polygon_sequence(&[3, 42]),
            Err(EngineError::UnsupportedPolygon(42))
        ));
    }

    #[test]
    fn test_tier_pass_through_is_idempotent() {
        let mut registry = SymbolRegistry::new();
        let mut tree = CompressionTree::new(&mut registry);

        let first = tree.compress_assembly("hex-ring");
        let second = tree.compress_assembly("hex-ring");
        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.symbol, second.symbol);
        assert_eq!(first.depth, 3);
        assert_eq!(tree.compress_mega("tower").depth, 4);
        assert_eq!(tree.compress_cluster("fan", true).symbol, "Φ₁");
    }

    #[test]
    fn test_expand_distinguishes_pair_glyph_from_tier_prefix() {
        let mut registry = SymbolRegistry::new();
        let mut tree = CompressionTree::new(&mut registry);
        let cluster = tree.compress_cluster("star", false);
        assert_eq!(cluster.symbol, "Ω₁");

        let omega_pair = 'Ω';
        let (a, b) = tree.registry().pair_members(omega_pair).unwrap();
        let expected_a = tree.registry().primitive_sides(a).unwrap();
        let expected_b = tree.registry().primitive_sides(b).unwrap();

        let encoding = format!("{}Ω₁c", omega_pair);
        let expanded = tree.expand(&encoding).unwrap();
        assert_eq!(
            expanded,
            vec![
                ExpandedElement::Sides(expected_a),
                ExpandedElement::Sides(expected_b),
                ExpandedElement::Tier {
                    tier: SymbolTier::Cluster,
                    symbol: "Ω₁".into(),
                    signature: "star".into(),
                },
                ExpandedElement::Sides(3),
            ]
        );
    }

    #[test]
    fn test_unknown_tier_symbol_fails() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);
        assert!(matches!(
            tree.expand("Ψ₉"),
            Err(EngineError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_streaming_matches_batch_compression() {
        let mut registry = SymbolRegistry::new();
        let tree = CompressionTree::new(&mut registry);

        let batches = vec![vec![3, 3], vec![5, 6, 7], vec![]];
        let encoded: Vec<String> = tree
            .stream_encode(&batches)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(encoded[2], "");

        let decoded: Vec<Vec<u32>> = tree
            .stream_decode(&encoded)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(decoded, batches);
    }
}
