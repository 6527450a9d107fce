//! Polyform Storage - symbolic compression and chunked storage for polyform assemblies
//!
//! Placed polygons are turned into compact symbol strings, persisted as
//! resumable chunked files, and recurring composite structures are promoted
//! to permanent symbols under a rate-limited policy.
//!
//! ## Pipeline
//!
//! ```text
//! EncodedPolygon ──► PolyformEncoder ──► StorageManager ──► workspace.jsonl
//!                        │                    │
//!                        └── SymbolRegistry ◄─┘ (snapshot every Nth chunk)
//! ```
//!
//! - **registry**: primitive, pair, cluster, assembly and mega symbol tables
//! - **codec**: varint/zig-zag wire format for polygon records
//! - **tree**: greedy pair folding and tier allocation pass-through
//! - **storage**: chunked JSONL save/load with embedded registry snapshots
//! - **tier3**: candidate catalog and promotion/demotion policy
//!
//! ## Catalog Layout
//!
//! ```text
//! <catalog_dir>/
//! ├── tier3_candidates.jsonl   # Append-only candidate records
//! └── tier3_promoted.jsonl     # Append-only promoted symbols and tombstones
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod storage;
pub mod tier3;
pub mod tree;

// Re-exports
pub use codec::{EncodedPolygon, PolyformDecoder, PolyformEncoder, Token};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use registry::{Allocation, RegistrySnapshot, SymbolRegistry, SymbolTier};
pub use storage::{EncodedPolygonProducer, StorageChunk, StorageManager, StorageRecord, TokenConsumer};
pub use tier3::{PromotionHook, PromotionRequest, PromotionService, RegistryBridge, Tier3Candidate, Tier3Catalog, Tier3Symbol};
pub use tree::{CompressionResult, CompressionTree};
