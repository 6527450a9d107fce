//! Tier 3 candidate promotion
//!
//! - `catalog` - candidate and promoted-symbol stores
//! - `promotion` - rate-limited promotion policy and hooks

pub mod catalog;
pub mod promotion;

pub use catalog::{
    candidate_to_symbol, CandidateStatus, DecisionEntry, DecisionKind, Tier3Candidate, Tier3Catalog,
    Tier3Symbol,
};
pub use promotion::{
    PromotionDecision, PromotionHook, PromotionRequest, PromotionService, RegistryBridge,
    TelemetryEvent,
};
