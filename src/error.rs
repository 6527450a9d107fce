//! Error types for polyform-storage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unsupported polygon with {0} sides")]
    UnsupportedPolygon(u32),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    #[error("Unknown Tier 3 candidate: {0}")]
    UnknownCandidate(String),

    #[error("Candidate {candidate_id} does not meet promotion rules: {reason}")]
    PromotionRejected { candidate_id: String, reason: String },

    #[error("Incomplete visualization payload for symbol {symbol}: missing {missing}")]
    ValidationIncomplete { symbol: String, missing: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
