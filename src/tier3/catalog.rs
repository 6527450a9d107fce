//! Tier 3 candidate and promoted-symbol catalog
//!
//! Both stores are append-only JSONL files. A flush appends every record
//! changed since the last flush; loading replays the file and the last line
//! for an id wins. A promoted-store line with `"status":"demoted"` removes
//! that symbol on replay. [`Tier3Catalog::compact`] rewrites both files with
//! only the live state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{span_days, CatalogConfig};
use crate::error::{EngineError, Result};

/// Prefix of every Tier 3 symbol
pub const TIER3_PREFIX: char = 'Ω';

/// Hex digits of the candidate digest kept in the symbol
const SYMBOL_DIGEST_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    #[default]
    Pending,
    Eligible,
    Probation,
    Promoted,
    Demoted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Eligible => "eligible",
            CandidateStatus::Probation => "probation",
            CandidateStatus::Promoted => "promoted",
            CandidateStatus::Demoted => "demoted",
        }
    }

    /// Statuses under which a candidate owns a live symbol
    pub fn holds_symbol(&self) -> bool {
        matches!(self, CandidateStatus::Probation | CandidateStatus::Promoted)
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Promote,
    Demote,
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub decision: DecisionKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub justification: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// A composite structure awaiting a permanent symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier3Candidate {
    pub candidate_id: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub core_components: Vec<String>,
    #[serde(default)]
    pub assembly_graph: Map<String, Value>,
    #[serde(default)]
    pub raw_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub stability_score: f64,
    #[serde(default)]
    pub status: CandidateStatus,
    #[serde(default = "default_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_promoted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probation_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub promotion_log: Vec<DecisionEntry>,
}

impl Tier3Candidate {
    pub fn new(candidate_id: impl Into<String>, signature: impl Into<String>, stability_score: f64) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            signature: signature.into(),
            core_components: Vec::new(),
            assembly_graph: Map::new(),
            raw_metrics: BTreeMap::new(),
            stability_score,
            status: CandidateStatus::Pending,
            created_at: Utc::now(),
            last_promoted_at: None,
            probation_until: None,
            promotion_log: Vec::new(),
        }
    }

    pub fn register_decision(
        &mut self,
        decision: DecisionKind,
        justification: Map<String, Value>,
        notes: Option<String>,
        timestamp: DateTime<Utc>,
    ) {
        self.promotion_log.push(DecisionEntry {
            decision,
            timestamp,
            justification,
            notes: notes.filter(|n| !n.is_empty()),
        });
    }

    /// Most recent decision of this kind
    pub fn last_decision_timestamp(&self, decision: DecisionKind) -> Option<DateTime<Utc>> {
        self.promotion_log
            .iter()
            .rev()
            .find(|entry| entry.decision == decision)
            .map(|entry| entry.timestamp)
    }

    /// Decisions of this kind at or after `now - window`
    pub fn recent_decision_count(&self, decision: DecisionKind, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.promotion_log
            .iter()
            .filter(|entry| entry.decision == decision && entry.timestamp >= cutoff)
            .count()
    }

    /// Whether a probation window exists and has run out
    pub fn probation_elapsed(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.probation_until) {
            (CandidateStatus::Probation, Some(until)) => now >= until,
            _ => false,
        }
    }
}

/// A promoted Tier 3 symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier3Symbol {
    pub symbol: String,
    #[serde(default)]
    pub candidate_id: String,
    #[serde(default)]
    pub signature: String,
    pub promoted_at: DateTime<Utc>,
    #[serde(default = "default_promotion_type")]
    pub promotion_type: String,
    #[serde(default = "default_symbol_status")]
    pub status: CandidateStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_promotion_type() -> String {
    "system".to_string()
}

fn default_symbol_status() -> CandidateStatus {
    CandidateStatus::Probation
}

/// Deterministic symbol for a candidate id
pub fn candidate_to_symbol(candidate_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(candidate_id.as_bytes()));
    format!("{}{}", TIER3_PREFIX, &digest[..SYMBOL_DIGEST_LEN])
}

/// JSONL-backed store for candidates and promoted symbols
#[derive(Debug)]
pub struct Tier3Catalog {
    base_path: PathBuf,
    candidates_path: PathBuf,
    promoted_path: PathBuf,
    candidates: BTreeMap<String, Tier3Candidate>,
    promoted: BTreeMap<String, Tier3Symbol>,
    dirty_candidates: BTreeSet<String>,
    pending_promoted: Vec<Tier3Symbol>,
    flush_threshold: usize,
    mutations_since_flush: usize,
}

impl Tier3Catalog {
    /// Open (or create) a catalog directory and replay both stores
    pub fn open(base_path: impl Into<PathBuf>, config: &CatalogConfig) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        let mut catalog = Self {
            candidates_path: base_path.join(&config.candidates_file),
            promoted_path: base_path.join(&config.promoted_file),
            base_path,
            candidates: BTreeMap::new(),
            promoted: BTreeMap::new(),
            dirty_candidates: BTreeSet::new(),
            pending_promoted: Vec::new(),
            flush_threshold: config.candidate_flush_threshold.max(1),
            mutations_since_flush: 0,
        };

        for candidate in replay::<Tier3Candidate>(&catalog.candidates_path)? {
            catalog.candidates.insert(candidate.candidate_id.clone(), candidate);
        }
        for symbol in replay::<Tier3Symbol>(&catalog.promoted_path)? {
            if symbol.status == CandidateStatus::Demoted {
                catalog.promoted.remove(&symbol.symbol);
            } else {
                catalog.promoted.insert(symbol.symbol.clone(), symbol);
            }
        }

        info!(
            path = %catalog.base_path.display(),
            candidates = catalog.candidates.len(),
            promoted = catalog.promoted.len(),
            "Opened Tier 3 catalog"
        );
        Ok(catalog)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Insert or replace a candidate; flushes once enough mutations pile up
    pub fn upsert_candidate(&mut self, candidate: Tier3Candidate) -> Result<()> {
        let id = candidate.candidate_id.clone();
        self.candidates.insert(id.clone(), candidate);
        self.touch(id)
    }

    pub fn get_candidate(&self, candidate_id: &str) -> Option<&Tier3Candidate> {
        self.candidates.get(candidate_id)
    }

    /// Candidates in id order, optionally restricted to some statuses
    pub fn iter_candidates<'a>(
        &'a self,
        statuses: Option<&'a [CandidateStatus]>,
    ) -> impl Iterator<Item = &'a Tier3Candidate> + 'a {
        self.candidates
            .values()
            .filter(move |c| statuses.map_or(true, |allowed| allowed.contains(&c.status)))
    }

    pub fn iter_promoted(&self) -> impl Iterator<Item = &Tier3Symbol> {
        self.promoted.values()
    }

    pub fn get_promoted_symbol(&self, candidate_id: &str) -> Option<&Tier3Symbol> {
        self.promoted
            .values()
            .find(|symbol| symbol.candidate_id == candidate_id)
    }

    /// Move a candidate into probation and record its symbol.
    ///
    /// Policy checks belong to the caller. Both stores are flushed. A
    /// probation length that is negative or runs past the representable
    /// range is rejected before anything changes.
    pub fn promote_candidate_at(
        &mut self,
        candidate_id: &str,
        promotion_type: &str,
        probation_days: i64,
        notes: Option<String>,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Tier3Symbol> {
        let probation_until = now
            .checked_add_signed(span_days(probation_days, "probation_days")?)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "probation of {} days ends out of range",
                    probation_days
                ))
            })?;
        let candidate = self.require_candidate_mut(candidate_id)?;

        let mut justification = Map::new();
        justification.insert("stability_score".into(), Value::from(candidate.stability_score));
        justification.insert(
            "raw_metrics".into(),
            serde_json::to_value(&candidate.raw_metrics)?,
        );
        justification.insert("promotion_type".into(), Value::from(promotion_type));

        candidate.status = CandidateStatus::Probation;
        candidate.last_promoted_at = Some(now);
        candidate.probation_until = Some(probation_until);
        candidate.register_decision(DecisionKind::Promote, justification, notes, now);

        let entry = Tier3Symbol {
            symbol: candidate_to_symbol(&candidate.candidate_id),
            candidate_id: candidate.candidate_id.clone(),
            signature: candidate.signature.clone(),
            promoted_at: now,
            promotion_type: promotion_type.to_string(),
            status: CandidateStatus::Probation,
            metadata,
        };

        self.promoted.insert(entry.symbol.clone(), entry.clone());
        self.pending_promoted.push(entry.clone());
        self.dirty_candidates.insert(candidate_id.to_string());
        self.flush()?;

        info!(candidate_id, symbol = %entry.symbol, promotion_type, "Promoted Tier 3 candidate");
        Ok(entry)
    }

    /// Demote unconditionally, dropping any live symbol. Both stores are flushed.
    pub fn demote_candidate_at(
        &mut self,
        candidate_id: &str,
        notes: Option<String>,
        justification: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let candidate = self.require_candidate_mut(candidate_id)?;
        candidate.status = CandidateStatus::Demoted;
        candidate.probation_until = None;
        candidate.register_decision(DecisionKind::Demote, justification, notes, now);

        let symbols: Vec<String> = self
            .promoted
            .values()
            .filter(|s| s.candidate_id == candidate_id)
            .map(|s| s.symbol.clone())
            .collect();
        for symbol in symbols {
            if let Some(mut tombstone) = self.promoted.remove(&symbol) {
                tombstone.status = CandidateStatus::Demoted;
                self.pending_promoted.push(tombstone);
            }
        }

        self.dirty_candidates.insert(candidate_id.to_string());
        self.flush()?;

        info!(candidate_id, "Demoted Tier 3 candidate");
        Ok(())
    }

    /// Set a candidate's status directly.
    ///
    /// `probation_until` must be given exactly when the new status is
    /// probation. A candidate holding a live symbol can only move between
    /// probation and promoted; demotion goes through
    /// [`Tier3Catalog::demote_candidate_at`].
    pub fn mark_status(
        &mut self,
        candidate_id: &str,
        status: CandidateStatus,
        probation_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if (status == CandidateStatus::Probation) != probation_until.is_some() {
            return Err(EngineError::InvalidArgument(format!(
                "probation_until must be set exactly when status is probation (got {})",
                status
            )));
        }

        let live_symbol = self
            .get_promoted_symbol(candidate_id)
            .map(|s| s.symbol.clone());
        if live_symbol.is_some() && !status.holds_symbol() {
            return Err(EngineError::InvalidArgument(format!(
                "candidate {} holds a live symbol; demote it instead of marking {}",
                candidate_id, status
            )));
        }

        let candidate = self.require_candidate_mut(candidate_id)?;
        candidate.status = status;
        candidate.probation_until = probation_until;

        if let Some(symbol) = live_symbol.and_then(|s| self.promoted.get_mut(&s)) {
            symbol.status = status;
            self.pending_promoted.push(symbol.clone());
        }

        self.touch(candidate_id.to_string())
    }

    /// Append all pending records to both stores
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty_candidates.is_empty() {
            let records: Vec<&Tier3Candidate> = self
                .dirty_candidates
                .iter()
                .filter_map(|id| self.candidates.get(id))
                .collect();
            append_lines(&self.candidates_path, records)?;
            debug!(count = self.dirty_candidates.len(), "Flushed candidate records");
            self.dirty_candidates.clear();
        }
        self.mutations_since_flush = 0;

        if !self.pending_promoted.is_empty() {
            append_lines(&self.promoted_path, self.pending_promoted.iter())?;
            debug!(count = self.pending_promoted.len(), "Flushed promoted records");
            self.pending_promoted.clear();
        }
        Ok(())
    }

    /// Rewrite both stores with current state only
    pub fn compact(&mut self) -> Result<()> {
        self.dirty_candidates.clear();
        self.pending_promoted.clear();
        self.mutations_since_flush = 0;

        rewrite_lines(&self.candidates_path, self.candidates.values())?;
        rewrite_lines(&self.promoted_path, self.promoted.values())?;
        info!(
            candidates = self.candidates.len(),
            promoted = self.promoted.len(),
            "Compacted Tier 3 catalog"
        );
        Ok(())
    }

    fn touch(&mut self, candidate_id: String) -> Result<()> {
        self.dirty_candidates.insert(candidate_id);
        self.mutations_since_flush += 1;
        if self.mutations_since_flush >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    fn require_candidate_mut(&mut self, candidate_id: &str) -> Result<&mut Tier3Candidate> {
        self.candidates
            .get_mut(candidate_id)
            .ok_or_else(|| EngineError::UnknownCandidate(candidate_id.to_string()))
    }
}

fn replay<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let data = line.trim();
        if data.is_empty() {
            continue;
        }
        match serde_json::from_str(data) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = line_number + 1,
                error = %e,
                "Skipping malformed catalog line"
            ),
        }
    }
    Ok(records)
}

fn write_lines<'a, T, W>(writer: &mut W, records: impl IntoIterator<Item = &'a T>) -> Result<()>
where
    T: Serialize + 'a,
    W: Write,
{
    for record in records {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn append_lines<'a, T: Serialize + 'a>(path: &Path, records: impl IntoIterator<Item = &'a T>) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    write_lines(&mut BufWriter::new(file), records)
}

fn rewrite_lines<'a, T: Serialize + 'a>(path: &Path, records: impl IntoIterator<Item = &'a T>) -> Result<()> {
    let staging = path.with_extension("jsonl.compact");
    write_lines(&mut BufWriter::new(File::create(&staging)?), records)?;
    fs::rename(&staging, path)?;
    Ok(())
}
