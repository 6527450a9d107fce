//! Tier 3 promotion policy
//!
//! Decides which candidates earn a permanent symbol, subject to a score
//! threshold, a per-candidate cooldown and rolling promotion/demotion
//! windows. Every mutating call holds the service lock, so a promote and a
//! demote on the same candidate never interleave.
//!
//! After each decision the registered [`PromotionHook`]s are notified. Hooks
//! are best-effort: errors and panics are logged and dropped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{span_days, PromotionConfig};
use crate::error::{EngineError, Result};
use crate::registry::SymbolRegistry;
use crate::tier3::catalog::{
    CandidateStatus, DecisionKind, Tier3Candidate, Tier3Catalog, Tier3Symbol,
};

/// Event type for a successful promotion
pub const EVENT_PROMOTED: &str = "promoted";

/// Event type for a direct demotion
pub const EVENT_DEMOTED: &str = "demoted";

/// Event type for a demotion triggered by probation expiry
pub const EVENT_PROBATION_EXPIRED: &str = "probation_expired";

/// Options for a single promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub promotion_type: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Falls back to the configured default
    #[serde(default)]
    pub probation_days: Option<i64>,
}

impl PromotionRequest {
    pub fn new(promotion_type: impl Into<String>) -> Self {
        Self {
            promotion_type: promotion_type.into(),
            notes: None,
            metadata: Map::new(),
            probation_days: None,
        }
    }
}

impl Default for PromotionRequest {
    fn default() -> Self {
        Self::new("system")
    }
}

/// A promote or demote decision produced outside the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionDecision {
    pub candidate_id: String,
    pub decision: DecisionKind,
    #[serde(default)]
    pub justification: Map<String, Value>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default = "default_promotion_type")]
    pub promotion_type: String,
    #[serde(default)]
    pub event_type: Option<String>,
}

fn default_promotion_type() -> String {
    "system".to_string()
}

/// Telemetry payload recorded for every decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub candidate_id: String,
    pub signature: String,
    pub promotion_state: String,
    pub timestamp: DateTime<Utc>,
    pub stability_score: f64,
    pub raw_metrics: BTreeMap<String, f64>,
    pub status: CandidateStatus,
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_metadata: Option<Tier3Symbol>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// External collaborators notified after each decision.
///
/// Every method defaults to a no-op.
pub trait PromotionHook: Send + Sync {
    /// Forward a telemetry event
    fn emit(&self, _event: &TelemetryEvent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Requeue the candidate for simulation
    fn enqueue(&self, _candidate_id: &str, _event_type: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Drop cached registry state
    fn invalidate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Makes promoted motifs usable by the codec.
///
/// On every promotion the candidate signature is allocated as a mega
/// symbol. Registry maps never shrink, so demotion leaves it in place.
pub struct RegistryBridge {
    registry: Arc<Mutex<SymbolRegistry>>,
}

impl RegistryBridge {
    pub fn new(registry: Arc<Mutex<SymbolRegistry>>) -> Self {
        Self { registry }
    }
}

impl PromotionHook for RegistryBridge {
    fn emit(&self, event: &TelemetryEvent) -> anyhow::Result<()> {
        if event.promotion_state != EVENT_PROMOTED || event.signature.is_empty() {
            return Ok(());
        }
        let mut registry = self
            .registry
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {}", e))?;
        let allocation = registry.allocate_mega(&event.signature);
        debug!(
            candidate_id = %event.candidate_id,
            symbol = %allocation.symbol,
            is_new = allocation.is_new,
            "Bridged promoted candidate into registry"
        );
        Ok(())
    }
}

struct ServiceState {
    catalog: Tier3Catalog,
    telemetry: VecDeque<TelemetryEvent>,
}

/// Rate-limited promotion/demotion over a [`Tier3Catalog`]
pub struct PromotionService {
    state: Mutex<ServiceState>,
    config: PromotionConfig,
    telemetry_capacity: usize,
    hooks: Vec<Box<dyn PromotionHook>>,
}

impl PromotionService {
    pub fn new(catalog: Tier3Catalog, config: PromotionConfig, telemetry_buffer_size: usize) -> Self {
        let telemetry_capacity = telemetry_buffer_size.max(1);
        Self {
            state: Mutex::new(ServiceState {
                catalog,
                telemetry: VecDeque::with_capacity(telemetry_capacity),
            }),
            config,
            telemetry_capacity,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: impl PromotionHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServiceState>> {
        self.state
            .lock()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    // ------------------------------------------------------------------
    // Catalog access
    // ------------------------------------------------------------------

    pub fn upsert_candidate(&self, candidate: Tier3Candidate) -> Result<()> {
        self.lock()?.catalog.upsert_candidate(candidate)
    }

    pub fn candidate(&self, candidate_id: &str) -> Result<Option<Tier3Candidate>> {
        Ok(self.lock()?.catalog.get_candidate(candidate_id).cloned())
    }

    /// Snapshot of candidates, optionally filtered by status
    pub fn candidates(&self, statuses: Option<&[CandidateStatus]>) -> Result<Vec<Tier3Candidate>> {
        Ok(self
            .lock()?
            .catalog
            .iter_candidates(statuses)
            .cloned()
            .collect())
    }

    pub fn promoted_symbols(&self) -> Result<Vec<Tier3Symbol>> {
        Ok(self.lock()?.catalog.iter_promoted().cloned().collect())
    }

    pub fn promoted_symbol(&self, candidate_id: &str) -> Result<Option<Tier3Symbol>> {
        Ok(self.lock()?.catalog.get_promoted_symbol(candidate_id).cloned())
    }

    pub fn flush(&self) -> Result<()> {
        self.lock()?.catalog.flush()
    }

    pub fn compact(&self) -> Result<()> {
        self.lock()?.catalog.compact()
    }

    // ------------------------------------------------------------------
    // Decisions
    // ------------------------------------------------------------------

    pub fn promote(&self, candidate_id: &str, request: PromotionRequest) -> Result<Tier3Symbol> {
        self.promote_at(candidate_id, request, Utc::now())
    }

    /// Promote if every policy rule passes, otherwise `PromotionRejected`
    pub fn promote_at(
        &self,
        candidate_id: &str,
        request: PromotionRequest,
        now: DateTime<Utc>,
    ) -> Result<Tier3Symbol> {
        let spans = self.spans()?;
        let probation_days = request
            .probation_days
            .unwrap_or(self.config.default_probation_days);
        span_days(probation_days, "probation_days")?;

        let (entry, event) = {
            let mut state = self.lock()?;
            let candidate = state
                .catalog
                .get_candidate(candidate_id)
                .ok_or_else(|| EngineError::UnknownCandidate(candidate_id.to_string()))?;

            if let Err(reason) = evaluate_promotion(&self.config, &spans, candidate, now) {
                info!(candidate_id, reason = %reason, "Promotion rejected");
                return Err(EngineError::PromotionRejected {
                    candidate_id: candidate_id.to_string(),
                    reason,
                });
            }

            let entry = state.catalog.promote_candidate_at(
                candidate_id,
                &request.promotion_type,
                probation_days,
                request.notes.clone(),
                request.metadata.clone(),
                now,
            )?;

            let mut extra = Map::new();
            extra.insert("promotion_type".into(), Value::from(request.promotion_type));
            extra.insert("metadata".into(), Value::Object(request.metadata));
            let event = self.record_event(&mut state, candidate_id, EVENT_PROMOTED, request.notes, extra, now)?;
            (entry, event)
        };

        self.notify(&event);
        Ok(entry)
    }

    pub fn demote(
        &self,
        candidate_id: &str,
        justification: Map<String, Value>,
        notes: Option<String>,
    ) -> Result<()> {
        self.demote_at(candidate_id, justification, notes, EVENT_DEMOTED, Utc::now())
    }

    /// Demote unconditionally and record `event_type` in telemetry
    pub fn demote_at(
        &self,
        candidate_id: &str,
        justification: Map<String, Value>,
        notes: Option<String>,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let event = {
            let mut state = self.lock()?;
            self.demote_locked(&mut state, candidate_id, justification, notes, event_type, now)?
        };
        self.notify(&event);
        Ok(())
    }

    pub fn apply_decision(&self, decision: PromotionDecision) -> Result<Option<Tier3Symbol>> {
        self.apply_decision_at(decision, Utc::now())
    }

    /// Promotions use the justification as symbol metadata
    pub fn apply_decision_at(
        &self,
        decision: PromotionDecision,
        now: DateTime<Utc>,
    ) -> Result<Option<Tier3Symbol>> {
        match decision.decision {
            DecisionKind::Promote => {
                let request = PromotionRequest {
                    promotion_type: decision.promotion_type,
                    notes: decision.notes,
                    metadata: decision.justification,
                    probation_days: None,
                };
                self.promote_at(&decision.candidate_id, request, now).map(Some)
            }
            DecisionKind::Demote => {
                let event_type = decision.event_type.as_deref().unwrap_or(EVENT_DEMOTED);
                self.demote_at(
                    &decision.candidate_id,
                    decision.justification,
                    decision.notes,
                    event_type,
                    now,
                )?;
                Ok(None)
            }
        }
    }

    /// Demote every probation candidate whose window elapsed and that
    /// should be demoted. Returns the demoted ids.
    pub fn process_probation_expiry(&self, now: DateTime<Utc>, notes: Option<String>) -> Result<Vec<String>> {
        let spans = self.spans()?;
        let mut demoted = Vec::new();
        let mut events = Vec::new();
        {
            let mut state = self.lock()?;
            let expired: Vec<String> = state
                .catalog
                .iter_candidates(Some(&[CandidateStatus::Probation][..]))
                .filter(|c| c.probation_elapsed(now) && demotion_due(&self.config, &spans, c, now))
                .map(|c| c.candidate_id.clone())
                .collect();

            for candidate_id in expired {
                let mut justification = Map::new();
                justification.insert("reason".into(), Value::from(EVENT_PROBATION_EXPIRED));
                let event = self.demote_locked(
                    &mut state,
                    &candidate_id,
                    justification,
                    notes.clone(),
                    EVENT_PROBATION_EXPIRED,
                    now,
                )?;
                events.push(event);
                demoted.push(candidate_id);
            }
        }

        for event in &events {
            self.notify(event);
        }
        if !demoted.is_empty() {
            info!(count = demoted.len(), "Demoted candidates after probation expiry");
        }
        Ok(demoted)
    }

    // ------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------

    pub fn should_promote(&self, candidate_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let spans = self.spans()?;
        let state = self.lock()?;
        let candidate = require(&state.catalog, candidate_id)?;
        Ok(evaluate_promotion(&self.config, &spans, candidate, now).is_ok())
    }

    pub fn should_demote(&self, candidate_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let spans = self.spans()?;
        let state = self.lock()?;
        let candidate = require(&state.catalog, candidate_id)?;
        Ok(demotion_due(&self.config, &spans, candidate, now))
    }

    /// Probation elapsed, score at or under the demotion threshold, or too
    /// many recent demotions
    pub fn candidate_should_demote(&self, candidate: &Tier3Candidate, now: DateTime<Utc>) -> Result<bool> {
        Ok(demotion_due(&self.config, &self.spans()?, candidate, now))
    }

    /// Configured spans as durations. Resolved before the lock is taken so
    /// an unrepresentable setting fails without touching the catalog.
    fn spans(&self) -> Result<PolicySpans> {
        Ok(PolicySpans {
            cooldown: self.config.promotion_cooldown()?,
            promotion_window: self.config.promotion_window()?,
            demotion_window: self.config.demotion_window()?,
        })
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// Most recent telemetry events, oldest first
    pub fn recent_events(&self, limit: Option<usize>) -> Result<Vec<TelemetryEvent>> {
        let state = self.lock()?;
        let skip = limit.map_or(0, |l| state.telemetry.len().saturating_sub(l));
        Ok(state.telemetry.iter().skip(skip).cloned().collect())
    }

    fn demote_locked(
        &self,
        state: &mut ServiceState,
        candidate_id: &str,
        justification: Map<String, Value>,
        notes: Option<String>,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent> {
        state
            .catalog
            .demote_candidate_at(candidate_id, notes.clone(), justification.clone(), now)?;
        let mut extra = Map::new();
        extra.insert("justification".into(), Value::Object(justification));
        self.record_event(state, candidate_id, event_type, notes, extra, now)
    }

    fn record_event(
        &self,
        state: &mut ServiceState,
        candidate_id: &str,
        event_type: &str,
        notes: Option<String>,
        extra: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<TelemetryEvent> {
        let candidate = require(&state.catalog, candidate_id)?;
        let symbol = state.catalog.get_promoted_symbol(candidate_id).cloned();
        let event = TelemetryEvent {
            candidate_id: candidate.candidate_id.clone(),
            signature: candidate.signature.clone(),
            promotion_state: event_type.to_string(),
            timestamp: now,
            stability_score: candidate.stability_score,
            raw_metrics: candidate.raw_metrics.clone(),
            status: candidate.status,
            notes,
            symbol: symbol.as_ref().map(|s| s.symbol.clone()),
            symbol_metadata: symbol,
            extra,
        };

        state.telemetry.push_back(event.clone());
        while state.telemetry.len() > self.telemetry_capacity {
            state.telemetry.pop_front();
        }
        Ok(event)
    }

    fn notify(&self, event: &TelemetryEvent) {
        for hook in &self.hooks {
            guarded("emit", || hook.emit(event));
            guarded("enqueue", || hook.enqueue(&event.candidate_id, &event.promotion_state));
            guarded("invalidate", || hook.invalidate());
        }
    }
}

struct PolicySpans {
    cooldown: Duration,
    promotion_window: Duration,
    demotion_window: Duration,
}

fn demotion_due(
    config: &PromotionConfig,
    spans: &PolicySpans,
    candidate: &Tier3Candidate,
    now: DateTime<Utc>,
) -> bool {
    if candidate.probation_elapsed(now) {
        return true;
    }
    if candidate.stability_score <= config.demotion_threshold {
        return true;
    }
    let limit = config.demotion_window_limit;
    limit > 0
        && !spans.demotion_window.is_zero()
        && candidate.recent_decision_count(DecisionKind::Demote, spans.demotion_window, now) >= limit
}

fn evaluate_promotion(
    config: &PromotionConfig,
    spans: &PolicySpans,
    candidate: &Tier3Candidate,
    now: DateTime<Utc>,
) -> std::result::Result<(), String> {
    let score = candidate.stability_score;
    if score < config.promotion_threshold {
        return Err(format!(
            "stability score {:.3} below threshold {:.3}",
            score, config.promotion_threshold
        ));
    }

    if !spans.cooldown.is_zero() {
        if let Some(last) = candidate.last_decision_timestamp(DecisionKind::Promote) {
            let elapsed = now.signed_duration_since(last);
            if elapsed < spans.cooldown {
                let remaining = spans.cooldown.checked_sub(&elapsed).unwrap_or(spans.cooldown);
                let hours = remaining.num_minutes().max(0) as f64 / 60.0;
                return Err(format!("promotion cooldown active for another {:.1}h", hours));
            }
        }
    }

    if config.promotion_window_limit > 0 && !spans.promotion_window.is_zero() {
        let promotions = candidate.recent_decision_count(DecisionKind::Promote, spans.promotion_window, now);
        if promotions >= config.promotion_window_limit {
            return Err(format!(
                "{} promotions in last {} days exceeds limit {}",
                promotions, config.promotion_window_days, config.promotion_window_limit
            ));
        }
    }

    if config.demotion_window_limit > 0 && !spans.demotion_window.is_zero() {
        let demotions = candidate.recent_decision_count(DecisionKind::Demote, spans.demotion_window, now);
        if demotions >= config.demotion_window_limit {
            return Err(format!(
                "{} demotions in last {} days requires stability review",
                demotions, config.demotion_window_days
            ));
        }
    }

    Ok(())
}

fn require<'a>(catalog: &'a Tier3Catalog, candidate_id: &str) -> Result<&'a Tier3Candidate> {
    catalog
        .get_candidate(candidate_id)
        .ok_or_else(|| EngineError::UnknownCandidate(candidate_id.to_string()))
}

/// Run a hook call, logging and discarding any error or panic
fn guarded(hook: &str, call: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(hook, error = %e, "Promotion hook failed"),
        Err(_) => warn!(hook, "Promotion hook panicked"),
    }
}
