//! Advisory decision engine.
//!
//! Runs on the critical path of every tool call and decides, within the
//! caller's millisecond budget, whether to show one piece of guidance:
//!
//! ```text
//! disabled? ─► budget left? ─► packet ─┐
//!                    │                 ├─► actionability ─► cooldown/guard ─► emit
//!                    ├─► live (deadline) ┤
//!                    └─► quick ──────────┘
//! ```
//!
//! `decide` never returns an error. Source failures degrade to the quick
//! path, then to no advice. Every decision is appended to the outcome log
//! and emitted as a `tracing` event with the same fields.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::advice::{
    AdviceItem, AdviceSource, best_candidate, enforce_actionability, quick_advice, text_key,
    tool_key,
};
use crate::advisory_state::{Admission, AdvisoryStateStore, CooldownKey, WindowOutcome};
use crate::decision::{Decision, NoAdviceReason, Outcome, OutcomeKind, Route, SuppressionReason};
use crate::delivery::{ClassifyInput, DeliveryBadge, classify};
use crate::error::ConfigError;
use crate::outcome_log::{OutcomeLog, OutcomeRecord};
use crate::persist::epoch_ms_now;
use crate::retrieval::{
    AdviceRetriever, PacketSource, RetrievalContext, RetrievalPermits, RetrievalResult,
    retrieve_with_deadline,
};

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration (`[advisory]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    /// Allow the deterministic quick path.
    pub quick_fallback_enabled: bool,
    /// Below this much remaining budget live retrieval is skipped.
    pub quick_fallback_min_remaining_ms: u64,
    /// Below this much remaining budget even the quick path is skipped.
    pub quick_floor_ms: u64,
    /// Upper bound on the live retrieval wait.
    pub retrieval_timeout_ms: u64,
    /// Budget held back from live retrieval for post-processing.
    pub retrieval_reserve_ms: u64,
    /// Retrieval threads allowed alive at once, timed-out ones included.
    pub max_inflight_retrievals: usize,
    /// Put the command line first in emitted text.
    pub action_first_enabled: bool,
    /// Per-tool cooldown. Zero disables.
    pub tool_cooldown_ms: u64,
    /// Per-text dedupe cooldown. Zero disables.
    pub dedupe_cooldown_ms: u64,
    pub fallback_guard_enabled: bool,
    /// Quick advice is suppressed while the windowed fallback ratio is above
    /// this.
    pub fallback_guard_max_ratio: f64,
    pub fallback_guard_window: usize,
    /// The guard stays open until the window holds this many outcomes.
    pub fallback_guard_min_samples: usize,
    /// Packets older than this are badged stale.
    pub stale_packet_ms: u64,
    /// Bounded wait for the cross-process state lock.
    pub state_lock_timeout_ms: u64,
    pub max_cooldown_entries: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quick_fallback_enabled: true,
            quick_fallback_min_remaining_ms: 900,
            quick_floor_ms: 5,
            retrieval_timeout_ms: 2_000,
            retrieval_reserve_ms: 50,
            max_inflight_retrievals: 4,
            action_first_enabled: false,
            tool_cooldown_ms: 10_000,
            dedupe_cooldown_ms: 600_000,
            fallback_guard_enabled: true,
            fallback_guard_max_ratio: 0.55,
            fallback_guard_window: 80,
            fallback_guard_min_samples: 20,
            stale_packet_ms: 900_000,
            state_lock_timeout_ms: 25,
            max_cooldown_entries: 4_096,
        }
    }
}

impl AdvisoryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fallback_guard_max_ratio) {
            return Err(ConfigError::Invalid(format!(
                "advisory.fallback_guard_max_ratio must be within [0, 1], got {}",
                self.fallback_guard_max_ratio
            )));
        }
        if self.fallback_guard_window == 0 {
            return Err(ConfigError::Invalid(
                "advisory.fallback_guard_window must be >= 1".to_string(),
            ));
        }
        if self.fallback_guard_min_samples > self.fallback_guard_window {
            return Err(ConfigError::Invalid(format!(
                "advisory.fallback_guard_min_samples ({}) exceeds fallback_guard_window ({})",
                self.fallback_guard_min_samples, self.fallback_guard_window
            )));
        }
        if self.quick_floor_ms > self.quick_fallback_min_remaining_ms {
            return Err(ConfigError::Invalid(
                "advisory.quick_floor_ms must not exceed quick_fallback_min_remaining_ms"
                    .to_string(),
            ));
        }
        if self.max_inflight_retrievals == 0 {
            return Err(ConfigError::Invalid(
                "advisory.max_inflight_retrievals must be >= 1".to_string(),
            ));
        }
        if self.max_cooldown_entries == 0 {
            return Err(ConfigError::Invalid(
                "advisory.max_cooldown_entries must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Request
// =============================================================================

/// One tool invocation to advise on. Never persisted.
#[derive(Debug, Clone)]
pub struct AdvisoryRequest {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub trace_id: String,
    pub user_context: Option<String>,
    /// When the hook started handling this call; the budget counts from here.
    pub start_time: Instant,
    pub budget_ms: u64,
}

impl AdvisoryRequest {
    pub fn new(tool_name: impl Into<String>, trace_id: impl Into<String>, budget_ms: u64) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_input: serde_json::Value::Null,
            trace_id: trace_id.into(),
            user_context: None,
            start_time: Instant::now(),
            budget_ms,
        }
    }

    #[must_use]
    pub fn with_tool_input(mut self, tool_input: serde_json::Value) -> Self {
        self.tool_input = tool_input;
        self
    }

    #[must_use]
    pub fn with_user_context(mut self, user_context: impl Into<String>) -> Self {
        self.user_context = Some(user_context.into());
        self
    }

    #[must_use]
    pub fn with_start_time(mut self, start_time: Instant) -> Self {
        self.start_time = start_time;
        self
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Budget left; negative once overrun.
    #[must_use]
    pub fn remaining_ms(&self) -> i64 {
        ms_i64(self.budget_ms).saturating_sub(ms_i64(self.elapsed_ms()))
    }
}

/// Millisecond setting as a signed budget value, saturating at `i64::MAX`.
fn ms_i64(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

// =============================================================================
// Stats
// =============================================================================

/// Per-process decision counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub decisions: u64,
    pub emitted: u64,
    pub emitted_fallback: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_fallback_guard: u64,
    pub no_advice_disabled: u64,
    pub no_advice_budget: u64,
    pub no_advice_no_candidate: u64,
    pub retrieval_timeouts: u64,
    /// Live retrieval skipped because every permit was taken.
    pub retrieval_saturated: u64,
    pub retrieval_errors: u64,
    pub outcome_log_failures: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Candidate chosen by the source stage.
struct Candidate {
    item: AdviceItem,
    route: Route,
    packet_age_ms: Option<u64>,
}

enum SourceStage {
    Found(Candidate),
    NoAdvice(NoAdviceReason),
}

pub struct AdvisoryEngine {
    config: AdvisoryConfig,
    state: Arc<AdvisoryStateStore>,
    packets: Arc<dyn PacketSource>,
    retriever: Arc<dyn AdviceRetriever>,
    permits: RetrievalPermits,
    outcome_log: Option<OutcomeLog>,
    stats: Mutex<EngineStats>,
}

impl std::fmt::Debug for AdvisoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryEngine")
            .field("config", &self.config)
            .field("state", &self.state.path())
            .field("outcome_log", &self.outcome_log)
            .finish_non_exhaustive()
    }
}

impl AdvisoryEngine {
    pub fn new(
        config: AdvisoryConfig,
        state: Arc<AdvisoryStateStore>,
        packets: Arc<dyn PacketSource>,
        retriever: Arc<dyn AdviceRetriever>,
        outcome_log: Option<OutcomeLog>,
    ) -> Self {
        let permits = RetrievalPermits::new(config.max_inflight_retrievals);
        Self {
            config,
            state,
            packets,
            retriever,
            permits,
            outcome_log,
            stats: Mutex::new(EngineStats::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AdvisoryConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &Arc<AdvisoryStateStore> {
        &self.state
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decide whether to show advice for `req`.
    pub fn decide(&self, req: &AdvisoryRequest) -> Decision {
        let span = info_span!("advisory_decide", trace_id = %req.trace_id, tool = %req.tool_name);
        let _guard = span.enter();
        let now_ms = epoch_ms_now();

        let (route, outcome, source, packet_age_ms) = match self.select(req) {
            SourceStage::NoAdvice(reason) => {
                if reason != NoAdviceReason::Disabled {
                    self.state.record_outcome(WindowOutcome::NoAdvice, now_ms);
                }
                (Route::None, OutcomeStage::NoAdvice(reason), None, None)
            }
            SourceStage::Found(candidate) => {
                let outcome = self.admit(req, &candidate, now_ms);
                (
                    candidate.route,
                    outcome,
                    Some(candidate.item.source),
                    candidate.packet_age_ms,
                )
            }
        };

        let latency_ms = req.elapsed_ms();
        let kind = outcome.kind();
        let badge = classify(&ClassifyInput {
            route,
            outcome: kind,
            latency_ms,
            budget_ms: req.budget_ms,
            packet_age_ms,
            stale_after_ms: self.config.stale_packet_ms,
        });

        let outcome = match (outcome, badge) {
            (OutcomeStage::Emitted(item), Some(badge)) => Outcome::Emitted { item, badge },
            (OutcomeStage::Suppressed { reason, insight_key }, Some(badge)) => {
                Outcome::Suppressed {
                    reason,
                    badge,
                    insight_key,
                }
            }
            (OutcomeStage::Emitted(_), None) => Outcome::NoAdvice {
                reason: NoAdviceReason::NoCandidate,
            },
            (OutcomeStage::Suppressed { reason, insight_key }, None) => Outcome::Suppressed {
                reason,
                badge: DeliveryBadge::Blocked,
                insight_key,
            },
            (OutcomeStage::NoAdvice(reason), _) => Outcome::NoAdvice { reason },
        };

        let decision = Decision {
            outcome,
            route,
            latency_ms,
        };
        self.record(req, &decision, source, now_ms);
        decision
    }

    /// Packet, live, or quick candidate selection under the budget.
    fn select(&self, req: &AdvisoryRequest) -> SourceStage {
        if !self.config.enabled {
            return SourceStage::NoAdvice(NoAdviceReason::Disabled);
        }
        let remaining = req.remaining_ms();
        if remaining <= 0 {
            return SourceStage::NoAdvice(NoAdviceReason::BudgetExhausted);
        }

        if let Some(packet) = self.packets.lookup(&req.trace_id, &req.tool_name) {
            if let Some(item) = best_candidate(&packet.items) {
                debug!(packet_id = %packet.packet_id, "Packet candidate");
                return SourceStage::Found(Candidate {
                    item: item.clone(),
                    route: Route::Packet,
                    packet_age_ms: Some(epoch_ms_now().saturating_sub(packet.created_at_ms)),
                });
            }
        }

        if remaining < ms_i64(self.config.quick_fallback_min_remaining_ms) {
            debug!(remaining_ms = remaining, "Budget too low for live retrieval");
            return self.quick_path(req);
        }

        let wait_ms = remaining
            .saturating_sub(ms_i64(self.config.retrieval_reserve_ms))
            .clamp(0, ms_i64(self.config.retrieval_timeout_ms))
            .unsigned_abs();
        let ctx = RetrievalContext {
            trace_id: req.trace_id.clone(),
            tool_name: req.tool_name.clone(),
            tool_input: req.tool_input.clone(),
            user_context: req.user_context.clone(),
        };
        let result = retrieve_with_deadline(
            &self.retriever,
            &self.permits,
            &ctx,
            Duration::from_millis(wait_ms),
        );
        debug!(result = result.label(), wait_ms, "Live retrieval finished");

        match result {
            RetrievalResult::Ok(items) => {
                if let Some(item) = best_candidate(&items) {
                    return SourceStage::Found(Candidate {
                        item: item.clone(),
                        route: Route::Live,
                        packet_age_ms: None,
                    });
                }
            }
            RetrievalResult::Timeout => self.bump(|s| s.retrieval_timeouts += 1),
            RetrievalResult::Saturated => self.bump(|s| s.retrieval_saturated += 1),
            RetrievalResult::SourceError(reason) => {
                warn!(reason = %reason, "Live retrieval failed; falling back");
                self.bump(|s| s.retrieval_errors += 1);
            }
            RetrievalResult::Empty => {}
        }
        self.quick_path(req)
    }

    fn quick_path(&self, req: &AdvisoryRequest) -> SourceStage {
        if !self.config.quick_fallback_enabled {
            return SourceStage::NoAdvice(NoAdviceReason::NoCandidate);
        }
        if req.remaining_ms() < ms_i64(self.config.quick_floor_ms) {
            return SourceStage::NoAdvice(NoAdviceReason::BudgetExhausted);
        }
        SourceStage::Found(Candidate {
            item: quick_advice(&req.tool_name, &req.tool_input),
            route: Route::Quick,
            packet_age_ms: None,
        })
    }

    /// Actionability, then cooldown/dedupe and the fallback guard.
    fn admit(&self, req: &AdvisoryRequest, candidate: &Candidate, now_ms: u64) -> OutcomeStage {
        let item = enforce_actionability(
            &candidate.item,
            &req.tool_name,
            self.config.action_first_enabled,
        );
        let keys = [
            CooldownKey::new(tool_key(&req.tool_name), self.config.tool_cooldown_ms),
            CooldownKey::new(text_key(&candidate.item.text), self.config.dedupe_cooldown_ms),
        ];
        let is_fallback = candidate.route == Route::Quick;

        match self.state.admit(&keys, is_fallback, now_ms) {
            Admission::Admitted => OutcomeStage::Emitted(item),
            Admission::Cooldown { key, remaining_ms } => {
                debug!(key = %key, remaining_ms, "Cooldown active");
                OutcomeStage::Suppressed {
                    reason: SuppressionReason::Cooldown,
                    insight_key: item.insight_key,
                }
            }
            Admission::FallbackGuard { ratio } => {
                debug!(ratio, "Fallback guard engaged");
                OutcomeStage::Suppressed {
                    reason: SuppressionReason::FallbackGuard,
                    insight_key: item.insight_key,
                }
            }
        }
    }

    fn record(
        &self,
        req: &AdvisoryRequest,
        decision: &Decision,
        source: Option<AdviceSource>,
        now_ms: u64,
    ) {
        let insight_key = match &decision.outcome {
            Outcome::Emitted { item, .. } => Some(item.insight_key.clone()),
            Outcome::Suppressed { insight_key, .. } => Some(insight_key.clone()),
            Outcome::NoAdvice { .. } => None,
        };
        let record = OutcomeRecord {
            ts_ms: now_ms,
            trace_id: req.trace_id.clone(),
            tool: req.tool_name.clone(),
            route: decision.route,
            outcome: decision.kind(),
            badge: decision.badge(),
            latency_ms: decision.latency_ms,
            budget_ms: req.budget_ms,
            suppression_reason: decision.suppression_reason(),
            no_advice_reason: decision.no_advice_reason(),
            insight_key,
            source,
        };

        info!(
            route = record.route.as_str(),
            outcome = record.outcome.as_str(),
            badge = record.badge.map(DeliveryBadge::as_str),
            latency_ms = record.latency_ms,
            budget_ms = record.budget_ms,
            suppression_reason = record.suppression_reason.map(SuppressionReason::as_str),
            no_advice_reason = record.no_advice_reason.map(NoAdviceReason::as_str),
            insight_key = record.insight_key.as_deref(),
            "Advisory decision"
        );

        let log_failed = match &self.outcome_log {
            Some(log) => match log.append(&record) {
                Ok(()) => false,
                Err(err) => {
                    warn!(error = %err, "Failed to append advisory outcome");
                    true
                }
            },
            None => false,
        };

        self.bump(|s| {
            s.decisions += 1;
            match &decision.outcome {
                Outcome::Emitted { .. } => {
                    s.emitted += 1;
                    if decision.route == Route::Quick {
                        s.emitted_fallback += 1;
                    }
                }
                Outcome::Suppressed {
                    reason: SuppressionReason::Cooldown,
                    ..
                } => s.suppressed_cooldown += 1,
                Outcome::Suppressed {
                    reason: SuppressionReason::FallbackGuard,
                    ..
                } => s.suppressed_fallback_guard += 1,
                Outcome::NoAdvice { reason } => match reason {
                    NoAdviceReason::Disabled => s.no_advice_disabled += 1,
                    NoAdviceReason::BudgetExhausted => s.no_advice_budget += 1,
                    NoAdviceReason::NoCandidate => s.no_advice_no_candidate += 1,
                },
            }
            if log_failed {
                s.outcome_log_failures += 1;
            }
        });
    }

    fn bump(&self, f: impl FnOnce(&mut EngineStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }
}

/// Outcome before the badge is attached.
enum OutcomeStage {
    Emitted(AdviceItem),
    Suppressed {
        reason: SuppressionReason,
        insight_key: String,
    },
    NoAdvice(NoAdviceReason),
}

impl OutcomeStage {
    fn kind(&self) -> OutcomeKind {
        match self {
            Self::Emitted(_) => OutcomeKind::Emitted,
            Self::Suppressed { .. } => OutcomeKind::Suppressed,
            Self::NoAdvice(_) => OutcomeKind::NoAdvice,
        }
    }
}
