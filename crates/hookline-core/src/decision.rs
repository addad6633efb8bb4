//! Result types for one advisory decision.

use serde::{Deserialize, Serialize};

use crate::advice::AdviceItem;
use crate::delivery::DeliveryBadge;

/// Which path produced the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Packet,
    Live,
    Quick,
    /// No path ran or none produced a candidate.
    None,
}

impl Route {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::Live => "live",
            Self::Quick => "quick",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Cooldown,
    FallbackGuard,
}

impl SuppressionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cooldown => "cooldown",
            Self::FallbackGuard => "fallback_guard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoAdviceReason {
    Disabled,
    BudgetExhausted,
    NoCandidate,
}

impl NoAdviceReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::BudgetExhausted => "budget_exhausted",
            Self::NoCandidate => "no_candidate",
        }
    }
}

/// Coarse outcome label used in logs and the outcome record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Emitted,
    Suppressed,
    NoAdvice,
}

impl OutcomeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Emitted => "emitted",
            Self::Suppressed => "suppressed",
            Self::NoAdvice => "no_advice",
        }
    }
}

/// What the engine decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Show `item` to the assistant before the tool runs.
    Emitted {
        item: AdviceItem,
        badge: DeliveryBadge,
    },
    /// A candidate existed but was withheld.
    Suppressed {
        reason: SuppressionReason,
        badge: DeliveryBadge,
        insight_key: String,
    },
    NoAdvice { reason: NoAdviceReason },
}

/// One decision for one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub route: Route,
    /// Milliseconds from the request start to the decision.
    pub latency_ms: u64,
}

impl Decision {
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self.outcome {
            Outcome::Emitted { .. } => OutcomeKind::Emitted,
            Outcome::Suppressed { .. } => OutcomeKind::Suppressed,
            Outcome::NoAdvice { .. } => OutcomeKind::NoAdvice,
        }
    }

    #[must_use]
    pub fn is_emitted(&self) -> bool {
        matches!(self.outcome, Outcome::Emitted { .. })
    }

    #[must_use]
    pub fn emitted_item(&self) -> Option<&AdviceItem> {
        match &self.outcome {
            Outcome::Emitted { item, .. } => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn suppression_reason(&self) -> Option<SuppressionReason> {
        match self.outcome {
            Outcome::Suppressed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn no_advice_reason(&self) -> Option<NoAdviceReason> {
        match self.outcome {
            Outcome::NoAdvice { reason } => Some(reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn badge(&self) -> Option<DeliveryBadge> {
        match self.outcome {
            Outcome::Emitted { badge, .. } | Outcome::Suppressed { badge, .. } => Some(badge),
            Outcome::NoAdvice { .. } => None,
        }
    }
}
