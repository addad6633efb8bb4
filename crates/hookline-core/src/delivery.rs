//! Delivery badge classification.
//!
//! A badge describes how a decision reached (or failed to reach) the user.
//! It is derived from the decision and recorded in the outcome log; nothing
//! on the decision path reads it back.

use serde::{Deserialize, Serialize};

use crate::decision::{OutcomeKind, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryBadge {
    /// Fresh packet or live retrieval within budget.
    Live,
    /// Quick-path advice.
    Fallback,
    /// A candidate was suppressed.
    Blocked,
    /// Emitted over budget or from an old packet.
    Stale,
}

impl DeliveryBadge {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Fallback => "fallback",
            Self::Blocked => "blocked",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for DeliveryBadge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyInput {
    pub route: Route,
    pub outcome: OutcomeKind,
    pub latency_ms: u64,
    pub budget_ms: u64,
    /// Age of the packet the candidate came from, if any.
    pub packet_age_ms: Option<u64>,
    pub stale_after_ms: u64,
}

#[must_use]
pub fn classify(input: &ClassifyInput) -> Option<DeliveryBadge> {
    match input.outcome {
        OutcomeKind::NoAdvice => None,
        OutcomeKind::Suppressed => Some(DeliveryBadge::Blocked),
        OutcomeKind::Emitted => {
            let stale_packet = input
                .packet_age_ms
                .is_some_and(|age| age > input.stale_after_ms);
            if stale_packet || input.latency_ms > input.budget_ms {
                return Some(DeliveryBadge::Stale);
            }
            match input.route {
                Route::Packet | Route::Live => Some(DeliveryBadge::Live),
                Route::Quick => Some(DeliveryBadge::Fallback),
                Route::None => None,
            }
        }
    }
}
