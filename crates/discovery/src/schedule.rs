//! The fixed retry schedule.
//!
//! Attempts stay on the primary endpoint while it is most likely to come up,
//! then try the secondary and tertiary endpoints, then return to the primary
//! with the longest timeout. Each endpoint switch is preceded by a
//! reachability precheck.

use std::time::Duration;

/// Which configured endpoint an attempt targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointSlot {
    Primary,
    Secondary,
    Tertiary,
}

impl EndpointSlot {
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
            Self::Tertiary => 2,
        }
    }
}

/// One row of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPlan {
    pub attempt: usize,
    pub slot: EndpointSlot,
    pub timeout: Duration,
    /// Wait before the next attempt when this one fails. `None` on the last.
    pub backoff: Option<Duration>,
    pub precheck: bool,
}

pub const MAX_ATTEMPTS: usize = 16;

use EndpointSlot::{Primary, Secondary, Tertiary};

// (slot, timeout ms, backoff ms, precheck)
const TABLE: [(EndpointSlot, u64, u64, bool); MAX_ATTEMPTS] = [
    (Primary, 5_000, 500, false),
    (Primary, 5_000, 1_000, false),
    (Primary, 5_000, 1_500, false),
    (Primary, 7_000, 2_000, false),
    (Primary, 7_000, 2_000, false),
    (Secondary, 7_000, 2_000, true),
    (Secondary, 7_000, 2_000, false),
    (Secondary, 7_000, 2_000, false),
    (Secondary, 10_000, 1_500, false),
    (Tertiary, 10_000, 1_500, true),
    (Tertiary, 10_000, 1_500, false),
    (Tertiary, 10_000, 1_500, false),
    (Tertiary, 10_000, 1_500, false),
    (Primary, 10_000, 1_500, true),
    (Primary, 10_000, 1_500, false),
    (Primary, 10_000, 0, false),
];

/// The plan for `attempt`, or `None` past the end of the schedule.
#[must_use]
pub fn plan(attempt: usize) -> Option<AttemptPlan> {
    let (slot, timeout_ms, backoff_ms, precheck) = *TABLE.get(attempt)?;
    Some(AttemptPlan {
        attempt,
        slot,
        timeout: Duration::from_millis(timeout_ms),
        backoff: (attempt + 1 < MAX_ATTEMPTS).then(|| Duration::from_millis(backoff_ms)),
        precheck,
    })
}

/// Every attempt, in order.
pub fn schedule() -> impl Iterator<Item = AttemptPlan> {
    (0..MAX_ATTEMPTS).filter_map(plan)
}
