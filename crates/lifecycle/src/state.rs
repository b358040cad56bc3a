use std::fmt;

use serde::{Deserialize, Serialize};

/// Believed state of the supervised workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadState {
    Uninitialized,
    Initializing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl WorkloadState {
    pub const ALL: [Self; 7] = [
        Self::Uninitialized,
        Self::Initializing,
        Self::Stopped,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Error,
    ];

    /// The transition table. Includes the reconciler's drift corrections
    /// (`Running -> Stopped`, `Stopped | Error -> Running`).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use WorkloadState::*;

        matches!(
            (self, next),
            (Uninitialized | Error, Initializing)
                | (Initializing, Stopped | Error)
                | (Stopped | Error, Starting)
                | (Starting, Running | Error)
                | (Running | Error, Stopping)
                | (Stopping, Stopped | Error)
                | (Running, Stopped)
                | (Stopped | Error, Running)
        )
    }

    /// A controller operation is mid-flight.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Initializing | Self::Starting | Self::Stopping)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, as broadcast to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: WorkloadState,
    pub to: WorkloadState,
}
