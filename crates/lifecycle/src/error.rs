use {podvisor_runtime::RuntimeError, thiserror::Error};

use crate::state::WorkloadState;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("container runtime is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("settings unavailable: {0}")]
    Settings(#[from] podvisor_config::Error),

    #[error("workload {name} is not running after launch")]
    WorkloadNotRunning { name: String },

    #[error("workload process exited during startup (exit code {code:?})")]
    WorkloadExited { code: Option<i32> },

    #[error("workload {name} is still present after stop")]
    StillPresent { name: String },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: WorkloadState,
        to: WorkloadState,
    },

    #[error("status query failed: {0}")]
    TransientQueryFailure(#[source] RuntimeError),
}

impl LifecycleError {
    /// Initialization failures that no retry without outside action will fix.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Runtime(RuntimeError::BinaryNotFound { .. } | RuntimeError::ImageUnavailable { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
