//! Lifecycle supervision for one containerized workload: the state machine,
//! its single-flight controller, and the drift reconciler.

pub mod controller;
pub mod error;
pub mod reconciler;
pub mod state;
pub mod workload;

pub use {
    controller::{LifecycleController, ReconcilePermit, StatusReport},
    error::{LifecycleError, Result},
    reconciler::{StatusReconciler, TickOutcome},
    state::{Transition, WorkloadState},
    workload::{Endpoint, LifecycleTimings, WorkloadSpec},
};
