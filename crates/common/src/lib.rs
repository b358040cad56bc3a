//! Error context helpers and the lifecycle event log shared by the podvisor
//! crates.

pub mod error;
pub mod event;

pub use {
    error::FromMessage,
    event::{EventLog, EventSource, LifecycleEvent, Severity, now_ms},
};
