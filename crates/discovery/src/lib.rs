//! Interface discovery: after the workload reports running, find which of its
//! web endpoints actually serves the interface.

pub mod discovery;
pub mod error;
pub mod probe;
pub mod schedule;

pub use {
    discovery::{
        DiscoveryAttempt, DiscoveryEvent, DiscoveryStatus, DiscoveryTimings, InterfaceDiscovery,
        InterfaceEndpoint, Verification,
    },
    error::{DiscoveryError, Result},
    probe::{EndpointProbe, HttpProbe, LoadedContent},
    schedule::{AttemptPlan, EndpointSlot, MAX_ATTEMPTS, plan, schedule},
};
