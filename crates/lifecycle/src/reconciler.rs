//! Periodic drift correction between the believed state and the runtime.

use std::{sync::Arc, time::Duration};

use {
    podvisor_common::EventSource,
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    controller::LifecycleController,
    error::LifecycleError,
    state::{Transition, WorkloadState},
};

/// What one reconciler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A lifecycle operation held the gate; nothing was touched.
    Deferred,
    /// Runtime not initialized yet, or an operation is mid-flight.
    Skipped,
    InSync,
    Corrected(Transition),
    /// The query failed; state left unchanged.
    QueryFailed,
}

pub struct StatusReconciler {
    controller: Arc<LifecycleController>,
    interval: Duration,
}

impl StatusReconciler {
    pub fn new(controller: Arc<LifecycleController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One reconciliation pass. Never waits on the gate and never overrides
    /// an in-flight operation.
    pub async fn tick(&self) -> TickOutcome {
        let Some(permit) = self.controller.try_reconcile() else {
            debug!("lifecycle operation in flight, deferring reconcile");
            return TickOutcome::Deferred;
        };

        let state = permit.state();
        if !permit.initialized() || state.is_transitional() || state == WorkloadState::Uninitialized
        {
            return TickOutcome::Skipped;
        }

        let rows = match permit.query().await {
            Ok(rows) => rows,
            Err(e) => {
                let err = LifecycleError::TransientQueryFailure(e);
                warn!(error = %err, "reconcile query failed");
                self.controller.events().error(
                    EventSource::Reconciler,
                    format!("{err}; will retry in {}s", self.interval.as_secs()),
                );
                return TickOutcome::QueryFailed;
            },
        };

        match permit.propose(rows.into_iter().next()) {
            None => TickOutcome::InSync,
            Some(transition) => {
                self.report(transition);
                TickOutcome::Corrected(transition)
            },
        }
    }

    fn report(&self, transition: Transition) {
        let events = self.controller.events();
        let name = &self.controller.spec().name;
        match transition.to {
            WorkloadState::Stopped => {
                warn!(name = %name, "workload disappeared outside the supervisor");
                events.warning(
                    EventSource::Reconciler,
                    format!("Workload {name} stopped unexpectedly. Start it again to recover."),
                );
            },
            _ => {
                info!(name = %name, from = %transition.from, "workload found running");
                events.info(
                    EventSource::Reconciler,
                    format!("Workload {name} is running (was {})", transition.from),
                );
            },
        }
    }

    /// Tick every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(interval_secs = self.interval.as_secs(), "status reconciler started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = self.tick().await;
                        debug!(?outcome, "reconcile tick");
                    },
                }
            }
            info!("status reconciler stopped");
        })
    }
}
