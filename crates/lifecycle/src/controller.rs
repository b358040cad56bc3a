//! The workload state machine.
//!
//! All lifecycle operations (`initialize`, `start`, `stop`, `restart`,
//! `shutdown`) queue on one async gate. A caller arriving while another
//! operation is in flight waits its turn and then evaluates against the state
//! that operation left behind, so a second `start()` after a successful one is
//! a no-op. The owned `run` process handle lives behind the same gate.

use std::sync::{Arc, RwLock};

use {
    podvisor_common::{EventLog, EventSource},
    podvisor_config::SettingsStore,
    podvisor_runtime::{
        ImageOutcome, LaunchSpec, ProcessHandle, RuntimeError, RuntimeGateway, Termination,
        WorkloadDescriptor, terminate_with_grace,
    },
    serde::Serialize,
    tokio::sync::{Mutex, MutexGuard, broadcast, watch},
    tracing::{debug, info, warn},
};

use crate::{
    error::{LifecycleError, Result},
    state::{Transition, WorkloadState},
    workload::{Endpoint, LifecycleTimings, WorkloadSpec},
};

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// State only touched while holding the gate.
#[derive(Default)]
struct Gated {
    handle: Option<Box<dyn ProcessHandle>>,
    initialized: bool,
}

/// Snapshot for display.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: WorkloadState,
    pub message: String,
    /// Last instance seen by a start, stop or reconciler query.
    pub workload: Option<WorkloadDescriptor>,
    /// Populated while running.
    pub endpoints: Vec<Endpoint>,
}

pub struct LifecycleController {
    gateway: RuntimeGateway,
    settings: Arc<dyn SettingsStore>,
    spec: WorkloadSpec,
    timings: LifecycleTimings,
    events: EventLog,
    state_tx: watch::Sender<WorkloadState>,
    transitions: broadcast::Sender<Transition>,
    gate: Mutex<Gated>,
    observed: RwLock<Option<WorkloadDescriptor>>,
    last_error: RwLock<Option<String>>,
}

impl LifecycleController {
    pub fn new(
        gateway: RuntimeGateway,
        settings: Arc<dyn SettingsStore>,
        spec: WorkloadSpec,
        timings: LifecycleTimings,
        events: EventLog,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkloadState::Uninitialized);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            gateway,
            settings,
            spec,
            timings,
            events,
            state_tx,
            transitions,
            gate: Mutex::new(Gated::default()),
            observed: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    // ── Observation ─────────────────────────────────────────────────────────

    pub fn state(&self) -> WorkloadState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkloadState> {
        self.state_tx.subscribe()
    }

    /// Every state change, in order.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    pub fn gateway(&self) -> &RuntimeGateway {
        &self.gateway
    }

    /// Whether a lifecycle operation currently holds the gate.
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    pub fn status(&self) -> StatusReport {
        let state = self.state();
        let workload = self.observed.read().ok().and_then(|o| o.clone());
        let message = match state {
            WorkloadState::Uninitialized => "Container runtime not initialized".to_string(),
            WorkloadState::Initializing => "Initializing container runtime".to_string(),
            WorkloadState::Stopped => "Workload is stopped".to_string(),
            WorkloadState::Starting => "Workload is starting".to_string(),
            WorkloadState::Running => "Workload is running".to_string(),
            WorkloadState::Stopping => "Workload is stopping".to_string(),
            WorkloadState::Error => match self.last_error.read().ok().and_then(|e| e.clone()) {
                Some(err) => format!("Workload error: {err}"),
                None => "Workload is in an error state".to_string(),
            },
        };
        let endpoints = if state == WorkloadState::Running {
            self.spec.endpoints("localhost")
        } else {
            Vec::new()
        };
        StatusReport {
            state,
            message,
            workload,
            endpoints,
        }
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Resolve the runtime binary, bring the runtime up and make sure the
    /// image exists. Runs once; a failed attempt may be retried.
    pub async fn initialize(&self) -> Result<()> {
        let mut gated = self.gate.lock().await;
        self.recover_interrupted(&mut gated);
        if gated.initialized {
            debug!("runtime already initialized");
            return Ok(());
        }

        self.transition(&mut gated, WorkloadState::Initializing)?;
        self.events
            .info(EventSource::Lifecycle, "Initializing container runtime");

        match self.initialize_sequence().await {
            Ok(()) => {
                gated.initialized = true;
                self.set_last_error(None);
                self.transition(&mut gated, WorkloadState::Stopped)?;
                self.events
                    .success(EventSource::Lifecycle, "Container runtime ready");
                Ok(())
            },
            Err(e) => {
                let next = if e.is_fatal() {
                    "Fix the runtime installation, then retry initialize."
                } else {
                    "Retry initialize."
                };
                self.fail(&mut gated, format!("Initialization failed: {e}. {next}"));
                Err(e)
            },
        }
    }

    async fn initialize_sequence(&self) -> Result<()> {
        let binary = self.gateway.prepare().await?;
        self.events.info(
            EventSource::Lifecycle,
            format!("Using container runtime at {}", binary.display()),
        );

        if let Some(ref machine) = self.spec.machine {
            self.events.info(
                EventSource::Lifecycle,
                format!("Preparing runtime machine {}", machine.name),
            );
        }
        self.gateway.ensure_ready(self.spec.machine.as_ref()).await?;

        let image = &self.spec.image.image;
        let message = match self.gateway.load_or_build_image(&self.spec.image).await? {
            ImageOutcome::AlreadyPresent => format!("Workload image {image} is present"),
            ImageOutcome::Loaded => format!("Loaded workload image {image} from bundle"),
            ImageOutcome::Built => format!("Built workload image {image}"),
        };
        self.events.info(EventSource::Lifecycle, message);
        Ok(())
    }

    /// Launch the workload. Returns the resulting state; a no-op if running.
    pub async fn start(&self) -> Result<WorkloadState> {
        let mut gated = self.gate.lock().await;
        self.recover_interrupted(&mut gated);
        self.start_locked(&mut gated).await
    }

    /// Stop the workload. A no-op if already stopped.
    pub async fn stop(&self) -> Result<WorkloadState> {
        let mut gated = self.gate.lock().await;
        self.recover_interrupted(&mut gated);
        self.stop_locked(&mut gated).await
    }

    /// Stop, settle, start, all under one hold of the gate. A failed stop
    /// phase does not prevent the start attempt.
    pub async fn restart(&self) -> Result<WorkloadState> {
        let mut gated = self.gate.lock().await;
        self.recover_interrupted(&mut gated);
        self.require_initialized(&gated)?;
        self.events
            .info(EventSource::Lifecycle, "Restarting workload");

        if let Err(e) = self.stop_locked(&mut gated).await {
            warn!(error = %e, "stop phase of restart failed, starting anyway");
        }
        tokio::time::sleep(self.timings.restart_settle).await;
        self.start_locked(&mut gated).await
    }

    /// Stop whatever is running and release the owned process. Used on exit.
    pub async fn shutdown(&self) -> Result<()> {
        let mut gated = self.gate.lock().await;
        self.recover_interrupted(&mut gated);
        let result = match self.state() {
            WorkloadState::Uninitialized | WorkloadState::Stopped => Ok(()),
            _ if !gated.initialized => Ok(()),
            _ => self.stop_locked(&mut gated).await.map(|_| ()),
        };
        if let Some(mut handle) = gated.handle.take()
            && let Err(e) = terminate_with_grace(handle.as_mut(), self.timings.kill_grace).await
        {
            warn!(error = %e, "failed to release workload process on shutdown");
        }
        result
    }

    async fn start_locked(&self, gated: &mut Gated) -> Result<WorkloadState> {
        self.require_initialized(gated)?;
        if self.state() == WorkloadState::Running {
            debug!("start requested while already running");
            return Ok(WorkloadState::Running);
        }

        self.transition(gated, WorkloadState::Starting)?;
        self.events.info(
            EventSource::Lifecycle,
            format!("Starting workload {}", self.spec.name),
        );

        match self.start_sequence(gated).await {
            Ok(descriptor) => {
                let id = descriptor.short_id().to_string();
                self.set_observed(Some(descriptor));
                self.set_last_error(None);
                self.transition(gated, WorkloadState::Running)?;
                self.events.success(
                    EventSource::Lifecycle,
                    format!("Workload {} is running ({id})", self.spec.name),
                );
                Ok(WorkloadState::Running)
            },
            Err(e) => {
                if let Some(mut handle) = gated.handle.take()
                    && let Err(err) =
                        terminate_with_grace(handle.as_mut(), self.timings.kill_grace).await
                {
                    warn!(error = %err, "failed to clean up workload process after failed start");
                }
                self.fail(
                    gated,
                    format!("Failed to start workload: {e}. Retry start."),
                );
                Err(e)
            },
        }
    }

    async fn start_sequence(&self, gated: &mut Gated) -> Result<WorkloadDescriptor> {
        let name = &self.spec.name;

        // A handle left over from a run that drifted to Stopped.
        if let Some(mut stale) = gated.handle.take()
            && let Err(e) = terminate_with_grace(stale.as_mut(), self.timings.kill_grace).await
        {
            warn!(error = %e, "failed to release stale workload process");
        }
        if self.gateway.remove_stale(name).await? {
            self.events
                .info(EventSource::Lifecycle, "Removed stale workload instance");
        }

        let launch = self.launch_spec()?;
        self.events
            .info(EventSource::Lifecycle, "Launching workload container");
        gated.handle = Some(self.gateway.launch(&launch).await?);

        self.events.info(
            EventSource::Lifecycle,
            format!(
                "Waiting {}s for the workload to come up",
                self.timings.launch_settle.as_secs()
            ),
        );
        tokio::time::sleep(self.timings.launch_settle).await;

        if let Some(handle) = gated.handle.as_mut()
            && !handle.is_alive()
        {
            let code = handle.wait().await.ok().flatten();
            return Err(LifecycleError::WorkloadExited { code });
        }

        self.gateway
            .query(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LifecycleError::WorkloadNotRunning { name: name.clone() })
    }

    fn launch_spec(&self) -> Result<LaunchSpec> {
        let settings = self.settings.load()?;

        let mut env = self.spec.env.clone();
        env.extend(settings.env);

        let mut secret_env = Vec::new();
        if !self.spec.credential_env.is_empty() {
            match settings.api_key {
                Some(key) => secret_env.push((self.spec.credential_env.clone(), key)),
                None => self.events.warning(
                    EventSource::Settings,
                    "No API key configured; starting without credentials",
                ),
            }
        }

        Ok(LaunchSpec {
            name: self.spec.name.clone(),
            image: self.spec.image.image.clone(),
            ports: self.spec.ports.clone(),
            env,
            secret_env,
            privileged: self.spec.privileged,
        })
    }

    async fn stop_locked(&self, gated: &mut Gated) -> Result<WorkloadState> {
        self.require_initialized(gated)?;
        if self.state() == WorkloadState::Stopped {
            debug!("stop requested while already stopped");
            return Ok(WorkloadState::Stopped);
        }

        let name = &self.spec.name;
        self.transition(gated, WorkloadState::Stopping)?;
        self.events
            .info(EventSource::Lifecycle, format!("Stopping workload {name}"));

        match self
            .gateway
            .terminate(name, self.timings.stop_grace, self.timings.stop_slack)
            .await
        {
            Ok(()) => debug!("runtime stop completed"),
            Err(e) if e.is_not_found() => debug!("no container to stop"),
            Err(e @ RuntimeError::Timeout { .. }) => self.events.warning(
                EventSource::Lifecycle,
                format!("Graceful stop did not finish ({e}); escalating"),
            ),
            Err(e) => self
                .events
                .warning(EventSource::Lifecycle, format!("Runtime stop failed: {e}")),
        }

        if let Some(mut handle) = gated.handle.take() {
            match terminate_with_grace(handle.as_mut(), self.timings.kill_grace).await {
                Ok(Termination::Killed) => self.events.warning(
                    EventSource::Lifecycle,
                    "Workload process ignored termination; killed it",
                ),
                Ok(_) => {},
                Err(e) => warn!(error = %e, "failed to terminate workload process"),
            }
        }

        match self.gateway.query(name).await {
            Ok(rows) if rows.is_empty() => {
                self.set_observed(None);
                self.set_last_error(None);
                self.transition(gated, WorkloadState::Stopped)?;
                self.events
                    .success(EventSource::Lifecycle, "Workload stopped");
                Ok(WorkloadState::Stopped)
            },
            Ok(rows) => {
                self.set_observed(rows.into_iter().next());
                self.fail(
                    gated,
                    "Workload is still present after stop. Check status, then retry stop."
                        .to_string(),
                );
                Err(LifecycleError::StillPresent { name: name.clone() })
            },
            Err(e) => {
                self.fail(
                    gated,
                    format!("Could not confirm the workload stopped: {e}. Check status, then retry stop."),
                );
                Err(e.into())
            },
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn require_initialized(&self, gated: &Gated) -> Result<()> {
        if gated.initialized {
            return Ok(());
        }
        self.events.error(
            EventSource::Lifecycle,
            "Container runtime is not initialized. Run initialize first.",
        );
        Err(LifecycleError::NotInitialized)
    }

    /// Move to `next`. Taking `Gated` proves the caller holds the gate.
    /// Moves outside the transition table are refused, leaving state as is.
    fn transition(&self, _gated: &mut Gated, next: WorkloadState) -> Result<()> {
        let from = self.state();
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            warn!(%from, to = %next, "refusing invalid state transition");
            return Err(LifecycleError::InvalidTransition { from, to: next });
        }
        info!(%from, to = %next, "workload state changed");
        self.state_tx.send_replace(next);
        let _ = self.transitions.send(Transition { from, to: next });
        Ok(())
    }

    fn fail(&self, gated: &mut Gated, message: String) {
        self.set_last_error(Some(message.clone()));
        if let Err(e) = self.transition(gated, WorkloadState::Error) {
            warn!(error = %e, "could not record failure state");
        }
        self.events.error(EventSource::Lifecycle, message);
    }

    /// A transitional state seen with the gate free means the operation that
    /// set it was dropped mid-flight. The workload is in an unknown condition.
    fn recover_interrupted(&self, gated: &mut Gated) {
        let state = self.state();
        if state.is_transitional() {
            warn!(%state, "previous lifecycle operation was interrupted");
            self.fail(
                gated,
                format!(
                    "Workload was left {state} by an interrupted operation. Check status, then retry."
                ),
            );
        }
    }

    fn set_observed(&self, descriptor: Option<WorkloadDescriptor>) {
        if let Ok(mut observed) = self.observed.write() {
            *observed = descriptor;
        }
    }

    fn set_last_error(&self, message: Option<String>) {
        if let Ok(mut last) = self.last_error.write() {
            *last = message;
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────────────

    /// Take the gate without waiting. `None` while an operation is in flight.
    pub fn try_reconcile(&self) -> Option<ReconcilePermit<'_>> {
        let mut gated = self.gate.try_lock().ok()?;
        self.recover_interrupted(&mut gated);
        Some(ReconcilePermit {
            controller: self,
            gated,
        })
    }
}

/// Exclusive, non-blocking access for one reconciler tick.
pub struct ReconcilePermit<'a> {
    controller: &'a LifecycleController,
    gated: MutexGuard<'a, Gated>,
}

impl ReconcilePermit<'_> {
    pub fn state(&self) -> WorkloadState {
        self.controller.state()
    }

    pub fn initialized(&self) -> bool {
        self.gated.initialized
    }

    /// Ask the runtime for the workload, with the gate still held.
    pub async fn query(&self) -> std::result::Result<Vec<WorkloadDescriptor>, RuntimeError> {
        self.controller
            .gateway
            .query(&self.controller.spec.name)
            .await
    }

    /// Apply the observed truth. Returns the drift correction made, if any.
    pub fn propose(mut self, observed: Option<WorkloadDescriptor>) -> Option<Transition> {
        let from = self.state();
        let present = observed.is_some();
        self.controller.set_observed(observed);

        let to = match (from, present) {
            (WorkloadState::Running, false) => WorkloadState::Stopped,
            (WorkloadState::Stopped | WorkloadState::Error, true) => WorkloadState::Running,
            _ => return None,
        };

        if to == WorkloadState::Stopped {
            let dead = self
                .gated
                .handle
                .as_mut()
                .is_some_and(|h| !h.is_alive());
            if dead {
                self.gated.handle = None;
            }
        } else {
            self.controller.set_last_error(None);
        }

        self.controller.transition(&mut self.gated, to).ok()?;
        Some(Transition { from, to })
    }
}
