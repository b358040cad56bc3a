//! Integration tests for the podvisor-lifecycle crate.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    podvisor_common::{EventLog, EventSource, Severity},
    podvisor_config::{MemorySettingsStore, PodvisorConfig, Settings},
    podvisor_lifecycle::{
        LifecycleController, LifecycleError, LifecycleTimings, StatusReconciler, TickOutcome,
        Transition, WorkloadSpec, WorkloadState,
    },
    podvisor_runtime::{
        CommandResult, ProcessHandle, ProcessRunner, Result as RuntimeResult, RuntimeError,
        RuntimeGateway,
    },
    secrecy::Secret,
    tokio::{sync::broadcast, time::Instant},
    tokio_util::sync::CancellationToken,
};

const NAME: &str = "computer-use-demo";

// ── Fake runtime ─────────────────────────────────────────────────────────────

/// Shared state of the simulated runtime: whether the container is listed by
/// `ps`, whether the owned `run` process is alive, and failure knobs.
#[derive(Default)]
struct World {
    present: AtomicBool,
    alive: AtomicBool,
    missing_binary: AtomicBool,
    ps_fails: AtomicBool,
    exit_on_launch: AtomicBool,
    /// `stop <name> -t N` hangs past its deadline.
    stop_hangs: AtomicBool,
    /// The `run` process shrugs off SIGTERM.
    ignore_sigterm: AtomicBool,
    calls: Mutex<Vec<(Instant, Vec<String>)>>,
    secret_keys: Mutex<Vec<String>>,
}

impl World {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(Instant, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn count(&self, verb: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some(verb))
            .count()
    }

    fn exit(&self) {
        self.set(&self.alive, false);
        self.set(&self.present, false);
    }
}

struct FakeRunner {
    world: Arc<World>,
}

fn not_found(command: &str) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: command.to_string(),
        exit_code: Some(125),
        stderr: format!("Error: no container with name or ID \"{NAME}\" found"),
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn prepare(&self) -> RuntimeResult<PathBuf> {
        if self.world.missing_binary.load(Ordering::SeqCst) {
            return Err(RuntimeError::BinaryNotFound {
                searched: vec![PathBuf::from("/opt/podvisor/podman")],
            });
        }
        Ok(PathBuf::from("/usr/bin/podman"))
    }

    async fn run(&self, args: &[String], timeout: Duration) -> RuntimeResult<CommandResult> {
        self.world
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), args.to_vec()));
        let present = self.world.present.load(Ordering::SeqCst);

        match args.first().map(String::as_str) {
            Some("version") => Ok(CommandResult::ok("podman version 5.2.0\n")),
            Some("image") => Ok(CommandResult::ok("")),
            Some("stop") if args.get(3).map(String::as_str) == Some("0") => {
                if present {
                    self.world.exit();
                    Ok(CommandResult::ok(NAME))
                } else {
                    Err(not_found("stop"))
                }
            },
            Some("stop") => {
                if self.world.stop_hangs.load(Ordering::SeqCst) {
                    tokio::time::sleep(timeout).await;
                    return Err(RuntimeError::Timeout {
                        command: args.join(" "),
                        timeout,
                    });
                }
                if present {
                    self.world.exit();
                    Ok(CommandResult::ok(NAME))
                } else {
                    Err(not_found("stop"))
                }
            },
            Some("rm") => Err(not_found("rm")),
            Some("ps") => {
                if self.world.ps_fails.load(Ordering::SeqCst) {
                    return Err(RuntimeError::CommandFailed {
                        command: "ps".into(),
                        exit_code: Some(125),
                        stderr: "cannot connect to Podman socket".into(),
                    });
                }
                if present {
                    Ok(CommandResult::ok(format!(
                        r#"[{{"Id":"3f2a9c1d8e7b6a5f","Names":["{NAME}"],"Image":"computer-use-demo:desktop","State":"running","Status":"Up 5 seconds"}}]"#
                    )))
                } else {
                    Ok(CommandResult::ok("[]"))
                }
            },
            other => panic!("unexpected runtime command: {other:?}"),
        }
    }

    async fn spawn(
        &self,
        args: &[String],
        secret_env: &[(String, Secret<String>)],
    ) -> RuntimeResult<Box<dyn ProcessHandle>> {
        self.world
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((Instant::now(), args.to_vec()));
        self.world
            .secret_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(secret_env.iter().map(|(k, _)| k.clone()));

        if self.world.exit_on_launch.load(Ordering::SeqCst) {
            self.world.exit();
        } else {
            self.world.set(&self.world.present, true);
            self.world.set(&self.world.alive, true);
        }
        Ok(Box::new(FakeHandle {
            world: Arc::clone(&self.world),
        }))
    }
}

struct FakeHandle {
    world: Arc<World>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn is_alive(&mut self) -> bool {
        self.world.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> RuntimeResult<()> {
        if !self.world.ignore_sigterm.load(Ordering::SeqCst) {
            self.world.exit();
        }
        Ok(())
    }

    async fn kill(&mut self) -> RuntimeResult<()> {
        self.world.exit();
        Ok(())
    }

    async fn wait(&mut self) -> RuntimeResult<Option<i32>> {
        if self.world.alive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(Some(1))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn spec() -> WorkloadSpec {
    let mut config = PodvisorConfig::default();
    config.runtime.machine.enabled = Some(false);
    WorkloadSpec::from_config(&config)
}

fn controller_with(world: &Arc<World>, settings: Settings) -> Arc<LifecycleController> {
    let runner = Arc::new(FakeRunner {
        world: Arc::clone(world),
    });
    let gateway =
        RuntimeGateway::with_timeouts(runner, Duration::from_secs(60), Duration::from_secs(600));
    Arc::new(LifecycleController::new(
        gateway,
        Arc::new(MemorySettingsStore::new(settings)),
        spec(),
        LifecycleTimings::default(),
        EventLog::default(),
    ))
}

fn controller(world: &Arc<World>) -> Arc<LifecycleController> {
    controller_with(world, Settings::default())
}

fn drain(rx: &mut broadcast::Receiver<Transition>) -> Vec<Transition> {
    let mut out = Vec::new();
    while let Ok(t) = rx.try_recv() {
        out.push(t);
    }
    out
}

fn has_event(c: &LifecycleController, source: EventSource, severity: Severity, needle: &str) -> bool {
    c.events()
        .recent(1000)
        .iter()
        .any(|e| e.source == source && e.severity == severity && e.message.contains(needle))
}

fn pair(from: WorkloadState, to: WorkloadState) -> Transition {
    Transition { from, to }
}

// ── Controller ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn initialize_moves_to_stopped_once() {
    let world = World::new();
    let c = controller(&world);

    c.initialize().await.unwrap();
    assert_eq!(c.state(), WorkloadState::Stopped);

    c.initialize().await.unwrap();
    assert_eq!(world.count("version"), 1, "second initialize is a no-op");
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Success, "runtime ready"));
}

#[tokio::test(start_paused = true)]
async fn start_before_initialize_is_rejected() {
    let world = World::new();
    let c = controller(&world);

    let err = c.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotInitialized));
    assert_eq!(c.state(), WorkloadState::Uninitialized);
    assert_eq!(world.count("run"), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_binary_is_fatal_and_retryable() {
    let world = World::new();
    world.set(&world.missing_binary, true);
    let c = controller(&world);

    let err = c.initialize().await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(c.state(), WorkloadState::Error);
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Error, "retry initialize"));
    assert!(c.status().message.contains("not found"));

    world.set(&world.missing_binary, false);
    c.initialize().await.unwrap();
    assert_eq!(c.state(), WorkloadState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_launch_once() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();

    let (a, b) = tokio::join!(c.start(), c.start());
    assert_eq!(a.unwrap(), WorkloadState::Running);
    assert_eq!(b.unwrap(), WorkloadState::Running);
    assert_eq!(world.count("run"), 1);
}

#[tokio::test(start_paused = true)]
async fn start_clears_stale_instance_and_waits_to_settle() {
    let world = World::new();
    world.set(&world.present, true);
    let c = controller(&world);
    c.initialize().await.unwrap();

    let before = Instant::now();
    c.start().await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(5));

    let calls = world.calls();
    let stale = calls
        .iter()
        .position(|(_, a)| a.first().map(String::as_str) == Some("stop"))
        .unwrap();
    let launch = calls
        .iter()
        .position(|(_, a)| a.first().map(String::as_str) == Some("run"))
        .unwrap();
    assert!(stale < launch);
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Info, "stale"));
}

#[tokio::test(start_paused = true)]
async fn credential_is_passed_by_name_only() {
    let world = World::new();
    let mut settings = Settings::default();
    settings.api_key = Some(Secret::new("sk-ant-test-123".to_string()));
    let c = controller_with(&world, settings);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    let (_, run) = world
        .calls()
        .into_iter()
        .find(|(_, a)| a.first().map(String::as_str) == Some("run"))
        .unwrap();
    assert!(run.iter().all(|a| !a.contains("sk-ant")));
    assert!(run.windows(2).any(|w| w[0] == "-e" && w[1] == "ANTHROPIC_API_KEY"));
    assert!(run.iter().any(|a| a == "WIDTH=1024"));
    assert_eq!(
        *world.secret_keys.lock().unwrap(),
        vec!["ANTHROPIC_API_KEY".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn missing_credential_warns_but_starts() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    assert!(has_event(&c, EventSource::Settings, Severity::Warning, "API key"));
    assert!(world.secret_keys.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exit_during_startup_is_an_error() {
    let world = World::new();
    world.set(&world.exit_on_launch, true);
    let c = controller(&world);
    c.initialize().await.unwrap();

    let err = c.start().await.unwrap_err();
    assert!(matches!(err, LifecycleError::WorkloadExited { .. }));
    assert_eq!(c.state(), WorkloadState::Error);
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Error, "Retry start"));

    world.set(&world.exit_on_launch, false);
    assert_eq!(c.start().await.unwrap(), WorkloadState::Running);
}

#[tokio::test(start_paused = true)]
async fn stop_is_graceful_when_runtime_cooperates() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    assert_eq!(c.stop().await.unwrap(), WorkloadState::Stopped);
    let (_, stop) = world
        .calls()
        .into_iter()
        .rfind(|(_, a)| a.first().map(String::as_str) == Some("stop"))
        .unwrap();
    assert_eq!(stop, vec!["stop", NAME, "-t", "10"]);
    assert!(!has_event(&c, EventSource::Lifecycle, Severity::Warning, "killed"));

    // Stopping again is a no-op.
    let calls = world.calls().len();
    assert_eq!(c.stop().await.unwrap(), WorkloadState::Stopped);
    assert_eq!(world.calls().len(), calls);
}

#[tokio::test(start_paused = true)]
async fn stop_escalates_to_kill() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    world.set(&world.stop_hangs, true);
    world.set(&world.ignore_sigterm, true);

    let before = Instant::now();
    assert_eq!(c.stop().await.unwrap(), WorkloadState::Stopped);
    // Runtime stop deadline (10s + 5s) then the 5s kill grace.
    assert!(before.elapsed() >= Duration::from_secs(20));
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Warning, "did not finish"));
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Warning, "killed"));
}

#[tokio::test(start_paused = true)]
async fn restart_stops_settles_then_starts() {
    use WorkloadState::*;

    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();
    let mut rx = c.transitions();

    assert_eq!(c.restart().await.unwrap(), Running);

    assert_eq!(
        drain(&mut rx),
        vec![
            pair(Running, Stopping),
            pair(Stopping, Stopped),
            pair(Stopped, Starting),
            pair(Starting, Running),
        ]
    );

    let calls = world.calls();
    let stopped_at = calls
        .iter()
        .find(|(_, a)| a.first().map(String::as_str) == Some("stop") && a[3] == "10")
        .map(|(t, _)| *t)
        .unwrap();
    let relaunched_at = calls
        .iter()
        .filter(|(_, a)| a.first().map(String::as_str) == Some("run"))
        .map(|(t, _)| *t)
        .next_back()
        .unwrap();
    assert!(relaunched_at - stopped_at >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn restart_continues_after_failed_stop() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    // The container refuses to go away on the graceful path, and the status
    // query fails, so the stop phase ends in Error.
    world.set(&world.stop_hangs, true);
    world.set(&world.ps_fails, true);
    let restart = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.restart().await })
    };
    let mut state = c.subscribe();
    state
        .wait_for(|s| *s == WorkloadState::Error)
        .await
        .unwrap();
    world.set(&world.stop_hangs, false);
    world.set(&world.ps_fails, false);

    assert_eq!(restart.await.unwrap().unwrap(), WorkloadState::Running);
}

#[tokio::test(start_paused = true)]
async fn status_lists_endpoints_only_while_running() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    assert!(c.status().endpoints.is_empty());

    c.start().await.unwrap();
    let status = c.status();
    assert_eq!(status.state, WorkloadState::Running);
    assert_eq!(status.workload.as_ref().unwrap().short_id(), "3f2a9c1d8e7b");
    let urls: Vec<_> = status.endpoints.iter().map(|e| e.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "localhost:5900",
            "http://localhost:8501",
            "http://localhost:6080/vnc.html",
            "http://localhost:8080",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_running_workload() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    c.shutdown().await.unwrap();
    assert_eq!(c.state(), WorkloadState::Stopped);
    assert!(!world.alive.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn shutdown_recovers_from_abandoned_start() {
    use WorkloadState::*;

    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    let mut rx = c.transitions();

    let start = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.start().await })
    };
    // One second into the 5s launch settle.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(c.state(), Starting);
    start.abort();
    assert!(start.await.unwrap_err().is_cancelled());
    assert_eq!(c.state(), Starting);

    c.shutdown().await.unwrap();
    assert_eq!(c.state(), Stopped);
    assert!(!world.alive.load(Ordering::SeqCst));
    assert!(has_event(&c, EventSource::Lifecycle, Severity::Error, "interrupted"));
    assert_eq!(
        drain(&mut rx),
        vec![
            pair(Stopped, Starting),
            pair(Starting, Error),
            pair(Error, Stopping),
            pair(Stopping, Stopped),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn reconciler_adopts_workload_after_abandoned_start() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();

    let start = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.start().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    start.abort();
    let _ = start.await;

    assert_eq!(
        reconciler.tick().await,
        TickOutcome::Corrected(pair(WorkloadState::Error, WorkloadState::Running))
    );
    assert_eq!(c.state(), WorkloadState::Running);
    assert_eq!(c.start().await.unwrap(), WorkloadState::Running);
    assert_eq!(world.count("run"), 1);
}

#[tokio::test(start_paused = true)]
async fn every_transition_is_in_the_table() {
    let world = World::new();
    let c = controller(&world);
    let mut rx = c.transitions();
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));

    c.initialize().await.unwrap();
    c.start().await.unwrap();
    world.exit();
    reconciler.tick().await;
    c.start().await.unwrap();
    c.restart().await.unwrap();
    c.stop().await.unwrap();

    let seen = drain(&mut rx);
    assert!(!seen.is_empty());
    for t in seen {
        assert!(t.from.can_transition_to(t.to), "{} -> {}", t.from, t.to);
    }
}

// ── Reconciler ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn tick_skips_before_initialize() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));

    assert_eq!(reconciler.tick().await, TickOutcome::Skipped);
    assert_eq!(world.count("ps"), 0);
}

#[tokio::test(start_paused = true)]
async fn tick_in_sync_when_running() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    assert_eq!(reconciler.tick().await, TickOutcome::InSync);
    assert_eq!(c.state(), WorkloadState::Running);
}

#[tokio::test(start_paused = true)]
async fn external_stop_is_corrected_with_warning() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    world.exit();
    assert_eq!(
        reconciler.tick().await,
        TickOutcome::Corrected(pair(WorkloadState::Running, WorkloadState::Stopped))
    );
    assert_eq!(c.state(), WorkloadState::Stopped);
    assert!(has_event(
        &c,
        EventSource::Reconciler,
        Severity::Warning,
        "stopped unexpectedly"
    ));
    assert!(c.status().endpoints.is_empty());
}

#[tokio::test(start_paused = true)]
async fn external_start_is_adopted() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();

    world.set(&world.present, true);
    assert_eq!(
        reconciler.tick().await,
        TickOutcome::Corrected(pair(WorkloadState::Stopped, WorkloadState::Running))
    );
    assert!(has_event(&c, EventSource::Reconciler, Severity::Info, "is running"));
}

#[tokio::test(start_paused = true)]
async fn query_failure_leaves_state_alone() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    world.set(&world.ps_fails, true);
    assert_eq!(reconciler.tick().await, TickOutcome::QueryFailed);
    assert_eq!(c.state(), WorkloadState::Running);
    assert!(has_event(&c, EventSource::Reconciler, Severity::Error, "will retry"));
}

#[tokio::test(start_paused = true)]
async fn tick_defers_while_operation_in_flight() {
    let world = World::new();
    let c = controller(&world);
    let reconciler = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5));
    c.initialize().await.unwrap();

    let start = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.start().await })
    };
    c.subscribe()
        .wait_for(|s| *s == WorkloadState::Starting)
        .await
        .unwrap();

    assert!(c.is_busy());
    assert_eq!(reconciler.tick().await, TickOutcome::Deferred);
    assert_eq!(c.state(), WorkloadState::Starting);

    assert_eq!(start.await.unwrap().unwrap(), WorkloadState::Running);
}

#[tokio::test(start_paused = true)]
async fn spawned_reconciler_runs_until_cancelled() {
    let world = World::new();
    let c = controller(&world);
    c.initialize().await.unwrap();
    c.start().await.unwrap();

    let cancel = CancellationToken::new();
    let task = StatusReconciler::new(Arc::clone(&c), Duration::from_secs(5)).spawn(cancel.clone());

    world.exit();
    c.subscribe()
        .wait_for(|s| *s == WorkloadState::Stopped)
        .await
        .unwrap();

    cancel.cancel();
    task.await.unwrap();
}
