//! The long-running supervisor: wires the controller, reconciler and
//! discovery together, streams events to stdout and reads line commands from
//! stdin until `quit` or Ctrl-C.

use std::sync::Arc;

use {
    anyhow::{Context, Result},
    podvisor_common::{EventLog, LifecycleEvent, Severity},
    podvisor_config::{FileSettingsStore, PodvisorConfig, SettingsStore},
    podvisor_discovery::{DiscoveryStatus, InterfaceDiscovery},
    podvisor_lifecycle::{
        LifecycleController, LifecycleTimings, StatusReconciler, StatusReport, Transition,
        WorkloadSpec, WorkloadState,
    },
    podvisor_runtime::{CliRunner, RuntimeGateway},
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        sync::broadcast::{self, error::RecvError},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

pub struct RunOptions {
    /// Start the workload once the runtime is initialized.
    pub auto_start: bool,
}

/// A line typed on stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Restart,
    Status,
    Discover,
    Events(usize),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next()?.to_ascii_lowercase();
        let command = match verb.as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "discover" => Self::Discover,
            "events" => Self::Events(words.next().and_then(|n| n.parse().ok()).unwrap_or(20)),
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => return None,
        };
        Some(command)
    }
}

const HELP: &str = "commands: start, stop, restart, status, discover, events [n], quit";

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

fn format_event(event: &LifecycleEvent) -> String {
    let color = match event.severity {
        Severity::Info => "",
        Severity::Success => GREEN,
        Severity::Warning => YELLOW,
        Severity::Error => RED,
    };
    let reset = if color.is_empty() {
        ""
    } else {
        RESET
    };
    format!("{color}[{}] {}{reset}", event.source, event.message)
}

fn format_status(report: &StatusReport, discovery: Option<&DiscoveryStatus>) -> String {
    let mut out = format!("state: {}\n{}", report.state, report.message);
    if let Some(ref workload) = report.workload {
        out.push_str(&format!(
            "\ncontainer: {} ({})",
            workload.short_id(),
            workload.status
        ));
    }
    for endpoint in &report.endpoints {
        out.push_str(&format!("\n  {:<10} {}", endpoint.name, endpoint.url));
    }
    match discovery {
        Some(DiscoveryStatus::Ready { endpoint, .. }) => {
            out.push_str(&format!("\ninterface: {} ({})", endpoint.url, endpoint.label));
        },
        Some(DiscoveryStatus::Probing { attempt, endpoint }) => {
            out.push_str(&format!(
                "\ninterface: probing {} (attempt {})",
                endpoint.url,
                attempt + 1
            ));
        },
        Some(DiscoveryStatus::Exhausted) => out.push_str("\ninterface: not found"),
        Some(DiscoveryStatus::Idle) | None => {},
    }
    out
}

async fn print_events(mut rx: broadcast::Receiver<LifecycleEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Start discovery when the workload reaches Running; abandon it when the
/// workload leaves Running.
async fn bridge_discovery(
    mut transitions: broadcast::Receiver<Transition>,
    discovery: InterfaceDiscovery,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            transition = transitions.recv() => match transition {
                Ok(t) if t.to == WorkloadState::Running => {
                    discovery.begin();
                },
                Ok(t) if t.from == WorkloadState::Running => discovery.cancel(),
                Ok(_) => {},
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "discovery bridge lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    discovery.cancel();
}

fn spawn_operation(controller: &Arc<LifecycleController>, command: Command) {
    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        let result = match command {
            Command::Start => controller.start().await,
            Command::Stop => controller.stop().await,
            Command::Restart => controller.restart().await,
            _ => return,
        };
        // The controller has already reported the failure as an event.
        if let Err(e) = result {
            debug!(?command, error = %e, "operation failed");
        }
    });
}

pub async fn run(config: PodvisorConfig, options: RunOptions) -> Result<()> {
    let events = EventLog::default();
    let cancel = CancellationToken::new();

    let settings: Arc<dyn SettingsStore> =
        Arc::new(FileSettingsStore::in_config_dir().context("cannot locate the settings file")?);
    let runner = Arc::new(CliRunner::from_config(&config.runtime));
    let controller = Arc::new(LifecycleController::new(
        RuntimeGateway::new(runner, &config.runtime),
        settings,
        WorkloadSpec::from_config(&config),
        LifecycleTimings::from(&config.lifecycle),
        events.clone(),
    ));

    let mut tasks = vec![tokio::spawn(print_events(events.subscribe(), cancel.clone()))];

    let discovery = if config.discovery.enabled {
        let discovery = InterfaceDiscovery::from_config(&config.discovery, events.clone())
            .context("invalid discovery configuration")?;
        tasks.push(tokio::spawn(bridge_discovery(
            controller.transitions(),
            discovery.clone(),
            cancel.clone(),
        )));
        Some(discovery)
    } else {
        None
    };

    if config.reconciler.enabled {
        tasks.push(
            StatusReconciler::new(Arc::clone(&controller), config.reconciler.interval())
                .spawn(cancel.clone()),
        );
    }

    let quitting = CancellationToken::new();
    let mut boot = {
        let controller = Arc::clone(&controller);
        let quitting = quitting.clone();
        tokio::spawn(async move {
            if controller.initialize().await.is_ok()
                && options.auto_start
                && !quitting.is_cancelled()
                && let Err(e) = controller.start().await
            {
                debug!(error = %e, "initial start failed");
            }
        })
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("interrupt received, shutting down");
                break;
            },
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("stdin closed; waiting for Ctrl-C");
                        stdin_open = false;
                        continue;
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to read stdin");
                        stdin_open = false;
                        continue;
                    },
                };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Help) => println!("{HELP}"),
                    Some(Command::Status) => {
                        let discovery = discovery.as_ref().map(InterfaceDiscovery::status);
                        println!("{}", format_status(&controller.status(), discovery.as_ref()));
                    },
                    Some(Command::Events(limit)) => {
                        for event in events.recent(limit) {
                            println!("{}", format_event(&event));
                        }
                    },
                    Some(Command::Discover) => match discovery {
                        Some(ref discovery) if controller.state() == WorkloadState::Running => {
                            discovery.begin();
                        },
                        Some(_) => println!("the workload is not running"),
                        None => println!("discovery is disabled"),
                    },
                    Some(command) => spawn_operation(&controller, command),
                    None => println!("unknown command {:?}; {HELP}", line.trim()),
                }
            },
        }
    }

    // Let an in-flight initialize or start finish so shutdown sees a settled
    // state. A second Ctrl-C abandons it.
    quitting.cancel();
    if !boot.is_finished() {
        eprintln!("Waiting for startup to finish (Ctrl-C again to abandon)...");
        tokio::select! {
            _ = &mut boot => {},
            _ = tokio::signal::ctrl_c() => {
                warn!("startup abandoned");
                boot.abort();
            },
        }
    }
    if let Some(ref discovery) = discovery {
        discovery.cancel();
    }
    if let Err(e) = controller.shutdown().await {
        warn!(error = %e, "workload did not shut down cleanly");
    }
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("podvisor stopped");
    Ok(())
}
