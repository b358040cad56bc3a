mod config_commands;
mod runtime_commands;
mod supervisor;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "podvisor", about = "Podvisor: container workload supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/podvisor/).
    #[arg(long, global = true, env = "PODVISOR_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the workload (default when no subcommand is provided).
    Run {
        /// Initialize the runtime but leave the workload stopped.
        #[arg(long)]
        no_start: bool,
    },
    /// Show whether the workload is running.
    Status {
        /// Print the runtime's view as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Stop a workload left running by an earlier session.
    Stop,
    /// List the workload's service endpoints.
    Ports,
    /// Configuration and stored settings.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

/// Initialise tracing on stderr; stdout carries the event stream. Workload
/// output is logged under the `podvisor_workload` target.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    if let Some(ref dir) = cli.config_dir {
        podvisor_config::set_config_dir(dir.clone());
    }

    match cli.command {
        None => {
            info!(version = env!("CARGO_PKG_VERSION"), "podvisor starting");
            supervisor::run(podvisor_config::discover_and_load(), supervisor::RunOptions {
                auto_start: true,
            })
            .await
        },
        Some(Commands::Run { no_start }) => {
            info!(version = env!("CARGO_PKG_VERSION"), "podvisor starting");
            supervisor::run(podvisor_config::discover_and_load(), supervisor::RunOptions {
                auto_start: !no_start,
            })
            .await
        },
        Some(Commands::Status { json }) => {
            runtime_commands::status(&podvisor_config::discover_and_load(), json).await
        },
        Some(Commands::Stop) => runtime_commands::stop(&podvisor_config::discover_and_load()).await,
        Some(Commands::Ports) => {
            runtime_commands::ports(&podvisor_config::discover_and_load());
            Ok(())
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action),
    }
}
