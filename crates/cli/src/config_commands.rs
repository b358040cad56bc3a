use {
    anyhow::{Context, Result, bail},
    clap::Subcommand,
};

use podvisor_config::{
    API_KEY, FileSettingsStore, PodvisorConfig, SettingsStore,
    validate::{self, Severity},
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration as TOML.
    Show,
    /// Write a default config file to the config directory.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Read a stored setting (`api_key` or an environment variable name).
    Get {
        key: String,
        /// Print the API key instead of masking it.
        #[arg(long)]
        reveal: bool,
    },
    /// Store a setting. An empty `api_key` value clears the key.
    Set { key: String, value: String },
    /// Remove a stored setting.
    Unset { key: String },
    /// Print the settings and config file locations.
    Path,
}

pub fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(verbose),
        ConfigAction::Show => show(),
        ConfigAction::Init { force } => init(force),
        ConfigAction::Get { key, reveal } => get(&key, reveal),
        ConfigAction::Set { key, value } => {
            settings()?.set(&key, &value)?;
            eprintln!("Saved {key}.");
            Ok(())
        },
        ConfigAction::Unset { key } => {
            if settings()?.unset(&key)? {
                eprintln!("Removed {key}.");
            } else {
                eprintln!("{key} was not set.");
            }
            Ok(())
        },
        ConfigAction::Path => {
            let store = settings()?;
            println!("settings: {}", store.path().display());
            match podvisor_config::find_config_file() {
                Some(path) => println!("config:   {}", path.display()),
                None => println!(
                    "config:   {} (not created)",
                    podvisor_config::find_or_default_config_path().display()
                ),
            }
            Ok(())
        },
    }
}

fn settings() -> Result<FileSettingsStore> {
    FileSettingsStore::in_config_dir().context("cannot locate the settings file")
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(7).collect();
    if secret.chars().count() <= 11 {
        "********".to_string()
    } else {
        format!("{visible}…")
    }
}

fn get(key: &str, reveal: bool) -> Result<()> {
    match settings()?.get(key)? {
        Some(value) if key == API_KEY && !reveal => println!("{}", mask(&value)),
        Some(value) => println!("{value}"),
        None => bail!("{key} is not set"),
    }
    Ok(())
}

fn show() -> Result<()> {
    let config = podvisor_config::discover_and_load();
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn init(force: bool) -> Result<()> {
    let path = podvisor_config::find_or_default_config_path();
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    podvisor_config::save_config_to(&PodvisorConfig::default(), &path)?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(verbose: bool) -> Result<()> {
    let result = validate::validate(None);

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}
