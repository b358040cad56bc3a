//! Configuration loading, validation, env substitution, and persisted settings.
//!
//! Config files: `podvisor.toml`, `podvisor.yaml`, or `podvisor.json`
//! Searched in `./` then `~/.config/podvisor/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod settings;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        clear_config_dir, config_dir, discover_and_load, find_config_file,
        find_or_default_config_path, load_config, save_config, save_config_to, set_config_dir,
    },
    schema::{
        DiscoveryConfig, EndpointConfig, LifecycleConfig, MachineConfig, PodvisorConfig,
        PortMapping, ReconcilerConfig, RuntimeConfig, WorkloadConfig,
    },
    settings::{API_KEY, FileSettingsStore, MemorySettingsStore, Settings, SettingsStore},
    validate::{Diagnostic, Severity, ValidationResult},
};
