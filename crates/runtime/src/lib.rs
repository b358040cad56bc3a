//! Container runtime access: binary resolution, the process runner seam, and
//! the typed gateway that owns the runtime's command vocabulary.

pub mod error;
pub mod gateway;
pub mod platform;
pub mod runner;

pub use {
    error::{Result, RuntimeError},
    gateway::{
        ImageOutcome, ImageSource, LaunchSpec, MachineSpec, RuntimeGateway, WorkloadDescriptor,
        parse_machine_list, parse_ps_output,
    },
    platform::{BinaryLocator, RUNTIME_BIN_ENV, default_bundle_dir, needs_machine},
    runner::{
        ChildHandle, CliRunner, CommandResult, ProcessHandle, ProcessRunner, Termination,
        terminate_with_grace,
    },
};
