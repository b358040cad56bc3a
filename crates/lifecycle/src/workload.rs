//! What the controller supervises and how long it waits.

use std::{collections::BTreeMap, time::Duration};

use {
    podvisor_config::{LifecycleConfig, PodvisorConfig, PortMapping},
    podvisor_runtime::{ImageSource, MachineSpec, default_bundle_dir, needs_machine},
    serde::Serialize,
};

/// A client-facing service address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub description: String,
}

/// The single workload: identity, image, ports and base environment.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: ImageSource,
    pub ports: Vec<PortMapping>,
    /// Base launch environment; settings overrides are layered on top.
    pub env: BTreeMap<String, String>,
    /// Variable that receives the stored credential. Empty disables it.
    pub credential_env: String,
    pub privileged: bool,
    /// Backing machine to provision, on platforms that need one.
    pub machine: Option<MachineSpec>,
}

impl WorkloadSpec {
    pub fn from_config(config: &PodvisorConfig) -> Self {
        let workload = &config.workload;
        let bundle_dir = config.runtime.bundle_dir.clone().or_else(default_bundle_dir);

        let archive = if workload.image_archive.as_os_str().is_empty() {
            None
        } else if workload.image_archive.is_absolute() {
            Some(workload.image_archive.clone())
        } else {
            bundle_dir
                .as_ref()
                .map(|dir| dir.join(&workload.image_archive))
        };

        let machine_enabled = config
            .runtime
            .machine
            .enabled
            .unwrap_or_else(|| needs_machine(std::env::consts::OS));

        Self {
            name: workload.name.clone(),
            image: ImageSource {
                image: workload.image.clone(),
                archive,
                build_context: workload.build_context.clone(),
                dockerfile: workload.dockerfile.clone(),
            },
            ports: workload.ports.clone(),
            env: workload.env.clone(),
            credential_env: workload.credential_env.clone(),
            privileged: workload.privileged,
            machine: machine_enabled.then(|| MachineSpec::from(&config.runtime.machine)),
        }
    }

    /// Client-facing endpoints, one per port mapping.
    #[must_use]
    pub fn endpoints(&self, host: &str) -> Vec<Endpoint> {
        self.ports
            .iter()
            .map(|p| Endpoint {
                name: p.name.clone(),
                url: p.endpoint(host),
                description: p.description.clone(),
            })
            .collect()
    }
}

/// Settle, grace and escalation delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub launch_settle: Duration,
    pub restart_settle: Duration,
    pub stop_grace: Duration,
    pub stop_slack: Duration,
    pub kill_grace: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self::from(&LifecycleConfig::default())
    }
}

impl From<&LifecycleConfig> for LifecycleTimings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            launch_settle: Duration::from_millis(config.launch_settle_ms),
            restart_settle: Duration::from_millis(config.restart_settle_ms),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            stop_slack: Duration::from_millis(config.stop_slack_ms),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }
}
