//! Config schema types (runtime, workload, lifecycle timings, reconciler,
//! discovery endpoints).
use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PodvisorConfig {
    pub runtime: RuntimeConfig,
    pub workload: WorkloadConfig,
    pub lifecycle: LifecycleConfig,
    pub reconciler: ReconcilerConfig,
    pub discovery: DiscoveryConfig,
}

// ── Runtime ─────────────────────────────────────────────────────────────────

/// How to find and drive the container runtime CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit path to the runtime binary. Takes precedence over everything else.
    pub binary: Option<PathBuf>,
    /// Directory holding `bundled-runtime/` and `bundled-vm/`. Defaults to the
    /// directory of the running executable.
    pub bundle_dir: Option<PathBuf>,
    /// Fall back to a `PATH` lookup when no bundled binary is found.
    pub use_path: bool,
    /// Timeout for short runtime commands (version, ps, rm, ...).
    pub command_timeout_secs: u64,
    /// Timeout for image load/build commands.
    pub image_timeout_secs: u64,
    pub machine: MachineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: None,
            bundle_dir: None,
            use_path: true,
            command_timeout_secs: 60,
            image_timeout_secs: 1800,
            machine: MachineConfig::default(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    #[must_use]
    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }
}

/// Backing machine provisioned on platforms where the runtime needs a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Force the machine step on or off. `None` picks by platform.
    pub enabled: Option<bool>,
    pub name: String,
    pub memory_mb: u32,
    pub cpus: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            name: "computer-use-demo".into(),
            memory_mb: 4096,
            cpus: 2,
        }
    }
}

// ── Workload ────────────────────────────────────────────────────────────────

/// The single supervised workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Container name; also the identity used for stale-instance cleanup.
    pub name: String,
    pub image: String,
    /// Pre-built image archive loaded with `load -i` when the image is missing.
    /// Relative paths resolve against the bundle directory.
    pub image_archive: PathBuf,
    /// Build context used when neither the image nor the archive exists.
    pub build_context: Option<PathBuf>,
    pub dockerfile: String,
    pub privileged: bool,
    /// Variable that receives the stored credential at launch.
    pub credential_env: String,
    /// Environment passed to every launch; settings overrides win.
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: "computer-use-demo".into(),
            image: "computer-use-demo:desktop".into(),
            image_archive: PathBuf::from("bundled-vm/container-image/computer-use-demo.tar"),
            build_context: None,
            dockerfile: "Dockerfile".into(),
            privileged: true,
            credential_env: "ANTHROPIC_API_KEY".into(),
            env: BTreeMap::new(),
            ports: PortMapping::defaults(),
        }
    }
}

/// A fixed host:container port mapping for one of the workload's services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub description: String,
    /// URL scheme used when presenting the endpoint; `None` for raw TCP services.
    #[serde(default)]
    pub scheme: Option<String>,
    /// Path appended to the endpoint URL.
    #[serde(default)]
    pub path: Option<String>,
}

impl PortMapping {
    fn new(
        name: &str,
        port: u16,
        description: &str,
        scheme: Option<&str>,
        path: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            host_port: port,
            container_port: port,
            description: description.into(),
            scheme: scheme.map(String::from),
            path: path.map(String::from),
        }
    }

    /// VNC, Streamlit, noVNC and the combined interface.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("vnc", 5900, "VNC server for remote desktop access", None, None),
            Self::new("streamlit", 8501, "Streamlit web interface", Some("http"), None),
            Self::new("novnc", 6080, "Web-based VNC client", Some("http"), Some("/vnc.html")),
            Self::new("combined", 8080, "Combined web interface", Some("http"), None),
        ]
    }

    /// `-p` argument value.
    #[must_use]
    pub fn publish_arg(&self) -> String {
        format!("{}:{}", self.host_port, self.container_port)
    }

    /// Client-facing address for this service.
    #[must_use]
    pub fn endpoint(&self, host: &str) -> String {
        match self.scheme {
            Some(ref scheme) => format!(
                "{scheme}://{host}:{}{}",
                self.host_port,
                self.path.as_deref().unwrap_or("")
            ),
            None => format!("{host}:{}", self.host_port),
        }
    }
}

// ── Lifecycle timings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Wait after launch before confirming the workload is present.
    pub launch_settle_ms: u64,
    /// Wait between the stop and start phases of a restart.
    pub restart_settle_ms: u64,
    /// Grace period handed to `stop -t`.
    pub stop_grace_secs: u64,
    /// Extra time allowed for the `stop` command itself beyond the grace period.
    pub stop_slack_ms: u64,
    /// Wait after signalling the owned process before killing it.
    pub kill_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            launch_settle_ms: 5_000,
            restart_settle_ms: 2_000,
            stop_grace_secs: 10,
            stop_slack_ms: 5_000,
            kill_grace_ms: 5_000,
        }
    }
}

// ── Reconciler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ── Discovery ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Candidate endpoints in priority order: primary, secondary, tertiary.
    pub endpoints: Vec<EndpointConfig>,
    /// A loaded body must exceed this many bytes to count as real content.
    pub min_content_bytes: usize,
    /// Delay between a successful load and the content check.
    pub content_check_delay_ms: u64,
    /// Delay before the first attempt of a sequence.
    pub initial_delay_ms: u64,
    /// Bound on the TCP reachability probe that precedes endpoint switches.
    pub precheck_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoints: vec![
                EndpointConfig::new("combined", "http://localhost:8080"),
                EndpointConfig::new("streamlit", "http://localhost:8501"),
                EndpointConfig::new("novnc", "http://localhost:6080"),
            ],
            min_content_bytes: 100,
            content_check_delay_ms: 1_000,
            initial_delay_ms: 0,
            precheck_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub label: String,
    pub url: String,
}

impl EndpointConfig {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}
