//! Typed operations over the runtime CLI.
//!
//! Every method is a fixed argument template issued through a
//! [`ProcessRunner`]. The gateway is stateless; errors come back with the
//! command, exit code and stderr attached.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    podvisor_config::{MachineConfig, PortMapping, RuntimeConfig},
    secrecy::Secret,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Result, RuntimeError},
    runner::{CommandResult, ProcessHandle, ProcessRunner},
};

fn to_args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

/// One row of `ps --format json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    pub state: String,
    pub status: String,
}

impl WorkloadDescriptor {
    #[must_use]
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }

    /// Short id for display.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }
}

/// Backing VM the runtime needs on some platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub memory_mb: u32,
    pub cpus: u32,
}

impl From<&MachineConfig> for MachineSpec {
    fn from(config: &MachineConfig) -> Self {
        Self {
            name: config.name.clone(),
            memory_mb: config.memory_mb,
            cpus: config.cpus,
        }
    }
}

/// Where to obtain the workload image when it is not present.
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub image: String,
    pub archive: Option<PathBuf>,
    pub build_context: Option<PathBuf>,
    pub dockerfile: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    AlreadyPresent,
    Loaded,
    Built,
}

/// Everything needed for `run`.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    /// Plain variables, passed as `-e KEY=VALUE`.
    pub env: BTreeMap<String, String>,
    /// Secret variables, passed as `-e KEY` and set on the runtime process.
    pub secret_env: Vec<(String, Secret<String>)>,
    pub privileged: bool,
}

impl LaunchSpec {
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut args = to_args(&["run", "--rm", "--name"]);
        args.push(self.name.clone());
        for port in &self.ports {
            args.push("-p".into());
            args.push(port.publish_arg());
        }
        for (key, value) in &self.env {
            if self.secret_env.iter().any(|(k, _)| k == key) {
                continue;
            }
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for (key, _) in &self.secret_env {
            args.push("-e".into());
            args.push(key.clone());
        }
        if self.privileged {
            args.push("--privileged".into());
        }
        args.push(self.image.clone());
        args
    }
}

/// Typed façade over the runtime CLI.
#[derive(Clone)]
pub struct RuntimeGateway {
    runner: Arc<dyn ProcessRunner>,
    command_timeout: Duration,
    image_timeout: Duration,
}

impl RuntimeGateway {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: &RuntimeConfig) -> Self {
        Self::with_timeouts(runner, config.command_timeout(), config.image_timeout())
    }

    pub fn with_timeouts(
        runner: Arc<dyn ProcessRunner>,
        command_timeout: Duration,
        image_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            command_timeout,
            image_timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<CommandResult> {
        self.runner.run(&args, self.command_timeout).await
    }

    /// Resolve the runtime binary.
    pub async fn prepare(&self) -> Result<PathBuf> {
        self.runner.prepare().await
    }

    pub async fn version(&self) -> Result<String> {
        let result = self.run(to_args(&["version"])).await?;
        Ok(result.stdout.trim().to_string())
    }

    /// Make sure the runtime can accept commands: provision and boot the
    /// backing machine when one is required, then check `version`.
    pub async fn ensure_ready(&self, machine: Option<&MachineSpec>) -> Result<()> {
        if let Some(machine) = machine {
            self.ensure_machine(machine).await?;
        }
        let version = self.version().await?;
        debug!(version = %version.lines().next().unwrap_or_default(), "runtime is ready");
        Ok(())
    }

    async fn ensure_machine(&self, machine: &MachineSpec) -> Result<()> {
        let listing = self
            .run(to_args(&["machine", "list", "--format", "json"]))
            .await?;
        let existing = parse_machine_list(&listing.stdout)?;
        let entry = existing.iter().find(|(name, _)| *name == machine.name);

        if entry.is_none() {
            info!(machine = %machine.name, memory_mb = machine.memory_mb, cpus = machine.cpus, "creating runtime machine");
            self.runner
                .run(
                    &[
                        "machine".to_string(),
                        "init".to_string(),
                        machine.name.clone(),
                        format!("--memory={}", machine.memory_mb),
                        format!("--cpus={}", machine.cpus),
                    ],
                    self.image_timeout,
                )
                .await?;
        }

        if entry.is_some_and(|(_, running)| *running) {
            debug!(machine = %machine.name, "runtime machine already running");
            return Ok(());
        }

        info!(machine = %machine.name, "starting runtime machine");
        match self
            .runner
            .run(
                &["machine".into(), "start".into(), machine.name.clone()],
                self.image_timeout,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { ref stderr, .. })
                if stderr.to_ascii_lowercase().contains("already running") =>
            {
                warn!(machine = %machine.name, "runtime machine was already running");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// `image exists`: exit 0 means present, exit 1 absent.
    pub async fn image_present(&self, image: &str) -> Result<bool> {
        match self
            .run(vec!["image".into(), "exists".into(), image.to_string()])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.exit_code() == Some(1) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn load_image(&self, archive: &Path) -> Result<()> {
        info!(archive = %archive.display(), "loading workload image");
        self.runner
            .run(
                &["load".into(), "-i".into(), archive.display().to_string()],
                self.image_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn build_image(&self, image: &str, dockerfile: &str, context: &Path) -> Result<()> {
        info!(image, context = %context.display(), "building workload image");
        self.runner
            .run(
                &[
                    "build".into(),
                    "-t".into(),
                    image.to_string(),
                    "-f".into(),
                    dockerfile.to_string(),
                    context.display().to_string(),
                ],
                self.image_timeout,
            )
            .await?;
        Ok(())
    }

    /// Present → done; archive on disk → load; build context on disk → build.
    pub async fn load_or_build_image(&self, source: &ImageSource) -> Result<ImageOutcome> {
        if self.image_present(&source.image).await? {
            debug!(image = %source.image, "workload image already present");
            return Ok(ImageOutcome::AlreadyPresent);
        }

        if let Some(ref archive) = source.archive
            && archive.is_file()
        {
            self.load_image(archive).await?;
            return Ok(ImageOutcome::Loaded);
        }

        if let Some(ref context) = source.build_context
            && context.is_dir()
        {
            self.build_image(&source.image, &source.dockerfile, context)
                .await?;
            return Ok(ImageOutcome::Built);
        }

        Err(RuntimeError::ImageUnavailable {
            image: source.image.clone(),
            reason: "not present, no image archive and no build context found".into(),
        })
    }

    /// Start the workload in the foreground; the returned handle owns the
    /// `run` process for as long as the workload lives.
    pub async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        info!(
            name = %spec.name,
            image = %spec.image,
            ports = spec.ports.len(),
            "launching workload"
        );
        self.runner.spawn(&spec.run_args(), &spec.secret_env).await
    }

    /// `stop <name> -t <grace>`, bounded by `grace + slack`.
    pub async fn terminate(&self, name: &str, grace: Duration, slack: Duration) -> Result<()> {
        self.runner
            .run(
                &[
                    "stop".into(),
                    name.to_string(),
                    "-t".into(),
                    grace.as_secs().to_string(),
                ],
                grace + slack,
            )
            .await?;
        Ok(())
    }

    /// `rm <name>`. Returns `false` when there was nothing to remove.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        match self.run(vec!["rm".into(), name.to_string()]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Clear out a leftover instance with this name: immediate stop, then
    /// remove. "Not found" at either step is fine.
    pub async fn remove_stale(&self, name: &str) -> Result<bool> {
        let stopped = match self
            .run(vec![
                "stop".into(),
                name.to_string(),
                "-t".into(),
                "0".into(),
            ])
            .await
        {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        let removed = self.remove(name).await?;
        if stopped || removed {
            info!(name, "removed stale workload instance");
        }
        Ok(stopped || removed)
    }

    /// Instances whose name is exactly `name`. Empty means not running.
    pub async fn query(&self, name: &str) -> Result<Vec<WorkloadDescriptor>> {
        let result = self
            .run(vec![
                "ps".into(),
                "--filter".into(),
                format!("name={name}"),
                "--format".into(),
                "json".into(),
            ])
            .await?;
        let rows = parse_ps_output(&result.stdout)?;
        Ok(rows.into_iter().filter(|d| d.has_name(name)).collect())
    }
}

// ── Output parsing ──────────────────────────────────────────────────────────

fn str_field<'a>(row: &'a Value, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|k| row.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
}

fn descriptor_from(row: &Value) -> Result<WorkloadDescriptor> {
    if !row.is_object() {
        return Err(RuntimeError::Parse(format!("expected an object, got {row}")));
    }
    let names = match row.get("Names").or_else(|| row.get("names")) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        Some(Value::String(joined)) => joined.split(',').map(|s| s.trim().to_string()).collect(),
        _ => Vec::new(),
    };
    Ok(WorkloadDescriptor {
        id: str_field(row, &["Id", "ID", "id"]).to_string(),
        names,
        image: str_field(row, &["Image", "image"]).to_string(),
        state: str_field(row, &["State", "state"]).to_string(),
        status: str_field(row, &["Status", "status"]).to_string(),
    })
}

/// Parse `ps --format json`: a JSON array (podman) or one object per line
/// (docker). Empty output and `null` mean no rows.
pub fn parse_ps_output(stdout: &str) -> Result<Vec<WorkloadDescriptor>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let rows: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| RuntimeError::Parse(format!("ps output: {e}")))?;
        return rows.iter().map(descriptor_from).collect();
    }

    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let row: Value = serde_json::from_str(line)
                .map_err(|e| RuntimeError::Parse(format!("ps output line: {e}")))?;
            descriptor_from(&row)
        })
        .collect()
}

/// Parse `machine list --format json` into `(name, running)` pairs. The
/// default machine carries a trailing `*` which is stripped.
pub fn parse_machine_list(stdout: &str) -> Result<Vec<(String, bool)>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let rows: Vec<Value> = serde_json::from_str(trimmed)
        .map_err(|e| RuntimeError::Parse(format!("machine list output: {e}")))?;
    Ok(rows
        .iter()
        .map(|row| {
            let name = str_field(row, &["Name", "name"])
                .trim_end_matches('*')
                .to_string();
            let running = row
                .get("Running")
                .or_else(|| row.get("running"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (name, running)
        })
        .collect())
}
