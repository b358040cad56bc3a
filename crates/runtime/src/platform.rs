//! Locating the container runtime binary for the current platform.
//!
//! Search order:
//! 1. Explicit path from config
//! 2. `PODVISOR_RUNTIME_BIN` environment variable
//! 3. Bundled binary: `<bundle>/bundled-runtime/podman/<os>/<arch>/bin/podman[.exe]`
//! 4. `PATH` lookup (when enabled)

use std::path::{Path, PathBuf};

use {
    podvisor_config::RuntimeConfig,
    tracing::{debug, warn},
};

use crate::error::{Result, RuntimeError};

pub const RUNTIME_BIN_ENV: &str = "PODVISOR_RUNTIME_BIN";

const PROGRAM: &str = "podman";

/// Bundle subdirectory for an OS/arch pair, as named by `std::env::consts`.
#[must_use]
pub fn bundle_subdir(os: &str, arch: &str) -> &'static str {
    let arm = arch == "aarch64";
    match os {
        "macos" if arm => "mac/arm64",
        "macos" => "mac/x64",
        "windows" => "windows/x64",
        _ if arm => "linux/arm64",
        _ => "linux/x64",
    }
}

#[must_use]
pub fn binary_file_name(os: &str) -> String {
    if os == "windows" {
        format!("{PROGRAM}.exe")
    } else {
        PROGRAM.to_string()
    }
}

/// Whether the runtime needs a backing VM ("machine") on this OS.
#[must_use]
pub fn needs_machine(os: &str) -> bool {
    os == "macos"
}

/// Default bundle directory: the directory of the running executable.
pub fn default_bundle_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Resolves the runtime binary from config, environment, bundle and `PATH`.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    pub explicit: Option<PathBuf>,
    pub env_override: Option<PathBuf>,
    pub bundle_dir: Option<PathBuf>,
    pub use_path: bool,
    pub os: &'static str,
    pub arch: &'static str,
}

impl BinaryLocator {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            explicit: config.binary.clone(),
            env_override: std::env::var_os(RUNTIME_BIN_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            bundle_dir: config.bundle_dir.clone().or_else(default_bundle_dir),
            use_path: config.use_path,
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    /// The bundled binary location, if a bundle directory is known.
    #[must_use]
    pub fn bundled_path(&self) -> Option<PathBuf> {
        let dir = self.bundle_dir.as_ref()?;
        Some(
            dir.join("bundled-runtime")
                .join(PROGRAM)
                .join(bundle_subdir(self.os, self.arch))
                .join("bin")
                .join(binary_file_name(self.os)),
        )
    }

    /// Find the binary. An explicit path that does not exist is an error
    /// rather than a reason to keep searching.
    pub fn resolve(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.explicit {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(RuntimeError::BinaryNotFound {
                searched: vec![path.clone()],
            });
        }

        let mut searched = Vec::new();

        if let Some(ref path) = self.env_override {
            if path.is_file() {
                return Ok(path.clone());
            }
            warn!(path = %path.display(), "{RUNTIME_BIN_ENV} set but no file there");
            searched.push(path.clone());
        }

        if let Some(path) = self.bundled_path() {
            if path.is_file() {
                return Ok(path);
            }
            debug!(path = %path.display(), "no bundled runtime binary");
            searched.push(path);
        }

        if self.use_path {
            match which::which(binary_file_name(self.os)) {
                Ok(path) => return Ok(path),
                Err(_) => searched.push(PathBuf::from(format!(
                    "$PATH/{}",
                    binary_file_name(self.os)
                ))),
            }
        }

        Err(RuntimeError::BinaryNotFound { searched })
    }
}

/// Ensure the owner/group/other execute bits are set.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    let mode = perms.mode();
    if mode & 0o111 != 0o111 {
        perms.set_mode(mode | 0o755);
        std::fs::set_permissions(path, perms)?;
        debug!(path = %path.display(), "marked runtime binary executable");
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
