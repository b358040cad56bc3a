//! Persisted user settings: the API credential and launch environment
//! overrides.
//!
//! Stored as `settings.json` in the config directory. Read when the workload
//! starts, written on every update.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::error::{Context, Error, Result};

/// Key addressing the credential through [`SettingsStore::get`] / [`SettingsStore::set`].
pub const API_KEY: &str = "api_key";

const SETTINGS_FILENAME: &str = "settings.json";

fn default_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("WIDTH".to_string(), "1024".to_string()),
        ("HEIGHT".to_string(), "768".to_string()),
        ("DISPLAY_NUM".to_string(), "1".to_string()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(
        default,
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<Secret<String>>,
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            env: default_env(),
        }
    }
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn validate_env_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::UnknownSetting {
            key: key.to_string(),
        })
    }
}

/// Key-value access to the persisted settings.
pub trait SettingsStore: Send + Sync {
    /// Snapshot of the current settings.
    fn load(&self) -> Result<Settings>;

    /// Replace the settings wholesale.
    fn save(&self, settings: &Settings) -> Result<()>;

    /// The stored credential, if any.
    fn api_key(&self) -> Result<Option<Secret<String>>> {
        Ok(self.load()?.api_key)
    }

    fn set_api_key(&self, key: &str) -> Result<()> {
        let mut settings = self.load()?;
        settings.api_key = (!key.is_empty()).then(|| Secret::new(key.to_string()));
        self.save(&settings)
    }

    /// Read one setting: [`API_KEY`] or an environment variable name.
    fn get(&self, key: &str) -> Result<Option<String>> {
        let settings = self.load()?;
        if key == API_KEY {
            return Ok(settings.api_key.map(|s| s.expose_secret().clone()));
        }
        Ok(settings.env.get(key).cloned())
    }

    /// Write one setting: [`API_KEY`] or an environment variable name.
    fn set(&self, key: &str, value: &str) -> Result<()> {
        if key == API_KEY {
            return self.set_api_key(value);
        }
        validate_env_key(key)?;
        let mut settings = self.load()?;
        settings.env.insert(key.to_string(), value.to_string());
        self.save(&settings)
    }

    /// Remove an environment override. Returns whether it existed.
    fn unset(&self, key: &str) -> Result<bool> {
        let mut settings = self.load()?;
        let existed = if key == API_KEY {
            settings.api_key.take().is_some()
        } else {
            settings.env.remove(key).is_some()
        };
        if existed {
            self.save(&settings)?;
        }
        Ok(existed)
    }
}

// ── File-backed store ───────────────────────────────────────────────────────

/// JSON-file settings store with an in-memory cache.
pub struct FileSettingsStore {
    path: PathBuf,
    cache: RwLock<Option<Settings>>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    /// Store at `<config_dir>/settings.json`.
    pub fn in_config_dir() -> Result<Self> {
        let dir = crate::loader::config_dir().context("no config directory available")?;
        Ok(Self::new(dir.join(SETTINGS_FILENAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Settings> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        match serde_json::from_str(&raw) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt settings file, using defaults");
                Ok(Settings::default())
            },
        }
    }

    fn write_file(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;

        #[cfg(unix)]
        {
            use std::{io::Write, os::unix::fs::OpenOptionsExt};

            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)?;
            file.write_all(json.as_bytes())?;
        }
        #[cfg(not(unix))]
        std::fs::write(&self.path, json)?;

        debug!(path = %self.path.display(), "saved settings");
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<Settings> {
        if let Ok(cache) = self.cache.read()
            && let Some(ref settings) = *cache
        {
            return Ok(settings.clone());
        }
        let settings = self.read_file()?;
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        self.write_file(settings)?;
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(())
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

/// Non-persistent store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        self.inner
            .read()
            .map(|s| s.clone())
            .map_err(|_| Error::message("settings lock poisoned"))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| Error::message("settings lock poisoned"))?;
        *inner = settings.clone();
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_display_env() {
        let store = MemorySettingsStore::default();
        assert_eq!(store.get("WIDTH").unwrap().as_deref(), Some("1024"));
        assert_eq!(store.get("DISPLAY_NUM").unwrap().as_deref(), Some("1"));
        assert!(store.api_key().unwrap().is_none());
    }

    #[test]
    fn api_key_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = FileSettingsStore::new(&path);
        store.set(API_KEY, "sk-test-123").unwrap();
        store.set("HEIGHT", "900").unwrap();

        let reopened = FileSettingsStore::new(&path);
        let key = reopened.api_key().unwrap().unwrap();
        assert_eq!(key.expose_secret(), "sk-test-123");
        assert_eq!(reopened.get("HEIGHT").unwrap().as_deref(), Some("900"));
        assert_eq!(reopened.get(API_KEY).unwrap().as_deref(), Some("sk-test-123"));
    }

    #[cfg(unix)]
    #[test]
    fn settings_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        FileSettingsStore::new(&path)
            .set(API_KEY, "secret")
            .unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn empty_api_key_clears_credential() {
        let store = MemorySettingsStore::default();
        store.set_api_key("abc").unwrap();
        store.set_api_key("").unwrap();
        assert!(store.api_key().unwrap().is_none());
    }

    #[test]
    fn rejects_invalid_env_names() {
        let store = MemorySettingsStore::default();
        assert!(store.set("1BAD", "x").is_err());
        assert!(store.set("HAS SPACE", "x").is_err());
        assert!(store.set("", "x").is_err());
        assert!(store.set("GOOD_NAME", "x").is_ok());
    }

    #[test]
    fn unset_removes_override() {
        let store = MemorySettingsStore::default();
        store.set("EXTRA", "1").unwrap();
        assert!(store.unset("EXTRA").unwrap());
        assert!(!store.unset("EXTRA").unwrap());
        assert!(store.get("EXTRA").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileSettingsStore::new(&path);
        let settings = store.load().unwrap();
        assert!(settings.api_key.is_none());
        assert_eq!(settings.env.get("WIDTH").map(String::as_str), Some("1024"));
    }

    #[test]
    fn debug_output_redacts_credential() {
        let store = MemorySettingsStore::default();
        store.set_api_key("sk-very-secret").unwrap();
        let rendered = format!("{:?}", store.load().unwrap());
        assert!(!rendered.contains("sk-very-secret"));
    }
}
