//! Configuration validation.
//!
//! Checks a TOML config against the known schema, flags misspelled keys with
//! suggestions, and reports semantic problems such as colliding host ports or
//! unparseable discovery endpoints.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use crate::schema::PodvisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// "syntax", "unknown-field", "type-error", "ports", "discovery",
    /// "workload", "timing" or "file-ref".
    pub category: &'static str,
    /// Dotted path, e.g. "workload.ports[1].host_port".
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{} [{}] {}", self.severity, self.category, self.message)
        } else {
            write!(
                f,
                "{} [{}] {}: {}",
                self.severity, self.category, self.path, self.message
            )
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree ─────────────────────────────────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    /// Dynamic keys with scalar values (`workload.env`).
    Map,
    Array(Box<KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let machine = Struct(HashMap::from([
        ("enabled", Leaf),
        ("name", Leaf),
        ("memory_mb", Leaf),
        ("cpus", Leaf),
    ]));

    let runtime = Struct(HashMap::from([
        ("binary", Leaf),
        ("bundle_dir", Leaf),
        ("use_path", Leaf),
        ("command_timeout_secs", Leaf),
        ("image_timeout_secs", Leaf),
        ("machine", machine),
    ]));

    let port = Struct(HashMap::from([
        ("name", Leaf),
        ("host_port", Leaf),
        ("container_port", Leaf),
        ("description", Leaf),
        ("scheme", Leaf),
        ("path", Leaf),
    ]));

    let workload = Struct(HashMap::from([
        ("name", Leaf),
        ("image", Leaf),
        ("image_archive", Leaf),
        ("build_context", Leaf),
        ("dockerfile", Leaf),
        ("privileged", Leaf),
        ("credential_env", Leaf),
        ("env", Map),
        ("ports", Array(Box::new(port))),
    ]));

    let lifecycle = Struct(HashMap::from([
        ("launch_settle_ms", Leaf),
        ("restart_settle_ms", Leaf),
        ("stop_grace_secs", Leaf),
        ("stop_slack_ms", Leaf),
        ("kill_grace_ms", Leaf),
    ]));

    let reconciler = Struct(HashMap::from([("enabled", Leaf), ("interval_secs", Leaf)]));

    let endpoint = Struct(HashMap::from([("label", Leaf), ("url", Leaf)]));

    let discovery = Struct(HashMap::from([
        ("enabled", Leaf),
        ("endpoints", Array(Box::new(endpoint))),
        ("min_content_bytes", Leaf),
        ("content_check_delay_ms", Leaf),
        ("initial_delay_ms", Leaf),
        ("precheck_timeout_ms", Leaf),
    ]));

    Struct(HashMap::from([
        ("runtime", runtime),
        ("workload", workload),
        ("lifecycle", lifecycle),
        ("reconciler", reconciler),
        ("discovery", discovery),
    ]))
}

// ── Suggestions ─────────────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(needle, c)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Validate the config at `path`, or the discovered config file when `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    let mut result = if is_toml {
        match std::fs::read_to_string(actual_path) {
            Ok(content) => validate_toml_str(&crate::env_subst::substitute_env(&content)),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    format!("failed to read config file: {e}"),
                )],
                config_path: None,
            },
        }
    } else {
        // Non-TOML formats skip the unknown-field walk.
        match crate::loader::load_config(actual_path) {
            Ok(config) => validate_config(&config),
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic::new(
                    Severity::Error,
                    "syntax",
                    "",
                    e.to_string(),
                )],
                config_path: None,
            },
        }
    };
    result.config_path = Some(actual_path.clone());
    result
}

/// Validate a TOML string without touching the filesystem.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("TOML syntax error: {e}"),
            ));
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<PodvisorConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// Semantic checks on an already-parsed config.
#[must_use]
pub fn validate_config(config: &PodvisorConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    check_semantics(config, &mut diagnostics);
    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known: Vec<&str> = fields.keys().copied().collect();
            for (key, child) in table {
                let path = join_path(prefix, key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child, child_schema, &path, diagnostics);
                    continue;
                }
                let message = match suggest(key, &known, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "unknown-field",
                    path,
                    message,
                ));
            }
        },
        (toml::Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Leaf, free-form map or type mismatch; deserialization reports the latter.
        _ => {},
    }
}

fn check_semantics(config: &PodvisorConfig, diagnostics: &mut Vec<Diagnostic>) {
    let workload = &config.workload;

    if workload.name.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "workload",
            "workload.name",
            "workload name must not be empty",
        ));
    }
    if workload.image.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "workload",
            "workload.image",
            "image reference must not be empty",
        ));
    }
    if workload.credential_env.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "workload",
            "workload.credential_env",
            "no credential variable; the stored API key will not be passed",
        ));
    }

    let mut seen_ports = HashSet::new();
    let mut seen_names = HashSet::new();
    for (i, port) in workload.ports.iter().enumerate() {
        let path = format!("workload.ports[{i}]");
        if port.host_port == 0 || port.container_port == 0 {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "ports",
                &path,
                "port numbers must be non-zero",
            ));
        }
        if !seen_ports.insert(port.host_port) {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "ports",
                format!("{path}.host_port"),
                format!("host port {} is mapped more than once", port.host_port),
            ));
        }
        if !seen_names.insert(port.name.as_str()) {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "ports",
                format!("{path}.name"),
                format!("duplicate port name \"{}\"", port.name),
            ));
        }
    }

    if config.discovery.enabled {
        if config.discovery.endpoints.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "discovery",
                "discovery.endpoints",
                "discovery is enabled but no endpoints are configured",
            ));
        } else if config.discovery.endpoints.len() < 3 {
            diagnostics.push(Diagnostic::new(
                Severity::Info,
                "discovery",
                "discovery.endpoints",
                "fewer than three endpoints; missing fallbacks reuse the last one",
            ));
        }
        for (i, endpoint) in config.discovery.endpoints.iter().enumerate() {
            let path = format!("discovery.endpoints[{i}].url");
            match url::Url::parse(&endpoint.url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {},
                Ok(parsed) => diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "discovery",
                    path,
                    format!("unsupported scheme \"{}\"", parsed.scheme()),
                )),
                Err(e) => diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "discovery",
                    path,
                    format!("invalid URL: {e}"),
                )),
            }
        }
    }

    if config.reconciler.enabled && config.reconciler.interval_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "timing",
            "reconciler.interval_secs",
            "interval must be at least one second",
        ));
    }
    if config.runtime.command_timeout_secs == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "timing",
            "runtime.command_timeout_secs",
            "timeout must be non-zero",
        ));
    }
    if config.runtime.command_timeout_secs <= config.lifecycle.stop_grace_secs {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "timing",
            "lifecycle.stop_grace_secs",
            "stop grace period is not shorter than the command timeout",
        ));
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("image", "image"), 0);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("imge", "image"), 1);
        assert_eq!(levenshtein("worklod", "workload"), 1);
    }

    #[test]
    fn defaults_are_clean() {
        let result = validate_config(&PodvisorConfig::default());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0);
    }

    #[test]
    fn empty_toml_is_clean() {
        let result = validate_toml_str("");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn misspelled_section_gets_suggestion() {
        let result = validate_toml_str("[worklod]\nname = \"x\"\n");
        let d = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field" && d.path == "worklod")
            .expect("unknown-field diagnostic");
        assert!(d.message.contains("workload"), "{}", d.message);
    }

    #[test]
    fn unknown_key_inside_port_entry() {
        let toml = r#"
[[workload.ports]]
name = "vnc"
host_port = 5900
container_port = 5900
hots = "x"
"#;
        let result = validate_toml_str(toml);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "workload.ports[0].hots"),
            "{:?}",
            result.diagnostics
        );
    }

    #[test]
    fn env_map_accepts_any_key() {
        let result = validate_toml_str("[workload.env]\nWIDTH = \"1280\"\nCUSTOM = \"1\"\n");
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn syntax_error_short_circuits() {
        let result = validate_toml_str("[workload\n");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_error_is_reported() {
        let result = validate_toml_str("[reconciler]\ninterval_secs = \"soon\"\n");
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.category == "type-error")
        );
    }

    #[test]
    fn duplicate_host_port_is_an_error() {
        let mut config = PodvisorConfig::default();
        config.workload.ports[1].host_port = 5900;
        let result = validate_config(&config);
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.category == "ports" && d.severity == Severity::Error)
        );
    }

    #[test]
    fn bad_endpoint_url_is_an_error() {
        let mut config = PodvisorConfig::default();
        config.discovery.endpoints[1].url = "not a url".into();
        config.discovery.endpoints[2].url = "ftp://localhost:21".into();
        let result = validate_config(&config);
        let paths: Vec<_> = result
            .diagnostics
            .iter()
            .filter(|d| d.category == "discovery")
            .map(|d| d.path.as_str())
            .collect();
        assert_eq!(paths, vec![
            "discovery.endpoints[1].url",
            "discovery.endpoints[2].url"
        ]);
    }

    #[test]
    fn zero_interval_is_an_error() {
        let mut config = PodvisorConfig::default();
        config.reconciler.interval_secs = 0;
        assert!(validate_config(&config).has_errors());

        config.reconciler.enabled = false;
        assert!(!validate_config(&config).has_errors());
    }

    #[test]
    fn validates_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podvisor.toml");
        std::fs::write(&path, "[runtime]\ncommand_timout_secs = 5\n").unwrap();
        let result = validate(Some(&path));
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));
        assert!(result.has_errors());
    }

    #[test]
    fn missing_file_is_read_error() {
        let result = validate(Some(Path::new("/nonexistent/podvisor.toml")));
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].category, "syntax");
    }
}
