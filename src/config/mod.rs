// Config module - Process declarations and their loader

mod loader;
mod size;

pub use loader::ConfigFile;
pub use size::MemorySize;

use crate::error::{OverseerError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted for `stop_signal`
pub const VALID_STOP_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Upper bound on `instances` for a single declaration
pub const MAX_INSTANCES: usize = 100;

/// How instances of a process are launched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// One plain child process per instance
    #[default]
    Fork,
    /// Accepted for compatibility, runs as `Fork`
    Cluster,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecMode::Fork => write!(f, "fork"),
            ExecMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// Immutable description of one managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Process name (unique identifier)
    pub name: String,

    /// Executable path, or a program name looked up through PATH
    pub script: PathBuf,

    /// Command-line arguments, as a list or a whitespace separated string
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,

    /// Absolute working directory
    pub cwd: PathBuf,

    /// Number of concurrent OS processes
    #[serde(default = "default_instances")]
    pub instances: usize,

    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Whether an unrequested exit is followed by a relaunch
    #[serde(default = "default_true")]
    pub autorestart: bool,

    /// Restart when files under `cwd` change
    #[serde(default)]
    pub watch: bool,

    /// Path fragments ignored by the file watcher
    #[serde(default = "default_ignore_watch")]
    pub ignore_watch: Vec<String>,

    /// Resident memory ceiling that forces a restart
    #[serde(default)]
    pub max_memory_restart: Option<MemorySize>,

    /// Base environment applied to every launch
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,

    /// Named environment overlays, one of which is selected at launch
    #[serde(default, deserialize_with = "deserialize_env_profiles")]
    pub env_profiles: BTreeMap<String, BTreeMap<String, String>>,

    #[serde(default)]
    pub out_file: Option<PathBuf>,

    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Combined stdout+stderr log
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Prefix each log line with a timestamp
    #[serde(default = "default_true")]
    pub time: bool,

    /// Write the combined log
    #[serde(default = "default_true")]
    pub merge_logs: bool,

    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,

    /// Signal to send on stop (default: SIGTERM)
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Grace period before SIGKILL, in milliseconds
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    /// Initial restart backoff, in milliseconds
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Cap on the restart backoff, in milliseconds
    #[serde(default = "default_max_restart_delay_ms")]
    pub max_restart_delay_ms: u64,

    /// Automatic restarts allowed within `restart_window_secs`
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
}

/// The three log destinations of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
    /// None when `merge_logs` is off
    pub combined: Option<PathBuf>,
}

/// Line formatting options for an instance's logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub timestamp: bool,
    pub date_format: String,
}

// Default value functions for serde
fn default_instances() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_ignore_watch() -> Vec<String> {
    vec!["node_modules".to_string(), "logs".to_string(), ".git".to_string()]
}

fn default_log_date_format() -> String {
    "YYYY-MM-DD HH:mm:ss Z".to_string()
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout_ms() -> u64 {
    1600
}

fn default_restart_delay_ms() -> u64 {
    100
}

fn default_max_restart_delay_ms() -> u64 {
    15_000
}

fn default_max_restarts() -> usize {
    16
}

fn default_restart_window_secs() -> u64 {
    60
}

fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        Line(String),
        List(Vec<String>),
    }

    Ok(match Args::deserialize(deserializer)? {
        Args::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        Args::List(list) => list,
    })
}

/// Environment values may be written as strings, numbers or booleans (`PORT = 9000`)
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            EnvValue::Text(s) => s,
            EnvValue::Int(i) => i.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Bool(b) => b.to_string(),
        }
    }
}

fn deserialize_env<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, EnvValue>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.into_string())).collect())
}

fn deserialize_env_profiles<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, BTreeMap<String, EnvValue>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(profile, vars)| {
            let vars = vars.into_iter().map(|(k, v)| (k, v.into_string())).collect();
            (profile, vars)
        })
        .collect())
}

impl ProcessSpec {
    /// A spec with default settings for everything but the launch invocation
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            instances: default_instances(),
            exec_mode: ExecMode::Fork,
            autorestart: true,
            watch: false,
            ignore_watch: default_ignore_watch(),
            max_memory_restart: None,
            env: BTreeMap::new(),
            env_profiles: BTreeMap::new(),
            out_file: None,
            error_file: None,
            log_file: None,
            time: true,
            merge_logs: true,
            log_date_format: default_log_date_format(),
            stop_signal: default_stop_signal(),
            kill_timeout_ms: default_kill_timeout_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: default_max_restart_delay_ms(),
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
        }
    }

    /// Validate the fields that do not depend on the launch profile
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(OverseerError::validation(&self.name, reason));

        if self.name.trim().is_empty() {
            return invalid("name must not be empty".to_string());
        }

        if self.script.as_os_str().is_empty() {
            return invalid("script must not be empty".to_string());
        }

        if !self.cwd.is_absolute() {
            return invalid(format!(
                "working directory must be absolute: {}",
                self.cwd.display()
            ));
        }
        if !self.cwd.is_dir() {
            return invalid(format!(
                "working directory does not exist: {}",
                self.cwd.display()
            ));
        }

        if self.instances == 0 || self.instances > MAX_INSTANCES {
            return invalid(format!(
                "instances must be between 1 and {}, got {}",
                MAX_INSTANCES, self.instances
            ));
        }

        if let Some(limit) = self.max_memory_restart {
            if limit.bytes() == 0 {
                return invalid("max_memory_restart must be a positive byte count".to_string());
            }
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return invalid(format!(
                "invalid stop_signal: {}. Must be one of: {}",
                self.stop_signal,
                VALID_STOP_SIGNALS.join(", ")
            ));
        }

        if self.max_restarts == 0 {
            return invalid("max_restarts must be at least 1".to_string());
        }

        Ok(())
    }

    /// Fail when `profile` is selected but not declared
    pub fn validate_profile(&self, profile: Option<&str>) -> Result<()> {
        match profile {
            Some(p) if !self.env_profiles.contains_key(p) => Err(OverseerError::validation(
                &self.name,
                format!("environment profile '{}' is not declared", p),
            )),
            _ => Ok(()),
        }
    }

    /// Variables layered onto the OS environment at launch: `env`, then the selected profile
    pub fn environment(&self, profile: Option<&str>) -> Result<BTreeMap<String, String>> {
        self.validate_profile(profile)?;

        let mut vars = self.env.clone();
        if let Some(overlay) = profile.and_then(|p| self.env_profiles.get(p)) {
            vars.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(vars)
    }

    /// Resolve the log files of instance `index`, defaulting to `<log_dir>/<name>-*.log`
    pub fn log_paths(&self, log_dir: &Path, index: usize) -> LogPaths {
        let resolve = |explicit: &Option<PathBuf>, kind: &str| {
            let path = explicit
                .clone()
                .unwrap_or_else(|| log_dir.join(format!("{}-{}.log", self.name, kind)));
            if self.instances > 1 {
                with_instance_suffix(&path, index)
            } else {
                path
            }
        };

        LogPaths {
            out: resolve(&self.out_file, "out"),
            err: resolve(&self.error_file, "error"),
            combined: self
                .merge_logs
                .then(|| resolve(&self.log_file, "combined")),
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            timestamp: self.time,
            date_format: self.log_date_format.clone(),
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Expand `$VAR` and `${VAR}` references from the supervisor's own environment
    pub fn expand_env_vars(&mut self) {
        self.script = expand_env_in_path(&self.script);
        self.cwd = expand_env_in_path(&self.cwd);
        self.args = self.args.iter().map(|a| expand_env_in_string(a)).collect();
        for value in self.env.values_mut() {
            *value = expand_env_in_string(value);
        }
        for vars in self.env_profiles.values_mut() {
            for value in vars.values_mut() {
                *value = expand_env_in_string(value);
            }
        }
        for path in [&mut self.out_file, &mut self.error_file, &mut self.log_file]
            .into_iter()
            .flatten()
        {
            *path = expand_env_in_path(path);
        }
    }
}

fn with_instance_suffix(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    path.with_file_name(file_name)
}

/// Expand `$VAR` and `${VAR}`; unknown variables are left untouched
pub(crate) fn expand_env_in_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => {
                out.push_str(&value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}
