//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Maximum concurrent encode jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Seconds to wait after SIGTERM before killing a canceled encoder
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Locations of uploaded sources and encoded outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("/app/uploads")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("/app/outputs")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            outputs_dir: default_outputs_dir(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// GPU management utility; only its exit code is consulted
    #[serde(default = "default_gpu_smi")]
    pub gpu_smi: String,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_gpu_smi() -> String {
    "nvidia-smi".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            gpu_smi: default_gpu_smi(),
        }
    }
}

/// File and job record retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    /// Files and terminal job records older than this are removed
    #[serde(default = "default_file_retention_hours")]
    pub file_retention_hours: u32,
    #[serde(default = "default_sweep_interval_minutes")]
    pub sweep_interval_minutes: u32,
    /// Width of the "recently completed" window in queue status
    #[serde(default = "default_recent_window_minutes")]
    pub recent_window_minutes: u32,
}

fn default_file_retention_hours() -> u32 {
    1
}

fn default_sweep_interval_minutes() -> u32 {
    15
}

fn default_recent_window_minutes() -> u32 {
    60
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            file_retention_hours: default_file_retention_hours(),
            sweep_interval_minutes: default_sweep_interval_minutes(),
            recent_window_minutes: default_recent_window_minutes(),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Resolution planning defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionConfig {
    /// Floor used when a request enables auto resolution without its own minimum
    #[serde(default = "default_min_height")]
    pub default_min_height: u32,
}

fn default_min_height() -> u32 {
    240
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            default_min_height: default_min_height(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MAX_CONCURRENT_JOBS -> worker.max_concurrent_jobs
    /// - FILE_RETENTION_HOURS -> retention.file_retention_hours
    /// - BACKEND_HOST -> server.host
    /// - BACKEND_PORT -> server.port
    /// - UPLOADS_DIR / OUTPUTS_DIR -> paths
    /// - FFMPEG_PATH / FFPROBE_PATH -> tools
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Some(jobs) = parsed_var::<u32>("MAX_CONCURRENT_JOBS") {
            self.worker.max_concurrent_jobs = jobs;
        }

        if let Some(hours) = parsed_var::<u32>("FILE_RETENTION_HOURS") {
            self.retention.file_retention_hours = hours;
        }

        if let Some(port) = parsed_var::<u16>("BACKEND_PORT") {
            self.server.port = port;
        }

        if let Some(host) = non_empty_var("BACKEND_HOST") {
            self.server.host = host;
        }

        if let Some(dir) = non_empty_var("UPLOADS_DIR") {
            self.paths.uploads_dir = PathBuf::from(dir);
        }

        if let Some(dir) = non_empty_var("OUTPUTS_DIR") {
            self.paths.outputs_dir = PathBuf::from(dir);
        }

        if let Some(bin) = non_empty_var("FFMPEG_PATH") {
            self.tools.ffmpeg = bin;
        }

        if let Some(bin) = non_empty_var("FFPROBE_PATH") {
            self.tools.ffprobe = bin;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Env var tests must not interleave
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for key in [
            "MAX_CONCURRENT_JOBS",
            "FILE_RETENTION_HOURS",
            "BACKEND_HOST",
            "BACKEND_PORT",
            "UPLOADS_DIR",
            "OUTPUTS_DIR",
            "FFMPEG_PATH",
            "FFPROBE_PATH",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_jobs in 0u32..16,
            grace in 1u64..60,
            retention_hours in 1u32..72,
            sweep in 1u32..120,
            port in 1u16..65535,
            min_height in 120u32..1080,
        ) {
            let toml_str = format!(
                r#"
[worker]
max_concurrent_jobs = {}
cancel_grace_secs = {}

[paths]
uploads_dir = "/srv/in"
outputs_dir = "/srv/out"

[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"

[retention]
file_retention_hours = {}
sweep_interval_minutes = {}

[server]
host = "127.0.0.1"
port = {}

[resolution]
default_min_height = {}
"#,
                max_jobs, grace, retention_hours, sweep, port, min_height
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.worker.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.worker.cancel_grace_secs, grace);
            prop_assert_eq!(config.paths.uploads_dir, PathBuf::from("/srv/in"));
            prop_assert_eq!(config.paths.outputs_dir, PathBuf::from("/srv/out"));
            prop_assert_eq!(config.tools.ffmpeg.as_str(), "/opt/ffmpeg/bin/ffmpeg");
            prop_assert_eq!(config.tools.ffprobe.as_str(), "ffprobe");
            prop_assert_eq!(config.retention.file_retention_hours, retention_hours);
            prop_assert_eq!(config.retention.sweep_interval_minutes, sweep);
            prop_assert_eq!(config.retention.recent_window_minutes, 60);
            prop_assert_eq!(config.server.host.as_str(), "127.0.0.1");
            prop_assert_eq!(config.server.port, port);
            prop_assert_eq!(config.resolution.default_min_height, min_height);
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nmax_concurrent_jobs = {}\n", initial_jobs);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_port(
            initial in 1u16..65535,
            override_port in 1u16..65535,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[server]\nport = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("BACKEND_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.server.port, override_port);
        }
    }

    #[test]
    fn test_invalid_env_value_keeps_file_value() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[retention]\nfile_retention_hours = 6\n").unwrap();
        env::set_var("FILE_RETENTION_HOURS", "soon");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.retention.file_retention_hours, 6);
    }

    #[test]
    fn test_path_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("UPLOADS_DIR", "/data/up");
        env::set_var("FFPROBE_PATH", "/usr/local/bin/ffprobe");
        env::set_var("BACKEND_HOST", "   ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.paths.uploads_dir, PathBuf::from("/data/up"));
        assert_eq!(config.tools.ffprobe, "/usr/local/bin/ffprobe");
        // blank values are ignored
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.worker.max_concurrent_jobs, 0);
        assert_eq!(config.worker.cancel_grace_secs, 5);
        assert_eq!(config.paths.uploads_dir, PathBuf::from("/app/uploads"));
        assert_eq!(config.paths.outputs_dir, PathBuf::from("/app/outputs"));
        assert_eq!(config.tools.gpu_smi, "nvidia-smi");
        assert_eq!(config.retention.file_retention_hours, 1);
        assert_eq!(config.retention.sweep_interval_minutes, 15);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.resolution.default_min_height, 240);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/sizecap/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = Config::parse_toml("[worker\nmax_concurrent_jobs = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
