//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target total CPU utilization in percent (1-100, default 50)
    #[serde(default = "default_target_cpu_percent")]
    pub target_cpu_percent: u32,
    /// Niceness applied to transcoder processes (0-19, higher = lower priority)
    #[serde(default = "default_nice_level")]
    pub nice_level: i32,
}

fn default_target_cpu_percent() -> u32 {
    50
}

fn default_nice_level() -> i32 {
    19
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_percent: default_target_cpu_percent(),
            nice_level: default_nice_level(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkersConfig {
    /// Maximum number of transcodes running at once
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Transcoder threads per worker (0 = derive from CPU budget)
    #[serde(default)]
    pub threads_per_worker: u32,
}

fn default_max_workers() -> u32 {
    2
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            threads_per_worker: 0,
        }
    }
}

/// Source discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Extensions selected as sources, matched case-insensitively
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
}

fn default_source_extensions() -> Vec<String> {
    vec![".mov".to_string()]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            source_extensions: default_source_extensions(),
        }
    }
}

/// External transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Program name or path of the transcoder
    #[serde(default = "default_program")]
    pub program: String,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
        }
    }
}

/// Interrupt handling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownConfig {
    /// Seconds a running transcode gets to exit after SIGTERM before it is killed
    #[serde(default = "default_task_grace_secs")]
    pub task_grace_secs: u64,
    /// Seconds the supervisor waits for all tasks before killing what is left
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_task_grace_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_grace_secs: default_task_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
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
    /// - AV1_BATCH_LOGICAL_CORES -> cpu.logical_cores
    /// - AV1_BATCH_TARGET_CPU_PERCENT -> cpu.target_cpu_percent
    /// - AV1_BATCH_NICE_LEVEL -> cpu.nice_level
    /// - AV1_BATCH_MAX_WORKERS -> workers.max_workers
    /// - AV1_BATCH_THREADS_PER_WORKER -> workers.threads_per_worker
    /// - AV1_BATCH_FFMPEG -> encoder.program
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("AV1_BATCH_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_TARGET_CPU_PERCENT") {
            if let Ok(percent) = val.parse::<u32>() {
                self.cpu.target_cpu_percent = percent;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_NICE_LEVEL") {
            if let Ok(level) = val.parse::<i32>() {
                self.cpu.nice_level = level;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.workers.max_workers = workers;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_THREADS_PER_WORKER") {
            if let Ok(threads) = val.parse::<u32>() {
                self.workers.threads_per_worker = threads;
            }
        }

        if let Ok(val) = env::var("AV1_BATCH_FFMPEG") {
            if !val.trim().is_empty() {
                self.encoder.program = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an optional file
    ///
    /// Without a file the defaults are used. Environment overrides apply either way.
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }
}
