use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::exercise::Difficulty;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryBenchConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl RetryBenchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.session.validate()?;
        Ok(config)
    }
}

fn default_difficulties() -> Vec<Difficulty> {
    Difficulty::all().to_vec()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_concurrency() -> usize {
    1
}

fn default_temperature() -> f32 {
    0.0
}

/// Knobs for a single benchmark session. Snapshotted into the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_difficulties")]
    pub difficulties: Vec<Difficulty>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Bound on loading the candidate and on each test-case call.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Exercises evaluated at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            difficulties: default_difficulties(),
            max_attempts: default_max_attempts(),
            timeout_ms: default_timeout_ms(),
            concurrency: default_concurrency(),
            temperature: default_temperature(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn includes(&self, difficulty: Difficulty) -> bool {
        self.difficulties.contains(&difficulty)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BenchError::config("max_attempts must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(BenchError::config("timeout_ms must be positive"));
        }
        if self.concurrency == 0 {
            return Err(BenchError::config("concurrency must be at least 1"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(BenchError::config(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if self.difficulties.is_empty() {
            return Err(BenchError::config("difficulty filter selects nothing"));
        }
        Ok(())
    }
}

fn default_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Retries for transient transport failures, on top of the first try.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_save() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_save")]
    pub save: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            save: default_save(),
        }
    }
}
