use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SmarnConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
    pub data_dir: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: "~/.local/share/smarn".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Empty means `<data_dir>/smarn.sqlite`.
    pub path: String,
    pub max_connections: u32,
    pub busy_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_connections: 4,
            busy_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "auto", "onnx" or "service"
    pub backend: String,
    pub dimensions: u32,
    pub onnx_model_dir: String,
    pub onnx_model_name: String,
    pub service_url: String,
    pub min_gpu_vram_gb: f64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub request_timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            dimensions: 768,
            onnx_model_dir: String::new(),
            onnx_model_name: "jina-clip-v1".to_string(),
            service_url: "http://localhost:6942".to_string(),
            min_gpu_vram_gb: 7.0,
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_seconds: 60,
        }
    }
}

/// Capture cadence and the similarity policy that drives it.
///
/// Intervals are in minutes. `slow_down_above` / `speed_up_below` bound the
/// dead band in which the interval is left alone.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Empty means `<data_dir>/screenshots`.
    pub screenshots_dir: String,
    pub compress: bool,
    pub initial_interval_minutes: f64,
    pub min_interval_minutes: f64,
    pub max_interval_minutes: f64,
    pub interval_step_minutes: f64,
    pub slow_down_above: f32,
    pub speed_up_below: f32,
    pub duplicate_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            screenshots_dir: String::new(),
            compress: true,
            initial_interval_minutes: 1.0,
            min_interval_minutes: 0.25,
            max_interval_minutes: 5.0,
            interval_step_minutes: 0.25,
            slow_down_above: 0.95,
            speed_up_below: 0.8,
            duplicate_threshold: 0.95,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 9,
            max_k: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl SmarnConfig {
    /// Load from an optional TOML file, overlaid by `SMARN__SECTION__KEY`
    /// environment variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("SMARN").separator("__"))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        if c.interval_step_minutes <= 0.0 {
            return Err(ConfigError::Message(
                "capture.interval_step_minutes must be positive".to_string(),
            ));
        }
        if !(c.min_interval_minutes > 0.0
            && c.min_interval_minutes <= c.initial_interval_minutes
            && c.initial_interval_minutes <= c.max_interval_minutes)
        {
            return Err(ConfigError::Message(format!(
                "capture intervals must satisfy 0 < min ({}) <= initial ({}) <= max ({})",
                c.min_interval_minutes, c.initial_interval_minutes, c.max_interval_minutes
            )));
        }
        if c.speed_up_below > c.slow_down_above {
            return Err(ConfigError::Message(format!(
                "capture.speed_up_below ({}) must not exceed capture.slow_down_above ({})",
                c.speed_up_below, c.slow_down_above
            )));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Message(
                "embedding.dimensions must be greater than 0".to_string(),
            ));
        }
        if self.retrieval.default_k == 0 || self.retrieval.max_k < self.retrieval.default_k {
            return Err(ConfigError::Message(format!(
                "retrieval.default_k ({}) must be in 1..=max_k ({})",
                self.retrieval.default_k, self.retrieval.max_k
            )));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.service.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        if self.database.path.is_empty() {
            self.data_dir().join("smarn.sqlite")
        } else {
            expand_path(&self.database.path)
        }
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        if self.capture.screenshots_dir.is_empty() {
            self.data_dir().join("screenshots")
        } else {
            expand_path(&self.capture.screenshots_dir)
        }
    }
}

/// Expand `~` and `$VAR` in a configured path. Unknown variables are left as-is.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}
