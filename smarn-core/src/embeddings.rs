//! Embeddings module for smarn — image and text into one vector space
//!
//! Provides an `EmbeddingBackend` trait with implementations for:
//! - **ONNX** — local CLIP inference (vision + text towers) on the CPU
//! - **Model service** — HTTP client for a separate process hosting the
//!   model on a GPU (`/imgemb/`, `/textemb/`)
//!
//! `select_backend_kind` picks between them from config and a GPU probe.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// jina-clip-v1 embedding dimensions
pub const CLIP_DIMENSIONS: usize = 768;

/// Default model service address
pub const DEFAULT_SERVICE_URL: &str = "http://localhost:6942";

// ============================================================================
// EmbeddingBackend trait
// ============================================================================

/// Abstraction over embedding providers. Image and text embeddings from the
/// same backend live in the same space and are comparable by cosine distance.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed the image stored at `path`.
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a free-text query.
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Returns the embedding dimension (768 for jina-clip-v1).
    fn dimensions(&self) -> usize;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

/// Embedding generation errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Image not found: {path}")]
    InvalidInput { path: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: expected {expected} dimensions, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },

    #[error("Missing embedding in response")]
    MissingEmbedding,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },

    #[error("ONNX model file not found at {path}")]
    ModelNotFound { path: String },

    #[error("ONNX inference error: {0}")]
    OnnxInference(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Image decoding error: {0}")]
    Image(String),

    #[error("Unknown embedding backend '{0}' (expected auto, onnx or service)")]
    UnsupportedBackend(String),
}

// ============================================================================
// Config types
// ============================================================================

/// Model service client configuration
#[derive(Debug, Clone)]
pub struct ModelServiceConfig {
    pub base_url: String,
    pub dimensions: usize,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_seconds: u64,
}

impl Default for ModelServiceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SERVICE_URL.to_string(),
            dimensions: CLIP_DIMENSIONS,
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_seconds: 60,
        }
    }
}

/// ONNX backend configuration
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub vision_model_path: PathBuf,
    pub text_model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub dimensions: usize,
}

/// Configuration union for the backend factory.
pub enum BackendConfig {
    Onnx(OnnxConfig),
    ModelService(ModelServiceConfig),
}

/// Create the appropriate backend from configuration.
pub fn create_backend(config: BackendConfig) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    match config {
        BackendConfig::Onnx(c) => Ok(Box::new(crate::onnx_embedder::OnnxClipClient::new(c)?)),
        BackendConfig::ModelService(c) => Ok(Box::new(ModelServiceClient::new(c)?)),
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// Which concrete backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Onnx,
    ModelService,
}

/// Resolve the configured backend name.
///
/// `"auto"` calls `probe_vram_gb` and picks the model service when the GPU has
/// at least `min_vram_gb`; explicit names never probe.
pub fn select_backend_kind(
    configured: &str,
    probe_vram_gb: impl FnOnce() -> Option<f64>,
    min_vram_gb: f64,
) -> Result<BackendKind, EmbeddingError> {
    match configured.trim().to_ascii_lowercase().as_str() {
        "onnx" | "cpu" => Ok(BackendKind::Onnx),
        "service" | "model-service" | "gpu" => Ok(BackendKind::ModelService),
        "auto" | "" => match probe_vram_gb() {
            Some(vram) if vram >= min_vram_gb => {
                tracing::info!(vram_gb = vram, "GPU has enough memory, using model service");
                Ok(BackendKind::ModelService)
            }
            Some(vram) => {
                tracing::info!(
                    vram_gb = vram,
                    required_gb = min_vram_gb,
                    "GPU memory below requirement, using local ONNX"
                );
                Ok(BackendKind::Onnx)
            }
            None => {
                tracing::info!("No usable GPU detected, using local ONNX");
                Ok(BackendKind::Onnx)
            }
        },
        other => Err(EmbeddingError::UnsupportedBackend(other.to_string())),
    }
}

/// Total VRAM of the largest NVIDIA GPU in GB, or `None` if `nvidia-smi` is
/// missing or fails.
pub fn probe_gpu_vram_gb() -> Option<f64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;

    if !output.status.success() {
        tracing::debug!(status = %output.status, "nvidia-smi exited unsuccessfully");
        return None;
    }

    parse_nvidia_smi_memory(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `nvidia-smi` memory output (one MiB value per GPU) into GB.
pub fn parse_nvidia_smi_memory(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .map(|mib| mib / 1024.0)
        .fold(None, |best: Option<f64>, gb| {
            Some(best.map_or(gb, |b| b.max(gb)))
        })
}

// ============================================================================
// Model service API structs (private)
// ============================================================================

/// The service returns either a flat vector or a batch of one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingPayload {
    Flat(Vec<f32>),
    Batched(Vec<Vec<f32>>),
}

impl EmbeddingPayload {
    fn into_vector(self) -> Option<Vec<f32>> {
        match self {
            EmbeddingPayload::Flat(v) if !v.is_empty() => Some(v),
            EmbeddingPayload::Flat(_) => None,
            EmbeddingPayload::Batched(rows) => rows.into_iter().next().filter(|v| !v.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceErrorResponse {
    detail: Option<serde_json::Value>,
}

// ============================================================================
// ModelServiceClient
// ============================================================================

/// Client for the model service that hosts the GPU model.
#[derive(Debug, Clone)]
pub struct ModelServiceClient {
    client: Client,
    config: ModelServiceConfig,
}

impl ModelServiceClient {
    pub fn new(config: ModelServiceConfig) -> Result<Self, EmbeddingError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a client with a custom base URL (for testing / integration)
    pub fn with_base_url(
        mut config: ModelServiceConfig,
        base_url: String,
    ) -> Result<Self, EmbeddingError> {
        config.base_url = base_url;
        Self::new(config)
    }

    async fn get_with_retry(
        &self,
        endpoint: &str,
        param: &str,
        value: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = Retry::spawn(retry_strategy, || self.get_once(endpoint, param, value)).await;

        match result {
            Ok(vec) => Ok(vec),
            Err(e) => {
                tracing::error!(
                    attempts = self.config.max_retries,
                    endpoint,
                    error = %e,
                    "All model service retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.config.max_retries,
                })
            }
        }
    }

    async fn get_once(
        &self,
        endpoint: &str,
        param: &str,
        value: &str,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/{}/", self.config.base_url.trim_end_matches('/'), endpoint);

        let response = self
            .client
            .get(&url)
            .query(&[(param, value)])
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ServiceErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.detail)
                .map(|d| match d {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or(error_body);

            tracing::warn!(code = status.as_u16(), message = %message, "Model service error");

            return Err(EmbeddingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let payload: EmbeddingPayload = response.json().await?;
        let values = payload
            .into_vector()
            .ok_or(EmbeddingError::MissingEmbedding)?;

        if values.len() != self.config.dimensions {
            return Err(EmbeddingError::InvalidDimensions {
                expected: self.config.dimensions,
                actual: values.len(),
            });
        }

        Ok(values)
    }
}

#[async_trait]
impl EmbeddingBackend for ModelServiceClient {
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        // The service runs on this machine and reads the file itself.
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(EmbeddingError::InvalidInput {
                path: path.display().to_string(),
            });
        }
        let path = path.to_string_lossy();
        self.get_with_retry("imgemb", "image_path", &path).await
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.get_with_retry("textemb", "query", text).await
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "model-service"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> ModelServiceConfig {
        ModelServiceConfig {
            base_url: String::new(),
            dimensions: CLIP_DIMENSIONS,
            max_retries: 3,
            retry_delay_ms: 10,
            timeout_seconds: 5,
        }
    }

    fn mock_vector() -> Vec<f32> {
        (0..CLIP_DIMENSIONS).map(|i| (i as f32) / 768.0).collect()
    }

    #[tokio::test]
    async fn test_embed_text_calls_textemb_with_query() {
        let mock_server = MockServer::start().await;
        let client = ModelServiceClient::with_base_url(test_config(), mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("GET"))
            .and(path("/textemb/"))
            .and(query_param("query", "red car"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_vector()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let embedding = client.embed_text("red car").await.expect("embedding");
        assert_eq!(embedding.len(), 768);
        assert_eq!(embedding[1], 1.0 / 768.0);
    }

    #[tokio::test]
    async fn test_embed_image_sends_path_and_accepts_batched_payload() {
        let mock_server = MockServer::start().await;
        let client = ModelServiceClient::with_base_url(test_config(), mock_server.uri()).unwrap();
        let image = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        let image_path = image.path().to_string_lossy().to_string();

        Mock::given(method("GET"))
            .and(path("/imgemb/"))
            .and(query_param("image_path", image_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![mock_vector()]))
            .mount(&mock_server)
            .await;

        let embedding = client.embed_image(image.path()).await.unwrap();
        assert_eq!(embedding.len(), 768);
    }

    #[tokio::test]
    async fn test_embed_image_missing_file_fails_before_request() {
        let mock_server = MockServer::start().await;
        let client = ModelServiceClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_vector()))
            .expect(0)
            .mount(&mock_server)
            .await;

        match client.embed_image(Path::new("/nonexistent/shot.png")).await {
            Err(EmbeddingError::InvalidInput { path }) => {
                assert!(path.contains("nonexistent"));
            }
            other => panic!("Expected InvalidInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embed_returns_retry_exhausted_on_500() {
        let mock_server = MockServer::start().await;
        let client = ModelServiceClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "detail": "Model not loaded"
            })))
            .mount(&mock_server)
            .await;

        match client.embed_text("hello").await {
            Err(EmbeddingError::RetryExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_embed_retries_on_503_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = ModelServiceClient::with_base_url(test_config(), mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_vector()))
            .mount(&mock_server)
            .await;

        let embedding = client.embed_text("hello").await.expect("success after retry");
        assert_eq!(embedding.len(), 768);
    }

    #[tokio::test]
    async fn test_wrong_dimensions_are_rejected() {
        let mock_server = MockServer::start().await;
        let mut config = test_config();
        config.max_retries = 0;
        let client = ModelServiceClient::with_base_url(config, mock_server.uri()).unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![0.1f32, 0.2, 0.3]))
            .mount(&mock_server)
            .await;

        match client.embed_text("hello").await {
            Err(EmbeddingError::InvalidDimensions { expected, actual }) => {
                assert_eq!(expected, 768);
                assert_eq!(actual, 3);
            }
            Err(EmbeddingError::RetryExhausted { .. }) => {}
            other => panic!("Expected InvalidDimensions or RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backend_trait_object_reports_name_and_dimensions() {
        let backend: Box<dyn EmbeddingBackend> = create_backend(BackendConfig::ModelService(
            ModelServiceConfig::default(),
        ))
        .unwrap();
        assert_eq!(backend.name(), "model-service");
        assert_eq!(backend.dimensions(), 768);
    }

    // --- backend selection ---

    #[test]
    fn test_explicit_backend_never_probes() {
        let probe = || -> Option<f64> { panic!("probe must not run") };
        assert_eq!(
            select_backend_kind("onnx", probe, 7.0).unwrap(),
            BackendKind::Onnx
        );
        let probe = || -> Option<f64> { panic!("probe must not run") };
        assert_eq!(
            select_backend_kind("service", probe, 7.0).unwrap(),
            BackendKind::ModelService
        );
        let probe = || -> Option<f64> { panic!("probe must not run") };
        assert_eq!(
            select_backend_kind("model-service", probe, 7.0).unwrap(),
            BackendKind::ModelService
        );
    }

    #[test]
    fn test_auto_uses_service_only_with_enough_vram() {
        assert_eq!(
            select_backend_kind("auto", || Some(8.0), 7.0).unwrap(),
            BackendKind::ModelService
        );
        assert_eq!(
            select_backend_kind("auto", || Some(7.0), 7.0).unwrap(),
            BackendKind::ModelService
        );
        assert_eq!(
            select_backend_kind("auto", || Some(4.0), 7.0).unwrap(),
            BackendKind::Onnx
        );
        assert_eq!(
            select_backend_kind("auto", || None, 7.0).unwrap(),
            BackendKind::Onnx
        );
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        assert!(matches!(
            select_backend_kind("tpu", || None, 7.0),
            Err(EmbeddingError::UnsupportedBackend(name)) if name == "tpu"
        ));
    }

    #[test]
    fn test_parse_nvidia_smi_takes_largest_gpu() {
        assert_eq!(parse_nvidia_smi_memory("8192\n24576\n"), Some(24.0));
        assert_eq!(parse_nvidia_smi_memory(" 6144 \n"), Some(6.0));
        assert_eq!(parse_nvidia_smi_memory("No devices were found\n"), None);
        assert_eq!(parse_nvidia_smi_memory(""), None);
    }
}
