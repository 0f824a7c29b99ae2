//! Embedder subsystem — builds the embedding backend at startup
//!
//! Reads `[embedding] backend`:
//! - `"onnx"` / `"cpu"` → local CLIP towers on the CPU
//! - `"service"` / `"model-service"` / `"gpu"` → the GPU model service over HTTP
//! - `"auto"` → probe the GPU with `nvidia-smi` and pick one

use smarn_core::{
    embeddings::{
        self, BackendConfig, BackendKind, EmbeddingBackend, EmbeddingError, ModelServiceConfig,
        OnnxConfig,
    },
    onnx_embedder, SmarnConfig,
};

/// Create an embedding backend from the application config.
pub fn create_backend_from_config(
    config: &SmarnConfig,
) -> Result<Box<dyn EmbeddingBackend>, EmbeddingError> {
    let kind = embeddings::select_backend_kind(
        &config.embedding.backend,
        embeddings::probe_gpu_vram_gb,
        config.embedding.min_gpu_vram_gb,
    )?;

    let backend = embeddings::create_backend(backend_config_for(config, kind))?;
    tracing::info!(
        backend = backend.name(),
        dimensions = backend.dimensions(),
        "Embedding backend ready"
    );
    Ok(backend)
}

/// Translate the `[embedding]` section into the factory's config for `kind`.
pub fn backend_config_for(config: &SmarnConfig, kind: BackendKind) -> BackendConfig {
    let dimensions = config.embedding.dimensions as usize;
    match kind {
        BackendKind::Onnx => {
            let paths = onnx_embedder::resolve_onnx_paths(
                &config.embedding.onnx_model_dir,
                &config.embedding.onnx_model_name,
            );
            BackendConfig::Onnx(OnnxConfig {
                vision_model_path: paths.vision,
                text_model_path: paths.text,
                tokenizer_path: paths.tokenizer,
                dimensions,
            })
        }
        BackendKind::ModelService => BackendConfig::ModelService(ModelServiceConfig {
            base_url: config.embedding.service_url.clone(),
            dimensions,
            max_retries: config.embedding.max_retries,
            retry_delay_ms: config.embedding.retry_delay_ms,
            timeout_seconds: config.embedding.request_timeout_seconds,
        }),
    }
}
