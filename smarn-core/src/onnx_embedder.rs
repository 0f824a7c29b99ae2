//! ONNX embedding backend — local CLIP inference via `jina-clip-v1` exports
//!
//! Uses the `ort` crate for ONNX Runtime, `tokenizers` for the text tower and
//! `image` for vision preprocessing. Produces 768-dimensional embeddings
//! entirely offline, with image and text in the same space.

use async_trait::async_trait;
use image::imageops::FilterType;
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::embeddings::{EmbeddingBackend, EmbeddingError, OnnxConfig};

/// Side length of the square CLIP input.
pub const CLIP_IMAGE_SIZE: u32 = 224;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Longest token sequence fed to the text tower.
const MAX_TEXT_TOKENS: usize = 512;

/// Local ONNX CLIP client holding both towers.
pub struct OnnxClipClient {
    vision: Arc<Mutex<Session>>,
    text: Arc<Mutex<Session>>,
    tokenizer: Arc<tokenizers::Tokenizer>,
    dimensions: usize,
}

impl std::fmt::Debug for OnnxClipClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxClipClient")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl OnnxClipClient {
    /// Load both ONNX towers and the tokenizer from the paths in `config`.
    ///
    /// Returns `EmbeddingError::ModelNotFound` if any file is missing.
    pub fn new(config: OnnxConfig) -> Result<Self, EmbeddingError> {
        for path in [
            &config.vision_model_path,
            &config.text_model_path,
            &config.tokenizer_path,
        ] {
            if !path.exists() {
                return Err(EmbeddingError::ModelNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let vision = load_session(&config.vision_model_path)?;
        let text = load_session(&config.text_model_path)?;

        let tokenizer = tokenizers::Tokenizer::from_file(&config.tokenizer_path)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

        tracing::info!(
            vision = %config.vision_model_path.display(),
            text = %config.text_model_path.display(),
            "Loaded ONNX CLIP model"
        );

        Ok(Self {
            vision: Arc::new(Mutex::new(vision)),
            text: Arc::new(Mutex::new(text)),
            tokenizer: Arc::new(tokenizer),
            dimensions: config.dimensions,
        })
    }
}

fn load_session(path: &Path) -> Result<Session, EmbeddingError> {
    Session::builder()
        .and_then(|b| b.with_intra_threads(2))
        .and_then(|b| b.commit_from_file(path))
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))
}

#[async_trait]
impl EmbeddingBackend for OnnxClipClient {
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(EmbeddingError::InvalidInput {
                path: path.display().to_string(),
            });
        }

        // Decoding and inference are CPU-bound — run on the blocking thread pool.
        let session = Arc::clone(&self.vision);
        let dimensions = self.dimensions;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let pixels = preprocess_image(&path)?;
            let mut session_guard = session
                .lock()
                .map_err(|e| EmbeddingError::OnnxInference(format!("session lock poisoned: {e}")))?;
            embed_image_sync(&mut session_guard, pixels, dimensions)
        })
        .await
        .map_err(|e| EmbeddingError::OnnxInference(format!("spawn_blocking join error: {e}")))?
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let session = Arc::clone(&self.text);
        let tokenizer = Arc::clone(&self.tokenizer);
        let dimensions = self.dimensions;
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut session_guard = session
                .lock()
                .map_err(|e| EmbeddingError::OnnxInference(format!("session lock poisoned: {e}")))?;
            embed_text_sync(&mut session_guard, &tokenizer, &text, dimensions)
        })
        .await
        .map_err(|e| EmbeddingError::OnnxInference(format!("spawn_blocking join error: {e}")))?
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

/// Decode, resize the shorter side to 224, centre crop and normalise into a
/// `[3, 224, 224]` CHW buffer.
fn preprocess_image(path: &Path) -> Result<Vec<f32>, EmbeddingError> {
    let img = image::open(path).map_err(|e| EmbeddingError::Image(e.to_string()))?;
    Ok(pixels_from_rgb(&img.to_rgb8()))
}

fn pixels_from_rgb(rgb: &image::RgbImage) -> Vec<f32> {
    let (w, h) = rgb.dimensions();
    let scale = CLIP_IMAGE_SIZE as f32 / w.min(h).max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).max(CLIP_IMAGE_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).max(CLIP_IMAGE_SIZE);

    let resized = image::imageops::resize(rgb, new_w, new_h, FilterType::CatmullRom);
    let left = (new_w - CLIP_IMAGE_SIZE) / 2;
    let top = (new_h - CLIP_IMAGE_SIZE) / 2;
    let cropped =
        image::imageops::crop_imm(&resized, left, top, CLIP_IMAGE_SIZE, CLIP_IMAGE_SIZE).to_image();

    let plane = (CLIP_IMAGE_SIZE * CLIP_IMAGE_SIZE) as usize;
    let mut chw = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let idx = (y * CLIP_IMAGE_SIZE + x) as usize;
        for c in 0..3 {
            chw[c * plane + idx] = (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    chw
}

fn embed_image_sync(
    session: &mut Session,
    pixels: Vec<f32>,
    expected_dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let side = CLIP_IMAGE_SIZE as i64;
    let tensor = Tensor::from_array((vec![1i64, 3, side, side], pixels))
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let outputs = session
        .run(ort::inputs! { "pixel_values" => tensor })
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let dims: Vec<i64> = shape.iter().copied().collect();
    finish_embedding(&dims, data, None, expected_dims)
}

fn embed_text_sync(
    session: &mut Session,
    tokenizer: &tokenizers::Tokenizer,
    text: &str,
    expected_dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;

    let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
    let mut attention_mask: Vec<i64> = encoding
        .get_attention_mask()
        .iter()
        .map(|&m| m as i64)
        .collect();
    input_ids.truncate(MAX_TEXT_TOKENS);
    attention_mask.truncate(MAX_TEXT_TOKENS);

    let tensor = Tensor::from_array((vec![1i64, input_ids.len() as i64], input_ids))
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let outputs = session
        .run(ort::inputs! { "input_ids" => tensor })
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let (shape, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| EmbeddingError::OnnxInference(e.to_string()))?;

    let dims: Vec<i64> = shape.iter().copied().collect();
    finish_embedding(&dims, data, Some(attention_mask.as_slice()), expected_dims)
}

/// Turn a raw model output into a unit-length embedding.
///
/// `[1, dim]` outputs are used as-is; `[1, seq, dim]` outputs are mean-pooled
/// (masked by `attention_mask` when given).
pub(crate) fn finish_embedding(
    shape: &[i64],
    data: &[f32],
    attention_mask: Option<&[i64]>,
    expected_dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let mut pooled = match shape.len() {
        2 => {
            let hidden_dim = shape[1] as usize;
            data.get(..hidden_dim)
                .ok_or_else(|| EmbeddingError::OnnxInference("output shorter than shape".into()))?
                .to_vec()
        }
        3 => {
            let seq_len = shape[1] as usize;
            let hidden_dim = shape[2] as usize;
            if data.len() < seq_len * hidden_dim {
                return Err(EmbeddingError::OnnxInference(
                    "output shorter than shape".to_string(),
                ));
            }
            let mut pooled = vec![0.0f32; hidden_dim];
            let mut weight_sum = 0.0f32;
            for tok_idx in 0..seq_len {
                let weight = match attention_mask {
                    Some(mask) => mask.get(tok_idx).copied().unwrap_or(0) as f32,
                    None => 1.0,
                };
                if weight > 0.0 {
                    let offset = tok_idx * hidden_dim;
                    for (dim, value) in pooled.iter_mut().enumerate() {
                        *value += data[offset + dim] * weight;
                    }
                    weight_sum += weight;
                }
            }
            if weight_sum > 0.0 {
                for v in &mut pooled {
                    *v /= weight_sum;
                }
            }
            pooled
        }
        n => {
            return Err(EmbeddingError::OnnxInference(format!(
                "Expected 2D or 3D output, got {n}D"
            )));
        }
    };

    let norm: f32 = pooled.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut pooled {
            *v /= norm;
        }
    }

    if pooled.len() != expected_dims {
        return Err(EmbeddingError::InvalidDimensions {
            expected: expected_dims,
            actual: pooled.len(),
        });
    }

    Ok(pooled)
}

/// Resolve the default model directory.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_home.join("smarn/models")
}

/// Paths of the vision tower, text tower and tokenizer for `model_name`
/// inside `model_dir` (empty means [`default_model_dir`]).
pub fn resolve_onnx_paths(model_dir: &str, model_name: &str) -> OnnxPaths {
    let dir = if model_dir.is_empty() {
        default_model_dir()
    } else {
        crate::config::expand_path(model_dir)
    };
    OnnxPaths {
        vision: dir.join(format!("{model_name}-vision.onnx")),
        text: dir.join(format!("{model_name}-text.onnx")),
        tokenizer: dir.join(format!("{model_name}-tokenizer.json")),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnnxPaths {
    pub vision: PathBuf,
    pub text: PathBuf,
    pub tokenizer: PathBuf,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CLIP_DIMENSIONS;

    #[test]
    fn test_model_not_found_returns_error() {
        let config = OnnxConfig {
            vision_model_path: PathBuf::from("/nonexistent/vision.onnx"),
            text_model_path: PathBuf::from("/nonexistent/text.onnx"),
            tokenizer_path: PathBuf::from("/nonexistent/tokenizer.json"),
            dimensions: CLIP_DIMENSIONS,
        };

        match OnnxClipClient::new(config) {
            Err(EmbeddingError::ModelNotFound { path }) => {
                assert!(path.ends_with("vision.onnx"), "path was: {path}");
            }
            other => panic!("Expected ModelNotFound, got: {other:?}"),
        }
    }

    #[test]
    fn test_default_model_dir_contains_smarn() {
        let dir = default_model_dir();
        assert!(
            dir.to_string_lossy().contains("smarn/models"),
            "Expected smarn/models in path, got: {}",
            dir.display()
        );
    }

    #[test]
    fn test_resolve_onnx_paths_custom_dir() {
        let paths = resolve_onnx_paths("/opt/models", "jina-clip-v1");
        assert_eq!(paths.vision, PathBuf::from("/opt/models/jina-clip-v1-vision.onnx"));
        assert_eq!(paths.text, PathBuf::from("/opt/models/jina-clip-v1-text.onnx"));
        assert_eq!(
            paths.tokenizer,
            PathBuf::from("/opt/models/jina-clip-v1-tokenizer.json")
        );
    }

    #[test]
    fn test_pixels_are_square_chw_and_normalised() {
        let img = image::RgbImage::from_pixel(640, 360, image::Rgb([255, 0, 128]));
        let pixels = pixels_from_rgb(&img);
        let plane = (CLIP_IMAGE_SIZE * CLIP_IMAGE_SIZE) as usize;
        assert_eq!(pixels.len(), 3 * plane);

        let red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let green = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        assert!((pixels[0] - red).abs() < 1e-4);
        assert!((pixels[plane + 17] - green).abs() < 1e-4);
    }

    #[test]
    fn test_finish_embedding_normalises_pooled_output() {
        let embedding = finish_embedding(&[1, 2], &[3.0, 4.0], None, 2).unwrap();
        assert!((embedding[0] - 0.6).abs() < 1e-6);
        assert!((embedding[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_finish_embedding_mean_pools_masked_tokens() {
        // second token is padding and must not contribute
        let data = [1.0, 0.0, 100.0, 100.0];
        let embedding = finish_embedding(&[1, 2, 2], &data, Some(&[1i64, 0][..]), 2).unwrap();
        assert_eq!(embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_finish_embedding_checks_dimensions() {
        match finish_embedding(&[1, 2], &[1.0, 0.0], None, 768) {
            Err(EmbeddingError::InvalidDimensions { expected, actual }) => {
                assert_eq!(expected, 768);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected InvalidDimensions, got {other:?}"),
        }
    }
}
