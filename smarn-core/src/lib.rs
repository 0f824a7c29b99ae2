pub mod active_window;
pub mod capture;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod models;
pub mod onnx_embedder;
pub mod similarity;

pub use active_window::{ActiveWindow, X11ActiveWindow};
pub use capture::{CaptureError, CommandCapture, ScreenCapture};
pub use config::SmarnConfig;
pub use db::{StoreError, VectorStore};
pub use embeddings::{
    create_backend, BackendConfig, BackendKind, EmbeddingBackend, EmbeddingError,
    ModelServiceClient, ModelServiceConfig, OnnxConfig, CLIP_DIMENSIONS,
};
pub use error::SmarnError;
pub use models::{NearestScreenshot, ScreenshotEntry, SearchHit, StoredScreenshot};
pub use onnx_embedder::OnnxClipClient;
pub use similarity::{cosine_similarity, GateOutcome, SimilarityGate};
