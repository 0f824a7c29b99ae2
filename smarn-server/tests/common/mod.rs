//! Test doubles shared by the server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use smarn_core::active_window::ActiveWindow;
use smarn_core::capture::{CaptureError, ScreenCapture};
use smarn_core::config::DatabaseConfig;
use smarn_core::db::VectorStore;
use smarn_core::embeddings::{EmbeddingBackend, EmbeddingError};

pub const DIMS: usize = 4;

pub fn unit(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[axis % DIMS] = 1.0;
    v
}

pub async fn temp_store() -> (tempfile::TempDir, VectorStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = VectorStore::open(dir.path().join("smarn.sqlite"), DIMS, &DatabaseConfig::default())
        .await
        .expect("open store");
    store.initialize().await.expect("initialize store");
    (dir, store)
}

/// Backend with canned vectors keyed by image path or query text.
/// Unknown keys fail like an unreachable model.
#[derive(Default)]
pub struct MockBackend {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    pub image_calls: AtomicUsize,
    pub text_calls: AtomicUsize,
}

impl MockBackend {
    pub fn with(self, key: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors
            .lock()
            .expect("mock lock")
            .insert(key.into(), vector);
        self
    }

    fn lookup(&self, key: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .lock()
            .expect("mock lock")
            .get(key)
            .cloned()
            .ok_or(EmbeddingError::RetryExhausted { attempts: 1 })
    }
}

#[async_trait]
impl EmbeddingBackend for MockBackend {
    async fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(&path.to_string_lossy())
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        self.lookup(text)
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Capture that hands out a fixed sequence of paths, then fails.
pub struct MockCapture {
    paths: Mutex<Vec<PathBuf>>,
    pub calls: AtomicUsize,
}

impl MockCapture {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        let mut paths = paths;
        paths.reverse();
        Self {
            paths: Mutex::new(paths),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ScreenCapture for MockCapture {
    async fn capture(&self) -> Result<PathBuf, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths
            .lock()
            .expect("mock lock")
            .pop()
            .ok_or(CaptureError::ToolNotFound {
                tool: "grim".to_string(),
            })
    }
}

pub struct FixedWindow {
    pub name: String,
    pub calls: AtomicUsize,
}

impl FixedWindow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ActiveWindow for FixedWindow {
    async fn application_name(&self) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.name.clone()
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
