//! Capture subsystem — the adaptive screenshot loop
//!
//! Each cycle: capture → sleep `interval` → embed → compare with the last
//! stored entry → persist → adjust `interval`.
//!
//! Every embedded capture is persisted; similarity only moves the interval.
//! Repetitive screens push it toward `max_interval_minutes`, changing screens
//! toward `min_interval_minutes`. A capture failure ends the loop with an
//! error; embedding and storage failures only cost the current cycle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use smarn_core::active_window::ActiveWindow;
use smarn_core::capture::{CaptureError, ScreenCapture};
use smarn_core::config::CaptureConfig;
use smarn_core::db::VectorStore;
use smarn_core::embeddings::EmbeddingBackend;
use smarn_core::similarity::SimilarityGate;
use tokio::sync::broadcast;

/// Transient loop state. Reset to the initial interval on restart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureState {
    pub interval_minutes: f64,
    pub last_similarity: Option<f32>,
}

impl CaptureState {
    pub fn initial(config: &CaptureConfig) -> Self {
        Self {
            interval_minutes: config.initial_interval_minutes,
            last_similarity: None,
        }
    }

    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval_minutes.max(0.0) * 60.0)
    }
}

/// Collaborators the loop drives.
#[derive(Clone)]
pub struct CaptureDeps {
    pub store: VectorStore,
    pub backend: Arc<dyn EmbeddingBackend>,
    pub capture: Arc<dyn ScreenCapture>,
    pub active_window: Arc<dyn ActiveWindow>,
}

/// What happened to one captured screenshot.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Persisted {
        id: i64,
        similarity: Option<f32>,
        duplicate: bool,
    },
    EmbeddingFailed,
    StoreFailed,
}

/// Next state after observing `similarity`.
///
/// `None` (nothing to compare with) leaves the interval alone. Otherwise the
/// interval moves one step and is clamped to the bounds, but only if it was
/// inside them to begin with.
pub fn adjust_interval(
    state: CaptureState,
    similarity: Option<f32>,
    config: &CaptureConfig,
) -> CaptureState {
    let Some(similarity) = similarity else {
        return CaptureState {
            last_similarity: None,
            ..state
        };
    };

    let min = config.min_interval_minutes;
    let max = config.max_interval_minutes;
    let step = config.interval_step_minutes;
    let current = state.interval_minutes;

    let interval = if !(min..=max).contains(&current) {
        current
    } else if similarity > config.slow_down_above {
        (current + step).min(max)
    } else if similarity < config.speed_up_below {
        (current - step).max(min)
    } else {
        current
    };

    CaptureState {
        interval_minutes: interval,
        last_similarity: Some(similarity),
    }
}

/// Embed, compare and persist one captured screenshot. The entry is stamped
/// with `captured_at`, not the time it reaches the store.
pub async fn process_capture(
    deps: &CaptureDeps,
    gate: &SimilarityGate,
    config: &CaptureConfig,
    state: CaptureState,
    image_path: &Path,
    captured_at: DateTime<Utc>,
) -> (CaptureState, CycleOutcome) {
    let embedding = match deps.backend.embed_image(image_path).await {
        Ok(embedding) => Some(embedding),
        Err(e) => {
            tracing::error!(
                path = %image_path.display(),
                backend = deps.backend.name(),
                error = %e,
                "Failed to embed screenshot, skipping this cycle"
            );
            None
        }
    };

    let application_name = deps.active_window.application_name().await;

    let Some(embedding) = embedding else {
        return (state, CycleOutcome::EmbeddingFailed);
    };

    let path = image_path.to_string_lossy();
    if embedding.len() != deps.store.dimensions() {
        tracing::error!(
            path = %path,
            expected = deps.store.dimensions(),
            actual = embedding.len(),
            "Embedding has the wrong dimension, skipping this cycle"
        );
        return (state, CycleOutcome::StoreFailed);
    }

    let outcome = match gate.evaluate(&deps.store, &embedding).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::warn!(error = %e, "Similarity check failed, storing without comparison");
            None
        }
    };
    let similarity = outcome.as_ref().and_then(|o| o.similarity);
    let duplicate = outcome.as_ref().is_some_and(|o| o.is_duplicate);

    if similarity.is_none() {
        tracing::info!("No previous entry to compare with, interval unchanged");
    }
    let next = adjust_interval(state, similarity, config);

    match deps
        .store
        .insert_at(&path, &application_name, &embedding, captured_at)
        .await
    {
        Ok(id) => {
            tracing::info!(
                id,
                application = %application_name,
                similarity = ?similarity,
                duplicate,
                interval_minutes = next.interval_minutes,
                "Stored screenshot"
            );
            (
                next,
                CycleOutcome::Persisted {
                    id,
                    similarity,
                    duplicate,
                },
            )
        }
        Err(e) => {
            tracing::error!(path = %path, error = %e, "Failed to store screenshot");
            (next, CycleOutcome::StoreFailed)
        }
    }
}

/// Called from main.rs to run the capture loop until shutdown.
///
/// Returns `Err` when a screenshot cannot be taken.
pub async fn run_capture_loop(
    deps: CaptureDeps,
    config: CaptureConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), CaptureError> {
    let gate = SimilarityGate::new(config.duplicate_threshold);
    let mut state = CaptureState::initial(&config);

    tracing::info!(
        "Capture loop started (interval: {}min, bounds: {}..={}min)",
        state.interval_minutes,
        config.min_interval_minutes,
        config.max_interval_minutes
    );

    loop {
        tracing::debug!("Capturing screenshot");
        let image_path = deps.capture.capture().await.map_err(|e| {
            tracing::error!(error = %e, "Screenshot capture failed");
            e
        })?;
        let captured_at = Utc::now();

        tokio::select! {
            _ = tokio::time::sleep(state.sleep_duration()) => {}
            _ = shutdown.recv() => {
                tracing::info!("Capture loop shutting down");
                return Ok(());
            }
        }

        let (next, _outcome) =
            process_capture(&deps, &gate, &config, state, &image_path, captured_at).await;
        state = next;
    }
}

// ============================================================================
// TESTS
// ============================================================================
