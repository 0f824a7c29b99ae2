use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata half of a stored screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotEntry {
    pub id: i64,
    pub image_path: String,
    pub application_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata joined with its vector-index row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredScreenshot {
    pub entry: ScreenshotEntry,
    pub embedding: Vec<f32>,
}

/// A `top_k` row: metadata annotated with its cosine distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearestScreenshot {
    pub entry: ScreenshotEntry,
    pub distance: f64,
}
