use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::screenshot::NearestScreenshot;

/// One search result as surfaced to the presentation layer.
///
/// `distance` is the raw cosine distance (lower is more similar).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub image_path: String,
    pub application_name: String,
    pub timestamp: DateTime<Utc>,
    pub distance: f64,
}

impl From<NearestScreenshot> for SearchHit {
    fn from(row: NearestScreenshot) -> Self {
        Self {
            image_path: row.entry.image_path,
            application_name: row.entry.application_name,
            timestamp: row.entry.timestamp,
            distance: row.distance,
        }
    }
}
