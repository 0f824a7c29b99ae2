pub mod screenshot;
pub mod search;

pub use screenshot::{NearestScreenshot, ScreenshotEntry, StoredScreenshot};
pub use search::SearchHit;
