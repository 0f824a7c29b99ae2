//! Screen capture through the desktop's screenshot tool
//!
//! The tool depends on the display server:
//! - Wayland → `grim`, or `gnome-screenshot -f` under GNOME
//! - X11 → `maim`
//!
//! Files land in the screenshots directory as `smarn_<YYYY-MM-DD_HH-MM-SS>.png`.

use async_trait::async_trait;
use chrono::Local;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("{tool} was not found on this system")]
    ToolNotFound { tool: String },

    #[error("{tool} exited with {status}")]
    ToolFailed { tool: String, status: String },

    #[error("Unknown display session: neither WAYLAND_DISPLAY nor DISPLAY is set")]
    UnsupportedSession,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PNG compression failed: {0}")]
    Compress(String),
}

/// Anything that can produce a screenshot file.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Take one screenshot and return the absolute path of the image file.
    async fn capture(&self) -> Result<PathBuf, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySession {
    Wayland { gnome: bool },
    X11,
}

/// Detect the display server from environment lookups. Wayland wins when
/// both variables are set.
pub fn detect_session(env: impl Fn(&str) -> Option<String>) -> Option<DisplaySession> {
    let present = |key: &str| env(key).is_some_and(|v| !v.is_empty());
    if present("WAYLAND_DISPLAY") {
        let gnome = env("XDG_CURRENT_DESKTOP")
            .map(|desktop| desktop.to_ascii_lowercase().contains("gnome"))
            .unwrap_or(false);
        Some(DisplaySession::Wayland { gnome })
    } else if present("DISPLAY") {
        Some(DisplaySession::X11)
    } else {
        None
    }
}

pub fn detect_session_from_env() -> Option<DisplaySession> {
    detect_session(|key| std::env::var(key).ok())
}

/// Program and arguments that write a screenshot of `session` to `path`.
pub fn capture_command(session: DisplaySession, path: &Path) -> (String, Vec<String>) {
    let target = path.to_string_lossy().to_string();
    match session {
        DisplaySession::Wayland { gnome: true } => (
            "gnome-screenshot".to_string(),
            vec!["-f".to_string(), target],
        ),
        DisplaySession::Wayland { gnome: false } => ("grim".to_string(), vec![target]),
        DisplaySession::X11 => ("maim".to_string(), vec![target]),
    }
}

pub fn screenshot_file_name() -> String {
    format!("smarn_{}.png", Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// Shells out to the session's screenshot tool.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    screenshots_dir: PathBuf,
    compress: bool,
    tool_override: Option<Vec<String>>,
}

impl CommandCapture {
    pub fn new(screenshots_dir: impl Into<PathBuf>, compress: bool) -> Self {
        Self {
            screenshots_dir: screenshots_dir.into(),
            compress,
            tool_override: None,
        }
    }

    /// Use a fixed command instead of the session's tool. The output path is
    /// appended as the last argument.
    pub fn with_tool(mut self, command: Vec<String>) -> Self {
        self.tool_override = Some(command);
        self
    }

    fn resolve_command(&self, path: &Path) -> Result<(String, Vec<String>), CaptureError> {
        if let Some(command) = &self.tool_override {
            let (program, rest) = command
                .split_first()
                .ok_or(CaptureError::UnsupportedSession)?;
            let mut args = rest.to_vec();
            args.push(path.to_string_lossy().to_string());
            return Ok((program.clone(), args));
        }
        let session = detect_session_from_env().ok_or(CaptureError::UnsupportedSession)?;
        Ok(capture_command(session, path))
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture(&self) -> Result<PathBuf, CaptureError> {
        tokio::fs::create_dir_all(&self.screenshots_dir).await?;
        let dir = tokio::fs::canonicalize(&self.screenshots_dir).await?;
        let path = dir.join(screenshot_file_name());

        let (program, args) = self.resolve_command(&path)?;
        let status = Command::new(&program)
            .args(&args)
            .status()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CaptureError::ToolNotFound {
                    tool: program.clone(),
                },
                _ => CaptureError::Io(e),
            })?;

        if !status.success() {
            return Err(CaptureError::ToolFailed {
                tool: program,
                status: status.to_string(),
            });
        }

        if self.compress {
            let target = path.clone();
            let compressed = tokio::task::spawn_blocking(move || compress_png(&target))
                .await
                .map_err(|e| CaptureError::Compress(format!("spawn_blocking join error: {e}")))
                .and_then(|result| result);
            if let Err(e) = compressed {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Compression failed, keeping the original screenshot"
                );
            }
        }

        tracing::info!(path = %path.display(), tool = %program, "Captured screenshot");
        Ok(path)
    }
}

/// Re-encode `path` in place as an RGB PNG with maximum compression.
pub fn compress_png(path: &Path) -> Result<(), CaptureError> {
    let rgb = image::open(path)
        .map_err(|e| CaptureError::Compress(e.to_string()))?
        .to_rgb8();

    let tmp = path.with_extension("png.tmp");
    {
        let file = std::fs::File::create(&tmp)?;
        let encoder = PngEncoder::new_with_quality(
            BufWriter::new(file),
            CompressionType::Best,
            FilterType::Adaptive,
        );
        rgb.write_with_encoder(encoder)
            .map_err(|e| CaptureError::Compress(e.to_string()))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_detect_session_prefers_wayland() {
        let env = env_of(&[("WAYLAND_DISPLAY", "wayland-0"), ("DISPLAY", ":0")]);
        assert_eq!(
            detect_session(env),
            Some(DisplaySession::Wayland { gnome: false })
        );
    }

    #[test]
    fn test_detect_session_gnome_and_x11() {
        let env = env_of(&[
            ("WAYLAND_DISPLAY", "wayland-0"),
            ("XDG_CURRENT_DESKTOP", "ubuntu:GNOME"),
        ]);
        assert_eq!(
            detect_session(env),
            Some(DisplaySession::Wayland { gnome: true })
        );
        assert_eq!(
            detect_session(env_of(&[("DISPLAY", ":1")])),
            Some(DisplaySession::X11)
        );
        assert_eq!(detect_session(env_of(&[("DISPLAY", "")])), None);
        assert_eq!(detect_session(env_of(&[])), None);
    }

    #[test]
    fn test_capture_command_per_session() {
        let path = Path::new("/tmp/shot.png");
        assert_eq!(
            capture_command(DisplaySession::X11, path),
            ("maim".to_string(), vec!["/tmp/shot.png".to_string()])
        );
        assert_eq!(
            capture_command(DisplaySession::Wayland { gnome: false }, path).0,
            "grim"
        );
        assert_eq!(
            capture_command(DisplaySession::Wayland { gnome: true }, path),
            (
                "gnome-screenshot".to_string(),
                vec!["-f".to_string(), "/tmp/shot.png".to_string()]
            )
        );
    }

    #[test]
    fn test_file_name_format() {
        let name = screenshot_file_name();
        assert!(name.starts_with("smarn_"));
        assert!(name.ends_with(".png"));
        // smarn_YYYY-MM-DD_HH-MM-SS.png
        assert_eq!(name.len(), "smarn_2024-01-01_00-00-00.png".len());
    }

    #[tokio::test]
    async fn test_capture_with_tool_creates_dir_and_returns_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let shots = dir.path().join("nested/screenshots");
        let capture = CommandCapture::new(&shots, false).with_tool(vec!["touch".to_string()]);

        let path = capture.capture().await.expect("capture");
        assert!(path.is_absolute());
        assert!(path.exists());
        assert!(path.starts_with(shots.canonicalize().unwrap()));
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let capture = CommandCapture::new(dir.path(), false)
            .with_tool(vec!["smarn-no-such-screenshot-tool".to_string()]);

        match capture.capture().await {
            Err(CaptureError::ToolNotFound { tool }) => {
                assert_eq!(tool, "smarn-no-such-screenshot-tool");
            }
            other => panic!("Expected ToolNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_tool_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let capture = CommandCapture::new(dir.path(), false).with_tool(vec!["false".to_string()]);
        assert!(matches!(
            capture.capture().await,
            Err(CaptureError::ToolFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_compression_keeps_original_file() {
        let dir = tempfile::tempdir().unwrap();
        // `touch` leaves an empty file, which is not a decodable PNG
        let capture = CommandCapture::new(dir.path(), true).with_tool(vec!["touch".to_string()]);

        let path = capture.capture().await.expect("capture");
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(compress_png(&path).is_err());
    }

    #[test]
    fn test_compress_png_keeps_dimensions_and_drops_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        image::RgbaImage::from_pixel(32, 16, image::Rgba([10, 20, 30, 128]))
            .save(&path)
            .unwrap();

        compress_png(&path).unwrap();

        let reloaded = image::open(&path).unwrap();
        assert_eq!(reloaded.width(), 32);
        assert_eq!(reloaded.height(), 16);
        assert_eq!(reloaded.color(), image::ColorType::Rgb8);
        assert!(!path.with_extension("png.tmp").exists());
    }
}
