//! Name of the application owning the focused window.
//!
//! Lookups never fail: anything that goes wrong yields `""`.

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::capture::{detect_session_from_env, DisplaySession};

#[async_trait]
pub trait ActiveWindow: Send + Sync {
    async fn application_name(&self) -> String;
}

/// Queries X11 (or XWayland) with `xdotool` / `xprop`.
#[derive(Debug, Clone, Default)]
pub struct X11ActiveWindow;

#[async_trait]
impl ActiveWindow for X11ActiveWindow {
    async fn application_name(&self) -> String {
        let result = match detect_session_from_env() {
            Some(DisplaySession::X11) => match xdotool_class_name().await {
                Some(name) => Some(name),
                None => xprop_class_name().await,
            },
            Some(DisplaySession::Wayland { .. }) => xprop_class_name().await,
            None => None,
        };
        result.unwrap_or_else(|| {
            tracing::debug!("Active application name unavailable");
            String::new()
        })
    }
}

async fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = match Command::new(program).args(args).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(program, error = %e, "Failed to run window query");
            return None;
        }
    };
    if !output.status.success() {
        tracing::debug!(program, status = %output.status, "Window query failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn xdotool_class_name() -> Option<String> {
    let name = run("xdotool", &["getactivewindow", "getwindowclassname"]).await?;
    (!name.is_empty()).then_some(name)
}

/// Works on X11 and, through XWayland, for X clients on Wayland.
async fn xprop_class_name() -> Option<String> {
    let root = run("xprop", &["-root", "_NET_ACTIVE_WINDOW"]).await?;
    let window_id = parse_active_window_id(&root)?;
    let class = run("xprop", &["-id", &window_id, "WM_CLASS"]).await?;
    parse_wm_class(&class)
}

/// `_NET_ACTIVE_WINDOW(WINDOW): window id # 0x3a00007` → `0x3a00007`.
pub fn parse_active_window_id(output: &str) -> Option<String> {
    let id = output.split_whitespace().last()?;
    // 0x0 means no window has focus
    (id.starts_with("0x") && id != "0x0").then(|| id.to_string())
}

/// `WM_CLASS(STRING) = "Navigator", "firefox"` → `Navigator`.
pub fn parse_wm_class(output: &str) -> Option<String> {
    let (_, value) = output.split_once('=')?;
    let quoted = Regex::new(r#""([^"]*)""#).ok()?;
    quoted
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
}
