use std::sync::Arc;

use clap::Parser;
use smarn_core::active_window::X11ActiveWindow;
use smarn_core::capture::CommandCapture;
use smarn_core::embeddings::EmbeddingBackend;
use smarn_core::SmarnConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use smarn_server::http::{self, HttpState};
use smarn_server::subsystems::capture_loop::{self, CaptureDeps};
use smarn_server::subsystems::embedder;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "smarn.toml")]
    config: String,

    /// Check the store and embedding backend, then exit
    #[arg(long)]
    health: bool,

    /// Serve search only; do not take screenshots
    #[arg(long)]
    no_capture: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match SmarnConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over [service] log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Open store
    let store = match smarn_core::db::open_configured(&config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open screenshot store: {}", e);
            std::process::exit(1);
        }
    };

    let backend: Arc<dyn EmbeddingBackend> = match embedder::create_backend_from_config(&config) {
        Ok(b) => Arc::from(b),
        Err(e) => {
            if args.health {
                println!("❌ Embedding backend unavailable: {}", e);
            } else {
                eprintln!("Failed to create embedding backend: {}", e);
            }
            std::process::exit(1);
        }
    };

    if args.health {
        match store.count().await {
            Ok(n) => println!(
                "✅ Store {} ({} entries)",
                store.path().display(),
                n
            ),
            Err(e) => {
                println!("❌ Store check failed: {}", e);
                std::process::exit(1);
            }
        }
        println!(
            "✅ Embedding backend: {} ({} dims)",
            backend.name(),
            backend.dimensions()
        );
        println!("✅ smarn health check passed");
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // HTTP API
    let http_task = if config.http.enabled {
        let state = HttpState {
            store: store.clone(),
            backend: Arc::clone(&backend),
            config: config.clone(),
        };
        let http_shutdown = tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = http::start_http_server(state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }))
    } else {
        None
    };

    if config.capture.enabled && !args.no_capture {
        let deps = CaptureDeps {
            store: store.clone(),
            backend: Arc::clone(&backend),
            capture: Arc::new(CommandCapture::new(
                config.screenshots_dir(),
                config.capture.compress,
            )),
            active_window: Arc::new(X11ActiveWindow),
        };

        if let Err(e) =
            capture_loop::run_capture_loop(deps, config.capture.clone(), tx.subscribe()).await
        {
            tracing::error!("Capture loop stopped: {}", e);
            eprintln!("Screenshot capture failed: {}", e);
            store.close().await;
            std::process::exit(1);
        }
    } else {
        tracing::info!("Capture disabled, serving search only");
        let mut shutdown = tx.subscribe();
        let _ = shutdown.recv().await;
    }

    // Let the HTTP server drain after the shutdown broadcast
    if let Some(task) = http_task {
        let _ = tx.send(());
        let _ = task.await;
    }
    store.close().await;

    Ok(())
}
