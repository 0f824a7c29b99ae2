//! smarn-cli — search your screen history from the terminal
//!
//! Talks to a running `smarn-server` over its HTTP API.
//!
//! # Subcommands
//! - `search <query> [-k <n>] [--json]` — find screenshots matching a description
//! - `status`                           — show server health
//! - `purge --yes`                      — delete every stored screenshot entry

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
const DEFAULT_K: usize = 9;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "smarn-cli",
    version,
    about = "Search your screen history by describing what you saw"
)]
struct Cli {
    /// smarn HTTP server URL (overrides SMARN_HTTP_URL env var)
    #[arg(long, env = "SMARN_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search stored screenshots by text
    Search {
        /// What you remember seeing
        query: String,

        /// Maximum number of results to return
        #[arg(short = 'k', long, default_value_t = DEFAULT_K)]
        k: usize,

        /// Output results as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Show smarn server status
    Status,

    /// Delete every stored screenshot entry (image files are kept)
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

/// A single hit from `GET /search`
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    pub image_path: String,
    #[serde(default)]
    pub application_name: String,
    pub timestamp: String,
    pub distance: f64,
}

/// JSON output row: the hit plus its similarity score.
#[derive(Debug, Serialize)]
pub struct HitOutput {
    pub image_path: String,
    pub application_name: String,
    pub timestamp: String,
    pub distance: f64,
    pub similarity: f64,
}

impl From<&SearchHit> for HitOutput {
    fn from(hit: &SearchHit) -> Self {
        Self {
            image_path: hit.image_path.clone(),
            application_name: hit.application_name.clone(),
            timestamp: hit.timestamp.clone(),
            distance: hit.distance,
            similarity: similarity(hit.distance),
        }
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Cosine distance to similarity, floored at 0.
pub fn similarity(distance: f64) -> f64 {
    (1.0 - distance).max(0.0)
}

/// Human-readable block for one hit.
pub fn format_hit(rank: usize, hit: &SearchHit) -> String {
    let app = if hit.application_name.is_empty() {
        "unknown application"
    } else {
        hit.application_name.as_str()
    };
    format!(
        "{}. {}\n   {} · {}\n   Similarity: {:.0}%",
        rank,
        hit.image_path,
        app,
        hit.timestamp,
        similarity(hit.distance) * 100.0
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// Run a text search against the smarn HTTP API.
fn do_search(server: &str, query: &str, k: usize, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/search", server);
    let k = k.to_string();

    let resp = match client(60)?
        .get(&url)
        .query(&[("query", query), ("k", k.as_str())])
        .send()
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("smarn-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("smarn-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    let hits: Vec<SearchHit> = match resp.json() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("smarn-cli: failed to parse search response: {}", e);
            std::process::exit(1);
        }
    };

    if json_output {
        let rows: Vec<HitOutput> = hits.iter().map(HitOutput::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if hits.is_empty() {
        eprintln!("No screenshots found for: {}", query);
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}\n", format_hit(i + 1, hit));
    }

    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);

    match client(10)?.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("smarn server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("Entries:      {}", body["entries"].as_i64().unwrap_or(0));
            println!("Database:     {}", body["database"].as_str().unwrap_or("?"));
            println!(
                "Embeddings:   {}",
                body["embedding_backend"].as_str().unwrap_or("?")
            );
        }
        Ok(r) => {
            eprintln!("smarn-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("smarn-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Delete every entry via DELETE /screenshots.
fn do_purge(server: &str, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        eprintln!("smarn-cli: refusing to purge without --yes");
        std::process::exit(2);
    }

    let url = format!("{}/screenshots", server);
    let resp = client(30)?.delete(&url).send()?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        eprintln!("smarn-cli: server returned {}: {}", status, body);
        std::process::exit(1);
    }

    let body: serde_json::Value = resp.json()?;
    println!("Purged {} entries", body["purged"].as_u64().unwrap_or(0));
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Search { query, k, json } => do_search(&server, &query, k, json),
        Commands::Status => do_status(&server),
        Commands::Purge { yes } => do_purge(&server, yes),
    };

    if let Err(e) = result {
        eprintln!("smarn-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_hit(app: &str, distance: f64) -> SearchHit {
        SearchHit {
            image_path: "/home/me/.local/share/smarn/screenshots/smarn_2024-05-01_12-00-00.png"
                .to_string(),
            application_name: app.to_string(),
            timestamp: "2024-05-01T12:00:00.000000Z".to_string(),
            distance,
        }
    }

    #[test]
    fn test_similarity_from_distance() {
        assert_eq!(similarity(0.0), 1.0);
        assert!((similarity(0.25) - 0.75).abs() < f64::EPSILON);
        assert_eq!(similarity(1.5), 0.0);
    }

    #[test]
    fn test_format_hit_shows_rank_path_app_and_percent() {
        let text = format_hit(2, &mock_hit("firefox", 0.12));
        assert!(text.starts_with("2. /home/me/"));
        assert!(text.contains("firefox · 2024-05-01T12:00:00.000000Z"));
        assert!(text.ends_with("Similarity: 88%"), "got: {text}");
    }

    #[test]
    fn test_format_hit_without_application() {
        let text = format_hit(1, &mock_hit("", 0.5));
        assert!(text.contains("unknown application"));
    }

    #[test]
    fn test_hit_deserializes_server_payload() {
        let body = serde_json::json!([{
            "image_path": "/s/a.png",
            "application_name": "code",
            "timestamp": "2024-05-01T12:00:00Z",
            "distance": 0.3
        }]);
        let hits: Vec<SearchHit> = serde_json::from_value(body).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].application_name, "code");
    }

    #[test]
    fn test_json_output_adds_similarity() {
        let row = HitOutput::from(&mock_hit("code", 0.2));
        let value = serde_json::to_value(&row).unwrap();
        assert!((value["similarity"].as_f64().unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(value["distance"], 0.2);
        assert_eq!(value["application_name"], "code");
    }

    #[test]
    fn test_cli_parses_search_flags() {
        let cli = Cli::try_parse_from(["smarn-cli", "search", "red car", "-k", "3", "--json"])
            .unwrap();
        match cli.command {
            Commands::Search { query, k, json } => {
                assert_eq!(query, "red car");
                assert_eq!(k, 3);
                assert!(json);
            }
            other => panic!("Expected search, got {other:?}"),
        }
    }
}
