//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `start` (default) -- run the proxy server
//! - `check <url>` -- run URL validation and DNS checks without fetching
//! - `status` -- query a running instance's health endpoint
//! - `config show|path` -- inspect the effective configuration
//! - `version` -- print version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::config::{self, ImgshieldConfig, DEFAULT_PORT};
use crate::media::FetchError;
use crate::server::ServerConfig;
use crate::ssrf::validate_url;

/// SSRF-hardened image fetch proxy.
#[derive(Parser, Debug)]
#[command(
    name = "imgshield",
    version = env!("CARGO_PKG_VERSION"),
    about = "imgshield - relay public images without exposing the internal network"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default when no subcommand is given).
    Start,

    /// Validate a URL and resolve its host the way the proxy would, without fetching it.
    Check {
        /// Absolute http(s) URL to check.
        url: String,
    },

    /// Query a running instance's health endpoint.
    Status {
        /// Port of the running instance (default: from config or 8787).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective settings (file plus environment).
    Show,
    /// Print the config file path.
    Path,
}

/// Run the `check <url>` subcommand. Exits non-zero when the URL is rejected.
pub async fn handle_check(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    let fetcher = ServerConfig::from_config(&cfg).fetcher;

    let outcome = match validate_url(url) {
        Ok(target) => fetcher
            .preflight(url)
            .await
            .map(|resolved| (target, resolved)),
        Err(e) => Err(FetchError::from(e)),
    };

    match outcome {
        Ok((target, resolved)) => {
            println!("Allowed: {}", target.url());
            println!("  Host:       {}", resolved.host());
            let addrs: Vec<String> = resolved.addrs().iter().map(|a| a.to_string()).collect();
            println!("  Addresses:  {}", addrs.join(", "));
            println!("  Connect to: {}", resolved.socket_addr(target.port()));
            Ok(())
        }
        Err(err) => {
            eprintln!("Rejected: {} ({})", err.category(), err);
            eprintln!("  Proxy would answer HTTP {}", err.status_code().as_u16());
            std::process::exit(1);
        }
    }
}

/// Run the `status` subcommand -- connect to a running instance's health endpoint.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to imgshield at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: imgshield start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;

    println!("imgshield status");
    println!("================");
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:  {}", version);
    }
    if let Some(uptime) = body.get("uptimeSeconds").and_then(|v| v.as_i64()) {
        println!("  Uptime:   {}", format_duration(uptime));
    }
    println!("  Address:  {}:{}", host, port);
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  Status:   {}", status);
    }

    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config()?;
    print!("{}", describe_config(&cfg));
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("imgshield {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn describe_config(cfg: &ImgshieldConfig) -> String {
    let origins = if cfg.policy.allowed_origins.is_empty() {
        "(none)".to_string()
    } else {
        cfg.policy.allowed_origins.join(", ")
    };
    let rate = if cfg.rate_limit.enabled {
        format!(
            "{} requests / {}s per client{}",
            cfg.rate_limit.max_requests,
            cfg.rate_limit.window.as_secs(),
            if cfg.rate_limit.trust_proxy_headers {
                " (proxy headers trusted)"
            } else {
                ""
            }
        )
    } else {
        "disabled".to_string()
    };

    let mut out = String::new();
    out.push_str(&format!("listen:          {}:{}\n", cfg.bind, cfg.port));
    out.push_str(&format!("max bytes:       {}\n", cfg.fetch.max_bytes));
    out.push_str(&format!("timeout:         {}ms\n", cfg.fetch.timeout_ms));
    out.push_str(&format!("user agent:      {}\n", cfg.user_agent));
    out.push_str(&format!("allowed origins: {}\n", origins));
    out.push_str(&format!("verbose errors:  {}\n", cfg.policy.verbose_errors));
    out.push_str(&format!("host binding:    {}\n", cfg.policy.host_binding));
    out.push_str(&format!("rate limit:      {}\n", rate));
    out.push_str(&format!("dev mode:        {}\n", cfg.dev_mode));
    out
}

fn resolve_port(explicit: Option<u16>) -> u16 {
    if let Some(p) = explicit {
        return p;
    }
    config::load_config()
        .map(|cfg| cfg.port)
        .unwrap_or(DEFAULT_PORT)
}

/// Format seconds into a human-readable duration string.
fn format_duration(seconds: i64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
