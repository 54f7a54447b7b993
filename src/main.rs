use clap::Parser;
use tracing::{error, info, warn};

use imgshield::cli::{self, Cli, Command, ConfigCommand};
use imgshield::config::{self, ImgshieldConfig};
use imgshield::logging::{self, targets};
use imgshield::server::{self, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Check { url }) => cli::handle_check(&url).await,

        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Configuration error: {e}");
            return Err(e.into());
        }
    };
    init_logging(&cfg)?;
    log_startup_banner(&cfg);

    let handle = server::run_server_with_config(ServerConfig::from_config(&cfg)).await?;
    info!(target: targets::HTTP, "imgshield listening on {}", handle.base_url());

    let reason = await_shutdown_trigger().await;
    info!("Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!("imgshield shut down");
    Ok(())
}

/// Development logging when IMGSHIELD_DEV is set, JSON otherwise.
fn init_logging(cfg: &ImgshieldConfig) -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if cfg.dev_mode {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

fn log_startup_banner(cfg: &ImgshieldConfig) {
    info!(
        target: targets::CONFIG,
        version = env!("CARGO_PKG_VERSION"),
        bind = %cfg.bind,
        port = cfg.port,
        max_bytes = cfg.fetch.max_bytes,
        timeout_ms = cfg.fetch.timeout_ms,
        host_binding = %cfg.policy.host_binding,
        allowed_origins = cfg.policy.allowed_origins.len(),
        rate_limit = cfg.rate_limit.enabled,
        "starting imgshield"
    );
    if cfg.policy.verbose_errors {
        warn!(
            target: targets::CONFIG,
            "verbose errors enabled; rejection details are returned to callers"
        );
    }
    if !cfg.bind.is_loopback() && cfg.policy.allowed_origins.is_empty() {
        warn!(
            target: targets::CONFIG,
            "listening on a non-loopback address with no allowed origins; browsers cannot read responses"
        );
    }
}

/// Wait for Ctrl+C or SIGTERM.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            ctrl_c_only().await
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    ctrl_c_only().await
}

async fn ctrl_c_only() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            error!("Failed to install Ctrl+C handler: {}; shutting down", e);
            "signal-handler-error"
        }
    }
}
