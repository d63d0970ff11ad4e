use anyhow::Context;
use cap::logging::{setup_logging, LogFormat, LoggingOptions};
use cap::recorder::Sinks;
use cap::{Blueprint, CapConfig, Supervisor};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built ",
    env!("CAP_BUILD_TIME"),
    ")"
);

/// Mock HTTP servers that answer from configured responses and record every request.
#[derive(Debug, Parser)]
#[command(name = "cap", version, long_version = LONG_VERSION, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "cap.yml")]
    config: PathBuf,

    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Operational log format
    #[arg(short = 'f', long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Extra file receiving operational logs (repeatable)
    #[arg(short, long = "output")]
    outputs: Vec<PathBuf>,

    /// Check the configuration and exit
    #[arg(long)]
    validate: bool,

    /// Seconds granted to in-flight requests at shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&LoggingOptions {
        level: cli.log_level.clone(),
        format: cli.log_format,
        outputs: cli.outputs.clone(),
    })?;
    tracing::info!("Starting cap v{}", LONG_VERSION);

    let config = CapConfig::load_from_file(&cli.config)
        .with_context(|| format!("Config file '{}' reading error", cli.config.display()))?;
    let blueprint = Blueprint::build(&config).context("Invalid configuration")?;
    tracing::info!(
        servers = blueprint.servers.len(),
        requests = blueprint.requests.len(),
        responses = blueprint.responses.len(),
        "Configuration loaded"
    );

    if cli.validate {
        for server in &blueprint.servers {
            println!(
                "{}: {} ({} rules, default response '{}')",
                server.name(),
                server.base_url,
                server.rules.len(),
                server.default_response.id
            );
        }
        return Ok(());
    }

    let supervisor = Supervisor::start(
        &blueprint,
        Sinks::stdout(),
        Duration::from_secs(cli.shutdown_timeout),
    )
    .await;

    if !supervisor.running() {
        supervisor.shutdown().await;
        anyhow::bail!("No server could be started");
    }

    shutdown_signal().await;
    supervisor.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
