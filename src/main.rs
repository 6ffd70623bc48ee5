use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil::broadcast::{
    Dispatcher, InMemoryDirectory, LogTransport, Message, RunCompletion,
};
use vigil::config::{LogFormat, LoggingConfig, VigilConfig};
use vigil::ratelimit::{Admission, AdmissionGuard, Limiter, Rejection};
use vigil::schedule::Trigger;

/// Admission control and scheduled broadcast service
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version)]
struct Cli {
    /// YAML configuration file (VIGIL__* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broadcast trigger until Ctrl+C or SIGTERM (default)
    Run,
    /// Run one broadcast immediately and print its summary
    SendNow,
    /// Show which admission rule applies to a path
    Resolve {
        /// Request path, e.g. /api/v1/auth/login
        path: String,
    },
    /// Replay requests through a fresh limiter and print each decision
    Simulate {
        /// Request path
        path: String,
        /// Client identity
        #[arg(long, default_value = "127.0.0.1")]
        identity: String,
        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = VigilConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &cli.config {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Configuration loaded from defaults and environment"),
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::SendNow => send_now(config).await,
        Command::Resolve { path } => resolve(&config, &path),
        Command::Simulate {
            path,
            identity,
            requests,
        } => simulate(&config, &path, &identity, requests).await,
    }
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn build_dispatcher(config: &VigilConfig) -> anyhow::Result<Dispatcher> {
    let directory = match &config.broadcast.recipients_file {
        Some(path) => InMemoryDirectory::from_file(path)
            .with_context(|| format!("Failed to load roster {}", path.display()))?,
        None => {
            warn!("No recipients_file configured, broadcasts will reach nobody");
            InMemoryDirectory::default()
        }
    };
    let directory = Arc::new(directory);
    info!(recipients = directory.len(), "Recipient roster loaded");

    Ok(Dispatcher::new(
        directory.clone(),
        directory,
        Arc::new(LogTransport::new()),
        Message::new(config.broadcast.message.clone()),
    )
    .with_pacing(config.broadcast.pacing()))
}

async fn run(config: VigilConfig) -> anyhow::Result<()> {
    info!("Starting Vigil broadcast service");

    let dispatcher = Arc::new(build_dispatcher(&config)?);
    let shutdown = CancellationToken::new();
    let trigger = Trigger::spawn(dispatcher, config.broadcast.trigger_config(), shutdown)?;

    shutdown_signal().await;
    trigger.shutdown().await;

    info!("Vigil broadcast service stopped");
    Ok(())
}

async fn send_now(config: VigilConfig) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&config)?;
    let cancel = CancellationToken::new();

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    let result = dispatcher.run_until_cancelled(&cancel).await;
    watcher.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.completion == RunCompletion::SourceUnavailable {
        bail!("recipient source unavailable, nothing was sent");
    }
    Ok(())
}

fn resolve(config: &VigilConfig, path: &str) -> anyhow::Result<()> {
    let table = config.admission.rule_table()?;
    let (rule, matched) = table.explain(path);

    println!(
        "{} -> {} per {}s ({})",
        path, rule.limit, rule.window_secs, matched
    );
    println!(
        "global -> {} per {}s",
        config.admission.global.limit, config.admission.global.window_secs
    );
    Ok(())
}

async fn simulate(config: &VigilConfig, path: &str, identity: &str, requests: u32) -> anyhow::Result<()> {
    let limiter = Limiter::new(config.admission.rule_table()?, config.admission.global)
        .with_idle_ttl(config.admission.idle_ttl());
    let guard = AdmissionGuard::with_settings(Arc::new(limiter), config.admission.guard_settings());

    for attempt in 1..=requests {
        match guard.admit(Some(identity), path).await {
            Admission::Rejected(rejection) => println!(
                "{:>3}: {} Retry-After: {} {}",
                attempt,
                Rejection::STATUS,
                rejection.retry_after_header(),
                rejection.body()
            ),
            admission => println!("{:>3}: {:?}", attempt, admission),
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
