use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hivequota::config::{HivequotaConfig, LoggingConfig};
use hivequota::ratelimit::{RateLimiter, Verdict};

/// Operator tool for the Hivequota rate limiter.
#[derive(Debug, Parser)]
#[command(name = "hivequota", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fire concurrent policy checks for one subject/action and report the verdicts
    Drill {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        action: String,
        #[arg(long, default_value_t = 10)]
        attempts: usize,
    },
    /// Print the funnel state of one subject/action as JSON
    Inspect {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        action: String,
    },
}

#[derive(Debug, Default, Serialize)]
struct DrillReport {
    allowed: usize,
    denied: usize,
    errors: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HivequotaConfig::from_file(path)?,
        None => HivequotaConfig::default(),
    };
    init_tracing(&config.logging);

    info!("Starting Hivequota");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = Arc::new(RateLimiter::from_config(&config).await?);
    info!(backend = limiter.backend_name(), "Rate limiter initialized");

    match cli.command {
        Command::Drill {
            subject,
            action,
            attempts,
        } => {
            let report = drill(limiter, &subject, &action, attempts).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Inspect { subject, action } => {
            let state = limiter.funnel_state(&subject, &action).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn drill(limiter: Arc<RateLimiter>, subject: &str, action: &str, attempts: usize) -> DrillReport {
    let tasks: Vec<_> = (0..attempts)
        .map(|_| {
            let limiter = limiter.clone();
            let subject = subject.to_string();
            let action = action.to_string();
            tokio::spawn(async move { limiter.check(&subject, &action).await })
        })
        .collect();

    let mut report = DrillReport::default();
    for outcome in futures::future::join_all(tasks).await {
        match outcome {
            Ok(Ok(Verdict::Allowed)) => report.allowed += 1,
            Ok(Ok(Verdict::Denied)) => report.denied += 1,
            Ok(Err(e)) => {
                warn!(error = %e, "Check failed");
                report.errors += 1;
            }
            Err(e) => {
                warn!(error = %e, "Check task panicked");
                report.errors += 1;
            }
        }
    }
    report
}
