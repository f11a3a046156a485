//! zenfeed daemon entry point

use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zenfeed::config::Config;
use zenfeed::engine::Engine;
use zenfeed::error::Error;
use zenfeed::ingest::JsonFeedParser;
use zenfeed::llm::OpenAiClient;
use zenfeed::rules::{LogChannel, NotifyChannel, WebhookChannel};
use zenfeed::schedule::{ShutdownHandle, SystemClock};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_CORRUPTION: u8 = 2;
const EXIT_FORCED: u8 = 3;

#[derive(Parser)]
#[command(name = "zenfeed")]
#[command(version, about = "Feed ingestion engine with LLM enrichment", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "zenfeed.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return EXIT_CONFIG;
        }
    };
    let shutdown_timeout = Duration::from_secs(config.scheduler.shutdown_timeout_secs);

    let llm = match OpenAiClient::new(&config.llm) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "failed to build LLM client");
            return EXIT_CONFIG;
        }
    };

    let channels = build_channels(&config);
    let engine = match Engine::open(config, llm, channels, Arc::new(SystemClock)) {
        Ok(engine) => Arc::new(engine),
        Err(e @ (Error::Corruption(_) | Error::Kv(_))) => {
            error!(error = %e, "storage unrecoverable");
            return EXIT_CORRUPTION;
        }
        Err(e) => {
            error!(error = %e, "failed to open engine");
            return EXIT_CONFIG;
        }
    };

    let parser = Arc::new(JsonFeedParser::new(engine.http_context().clone()));
    let handle = ShutdownHandle::new();
    engine.start(parser, handle.token());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    handle.shutdown();

    match engine.stop(shutdown_timeout).await {
        Ok(true) => EXIT_OK,
        Ok(false) => {
            error!("jobs did not stop within the grace period");
            EXIT_FORCED
        }
        Err(e) => {
            error!(error = %e, "shutdown failed");
            EXIT_FORCED
        }
    }
}

/// One channel per distinct name in the rule list: URLs become webhooks,
/// anything else logs.
fn build_channels(config: &Config) -> HashMap<String, Arc<dyn NotifyChannel>> {
    let client = reqwest::Client::new();
    let mut channels: HashMap<String, Arc<dyn NotifyChannel>> = HashMap::new();
    for rule in &config.rules {
        let name = rule.channel.clone();
        channels.entry(name.clone()).or_insert_with(|| {
            if name.starts_with("http://") || name.starts_with("https://") {
                Arc::new(WebhookChannel::new(client.clone(), name))
            } else {
                Arc::new(LogChannel)
            }
        });
    }
    channels
}
