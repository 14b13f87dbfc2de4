//! Bulwark CLI
//!
//! Drives the resilience engine against HTTP JSON endpoints: inspect the
//! effective configuration, fetch through the cache/breaker/retry pipeline,
//! or poll endpoints while printing health reports.

mod http;
mod logging;

use anyhow::Context;
use bulwark_resilience::{
    EngineConfig, FileDurableTier, HttpRetryClassifier, RequestOptions, ResilienceEngine,
};
use clap::{ArgAction, Parser, Subcommand};
use http::{HttpFetcher, HttpProbe};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about = "Resilient fetching and health monitoring")]
struct Cli {
    /// JSON config file
    #[arg(long, short, global = true, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the validated configuration and any repairs
    Config,

    /// GET each URL through the engine
    Fetch {
        /// Endpoints returning JSON
        #[arg(required = true)]
        urls: Vec<String>,

        /// Persist results here so stale values survive restarts
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Fetch every URL this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },

    /// Poll URLs and print a health report per tick
    Monitor {
        /// Endpoints returning JSON
        #[arg(required = true)]
        urls: Vec<String>,

        /// Number of health checks to run
        #[arg(long, default_value_t = 3)]
        ticks: u32,
    },
}

#[derive(Serialize)]
struct ConfigOutput<'a> {
    config: &'a EngineConfig,
    repairs: &'a [bulwark_resilience::ConfigRepair],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FetchLine<'a> {
    url: &'a str,
    source: bulwark_resilience::Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<bulwark_resilience::FallbackReason>,
    attempts: u32,
    value: &'a serde_json::Value,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn build_engine(config: EngineConfig, cache_dir: Option<&Path>) -> anyhow::Result<ResilienceEngine> {
    let mut builder = ResilienceEngine::builder().with_config(config);
    if let Some(dir) = cache_dir {
        let tier = FileDurableTier::open(dir)
            .await
            .with_context(|| format!("opening cache directory {}", dir.display()))?;
        builder = builder.with_durable(Arc::new(tier));
    }
    Ok(builder.build().await?)
}

fn fetcher_for(config: &EngineConfig) -> anyhow::Result<HttpFetcher> {
    // the engine enforces attempt timeouts; this only bounds hung connections
    let timeout = config
        .attempt_timeout()
        .unwrap_or(Duration::from_secs(30))
        .saturating_mul(2);
    HttpFetcher::new(timeout).context("building HTTP client")
}

async fn fetch_through(
    engine: &ResilienceEngine,
    fetcher: &HttpFetcher,
    url: &str,
) -> bulwark_resilience::Fetched<serde_json::Value> {
    engine
        .request(
            url,
            |_| fetcher.get_json(url),
            RequestOptions::new().with_retry_if(HttpRetryClassifier),
        )
        .await
}

fn cmd_config(config: EngineConfig) -> anyhow::Result<()> {
    let (config, repairs) = config.validate()?;
    let output = ConfigOutput {
        config: &config,
        repairs: &repairs,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_fetch(
    config: EngineConfig,
    urls: &[String],
    cache_dir: Option<&Path>,
    repeat: u32,
) -> anyhow::Result<()> {
    let fetcher = fetcher_for(&config)?;
    let engine = build_engine(config, cache_dir).await?;
    engine.start().await;

    for round in 1..=repeat.max(1) {
        tracing::debug!(round, "Fetch round");
        for url in urls {
            let fetched = fetch_through(&engine, &fetcher, url).await;
            let line = FetchLine {
                url,
                source: fetched.source,
                reason: fetched.reason,
                attempts: fetched.attempts,
                value: &fetched.value,
            };
            println!("{}", serde_json::to_string(&line)?);
        }
    }

    engine.shutdown().await;
    Ok(())
}

async fn cmd_monitor(config: EngineConfig, urls: &[String], ticks: u32) -> anyhow::Result<()> {
    let fetcher = fetcher_for(&config)?;
    let slow_after = config.latency_degraded();
    let interval = config.health_interval();
    let auto_recovery = config.auto_recovery_enabled;
    let engine = build_engine(config, None).await?;

    for url in urls {
        engine
            .health()
            .register_probe(
                format!("http:{url}"),
                HttpProbe::new(fetcher.clone(), url.clone(), slow_after),
            )
            .await;
        engine.watch_endpoint(url).await;
    }

    let ticks = ticks.max(1);
    for tick in 1..=ticks {
        for url in urls {
            fetch_through(&engine, &fetcher, url).await;
        }

        let report = engine.check_health().await;
        println!("{}", serde_json::to_string_pretty(&*report)?);

        if auto_recovery && !report.is_healthy() {
            let summary = engine.attempt_recovery(&report).await;
            tracing::info!(
                recovered = ?summary.recovered,
                failed = summary.failed.len(),
                unhandled = ?summary.unhandled,
                "Recovery pass"
            );
        }

        if tick < ticks {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.json_logs)?;

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Config => cmd_config(config),
        Command::Fetch {
            urls,
            cache_dir,
            repeat,
        } => cmd_fetch(config, &urls, cache_dir.as_deref(), repeat).await,
        Command::Monitor { urls, ticks } => cmd_monitor(config, &urls, ticks).await,
    }
}
