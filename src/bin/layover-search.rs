use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use layover_party::{App, AppConfig, SearchRequest};

/// Search round trips ranked by time spent on the ground.
#[derive(Debug, Parser)]
#[command(name = "layover-search", version)]
struct Args {
    /// Origin IATA code
    #[arg(long)]
    origin: String,

    /// Destination IATA code
    #[arg(long)]
    dest: String,

    /// Outbound date, YYYY-MM-DD
    #[arg(long)]
    date: NaiveDate,

    /// Return date, YYYY-MM-DD
    #[arg(long)]
    return_date: NaiveDate,

    #[arg(long, default_value_t = 1)]
    adults: u32,

    /// How long the provider may spend collecting results
    #[arg(long)]
    wait_ms: Option<u32>,

    #[arg(long, default_value_t = 1)]
    page: usize,

    /// Caller identity used for per-user quotas
    #[arg(long, env = "LAYOVER_USER", default_value = "cli")]
    user: String,

    /// Local airports JSON, instead of downloading it
    #[arg(long)]
    airports: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("layover_party=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = AppConfig::load().context("loading configuration")?;
    if args.airports.is_some() {
        config.airports.path = args.airports.clone();
    }
    let wait_ms = args.wait_ms.unwrap_or(config.search.default_wait_ms);

    let app = App::start(config).await.context("starting services")?;

    let request = SearchRequest::new(args.origin, args.dest, args.date, args.return_date)
        .with_adults(args.adults)
        .with_max_wait_ms(wait_ms)
        .with_page(args.page);

    let outcome = app.search(&args.user, &request).await;

    // Persist the cache even when the search failed
    if let Err(e) = app.shutdown() {
        error!(error = %e, "failed to persist cache snapshot");
    }

    let results = match outcome {
        Ok(results) => results,
        Err(e) => {
            if let Some(secs) = e.retry_after_secs() {
                error!(retry_after_secs = secs, "search rate limited");
            }
            return Err(anyhow::Error::new(e).context("search failed"));
        }
    };

    info!(results = results.len(), page = request.page, "search complete");
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
