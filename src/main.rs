//! # habr_digest
//!
//! Collects recent article links from Habr hubs and hands them out as
//! per-subscriber digests, on a wall-clock schedule and on demand.
//!
//! ## Features
//!
//! - Walks hub listing pages newest-first until the lookback window is passed
//! - Reads publication times in ISO, relative ("3 часа назад"), "вчера в
//!   HH:MM" and full-date forms
//! - Keeps every outbound request under one shared sliding-window limit
//! - Throttles on-demand commands per caller
//! - Writes one JSON digest per subscriber per scheduled run
//!
//! ## Usage
//!
//! ```sh
//! habr_digest --config config.yaml serve
//! habr_digest harvest --hub Python --hours 3
//! habr_digest hubs
//! ```
//!
//! ## Architecture
//!
//! 1. **Fetching**: rate-limited GET of one listing page ([`scrapers::fetcher`])
//! 2. **Extraction**: article cards to titles, URLs and times ([`scrapers::extractor`], [`time_resolver`])
//! 3. **Pagination**: stop at the first empty or fully stale page ([`harvest`])
//! 4. **Fan-out**: dedup across a subscriber's hubs and write digests ([`dispatch`], [`outputs`])

use clap::Parser;
use futures::stream::{self, StreamExt};
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod dispatch;
mod harvest;
mod limiter;
mod models;
mod outputs;
mod schedule;
mod scrapers;
mod serve;
mod time_resolver;
mod utils;

use cli::{Cli, Command};
use config::Config;
use dispatch::Dispatcher;
use harvest::Harvester;
use limiter::Limiters;
use models::HubSection;
use scrapers::fetcher::HttpPageFetcher;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    debug!(?args.config, ?args.output_dir, ?args.command, "Parsed CLI arguments");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }

    let limiters = Limiters::from_config(&config.rate_limits)?;
    let fetcher = HttpPageFetcher::new(&config.site, Arc::clone(&limiters.outbound))?;
    let harvester = Harvester::new(
        fetcher,
        config.hub_registry(),
        config.site.origin_url()?,
        &config.harvest,
    );

    match args.command {
        Command::Hubs => {
            let registry = harvester.registry();
            info!(hubs = registry.len(), "Configured hubs");
            for name in registry.names() {
                if let Some(hub) = registry.get(name) {
                    println!("{}\t{}", hub.display_name, hub.slug);
                }
            }
        }
        Command::Harvest { hubs, hours } => {
            let start_time = std::time::Instant::now();
            let sections: Vec<HubSection> = stream::iter(hubs)
                .then(|hub| {
                    let harvester = &harvester;
                    async move {
                        let articles = harvester.harvest(&hub, hours).await;
                        HubSection { hub, articles }
                    }
                })
                .collect()
                .await;
            println!("{}", serde_json::to_string_pretty(&sections)?);
            info!(
                hubs = sections.len(),
                articles = sections.iter().map(|s| s.articles.len()).sum::<usize>(),
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "Harvest complete"
            );
        }
        Command::Serve => {
            if let Err(e) = ensure_writable_dir(&config.output_dir).await {
                error!(
                    path = %config.output_dir,
                    error = %e,
                    "Output directory is not writable (fix perms or choose a different path)"
                );
                return Err(e);
            }
            let entries = config.schedule_entries()?;
            let dispatcher = Arc::new(Dispatcher::new(
                harvester,
                config.subscribers.clone(),
                Arc::clone(&limiters.commands),
                config.output_dir.clone(),
            ));
            info!(
                subscribers = dispatcher.subscribers().len(),
                schedule = entries.len(),
                "habr_digest serving"
            );
            serve::run(dispatcher, limiters.commands, entries).await?;
        }
    }

    Ok(())
}
