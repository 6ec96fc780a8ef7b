//! Per-hub pagination with the lookback filter.
//!
//! [`Harvester::harvest_hub`] walks listing pages 1, 2, ... and stops at the
//! first of:
//!
//! - a page with no candidates (end of listing, or a failed fetch),
//! - a non-empty page where nothing was fresh enough to keep (listings are
//!   newest-first, so later pages are older still),
//! - the page cap.
//!
//! Undated candidates are never kept: guessing a time could deliver the same
//! article twice once its time becomes readable on a later run.

use crate::config::{HarvestConfig, HubRegistry};
use crate::models::{Article, LookbackRequest, PageResult};
use crate::scrapers::PageSource;
use crate::scrapers::extractor::extract;
use crate::utils::local_now;
use chrono::NaiveDateTime;
use rand::{Rng, rng};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Counters for one hub run, logged when the run ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    pub pages: u32,
    pub failed_fetches: u32,
    pub kept: usize,
    pub stale: usize,
    pub undated: usize,
    pub skipped: usize,
}

/// Articles plus counters for one hub run.
#[derive(Debug, Default, Clone)]
pub struct HubHarvest {
    pub articles: Vec<Article>,
    pub stats: HarvestStats,
}

/// Drives fetch + extract + filter for any [`PageSource`].
#[derive(Debug)]
pub struct Harvester<S> {
    source: S,
    registry: HubRegistry,
    origin: Url,
    max_pages: u32,
    courtesy_delay: Duration,
    courtesy_jitter_ms: u64,
    clock: fn() -> NaiveDateTime,
}

impl<S: PageSource> Harvester<S> {
    pub fn new(source: S, registry: HubRegistry, origin: Url, cfg: &HarvestConfig) -> Self {
        Self {
            source,
            registry,
            origin,
            max_pages: cfg.max_pages,
            courtesy_delay: Duration::from_millis(cfg.courtesy_delay_ms),
            courtesy_jitter_ms: cfg.courtesy_jitter_ms,
            clock: local_now,
        }
    }

    /// Replace the wall clock used for thresholds and relative times.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// Articles from `hub_name` published within the last `hours_back` hours.
    ///
    /// # Arguments
    ///
    /// * `hub_name` - Display name of a configured hub, e.g. `"Python"`
    /// * `hours_back` - Lookback in hours; clamped to 1..=24
    ///
    /// # Returns
    ///
    /// The kept articles in page order, without repeats. An unknown hub
    /// yields an empty list.
    #[instrument(level = "info", skip(self))]
    pub async fn harvest(&self, hub_name: &str, hours_back: u32) -> Vec<Article> {
        let Some(hub) = self.registry.get(hub_name) else {
            warn!(hub = hub_name, "Unknown hub; nothing to harvest");
            return Vec::new();
        };
        let lookback = LookbackRequest::new(hub.clone(), hours_back, (self.clock)());
        self.harvest_hub(&lookback).await
    }

    pub async fn harvest_hub(&self, lookback: &LookbackRequest) -> Vec<Article> {
        self.run_hub(lookback).await.articles
    }

    /// Walk the hub's listing pages newest first until a stop rule applies.
    ///
    /// Pagination ends at an empty page, at a non-empty page where nothing
    /// was kept, or at the page cap. A failed fetch counts as an empty page.
    ///
    /// # Arguments
    ///
    /// * `lookback` - Hub and threshold to harvest against
    ///
    /// # Returns
    ///
    /// A [`HubHarvest`] with the kept articles and the page, skip and
    /// failure counts of the walk.
    #[instrument(level = "info", skip_all, fields(hub = %lookback.hub.display_name, hours_back = lookback.hours_back))]
    pub async fn run_hub(&self, lookback: &LookbackRequest) -> HubHarvest {
        let threshold = lookback.threshold();
        let mut stats = HarvestStats::default();
        let mut seen = HashSet::new();
        let mut articles = Vec::new();

        for page in 1..=self.max_pages {
            if page > 1 {
                self.courtesy_pause().await;
            }
            stats.pages += 1;

            let result = match self.source.fetch_page(&lookback.hub, page).await {
                Ok(html) => extract(&html, &self.origin, (self.clock)()),
                Err(e) => {
                    warn!(page, error = %e, "Page fetch failed; treating as empty");
                    stats.failed_fetches += 1;
                    PageResult::default()
                }
            };
            stats.skipped += result.skipped;

            if result.is_empty() {
                info!(page, "No articles on page; stopping");
                break;
            }

            let mut kept_on_page = 0usize;
            for article in result.articles {
                match article.published_at {
                    None => {
                        stats.undated += 1;
                        debug!(url = %article.url, raw_time = ?article.raw_time, "Dropping undated article");
                    }
                    Some(published) if published >= threshold => {
                        kept_on_page += 1;
                        if seen.insert(article.url.clone()) {
                            articles.push(article);
                        }
                    }
                    Some(published) => {
                        stats.stale += 1;
                        debug!(url = %article.url, %published, %threshold, "Article older than threshold");
                    }
                }
            }

            if kept_on_page == 0 {
                info!(page, "Nothing fresh on page; stopping");
                break;
            }
            if page == self.max_pages {
                warn!(page, "Page cap reached");
            }
        }

        stats.kept = articles.len();
        if stats.undated > 0 {
            warn!(undated = stats.undated, "Articles without a readable publication time were dropped");
        }
        info!(
            pages = stats.pages,
            kept = stats.kept,
            stale = stats.stale,
            skipped = stats.skipped,
            failed_fetches = stats.failed_fetches,
            "Hub harvest complete"
        );
        HubHarvest { articles, stats }
    }

    async fn courtesy_pause(&self) {
        let jitter = if self.courtesy_jitter_ms > 0 {
            rng().random_range(0..=self.courtesy_jitter_ms)
        } else {
            0
        };
        let pause = self.courtesy_delay + Duration::from_millis(jitter);
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }
}
