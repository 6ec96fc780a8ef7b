//! Data models shared by the harvesting pipeline.
//!
//! - [`Article`]: one article card scraped from a hub listing page
//! - [`HubDescriptor`]: a hub's display name and URL slug
//! - [`LookbackRequest`]: a hub plus the time window to harvest
//! - [`PageResult`]: what the extractor pulled out of one listing page
//! - [`Digest`]: the per-subscriber bundle handed to the delivery side

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Extra slack subtracted from every lookback threshold.
///
/// Relative tokens such as "3 часа назад" are only accurate to the unit they
/// name, so a boundary article can otherwise miss the window by seconds.
pub const GRACE_MINUTES: i64 = 5;

/// Smallest lookback a request may ask for, in hours.
pub const MIN_HOURS_BACK: u32 = 1;

/// Largest lookback a request may ask for, in hours.
pub const MAX_HOURS_BACK: u32 = 24;

/// An article card found on a hub listing page.
///
/// `url` is the deduplication key for a whole harvesting run. An article with
/// `published_at == None` never leaves the pagination controller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Article {
    /// Headline text.
    pub title: String,
    /// Absolute permalink.
    pub url: String,
    /// The time text exactly as found in the markup, if any.
    pub raw_time: Option<String>,
    /// The resolved publication time in the site's local time.
    pub published_at: Option<NaiveDateTime>,
}

/// A hub as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubDescriptor {
    pub display_name: String,
    pub slug: String,
}

impl HubDescriptor {
    pub fn new(display_name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            slug: slug.into(),
        }
    }
}

/// One "give me the last N hours of this hub" request.
#[derive(Debug, Clone)]
pub struct LookbackRequest {
    pub hub: HubDescriptor,
    /// Always within `MIN_HOURS_BACK..=MAX_HOURS_BACK`.
    pub hours_back: u32,
    pub requested_at: NaiveDateTime,
}

impl LookbackRequest {
    /// Build a request, clamping `hours_back` into the supported range.
    pub fn new(hub: HubDescriptor, hours_back: u32, requested_at: NaiveDateTime) -> Self {
        let clamped = clamp_hours_back(hours_back);
        if clamped != hours_back {
            tracing::debug!(requested = hours_back, clamped, "Clamped lookback hours");
        }
        Self {
            hub,
            hours_back: clamped,
            requested_at,
        }
    }

    /// Oldest publication time still accepted, grace buffer included.
    pub fn threshold(&self) -> NaiveDateTime {
        self.requested_at
            - Duration::hours(i64::from(self.hours_back))
            - Duration::minutes(GRACE_MINUTES)
    }
}

/// Clamp a lookback into `MIN_HOURS_BACK..=MAX_HOURS_BACK`.
pub fn clamp_hours_back(hours_back: u32) -> u32 {
    hours_back.clamp(MIN_HOURS_BACK, MAX_HOURS_BACK)
}

/// The extractor's view of one listing page.
#[derive(Debug, Default, Clone)]
pub struct PageResult {
    /// Candidates in page order, unique by `url`.
    pub articles: Vec<Article>,
    /// Containers dropped because no usable link or title was found.
    pub skipped: usize,
}

impl PageResult {
    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }
}

/// Articles for one hub inside a [`Digest`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubSection {
    pub hub: String,
    pub articles: Vec<Article>,
}

/// Everything one subscriber receives for one run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Digest {
    pub subscriber: String,
    pub hours_back: u32,
    pub generated_at: NaiveDateTime,
    pub hubs: Vec<HubSection>,
}

impl Digest {
    pub fn article_count(&self) -> usize {
        self.hubs.iter().map(|h| h.articles.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_threshold_includes_grace() {
        let req = LookbackRequest::new(HubDescriptor::new("Python", "python"), 3, at(12, 0));
        assert_eq!(req.threshold(), at(8, 55));
    }

    #[test]
    fn test_hours_back_is_clamped() {
        let hub = HubDescriptor::new("Linux", "linux");
        assert_eq!(LookbackRequest::new(hub.clone(), 0, at(12, 0)).hours_back, 1);
        assert_eq!(LookbackRequest::new(hub.clone(), 48, at(12, 0)).hours_back, 24);
        assert_eq!(LookbackRequest::new(hub, 6, at(12, 0)).hours_back, 6);
    }

    #[test]
    fn test_article_serialization() {
        let article = Article {
            title: "Rust в продакшене".to_string(),
            url: "https://habr.com/ru/articles/1/".to_string(),
            raw_time: Some("2 часа назад".to_string()),
            published_at: Some(at(10, 0)),
        };
        let json = serde_json::to_string(&article).unwrap();
        assert!(json.contains("https://habr.com/ru/articles/1/"));
        assert!(json.contains("2024-01-10T10:00:00"));
    }

    #[test]
    fn test_digest_article_count() {
        let digest = Digest {
            subscriber: "alice".to_string(),
            hours_back: 4,
            generated_at: at(18, 0),
            hubs: vec![
                HubSection { hub: "Linux".to_string(), articles: vec![] },
                HubSection {
                    hub: "Python".to_string(),
                    articles: vec![Article {
                        title: "Asyncio".to_string(),
                        url: "https://habr.com/ru/articles/2/".to_string(),
                        raw_time: None,
                        published_at: Some(at(17, 0)),
                    }],
                },
            ],
        };
        assert_eq!(digest.article_count(), 1);
    }
}
