//! Runtime configuration loaded from YAML.
//!
//! Every section has defaults matching the production deployment, so an
//! empty file (or no file at all) yields a working setup with no
//! subscribers. Validation runs once at load time; anything wrong here is
//! fatal at startup.
//!
//! ```yaml
//! site:
//!   origin: https://habr.com
//!   locale: ru
//! rate_limits:
//!   max_outbound_requests: 1
//!   outbound_window_seconds: 1.0
//! schedule:
//!   "08:00": 14
//! subscribers:
//!   - id: alice
//!     hubs: [Python, Linux]
//! ```

use crate::models::HubDescriptor;
use crate::schedule::ScheduleEntry;
use serde::Deserialize;
use crate::utils::slugify;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};
use url::Url;

/// Startup configuration problems. None of these are recoverable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid site origin {origin:?}: {source}")]
    BadOrigin {
        origin: String,
        #[source]
        source: url::ParseError,
    },
    #[error("schedule time {0:?} is not HH:MM")]
    BadScheduleTime(String),
    #[error("schedule entry {time} asks for {hours} hours; allowed range is 1..=24")]
    HoursOutOfRange { time: String, hours: u32 },
    #[error("hub registry is empty")]
    EmptyHubRegistry,
    #[error("subscriber {subscriber:?} selects unknown hub {hub:?}")]
    UnknownHub { subscriber: String, hub: String },
    #[error("{0} must be at least 1")]
    ZeroCapacity(&'static str),
    #[error("{0} must be a positive number of seconds no longer than a year")]
    BadWindow(&'static str),
    #[error("subscriber id {0:?} has no characters usable in a file name")]
    UnusableSubscriberId(String),
    #[error("subscribers {first:?} and {second:?} would write to the same digest file")]
    SubscriberFileClash { first: String, second: String },
}

/// Where and how pages are fetched.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub origin: String,
    pub locale: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            origin: "https://habr.com".to_string(),
            locale: "ru".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
            timeout_secs: 10,
        }
    }
}

impl SiteConfig {
    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin).map_err(|source| ConfigError::BadOrigin {
            origin: self.origin.clone(),
            source,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The two admission-control disciplines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Outbound fetches allowed per `outbound_window_seconds`, all callers together.
    pub max_outbound_requests: usize,
    pub outbound_window_seconds: f64,
    /// On-demand commands allowed per caller per `command_window_seconds`.
    pub max_commands_per_caller: usize,
    pub command_window_seconds: f64,
}

/// Longest window either limiter accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn window_from_secs(secs: f64, field: &'static str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero() && *d <= MAX_WINDOW)
        .ok_or(ConfigError::BadWindow(field))
}

impl RateLimitConfig {
    pub fn outbound_window(&self) -> Result<Duration, ConfigError> {
        window_from_secs(self.outbound_window_seconds, "outbound_window_seconds")
    }

    pub fn command_window(&self) -> Result<Duration, ConfigError> {
        window_from_secs(self.command_window_seconds, "command_window_seconds")
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_outbound_requests: 1,
            outbound_window_seconds: 1.0,
            max_commands_per_caller: 1,
            command_window_seconds: 60.0,
        }
    }
}

/// Pagination knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Hard cap on pages visited per hub per run.
    pub max_pages: u32,
    /// Pause between page fetches, on top of the outbound limiter.
    pub courtesy_delay_ms: u64,
    /// Random extra pause in `0..=courtesy_jitter_ms`.
    pub courtesy_jitter_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            courtesy_delay_ms: 200,
            courtesy_jitter_ms: 0,
        }
    }
}

/// A subscriber and the hubs they follow.
#[derive(Debug, Clone, Deserialize)]
pub struct Subscriber {
    pub id: String,
    #[serde(default)]
    pub hubs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site: SiteConfig,
    pub rate_limits: RateLimitConfig,
    pub harvest: HarvestConfig,
    /// `"HH:MM" -> hours_back`.
    pub schedule: BTreeMap<String, u32>,
    /// Display name -> URL slug.
    pub hubs: BTreeMap<String, String>,
    pub subscribers: Vec<Subscriber>,
    pub output_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        let schedule = [("08:00", 14), ("14:00", 6), ("18:00", 4)]
            .into_iter()
            .map(|(t, h)| (t.to_string(), h))
            .collect();

        let hubs = [
            ("DevOps", "devops"),
            ("IT-инфраструктура", "it-infrastructure"),
            ("Linux", "linux"),
            ("Python", "python"),
            ("Анализ и проектирование систем", "analysis_design"),
            ("Информационная безопасность", "infosecurity"),
            ("Искусственный интеллект", "artificial_intelligence"),
            ("Машинное обучение", "machine_learning"),
            ("Научно-популярное", "popular_science"),
            ("Программирование", "programming"),
            ("Сетевые технологии", "network_technologies"),
            ("Системное администрирование", "sys_admin"),
        ]
        .into_iter()
        .map(|(name, slug)| (name.to_string(), slug.to_string()))
        .collect();

        Self {
            site: SiteConfig::default(),
            rate_limits: RateLimitConfig::default(),
            harvest: HarvestConfig::default(),
            schedule,
            hubs,
            subscribers: Vec::new(),
            output_dir: "digests".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, or fall back to defaults when no path is given.
    #[instrument(level = "info")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_yaml(&text)?
            }
            None => {
                info!("No config file given; using built-in defaults");
                let config = Self::default();
                config.validate()?;
                config
            }
        };
        info!(
            hubs = config.hubs.len(),
            schedule = config.schedule.len(),
            subscribers = config.subscribers.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.site.origin_url()?;

        let limits = &self.rate_limits;
        if limits.max_outbound_requests == 0 {
            return Err(ConfigError::ZeroCapacity("max_outbound_requests"));
        }
        if limits.max_commands_per_caller == 0 {
            return Err(ConfigError::ZeroCapacity("max_commands_per_caller"));
        }
        limits.outbound_window()?;
        limits.command_window()?;

        self.schedule_entries()?;

        if self.hubs.is_empty() {
            return Err(ConfigError::EmptyHubRegistry);
        }
        for sub in &self.subscribers {
            if let Some(hub) = sub.hubs.iter().find(|h| !self.hubs.contains_key(*h)) {
                return Err(ConfigError::UnknownHub {
                    subscriber: sub.id.clone(),
                    hub: hub.clone(),
                });
            }
        }
        self.check_digest_file_names()?;
        Ok(())
    }

    /// Every subscriber must own a distinct, non-empty digest file stem.
    fn check_digest_file_names(&self) -> Result<(), ConfigError> {
        let mut stems: HashMap<String, &str> = HashMap::new();
        for sub in &self.subscribers {
            let stem = slugify(&sub.id);
            if stem.is_empty() {
                return Err(ConfigError::UnusableSubscriberId(sub.id.clone()));
            }
            if let Some(first) = stems.insert(stem, &sub.id) {
                return Err(ConfigError::SubscriberFileClash {
                    first: first.to_string(),
                    second: sub.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// The schedule table as parsed entries, in time-of-day order.
    pub fn schedule_entries(&self) -> Result<Vec<ScheduleEntry>, ConfigError> {
        self.schedule
            .iter()
            .map(|(time, hours)| ScheduleEntry::parse(time, *hours))
            .collect()
    }

    pub fn hub_registry(&self) -> HubRegistry {
        HubRegistry::new(&self.hubs)
    }
}

/// Display name -> [`HubDescriptor`] lookup. Fixed after startup.
#[derive(Debug, Clone, Default)]
pub struct HubRegistry {
    hubs: BTreeMap<String, HubDescriptor>,
}

impl HubRegistry {
    pub fn new(map: &BTreeMap<String, String>) -> Self {
        let hubs = map
            .iter()
            .map(|(name, slug)| (name.clone(), HubDescriptor::new(name.clone(), slug.clone())))
            .collect();
        Self { hubs }
    }

    pub fn get(&self, display_name: &str) -> Option<&HubDescriptor> {
        self.hubs.get(display_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hubs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }
}
