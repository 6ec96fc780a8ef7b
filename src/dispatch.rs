//! Fan-out of harvests to subscribers, scheduled and on demand.
//!
//! Each subscriber gets one [`Digest`] per run. Hubs are visited in sorted
//! order and an article already listed under an earlier hub is not repeated
//! under a later one. Inside a hub, articles are newest first.
//!
//! On-demand requests go through the per-caller command guard before any
//! page is fetched. Both paths share the harvester, and therefore the one
//! outbound limiter.

use crate::config::Subscriber;
use crate::harvest::Harvester;
use crate::limiter::KeyedLimiter;
use crate::models::{Digest, HubSection, clamp_hours_back};
use crate::outputs::json::write_digest;
use crate::schedule::ScheduledJob;
use crate::scrapers::PageSource;
use crate::utils::{format_wait, local_now};
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Lookback used when a command gives no usable hour count.
pub const DEFAULT_COMMAND_HOURS: u32 = 1;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{}", format_wait(*.wait))]
    Throttled { wait: Duration },
    #[error("unknown subscriber {0:?}")]
    UnknownSubscriber(String),
}

/// A parsed line from the command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    News { caller: String, hours_back: u32 },
}

/// Parse `news <caller> [hours]`.
///
/// A missing or unreadable hour count falls back to [`DEFAULT_COMMAND_HOURS`].
/// Out-of-range counts are clamped to 1..=24.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(cmd) if cmd.eq_ignore_ascii_case("news") => {}
        Some(other) => return Err(format!("unknown command {other:?}")),
        None => return Err("empty command".to_string()),
    }
    let caller = parts
        .next()
        .ok_or_else(|| "usage: news <caller> [hours]".to_string())?
        .to_string();
    let hours_back = match parts.next() {
        None => DEFAULT_COMMAND_HOURS,
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) => clamp_hours_back(n),
            Err(_) => {
                warn!(raw, "Unreadable hour count; using default");
                DEFAULT_COMMAND_HOURS
            }
        },
    };
    Ok(Command::News { caller, hours_back })
}

#[derive(Debug)]
pub struct Dispatcher<S> {
    harvester: Harvester<S>,
    subscribers: Vec<Subscriber>,
    commands: Arc<KeyedLimiter<String>>,
    output_dir: String,
}

impl<S: PageSource> Dispatcher<S> {
    pub fn new(
        harvester: Harvester<S>,
        subscribers: Vec<Subscriber>,
        commands: Arc<KeyedLimiter<String>>,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            harvester,
            subscribers,
            commands,
            output_dir: output_dir.into(),
        }
    }

    #[cfg(test)]
    pub fn harvester(&self) -> &Harvester<S> {
        &self.harvester
    }

    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    /// Harvest every hub in `hubs` and assemble one digest.
    #[instrument(level = "info", skip(self, hubs), fields(hubs = hubs.len()))]
    pub async fn digest_for(&self, subscriber: &str, hubs: &[String], hours_back: u32) -> Digest {
        let mut ordered: Vec<&String> = hubs.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut seen = HashSet::new();
        let mut sections = Vec::new();
        for hub in ordered {
            let mut articles = self.harvester.harvest(hub, hours_back).await;
            articles.retain(|a| seen.insert(a.url.clone()));
            if articles.is_empty() {
                continue;
            }
            articles.sort_by_key(|a| Reverse(a.published_at));
            sections.push(HubSection {
                hub: hub.clone(),
                articles,
            });
        }

        Digest {
            subscriber: subscriber.to_string(),
            hours_back: clamp_hours_back(hours_back),
            generated_at: local_now(),
            hubs: sections,
        }
    }

    /// One scheduled run: a digest for every subscriber, written to disk.
    #[instrument(level = "info", skip(self), fields(subscribers = self.subscribers.len()))]
    pub async fn run_scheduled(&self, hours_back: u32) {
        let mut written = 0usize;
        for sub in &self.subscribers {
            if sub.hubs.is_empty() {
                info!(subscriber = %sub.id, "No hubs selected; skipping");
                continue;
            }
            let digest = self.digest_for(&sub.id, &sub.hubs, hours_back).await;
            if digest.article_count() == 0 {
                info!(subscriber = %sub.id, "Nothing new for subscriber");
                continue;
            }
            match write_digest(&digest, &self.output_dir).await {
                Ok(_) => written += 1,
                Err(e) => error!(subscriber = %sub.id, error = %e, "Failed to write digest"),
            }
        }
        info!(written, "Scheduled run complete");
    }

    /// Handle one on-demand request from `caller`.
    ///
    /// The command guard is consulted before anything else, so a throttled
    /// caller costs no outbound requests.
    ///
    /// # Arguments
    ///
    /// * `caller` - Subscriber id; also the command guard key
    /// * `hours_back` - Lookback in hours; clamped to 1..=24
    ///
    /// # Returns
    ///
    /// The caller's digest, [`DispatchError::Throttled`] with the wait, or
    /// [`DispatchError::UnknownSubscriber`]. An unknown caller still uses up
    /// an admission in its window.
    #[instrument(level = "info", skip(self))]
    pub async fn news(&self, caller: &str, hours_back: u32) -> Result<Digest, DispatchError> {
        let key = caller.to_string();
        if !self.commands.admit(&key) {
            let wait = self.commands.wait_time(&key);
            warn!(wait_ms = wait.as_millis() as u64, "Command throttled");
            return Err(DispatchError::Throttled { wait });
        }

        let sub = self
            .subscribers
            .iter()
            .find(|s| s.id == caller)
            .ok_or_else(|| DispatchError::UnknownSubscriber(caller.to_string()))?;

        let digest = self.digest_for(&sub.id, &sub.hubs, hours_back).await;
        info!(articles = digest.article_count(), "On-demand digest ready");
        Ok(digest)
    }
}

impl<S: PageSource> ScheduledJob for Dispatcher<S> {
    async fn run(&self, hours_back: u32) {
        self.run_scheduled(hours_back).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::tests::{ScriptedSource, card, harvester, page};

    fn subscriber(id: &str, hubs: &[&str]) -> Subscriber {
        Subscriber {
            id: id.to_string(),
            hubs: hubs.iter().map(|h| h.to_string()).collect(),
        }
    }

    fn dispatcher(source: ScriptedSource, output_dir: &str) -> Dispatcher<ScriptedSource> {
        Dispatcher::new(
            harvester(source, 50),
            vec![
                subscriber("alice", &["Python", "Linux"]),
                subscriber("bob", &[]),
            ],
            Arc::new(KeyedLimiter::new(1, Duration::from_secs(60))),
            output_dir,
        )
    }

    fn shared_source() -> ScriptedSource {
        ScriptedSource::default()
            .with_hub(
                "linux",
                vec![Some(page(&[
                    card(7, Some("3 часа назад")),
                    card(1, Some("1 час назад")),
                ]))],
            )
            .with_hub(
                "python",
                vec![Some(page(&[
                    card(1, Some("1 час назад")),
                    card(2, Some("10 минут назад")),
                ]))],
            )
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("news alice 5"),
            Ok(Command::News { caller: "alice".into(), hours_back: 5 })
        );
        assert_eq!(
            parse_command("  NEWS bob  "),
            Ok(Command::News { caller: "bob".into(), hours_back: 1 })
        );
        assert_eq!(
            parse_command("news bob lots"),
            Ok(Command::News { caller: "bob".into(), hours_back: 1 })
        );
        assert_eq!(
            parse_command("news bob 99"),
            Ok(Command::News { caller: "bob".into(), hours_back: 24 })
        );
        assert!(parse_command("news").is_err());
        assert!(parse_command("weather alice").is_err());
        assert!(parse_command("").is_err());
    }

    #[tokio::test]
    async fn test_digest_dedups_across_hubs_in_sorted_order() {
        let d = dispatcher(shared_source(), "unused");
        let hubs = vec!["Python".to_string(), "Linux".to_string()];
        let digest = d.digest_for("alice", &hubs, 5).await;

        let names: Vec<_> = digest.hubs.iter().map(|h| h.hub.as_str()).collect();
        assert_eq!(names, vec!["Linux", "Python"]);

        let linux: Vec<_> = digest.hubs[0].articles.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(
            linux,
            vec!["https://habr.com/ru/articles/1/", "https://habr.com/ru/articles/7/"]
        );
        let python: Vec<_> = digest.hubs[1].articles.iter().map(|a| a.url.as_str()).collect();
        assert_eq!(python, vec!["https://habr.com/ru/articles/2/"]);
        assert_eq!(digest.article_count(), 3);
    }

    #[tokio::test]
    async fn test_news_is_throttled_per_caller() {
        let d = dispatcher(shared_source(), "unused");

        assert!(d.news("alice", 5).await.is_ok());
        match d.news("alice", 5).await {
            Err(DispatchError::Throttled { wait }) => {
                assert!(wait > Duration::from_secs(58));
                assert!(wait <= Duration::from_secs(60));
            }
            other => panic!("expected throttle, got {other:?}"),
        }

        let calls = || d.harvester().source().calls.lock().unwrap().len();
        let fetched_before = calls();
        assert!(matches!(
            d.news("alice", 5).await,
            Err(DispatchError::Throttled { .. })
        ));
        assert_eq!(calls(), fetched_before);

        assert!(matches!(
            d.news("mallory", 5).await,
            Err(DispatchError::UnknownSubscriber(_))
        ));
    }

    #[test]
    fn test_throttled_message_mentions_wait() {
        let err = DispatchError::Throttled { wait: Duration::from_secs(75) };
        assert_eq!(
            err.to_string(),
            "Too many requests. Wait 1 min 15 sec before the next one."
        );
    }

    #[tokio::test]
    async fn test_scheduled_run_writes_one_file_per_subscriber_with_news() {
        let dir = std::env::temp_dir().join(format!("habr_digest_dispatch_{}", std::process::id()));
        let out = dir.to_string_lossy().to_string();
        let d = dispatcher(shared_source(), &out);

        d.run(5).await;

        let files: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .flat_map(|day| std::fs::read_dir(day.unwrap().path()).unwrap())
            .map(|f| f.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("alice_"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
