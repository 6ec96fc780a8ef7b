//! Article extraction from a hub listing page.
//!
//! Habr's markup changes without notice, so every lookup is an ordered list
//! of strategies and the first one that produces something wins:
//!
//! - **Containers**: `article.tm-articles-list__item`, else any `article`.
//! - **Permalink**: the `tm-title__link` anchor, else an `h2` link shaped like
//!   a permalink, else any permalink-shaped link in the card.
//! - **Title**: the permalink's text, else a label in the card heading when
//!   the link itself only carries a stub like "Ok" or an arrow.
//! - **Time**: a `time` element, else one under the
//!   `tm-article-datetime-published` marker, else one inside any link, else
//!   the first bit of card text that reads like a time.
//!
//! A card without a usable link or title is skipped and counted, never
//! treated as an error.

use crate::models::{Article, PageResult};
use crate::time_resolver::{self, looks_like_time};
use chrono::NaiveDateTime;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info};
use url::Url;

/// Titles this short (in characters) or shorter are treated as missing.
const MIN_TITLE_CHARS: usize = 4;

static CONTAINER_PRIMARY: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"article[class*="tm-articles-list__item"]"#).unwrap());
static CONTAINER_ANY: Lazy<Selector> = Lazy::new(|| Selector::parse("article").unwrap());
static TITLE_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"a[class*="tm-title__link"]"#).unwrap());
static HEADING_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("h2 a[href]").unwrap());
static ANY_LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static HEADING_LABEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"h2 span, [class*="tm-title"] span"#).unwrap());
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time").unwrap());
static PUBLISHED_TIME: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"[class*="tm-article-datetime-published"] time"#).unwrap()
});
static LINK_TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("a time").unwrap());

/// `/articles/<id>/` or `/companies/<name>/articles/<id>/`, any locale prefix.
static PERMALINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|/)(?:articles|companies/[^/]+/articles)/\d+/").unwrap());

type LinkStrategy = for<'a> fn(ElementRef<'a>) -> Option<ElementRef<'a>>;
type TimeStrategy = for<'a> fn(ElementRef<'a>) -> Option<String>;

const LINK_STRATEGIES: [(&str, LinkStrategy); 3] = [
    ("title_marker", title_marker_link),
    ("heading_permalink", heading_permalink),
    ("any_permalink", any_permalink),
];

const TIME_STRATEGIES: [(&str, TimeStrategy); 4] = [
    ("time_element", time_element),
    ("published_marker", published_marker_time),
    ("link_time", link_time),
    ("free_text", free_text_time),
];

/// Why a card was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoLink,
    BadHref,
    ShortTitle,
}

/// Parse one listing page into article candidates.
///
/// `origin` resolves relative links; `now` anchors relative times.
pub fn extract(html: &str, origin: &Url, now: NaiveDateTime) -> PageResult {
    let document = Html::parse_document(html);

    let mut containers: Vec<ElementRef<'_>> = document.select(&CONTAINER_PRIMARY).collect();
    if containers.is_empty() {
        containers = document.select(&CONTAINER_ANY).collect();
        if !containers.is_empty() {
            debug!(count = containers.len(), "Primary card selector missed; using bare <article>");
        }
    }

    let mut seen = HashSet::new();
    let mut articles = Vec::new();
    let mut skipped = 0usize;

    for container in containers {
        match candidate(container, origin, now) {
            Ok(article) => {
                if seen.insert(article.url.clone()) {
                    articles.push(article);
                } else {
                    debug!(url = %article.url, "Duplicate card on page");
                }
            }
            Err(reason) => {
                skipped += 1;
                debug!(?reason, "Skipping card");
            }
        }
    }

    let articles: Vec<Article> = articles.into_iter().unique_by(|a| a.url.clone()).collect();
    info!(count = articles.len(), skipped, "Parsed hub page");
    PageResult { articles, skipped }
}

fn candidate(
    container: ElementRef<'_>,
    origin: &Url,
    now: NaiveDateTime,
) -> Result<Article, SkipReason> {
    let link = LINK_STRATEGIES
        .iter()
        .find_map(|(_, strategy)| strategy(container))
        .ok_or(SkipReason::NoLink)?;

    let href = link
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SkipReason::BadHref)?;
    let url = origin.join(href).map_err(|_| SkipReason::BadHref)?.to_string();

    let title = title_of(container, link).ok_or(SkipReason::ShortTitle)?;

    let raw_time = TIME_STRATEGIES.iter().find_map(|(name, strategy)| {
        let token = strategy(container)?;
        debug!(strategy = name, %token, "Found time token");
        Some(token)
    });
    let published_at = raw_time
        .as_deref()
        .and_then(|token| time_resolver::resolve(token, now));

    Ok(Article {
        title,
        url,
        raw_time,
        published_at,
    })
}

fn visible_text(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).join(" ")
}

fn usable_title(text: String) -> Option<String> {
    (text.chars().count() > MIN_TITLE_CHARS).then_some(text)
}

fn title_of(container: ElementRef<'_>, link: ElementRef<'_>) -> Option<String> {
    usable_title(visible_text(link)).or_else(|| {
        container
            .select(&HEADING_LABEL)
            .find_map(|label| usable_title(visible_text(label)))
    })
}

fn is_permalink(link: &ElementRef<'_>) -> bool {
    link.value()
        .attr("href")
        .is_some_and(|href| PERMALINK_RE.is_match(href))
}

fn title_marker_link(container: ElementRef<'_>) -> Option<ElementRef<'_>> {
    container.select(&TITLE_LINK).next()
}

fn heading_permalink(container: ElementRef<'_>) -> Option<ElementRef<'_>> {
    container.select(&HEADING_LINK).find(is_permalink)
}

fn any_permalink(container: ElementRef<'_>) -> Option<ElementRef<'_>> {
    container.select(&ANY_LINK).find(is_permalink)
}

/// The machine-readable `datetime` attribute wins over the display text.
fn time_token(time: ElementRef<'_>) -> Option<String> {
    time.value()
        .attr("datetime")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| Some(visible_text(time)).filter(|t| !t.is_empty()))
}

fn time_element(container: ElementRef<'_>) -> Option<String> {
    container.select(&TIME).next().and_then(time_token)
}

fn published_marker_time(container: ElementRef<'_>) -> Option<String> {
    container.select(&PUBLISHED_TIME).next().and_then(time_token)
}

fn link_time(container: ElementRef<'_>) -> Option<String> {
    container.select(&LINK_TIME).next().and_then(time_token)
}

fn free_text_time(container: ElementRef<'_>) -> Option<String> {
    container
        .text()
        .map(str::trim)
        .find(|t| !t.is_empty() && looks_like_time(t))
        .map(str::to_string)
}
