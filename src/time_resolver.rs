//! Turn Habr's publication-time text into absolute timestamps.
//!
//! Listing pages show times in several shapes depending on age and on which
//! part of the markup we read:
//!
//! | Shape | Example | Result |
//! |-------|---------|--------|
//! | ISO-8601 | `2023-11-19T18:22:52.000Z` | parsed, +3h when `Z` |
//! | relative hours | `3 часа назад` | `now - 3h` |
//! | relative minutes | `15 минут назад` | `now - 15m` |
//! | yesterday | `вчера в 09:15` | previous day, 09:15:00 |
//! | today | `сегодня в 09:15` | today, 09:15:00 |
//! | absolute | `19 ноября 2023 в 18:22` | that instant |
//!
//! All results are naive local times in the site's zone (Moscow). A `Z`
//! timestamp is shifted by a fixed +3 hours. Moscow has had no DST since 2014,
//! but the shift is still a fixed offset and not a tz database lookup.
//!
//! English forms ("2 hours ago", "yesterday at 09:15") are accepted as well;
//! the English Habr locale emits them.

use crate::utils::truncate_for_log;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Offset applied to `Z`-suffixed ISO timestamps.
pub const UTC_TO_SITE_HOURS: i64 = 3;

static ISO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})-(\d{2})-(\d{2})[tT](\d{2}):(\d{2}):(\d{2})(?:\.\d+)?([zZ])?").unwrap()
});
static HOURS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s+(?:час(?:ов|а)?|hours?)").unwrap());
static MINUTES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s+(?:минут[уы]?|minutes?)").unwrap());
static YESTERDAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)вчера|yesterday").unwrap());
static TODAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)сегодня|today").unwrap());
static CLOCK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{2})").unwrap());
static ABSOLUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{1,2})\s+(\p{L}+)\s+(\d{4})\s+(?:в|at)\s+(\d{1,2}):(\d{2})").unwrap()
});
static ANY_TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\d+\s+(?:час(?:ов|а)?|hours?)|\d+\s+(?:минут[уы]?|minutes?)|вчера|сегодня|yesterday|today|\d+\s+\p{L}+\s+\d{4}",
    )
    .unwrap()
});

/// Genitive month names as they appear in absolute dates.
const MONTHS: [(&str, u32); 12] = [
    ("января", 1),
    ("февраля", 2),
    ("марта", 3),
    ("апреля", 4),
    ("мая", 5),
    ("июня", 6),
    ("июля", 7),
    ("августа", 8),
    ("сентября", 9),
    ("октября", 10),
    ("ноября", 11),
    ("декабря", 12),
];

type Grammar = fn(&str, NaiveDateTime) -> Option<NaiveDateTime>;

/// Grammars in priority order; the first one to produce a value wins.
const GRAMMARS: [(&str, Grammar); 6] = [
    ("iso8601", parse_iso),
    ("relative_hours", parse_relative_hours),
    ("relative_minutes", parse_relative_minutes),
    ("yesterday", parse_yesterday),
    ("today", parse_today),
    ("absolute", parse_absolute),
];

/// Resolve a raw time token against `now`.
///
/// Returns `None` (and logs a warning) when no grammar matches.
pub fn resolve(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    for (name, grammar) in GRAMMARS {
        if let Some(ts) = grammar(token, now) {
            debug!(token, grammar = name, resolved = %ts, "Resolved time token");
            return Some(ts);
        }
    }

    warn!(token = %truncate_for_log(token, 80), "Could not resolve time token");
    None
}

/// True when `text` contains something one of the grammars could read.
///
/// Used by the extractor to pick a free-text time out of a card.
pub fn looks_like_time(text: &str) -> bool {
    ANY_TIME_RE.is_match(text)
}

fn parse_iso(token: &str, _now: NaiveDateTime) -> Option<NaiveDateTime> {
    let caps = ISO_RE.captures(token)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = i32::try_from(num(1)?).ok()?;
    let parsed = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?.and_hms_opt(
        num(4)?,
        num(5)?,
        num(6)?,
    )?;

    if caps.get(7).is_some() {
        Some(parsed + Duration::hours(UTC_TO_SITE_HOURS))
    } else {
        Some(parsed)
    }
}

fn parse_relative_hours(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let n: i64 = HOURS_RE.captures(token)?.get(1)?.as_str().parse().ok()?;
    now.checked_sub_signed(Duration::try_hours(n)?)
}

fn parse_relative_minutes(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    let n: i64 = MINUTES_RE.captures(token)?.get(1)?.as_str().parse().ok()?;
    now.checked_sub_signed(Duration::try_minutes(n)?)
}

fn parse_yesterday(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if !YESTERDAY_RE.is_match(token) {
        return None;
    }
    let (hour, minute) = clock(token)?;
    (now.date() - Duration::days(1)).and_hms_opt(hour, minute, 0)
}

fn parse_today(token: &str, now: NaiveDateTime) -> Option<NaiveDateTime> {
    if !TODAY_RE.is_match(token) {
        return None;
    }
    let (hour, minute) = clock(token)?;
    now.date().and_hms_opt(hour, minute, 0)
}

fn parse_absolute(token: &str, _now: NaiveDateTime) -> Option<NaiveDateTime> {
    for caps in ABSOLUTE_RE.captures_iter(token) {
        let month_name = caps[2].to_lowercase();
        let Some(month) = month_number(&month_name) else {
            continue;
        };
        let (Ok(day), Ok(year), Ok(hour), Ok(minute)) = (
            caps[1].parse::<u32>(),
            caps[3].parse::<i32>(),
            caps[4].parse::<u32>(),
            caps[5].parse::<u32>(),
        ) else {
            continue;
        };

        match NaiveDate::from_ymd_opt(year, month, day).and_then(|d| d.and_hms_opt(hour, minute, 0)) {
            Some(ts) => return Some(ts),
            None => debug!(token, day, month, year, "Absolute date out of range; skipping"),
        }
    }
    None
}

fn month_number(name: &str) -> Option<u32> {
    MONTHS
        .iter()
        .find(|(month, _)| *month == name)
        .map(|(_, n)| *n)
}

fn clock(token: &str) -> Option<(u32, u32)> {
    let caps = CLOCK_RE.captures(token)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}
