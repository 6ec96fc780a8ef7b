//! Fetching and parsing Habr hub listing pages.
//!
//! Harvesting a hub is split in two so each half can be tested alone:
//!
//! 1. **Fetching** ([`fetcher`]): one rate-limited GET per listing page,
//!    behind the [`PageSource`] trait.
//! 2. **Extraction** ([`extractor`]): turn the page's HTML into article
//!    candidates with resolved publication times.
//!
//! A fetch failure is a value ([`FetchError`]), never a panic. The
//! pagination controller treats it as an empty page.

pub mod extractor;
pub mod fetcher;

use crate::models::HubDescriptor;
use std::future::Future;
use thiserror::Error;

/// Transient problems fetching a listing page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("invalid page URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Anything that can hand back the HTML of one hub listing page.
pub trait PageSource: Send + Sync {
    fn fetch_page(
        &self,
        hub: &HubDescriptor,
        page: u32,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;
}
