//! HTTP page fetcher for hub listings.
//!
//! # URL Pattern
//!
//! `{origin}/{locale}/hubs/{slug}/articles/page{N}/`, for example
//! `https://habr.com/ru/hubs/python/articles/page2/`.

use super::{FetchError, PageSource};
use crate::config::SiteConfig;
use crate::limiter::RequestLimiter;
use crate::models::HubDescriptor;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use url::Url;

/// Fetches listing pages over HTTP, one limiter admission per request.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
    origin: Url,
    locale: String,
    limiter: Arc<RequestLimiter>,
}

impl HttpPageFetcher {
    pub fn new(site: &SiteConfig, limiter: Arc<RequestLimiter>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(site.user_agent.clone())
            .timeout(site.timeout())
            .build()?;
        Ok(Self {
            client,
            origin: Url::parse(&site.origin)?,
            locale: site.locale.clone(),
            limiter,
        })
    }

    /// Absolute URL of page `page` of `hub`.
    pub fn page_url(&self, hub: &HubDescriptor, page: u32) -> Result<Url, FetchError> {
        page_url(&self.origin, &self.locale, hub, page)
    }
}

pub(crate) fn page_url(
    origin: &Url,
    locale: &str,
    hub: &HubDescriptor,
    page: u32,
) -> Result<Url, FetchError> {
    let path = format!(
        "/{}/hubs/{}/articles/page{}/",
        locale,
        urlencoding::encode(&hub.slug),
        page
    );
    Ok(origin.join(&path)?)
}

impl PageSource for HttpPageFetcher {
    #[instrument(level = "info", skip_all, fields(hub = %hub.display_name, page = page))]
    async fn fetch_page(&self, hub: &HubDescriptor, page: u32) -> Result<String, FetchError> {
        let url = self.page_url(hub, page)?;

        let waited = self.limiter.block_until_admitted().await;
        if !waited.is_zero() {
            debug!(waited_ms = waited.as_millis() as u64, "Admitted after rate-limit wait");
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.text().await?;

        info!(%url, bytes = body.len(), "Fetched hub page");
        Ok(body)
    }
}
