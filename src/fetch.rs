//! Crawl-service client: URL discovery and two-phase page fetch.
//!
//! Fetching is two-phase: a fast scrape (no script execution, short
//! timeout) first, and if it yields no content, one retry in rendered mode
//! (headless browser, extra hydration wait, longer timeout). Both phases
//! exhausted without content is `Ok(None)` — the page is classified as
//! `empty`, not errored. Transport and API failures are `Err` and fatal
//! for that single URL only; the orchestrator isolates them from sibling
//! fetches.
//!
//! The concrete client speaks a Firecrawl-style JSON API (`POST /v1/map`
//! for discovery, `POST /v1/scrape` with markdown output, `waitFor`, and
//! per-call `timeout`). The API key comes from `CRAWLER_API_KEY`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::CrawlerConfig;

/// Retrieves rendered text for URLs. The seam the orchestrators mock.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Discover the pages of a site from a seed URL. A crawl the service
    /// reports as failed or cancelled is an error.
    async fn discover(&self, seed_url: &str) -> Result<Vec<String>>;

    /// Fetch one page's text content. `Ok(None)` means both fetch phases
    /// yielded nothing — the page is empty, not errored.
    async fn fetch_page(&self, url: &str) -> Result<Option<String>>;
}

pub struct CrawlClient {
    client: reqwest::Client,
    base_url: String,
    fast_timeout: Duration,
    render_timeout: Duration,
    render_wait_ms: u64,
}

#[derive(Deserialize)]
struct MapResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    links: Vec<String>,
}

#[derive(Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<ScrapeData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ScrapeData {
    #[serde(default)]
    markdown: Option<String>,
}

impl CrawlClient {
    pub fn new(config: &CrawlerConfig) -> Result<Self> {
        if std::env::var("CRAWLER_API_KEY").is_err() {
            bail!("CRAWLER_API_KEY environment variable not set");
        }

        // Per-call timeouts are passed per request; keep the client-level
        // timeout above the slowest phase.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.render_timeout_secs + 10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fast_timeout: Duration::from_secs(config.fast_timeout_secs),
            render_timeout: Duration::from_secs(config.render_timeout_secs),
            render_wait_ms: config.render_wait_ms,
        })
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let api_key = std::env::var("CRAWLER_API_KEY")
            .map_err(|_| anyhow::anyhow!("CRAWLER_API_KEY not set"))?;

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("crawl service request to {} failed", path))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("crawl service error {}: {}", status, body_text);
        }

        Ok(response.json().await?)
    }

    /// One scrape call. `rendered` switches on browser execution and the
    /// hydration wait.
    async fn scrape(&self, url: &str, rendered: bool) -> Result<Option<String>> {
        let timeout = if rendered {
            self.render_timeout
        } else {
            self.fast_timeout
        };

        let mut body = serde_json::json!({
            "url": url,
            "formats": ["markdown"],
            "timeout": timeout.as_millis() as u64,
        });
        if rendered {
            body["waitFor"] = serde_json::json!(self.render_wait_ms);
            body["actions"] = serde_json::json!([
                { "type": "wait", "milliseconds": self.render_wait_ms }
            ]);
        }

        let json = self.post_json("/v1/scrape", body).await?;
        let parsed: ScrapeResponse = serde_json::from_value(json)?;

        if !parsed.success {
            bail!(
                "scrape of {} failed: {}",
                url,
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let content = parsed
            .data
            .and_then(|d| d.markdown)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        Ok(content)
    }
}

#[async_trait]
impl PageFetcher for CrawlClient {
    async fn discover(&self, seed_url: &str) -> Result<Vec<String>> {
        let json = self
            .post_json("/v1/map", serde_json::json!({ "url": seed_url }))
            .await?;
        let parsed: MapResponse = serde_json::from_value(json)?;

        match parsed.status.as_deref() {
            Some("failed") | Some("cancelled") => {
                bail!(
                    "crawl of {} reported status '{}'",
                    seed_url,
                    parsed.status.unwrap_or_default()
                );
            }
            _ => {}
        }
        if !parsed.success {
            bail!("crawl of {} failed", seed_url);
        }

        Ok(parsed.links)
    }

    async fn fetch_page(&self, url: &str) -> Result<Option<String>> {
        // Fast phase; a miss here is not fatal, it triggers the rendered
        // retry for JavaScript-heavy pages.
        match self.scrape(url, false).await {
            Ok(Some(content)) => return Ok(Some(content)),
            Ok(None) => {
                tracing::debug!(url, "fast fetch returned no content, retrying rendered");
            }
            Err(e) => {
                tracing::debug!(url, error = %e, "fast fetch failed, retrying rendered");
            }
        }

        self.scrape(url, true).await
    }
}
