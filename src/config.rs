use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk length in bytes (split points stay on char boundaries).
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}

/// Crawl/scrape service settings. The API key comes from the
/// `CRAWLER_API_KEY` environment variable, never from the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_crawler_base_url")]
    pub base_url: String,
    /// Timeout for the fast (no script execution) fetch phase.
    #[serde(default = "default_fast_timeout_secs")]
    pub fast_timeout_secs: u64,
    /// Timeout for the rendered (headless browser) fetch phase.
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,
    /// Extra hydration wait before the rendered phase captures content.
    #[serde(default = "default_render_wait_ms")]
    pub render_wait_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            base_url: default_crawler_base_url(),
            fast_timeout_secs: default_fast_timeout_secs(),
            render_timeout_secs: default_render_timeout_secs(),
            render_wait_ms: default_render_wait_ms(),
        }
    }
}

fn default_crawler_base_url() -> String {
    "https://api.firecrawl.dev".to_string()
}
fn default_fast_timeout_secs() -> u64 {
    30
}
fn default_render_timeout_secs() -> u64 {
    60
}
fn default_render_wait_ms() -> u64 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Texts per embedding API call.
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: default_embed_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_embed_batch_size() -> usize {
    100
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// URLs in flight at once during an incremental sync.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Rows per store insert batch.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    /// Overall wall-clock budget for one run, in seconds.
    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            insert_batch_size: default_insert_batch_size(),
            budget_secs: default_budget_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}
fn default_insert_batch_size() -> usize {
    500
}
fn default_budget_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_max_requests() -> u32 {
    20
}
fn default_window_ms() -> u64 {
    60_000
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.sync.concurrency == 0 {
        anyhow::bail!("sync.concurrency must be > 0");
    }
    if config.sync.insert_batch_size == 0 {
        anyhow::bail!("sync.insert_batch_size must be > 0");
    }
    if config.rate_limit.max_requests == 0 || config.rate_limit.window_ms == 0 {
        anyhow::bail!("rate_limit.max_requests and rate_limit.window_ms must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
