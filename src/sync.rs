//! Incremental sync orchestrator.
//!
//! Pulls an explicit URL list through fetch → change detection → chunking
//! → embedding → storage for one tenant, with a fixed number of URLs in
//! flight at once. Batches run sequentially; URLs within a batch run as
//! isolated tasks whose failures become per-URL `error` outcomes and never
//! abort siblings. One progress event is emitted per completed URL, in
//! completion order, followed by a terminal `complete` event.
//!
//! Replacement ordering: a source's old chunks are deleted only after the
//! replacement content has been fetched, chunked, and embedded, immediately
//! before the matching insert. A failure anywhere earlier leaves the
//! previously indexed content intact and queryable.
//!
//! Cancellation is cooperative: a closed event channel (the consumer went
//! away) stops new batches between batch boundaries, as does the overall
//! wall-clock budget; the in-flight batch drains naturally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::checksum;
use crate::chunk::split_text;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::fetch::PageFetcher;
use crate::models::{ChunkRecord, MANUAL_SOURCE};
use crate::progress::{PageStatus, ProgressEvent, SyncStats};
use crate::store::ChunkStore;

/// Tuning knobs for one sync run, lifted out of [`Config`].
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// URLs in flight at once.
    pub concurrency: usize,
    /// Chunker bound, in bytes.
    pub max_chunk_chars: usize,
    /// Texts per embedding API call.
    pub embed_batch_size: usize,
    /// Overall wall-clock budget for the run.
    pub budget: Duration,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.sync.concurrency,
            max_chunk_chars: config.chunking.max_chars,
            embed_batch_size: config.embedding.batch_size,
            budget: Duration::from_secs(config.sync.budget_secs),
        }
    }
}

/// Terminal result for one URL within a run.
#[derive(Debug, Clone)]
struct UrlOutcome {
    url: String,
    status: PageStatus,
    chunks: Option<usize>,
    error: Option<String>,
}

/// The incremental sync pipeline. Cheap to clone; clones share the
/// fetcher, embedder, and store pool.
#[derive(Clone)]
pub struct SyncRunner {
    fetcher: Arc<dyn PageFetcher>,
    embedder: Arc<dyn Embedder>,
    store: ChunkStore,
    options: SyncOptions,
}

impl SyncRunner {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        embedder: Arc<dyn Embedder>,
        store: ChunkStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            store,
            options,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn fetcher(&self) -> Arc<dyn PageFetcher> {
        self.fetcher.clone()
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder.clone()
    }

    /// Sync an explicit URL list for one tenant, streaming progress into
    /// `events`. Returns the aggregate stats (also carried by the final
    /// `complete` event).
    pub async fn run(
        &self,
        tenant_id: &str,
        urls: Vec<String>,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Result<SyncStats> {
        validate_request(tenant_id, &urls)?;

        let total = urls.len();
        let deadline = Instant::now() + self.options.budget;
        let mut stats = SyncStats::default();
        let mut current = 0usize;
        let mut cancelled = false;

        let _ = events.send(ProgressEvent::Start { total }).await;

        for batch in urls.chunks(self.options.concurrency.max(1)) {
            if events.is_closed() {
                tracing::info!(tenant_id, "sync cancelled by consumer, draining stopped");
                cancelled = true;
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(tenant_id, "sync wall-clock budget exhausted");
                cancelled = true;
                break;
            }

            let mut tasks = JoinSet::new();
            let mut spawned: HashMap<tokio::task::Id, String> = HashMap::new();
            for url in batch {
                let runner = self.clone();
                let tenant = tenant_id.to_string();
                let task_url = url.clone();
                let handle = tasks.spawn(async move { runner.process_url(tenant, task_url).await });
                spawned.insert(handle.id(), url.clone());
            }

            // Collect in completion order; each event carries the URL so
            // consumers can reconcile ordering themselves.
            while let Some(joined) = tasks.join_next_with_id().await {
                let outcome = match joined {
                    Ok((_, outcome)) => outcome,
                    // A panicked task is isolated like any other failure;
                    // the task id recovers which URL it was working on.
                    Err(join_err) => UrlOutcome {
                        url: spawned
                            .get(&join_err.id())
                            .cloned()
                            .unwrap_or_else(|| "<unknown>".to_string()),
                        status: PageStatus::Error,
                        chunks: None,
                        error: Some(join_err.to_string()),
                    },
                };

                current += 1;
                stats.record(outcome.status);

                let sent = events
                    .send(ProgressEvent::Progress {
                        current,
                        total,
                        url: outcome.url,
                        status: outcome.status,
                        error: outcome.error,
                        chunks: outcome.chunks,
                        stats,
                    })
                    .await;
                if sent.is_err() {
                    cancelled = true;
                }
            }
        }

        if cancelled {
            tracing::info!(
                tenant_id,
                processed = current,
                total,
                "sync ended early, {} urls not processed",
                total - current
            );
        }

        let _ = events.send(ProgressEvent::Complete { total, stats }).await;
        Ok(stats)
    }

    /// One URL's pipeline, with every failure folded into the outcome.
    async fn process_url(self, tenant_id: String, url: String) -> UrlOutcome {
        match self.process_url_inner(&tenant_id, &url).await {
            Ok((status, chunk_count)) => UrlOutcome {
                url,
                status,
                chunks: (chunk_count > 0).then_some(chunk_count),
                error: None,
            },
            Err(e) => {
                tracing::warn!(tenant_id, url, error = %format!("{e:#}"), "url sync failed");
                UrlOutcome {
                    url,
                    status: PageStatus::Error,
                    chunks: None,
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    async fn process_url_inner(&self, tenant_id: &str, url: &str) -> Result<(PageStatus, usize)> {
        let content = match self.fetcher.fetch_page(url).await? {
            Some(content) => content,
            None => return Ok((PageStatus::Empty, 0)),
        };

        let checksum = checksum::fingerprint(&content);
        let stored = self.store.find_checksum(tenant_id, url).await?;
        if stored.as_deref() == Some(checksum.as_str()) {
            return Ok((PageStatus::Skipped, 0));
        }

        let had_prior = stored.is_some();
        let chunk_count = self
            .replace_source(tenant_id, url, &content, &checksum)
            .await?;

        if chunk_count == 0 {
            // Content existed but the chunker produced nothing usable.
            return Ok((PageStatus::Empty, 0));
        }

        let status = if had_prior {
            PageStatus::Updated
        } else {
            PageStatus::New
        };
        Ok((status, chunk_count))
    }

    /// Ingest hand-entered text for a tenant under the `"manual"` source,
    /// with the same checksum short-circuit as crawled pages.
    pub async fn ingest_text(&self, tenant_id: &str, text: &str) -> Result<(PageStatus, usize)> {
        if tenant_id.trim().is_empty() {
            bail!("tenant id must not be empty");
        }

        let checksum = checksum::fingerprint(text);
        let stored = self.store.find_checksum(tenant_id, MANUAL_SOURCE).await?;
        if stored.as_deref() == Some(checksum.as_str()) {
            return Ok((PageStatus::Skipped, 0));
        }

        let had_prior = stored.is_some();
        let chunk_count = self
            .replace_source(tenant_id, MANUAL_SOURCE, text, &checksum)
            .await?;

        if chunk_count == 0 {
            return Ok((PageStatus::Empty, 0));
        }
        Ok((
            if had_prior {
                PageStatus::Updated
            } else {
                PageStatus::New
            },
            chunk_count,
        ))
    }

    /// Chunk, embed, and atomically swap one source's chunks. Old chunks
    /// are deleted only after every replacement embedding exists in memory.
    /// Returns 0 without touching the store when the chunker yields nothing.
    async fn replace_source(
        &self,
        tenant_id: &str,
        source_url: &str,
        content: &str,
        checksum: &str,
    ) -> Result<usize> {
        let texts = split_text(content, self.options.max_chunk_chars);
        if texts.is_empty() {
            return Ok(0);
        }

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.options.embed_batch_size.max(1)) {
            let vectors = self
                .embedder
                .embed(batch)
                .await
                .with_context(|| format!("embedding failed for {}", source_url))?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedding service returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            embeddings.extend(vectors);
        }

        let records: Vec<ChunkRecord> = texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (content, embedding))| ChunkRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                source_url: source_url.to_string(),
                chunk_index: index as i64,
                content,
                checksum: checksum.to_string(),
                embedding,
            })
            .collect();

        // The replacement is fully computed; now (and only now) swap.
        self.store.delete_chunks(tenant_id, source_url).await?;
        self.store.insert_chunks(tenant_id, &records).await?;

        Ok(records.len())
    }
}

/// Reject bad input before any network or store work begins.
pub fn validate_request(tenant_id: &str, urls: &[String]) -> Result<()> {
    if tenant_id.trim().is_empty() {
        bail!("tenant id must not be empty");
    }
    if urls.is_empty() {
        bail!("url list must not be empty");
    }
    for url in urls {
        reqwest::Url::parse(url).with_context(|| format!("malformed url: {}", url))?;
    }
    Ok(())
}
