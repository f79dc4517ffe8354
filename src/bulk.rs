//! One-shot full-site ingest.
//!
//! Used for a tenant's first-time ingestion: crawl the whole site once,
//! embed everything, then replace the tenant's corpus as a unit. The
//! pipeline is crawl-first — nothing is deleted until every replacement
//! embedding exists in memory, so the existing corpus stays queryable for
//! the entire crawl+embed phase.
//!
//! Phases are modeled explicitly as [`IngestPhase`] so each transition's
//! preconditions can be asserted without network mocking: `Replacing` is
//! only reachable after all embeddings succeeded, and `Failed` only from
//! `Crawling` or `Embedding` — a failure during `Replacing` (delete done,
//! insert incomplete) is the known partial-write gap and is surfaced with
//! the failing batch index instead.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use crate::checksum;
use crate::chunk::split_text;
use crate::embedding::Embedder;
use crate::fetch::PageFetcher;
use crate::models::{BulkSummary, ChunkRecord, SourceDocument};
use crate::store::ChunkStore;
use crate::sync::SyncOptions;

/// Pipeline phase of a bulk ingest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestPhase {
    Crawling,
    Chunking,
    Embedding,
    Replacing,
    Done,
    Failed,
}

impl IngestPhase {
    /// Guarded transition. Legal edges:
    /// `Crawling → Chunking → Embedding → Replacing → Done`, plus
    /// `Crawling → Failed` and `Embedding → Failed`.
    pub fn advance(self, next: IngestPhase) -> Result<IngestPhase> {
        use IngestPhase::*;
        let legal = matches!(
            (self, next),
            (Crawling, Chunking)
                | (Chunking, Embedding)
                | (Embedding, Replacing)
                | (Replacing, Done)
                | (Crawling, Failed)
                | (Embedding, Failed)
        );
        if !legal {
            bail!("illegal ingest phase transition {:?} -> {:?}", self, next);
        }
        Ok(next)
    }
}

/// Crawl `seed_url`, embed every discovered page, and replace the tenant's
/// whole corpus. No store mutation happens unless the crawl and every
/// embedding batch succeed. The wall-clock budget is checked between
/// batches up to the start of `Replacing` and never after: once the swap
/// begins it runs to completion, so a timeout cannot interrupt it.
pub async fn run_bulk_ingest(
    fetcher: Arc<dyn PageFetcher>,
    embedder: Arc<dyn Embedder>,
    store: &ChunkStore,
    options: &SyncOptions,
    tenant_id: &str,
    seed_url: &str,
) -> Result<BulkSummary> {
    if tenant_id.trim().is_empty() {
        bail!("tenant id must not be empty");
    }
    reqwest::Url::parse(seed_url).with_context(|| format!("malformed seed url: {}", seed_url))?;

    let mut phase = IngestPhase::Crawling;
    let deadline = Instant::now() + options.budget;
    tracing::info!(tenant_id, seed_url, "bulk ingest started");

    let urls = match fetcher.discover(seed_url).await {
        Ok(urls) => urls,
        Err(e) => {
            phase = phase.advance(IngestPhase::Failed)?;
            tracing::warn!(tenant_id, phase = ?phase, "crawl failed");
            return Err(e).with_context(|| format!("crawl of {} failed", seed_url));
        }
    };
    if urls.is_empty() {
        phase.advance(IngestPhase::Failed)?;
        bail!("crawl of {} discovered no pages", seed_url);
    }

    // Fetch all pages while the old corpus remains fully queryable.
    // Per-page fetch errors are not fatal here; they count as empty.
    let mut pages: Vec<SourceDocument> = Vec::new();
    let mut empty_pages = 0usize;

    for batch in urls.chunks(options.concurrency.max(1)) {
        if Instant::now() >= deadline {
            phase.advance(IngestPhase::Failed)?;
            bail!(
                "bulk ingest of {} exceeded its wall-clock budget while crawling; corpus left untouched",
                seed_url
            );
        }

        let mut tasks = JoinSet::new();
        for url in batch {
            let fetcher = fetcher.clone();
            let url = url.clone();
            tasks.spawn(async move {
                let result = fetcher.fetch_page(&url).await;
                (url, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((url, result)) = joined else {
                empty_pages += 1;
                continue;
            };
            match result {
                Ok(Some(content)) if !content.trim().is_empty() => {
                    let checksum = checksum::fingerprint(&content);
                    pages.push(SourceDocument {
                        url,
                        raw_content: content,
                        checksum,
                    });
                }
                Ok(_) => {
                    tracing::debug!(tenant_id, url, "page contributed no content");
                    empty_pages += 1;
                }
                Err(e) => {
                    tracing::warn!(tenant_id, url, error = %format!("{e:#}"), "page fetch failed, counting as empty");
                    empty_pages += 1;
                }
            }
        }
    }

    if pages.is_empty() {
        phase.advance(IngestPhase::Failed)?;
        bail!(
            "every page of {} came back empty; the site may require deeper rendering or block automated fetches",
            seed_url
        );
    }

    phase = phase.advance(IngestPhase::Chunking)?;
    let mut texts: Vec<String> = Vec::new();
    let mut page_spans: Vec<(usize, usize)> = Vec::with_capacity(pages.len());
    for page in &pages {
        let chunks = split_text(&page.raw_content, options.max_chunk_chars);
        let start = texts.len();
        texts.extend(chunks);
        page_spans.push((start, texts.len()));
    }

    phase = phase.advance(IngestPhase::Embedding)?;
    let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(options.embed_batch_size.max(1)) {
        if Instant::now() >= deadline {
            phase.advance(IngestPhase::Failed)?;
            bail!("bulk ingest exceeded its wall-clock budget while embedding; corpus left untouched");
        }
        match embedder.embed(batch).await {
            Ok(vectors) if vectors.len() == batch.len() => embeddings.extend(vectors),
            Ok(vectors) => {
                phase.advance(IngestPhase::Failed)?;
                bail!(
                    "embedding service returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            Err(e) => {
                phase.advance(IngestPhase::Failed)?;
                return Err(e).context("embedding failed, corpus left untouched");
            }
        }
    }

    let mut records: Vec<ChunkRecord> = Vec::with_capacity(texts.len());
    for (page, (start, end)) in pages.iter().zip(&page_spans) {
        for (offset, global_index) in (*start..*end).enumerate() {
            records.push(ChunkRecord {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                source_url: page.url.clone(),
                chunk_index: offset as i64,
                content: texts[global_index].clone(),
                checksum: page.checksum.clone(),
                embedding: embeddings[global_index].clone(),
            });
        }
    }

    // Last budget check; the swap below is never interrupted mid-flight.
    if Instant::now() >= deadline {
        phase.advance(IngestPhase::Failed)?;
        bail!("bulk ingest exceeded its wall-clock budget before replacement; corpus left untouched");
    }

    // All embeddings exist; swap the corpus. A failure between the delete
    // and the last insert batch leaves a partial corpus (known gap) and is
    // reported with the failing batch index.
    phase = phase.advance(IngestPhase::Replacing)?;
    store.delete_all(tenant_id).await?;
    store.insert_chunks(tenant_id, &records).await?;

    phase = phase.advance(IngestPhase::Done)?;
    let summary = BulkSummary {
        pages_count: pages.len(),
        chunks_count: records.len(),
        empty_pages,
    };
    tracing::info!(
        tenant_id,
        phase = ?phase,
        pages = summary.pages_count,
        chunks = summary.chunks_count,
        empty = summary.empty_pages,
        "bulk ingest complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::IngestPhase::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let phase = Crawling
            .advance(Chunking)
            .and_then(|p| p.advance(Embedding))
            .and_then(|p| p.advance(Replacing))
            .and_then(|p| p.advance(Done))
            .unwrap();
        assert_eq!(phase, Done);
    }

    #[test]
    fn failed_is_reachable_only_from_crawling_and_embedding() {
        assert!(Crawling.advance(Failed).is_ok());
        assert!(Embedding.advance(Failed).is_ok());
        assert!(Chunking.advance(Failed).is_err());
        assert!(Replacing.advance(Failed).is_err());
        assert!(Done.advance(Failed).is_err());
    }

    #[test]
    fn replacing_requires_embedding_first() {
        assert!(Crawling.advance(Replacing).is_err());
        assert!(Chunking.advance(Replacing).is_err());
        assert!(Embedding.advance(Replacing).is_ok());
    }

    #[test]
    fn no_transitions_out_of_terminal_states() {
        assert!(Done.advance(Crawling).is_err());
        assert!(Failed.advance(Crawling).is_err());
        assert!(Failed.advance(Done).is_err());
    }
}
