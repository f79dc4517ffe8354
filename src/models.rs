//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the source documents, stored chunks, and run
//! summaries that flow through fetch, chunking, embedding, and storage.

use serde::Serialize;

/// Sentinel `source_url` for hand-entered (non-crawled) text.
pub const MANUAL_SOURCE: &str = "manual";

/// One fetched page (or manually supplied text) before chunking.
///
/// Ephemeral: lives only for the duration of a single fetch-and-process
/// cycle. Only its chunks are persisted.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub url: String,
    pub raw_content: String,
    pub checksum: String,
}

/// A stored chunk: bounded content slice plus its embedding vector.
///
/// All chunks sharing a `(tenant_id, source_url)` pair carry the same
/// `checksum` — they were produced from one fetch — and are replaced as
/// a unit when the source changes.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub tenant_id: String,
    pub source_url: String,
    pub chunk_index: i64,
    pub content: String,
    pub checksum: String,
    pub embedding: Vec<f32>,
}

/// Final summary of a bulk (full-site) ingest.
#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub pages_count: usize,
    pub chunks_count: usize,
    pub empty_pages: usize,
}
