//! Tenant-scoped chunk store adapter.
//!
//! Every read and write is keyed by tenant id; cross-tenant access is
//! impossible through this interface. Inserts run in bounded batches so a
//! large site never produces one oversized statement, and a failed batch
//! reports which batch index broke.
//!
//! Replacement ordering is owned by the orchestrators: old chunks for a
//! source are deleted only after the replacement chunks have been fetched,
//! chunked, and embedded, immediately before the matching insert.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::embedding::vec_to_blob;
use crate::models::ChunkRecord;

#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
    insert_batch_size: usize,
}

impl ChunkStore {
    pub fn new(pool: SqlitePool, insert_batch_size: usize) -> Self {
        Self {
            pool,
            insert_batch_size: insert_batch_size.max(1),
        }
    }

    /// Stored checksum for a source, if the tenant has chunks for it.
    /// All chunks of one source share one checksum, so any row will do.
    pub async fn find_checksum(&self, tenant_id: &str, source_url: &str) -> Result<Option<String>> {
        let checksum: Option<String> = sqlx::query_scalar(
            "SELECT checksum FROM chunks WHERE tenant_id = ? AND source_url = ? LIMIT 1",
        )
        .bind(tenant_id)
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(checksum)
    }

    /// Delete all chunks for one source. Idempotent; returns rows removed.
    pub async fn delete_chunks(&self, tenant_id: &str, source_url: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE tenant_id = ? AND source_url = ?")
            .bind(tenant_id)
            .bind(source_url)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Bulk insert, one transaction per batch of `insert_batch_size` rows.
    /// A failed batch surfaces its index so the caller can report how far
    /// the write got.
    pub async fn insert_chunks(&self, tenant_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let batch_count = chunks.len().div_ceil(self.insert_batch_size);

        for (batch_index, batch) in chunks.chunks(self.insert_batch_size).enumerate() {
            self.insert_batch(tenant_id, batch, now)
                .await
                .with_context(|| {
                    format!(
                        "insert batch {} of {} failed for tenant '{}'",
                        batch_index + 1,
                        batch_count,
                        tenant_id
                    )
                })?;
        }

        Ok(())
    }

    async fn insert_batch(&self, tenant_id: &str, batch: &[ChunkRecord], now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in batch {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, tenant_id, source_url, chunk_index, content, checksum, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(tenant_id)
            .bind(&chunk.source_url)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(&chunk.checksum)
            .bind(vec_to_blob(&chunk.embedding))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Wipe the tenant's entire corpus. Used only by the bulk full-replace
    /// path, after all replacement embeddings exist in memory.
    pub async fn delete_all(&self, tenant_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_chunks(&self, tenant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Distinct sources with chunk counts, most chunks first.
    pub async fn list_sources(&self, tenant_id: &str) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT source_url, COUNT(*) AS chunk_count
            FROM chunks
            WHERE tenant_id = ?
            GROUP BY source_url
            ORDER BY chunk_count DESC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
