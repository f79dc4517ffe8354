//! Per-tenant corpus statistics.
//!
//! Quick summary of what's indexed for a tenant: chunk counts and a
//! per-source breakdown. Used by `kbs stats` to give confidence that
//! ingests and syncs are doing what they should.

use anyhow::Result;

use crate::store::ChunkStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(store: &ChunkStore, tenant_id: &str) -> Result<()> {
    let total_chunks = store.count_chunks(tenant_id).await?;
    let sources = store.list_sources(tenant_id).await?;

    println!("kb-sync — Corpus Stats");
    println!("======================");
    println!();
    println!("  Tenant:   {}", tenant_id);
    println!("  Sources:  {}", sources.len());
    println!("  Chunks:   {}", total_chunks);

    if !sources.is_empty() {
        println!();
        println!("  {:<56} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(66));
        for (source_url, chunk_count) in &sources {
            println!("  {:<56} {:>8}", truncate(source_url, 56), chunk_count);
        }
    }

    println!();
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
