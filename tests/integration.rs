//! End-to-end pipeline tests over a temporary SQLite database with mock
//! fetcher/embedder implementations.
//!
//! Covers: the three-URL new/skipped/empty scenario, idempotent re-sync,
//! per-URL failure isolation, the never-empty replacement guarantee, bulk
//! ingest aborting before any mutation on crawl failure, and progress
//! event framing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use kb_sync::bulk::run_bulk_ingest;
use kb_sync::db;
use kb_sync::embedding::Embedder;
use kb_sync::fetch::PageFetcher;
use kb_sync::migrate;
use kb_sync::models::ChunkRecord;
use kb_sync::progress::{PageStatus, ProgressEvent, SyncStats};
use kb_sync::store::ChunkStore;
use kb_sync::sync::{SyncOptions, SyncRunner};

// ============ Mocks ============

#[derive(Clone)]
enum Page {
    Content(String),
    Empty,
    Fail(String),
    Panic,
}

struct MockFetcher {
    pages: HashMap<String, Page>,
    discover: Result<Vec<String>, String>,
    fetch_calls: AtomicUsize,
}

impl MockFetcher {
    fn with_pages(pages: Vec<(&str, Page)>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|(url, page)| (url.to_string(), page))
                .collect(),
            discover: Ok(Vec::new()),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn with_discover(mut self, urls: Vec<&str>) -> Self {
        self.discover = Ok(urls.into_iter().map(String::from).collect());
        self
    }

    fn with_failed_crawl(mut self, reason: &str) -> Self {
        self.discover = Err(reason.to_string());
        self
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn discover(&self, _seed_url: &str) -> Result<Vec<String>> {
        match &self.discover {
            Ok(urls) => Ok(urls.clone()),
            Err(reason) => bail!("crawl reported status '{}'", reason),
        }
    }

    async fn fetch_page(&self, url: &str) -> Result<Option<String>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(url) {
            Some(Page::Content(content)) => Ok(Some(content.clone())),
            Some(Page::Empty) | None => Ok(None),
            Some(Page::Fail(msg)) => bail!("fetch of {} failed: {}", url, msg),
            Some(Page::Panic) => panic!("fetch of {} blew up", url),
        }
    }
}

struct MockEmbedder {
    dims: usize,
    fail: bool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    fn new() -> Self {
        Self {
            dims: 4,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("embedding service unavailable");
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32; self.dims])
            .collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Setup ============

async fn test_store() -> (TempDir, ChunkStore) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("kbs.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (tmp, ChunkStore::new(pool, 500))
}

fn options() -> SyncOptions {
    SyncOptions {
        concurrency: 5,
        max_chunk_chars: 1000,
        embed_batch_size: 100,
        budget: Duration::from_secs(300),
    }
}

fn runner(fetcher: MockFetcher, embedder: Arc<MockEmbedder>, store: ChunkStore) -> SyncRunner {
    SyncRunner::new(Arc::new(fetcher), embedder, store, options())
}

/// Run a sync and collect the full event stream alongside the stats.
async fn run_collecting(
    runner: &SyncRunner,
    tenant: &str,
    urls: Vec<String>,
) -> (SyncStats, Vec<ProgressEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });

    let stats = runner.run(tenant, urls, tx).await.unwrap();
    let events = collector.await.unwrap();
    (stats, events)
}

/// Seed the store with one already-synced source.
async fn seed_source(store: &ChunkStore, tenant: &str, url: &str, content: &str) {
    let checksum = kb_sync::checksum::fingerprint(content);
    let records = vec![ChunkRecord {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant.to_string(),
        source_url: url.to_string(),
        chunk_index: 0,
        content: content.to_string(),
        checksum,
        embedding: vec![0.5; 4],
    }];
    store.insert_chunks(tenant, &records).await.unwrap();
}

// ============ Incremental sync ============

#[tokio::test]
async fn sync_new_skipped_empty_scenario() {
    let (_tmp, store) = test_store().await;

    // B is already indexed with identical content; A is new; C is empty.
    seed_source(&store, "acme", "https://acme.test/b", "B content unchanged").await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/a", Page::Content("Hello world".to_string())),
        ("https://acme.test/b", Page::Content("B content unchanged".to_string())),
        ("https://acme.test/c", Page::Empty),
    ]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder.clone(), store.clone());

    let (stats, _) = run_collecting(
        &runner,
        "acme",
        vec![
            "https://acme.test/a".to_string(),
            "https://acme.test/b".to_string(),
            "https://acme.test/c".to_string(),
        ],
    )
    .await;

    assert_eq!(
        stats,
        SyncStats {
            new_pages: 1,
            updated_pages: 0,
            skipped_pages: 1,
            empty_pages: 1,
            errors: 0,
        }
    );
    // Only A was embedded and written.
    assert_eq!(embedder.call_count(), 1);
    assert_eq!(
        store.find_checksum("acme", "https://acme.test/a").await.unwrap(),
        Some(kb_sync::checksum::fingerprint("Hello world"))
    );
    assert!(store.find_checksum("acme", "https://acme.test/c").await.unwrap().is_none());
}

#[tokio::test]
async fn second_sync_skips_everything_and_writes_nothing() {
    let (_tmp, store) = test_store().await;

    let fetcher = || {
        MockFetcher::with_pages(vec![
            ("https://acme.test/a", Page::Content("alpha page".to_string())),
            ("https://acme.test/b", Page::Content("beta page".to_string())),
        ])
    };
    let urls = vec![
        "https://acme.test/a".to_string(),
        "https://acme.test/b".to_string(),
    ];

    let embedder = Arc::new(MockEmbedder::new());
    let first = runner(fetcher(), embedder.clone(), store.clone());
    let (stats, _) = run_collecting(&first, "acme", urls.clone()).await;
    assert_eq!(stats.new_pages, 2);
    let calls_after_first = embedder.call_count();

    let second = runner(fetcher(), embedder.clone(), store.clone());
    let (stats, _) = run_collecting(&second, "acme", urls).await;

    assert_eq!(stats.skipped_pages, 2);
    assert_eq!(stats.new_pages, 0);
    // No embedding work, hence no store writes, on the second run.
    assert_eq!(embedder.call_count(), calls_after_first);
}

#[tokio::test]
async fn changed_content_is_updated_not_new() {
    let (_tmp, store) = test_store().await;
    seed_source(&store, "acme", "https://acme.test/a", "old content").await;

    let fetcher = MockFetcher::with_pages(vec![(
        "https://acme.test/a",
        Page::Content("new content".to_string()),
    )]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder, store.clone());

    let (stats, _) =
        run_collecting(&runner, "acme", vec!["https://acme.test/a".to_string()]).await;

    assert_eq!(stats.updated_pages, 1);
    assert_eq!(
        store.find_checksum("acme", "https://acme.test/a").await.unwrap(),
        Some(kb_sync::checksum::fingerprint("new content"))
    );
}

#[tokio::test]
async fn one_failing_url_never_aborts_the_batch() {
    let (_tmp, store) = test_store().await;

    let mut pages: Vec<(String, Page)> = (0..9)
        .map(|i| {
            (
                format!("https://acme.test/p{i}"),
                Page::Content(format!("page {i} body")),
            )
        })
        .collect();
    pages.push((
        "https://acme.test/broken".to_string(),
        Page::Fail("connection reset".to_string()),
    ));

    let fetcher = MockFetcher {
        pages: pages.into_iter().collect(),
        discover: Ok(Vec::new()),
        fetch_calls: AtomicUsize::new(0),
    };
    let embedder = Arc::new(MockEmbedder::new());
    let runner = SyncRunner::new(Arc::new(fetcher), embedder, store.clone(), options());

    let urls: Vec<String> = (0..9)
        .map(|i| format!("https://acme.test/p{i}"))
        .chain(std::iter::once("https://acme.test/broken".to_string()))
        .collect();
    let (stats, events) = run_collecting(&runner, "acme", urls).await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.new_pages, 9);

    // The failing URL's event carries the error message.
    let error_event = events.iter().find_map(|e| match e {
        ProgressEvent::Progress {
            url,
            status: PageStatus::Error,
            error,
            ..
        } => Some((url.clone(), error.clone())),
        _ => None,
    });
    let (url, error) = error_event.expect("an error progress event");
    assert_eq!(url, "https://acme.test/broken");
    assert!(error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn embed_failure_leaves_prior_chunks_queryable() {
    let (_tmp, store) = test_store().await;
    seed_source(&store, "acme", "https://acme.test/a", "old content").await;

    let fetcher = MockFetcher::with_pages(vec![(
        "https://acme.test/a",
        Page::Content("changed content".to_string()),
    )]);
    let embedder = Arc::new(MockEmbedder::failing());
    let runner = runner(fetcher, embedder, store.clone());

    let (stats, _) =
        run_collecting(&runner, "acme", vec!["https://acme.test/a".to_string()]).await;

    assert_eq!(stats.errors, 1);
    // The old corpus for the source must survive the failed update.
    assert_eq!(store.count_chunks("acme").await.unwrap(), 1);
    assert_eq!(
        store.find_checksum("acme", "https://acme.test/a").await.unwrap(),
        Some(kb_sync::checksum::fingerprint("old content"))
    );
}

#[tokio::test]
async fn event_stream_is_start_progress_complete() {
    let (_tmp, store) = test_store().await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/a", Page::Content("a body".to_string())),
        ("https://acme.test/b", Page::Empty),
    ]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder, store);

    let (stats, events) = run_collecting(
        &runner,
        "acme",
        vec![
            "https://acme.test/a".to_string(),
            "https://acme.test/b".to_string(),
        ],
    )
    .await;

    assert!(matches!(events.first(), Some(ProgressEvent::Start { total: 2 })));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Complete { total: 2, .. })
    ));
    let progress_count = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::Progress { .. }))
        .count();
    assert_eq!(progress_count, 2);

    // The final event carries the aggregate stats.
    if let Some(ProgressEvent::Complete { stats: final_stats, .. }) = events.last() {
        assert_eq!(*final_stats, stats);
    }
}

#[tokio::test]
async fn rejects_invalid_input_before_any_work() {
    let (_tmp, store) = test_store().await;
    let fetcher = MockFetcher::with_pages(vec![]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder.clone(), store);

    let (tx, _rx) = mpsc::channel(8);
    assert!(runner.run("", vec!["https://a.example".to_string()], tx).await.is_err());

    let (tx, _rx) = mpsc::channel(8);
    assert!(runner.run("acme", vec![], tx).await.is_err());

    let (tx, _rx) = mpsc::channel(8);
    assert!(runner.run("acme", vec!["not a url".to_string()], tx).await.is_err());

    assert_eq!(embedder.call_count(), 0);
}

#[tokio::test]
async fn panicking_fetch_reports_its_url() {
    let (_tmp, store) = test_store().await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/ok", Page::Content("fine page".to_string())),
        ("https://acme.test/boom", Page::Panic),
    ]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder, store);

    let (stats, events) = run_collecting(
        &runner,
        "acme",
        vec![
            "https://acme.test/ok".to_string(),
            "https://acme.test/boom".to_string(),
        ],
    )
    .await;

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.new_pages, 1);

    // Even a panicked task's event names the URL it was working on.
    let error_url = events.iter().find_map(|e| match e {
        ProgressEvent::Progress {
            url,
            status: PageStatus::Error,
            ..
        } => Some(url.clone()),
        _ => None,
    });
    assert_eq!(error_url.as_deref(), Some("https://acme.test/boom"));
}

// ============ Cancellation and budget ============

#[tokio::test]
async fn dropped_consumer_stops_sync_before_any_fetch() {
    let (_tmp, store) = test_store().await;

    let fetcher = Arc::new(MockFetcher::with_pages(vec![
        ("https://acme.test/a", Page::Content("a body".to_string())),
        ("https://acme.test/b", Page::Content("b body".to_string())),
    ]));
    let embedder = Arc::new(MockEmbedder::new());
    let runner = SyncRunner::new(fetcher.clone(), embedder.clone(), store, options());

    let (tx, rx) = mpsc::channel(8);
    drop(rx);

    let stats = runner
        .run(
            "acme",
            vec![
                "https://acme.test/a".to_string(),
                "https://acme.test/b".to_string(),
            ],
            tx,
        )
        .await
        .unwrap();

    // The consumer was gone before the first batch; nothing was fetched.
    assert_eq!(stats, SyncStats::default());
    assert_eq!(fetcher.fetch_count(), 0);
    assert_eq!(embedder.call_count(), 0);
}

#[tokio::test]
async fn mid_run_disconnect_stops_later_batches() {
    let (_tmp, store) = test_store().await;

    let pages: Vec<(String, Page)> = (0..10)
        .map(|i| {
            (
                format!("https://acme.test/p{i}"),
                Page::Content(format!("page {i} body")),
            )
        })
        .collect();
    let fetcher = Arc::new(MockFetcher {
        pages: pages.into_iter().collect(),
        discover: Ok(Vec::new()),
        fetch_calls: AtomicUsize::new(0),
    });
    let embedder = Arc::new(MockEmbedder::new());
    let mut opts = options();
    opts.concurrency = 2;
    let runner = SyncRunner::new(fetcher.clone(), embedder, store, opts);

    // Capacity 1 keeps the runner from racing ahead of the consumer.
    let (tx, mut rx) = mpsc::channel(1);
    let consumer = tokio::spawn(async move {
        // start + the first batch's two progress events, then disconnect.
        for _ in 0..3 {
            if rx.recv().await.is_none() {
                break;
            }
        }
    });

    let urls: Vec<String> = (0..10).map(|i| format!("https://acme.test/p{i}")).collect();
    let stats = runner.run("acme", urls, tx).await.unwrap();
    consumer.await.unwrap();

    // The in-flight batch drains; batches after the disconnect never start.
    assert!(fetcher.fetch_count() >= 2);
    assert!(
        fetcher.fetch_count() <= 4,
        "{} urls fetched after disconnect",
        fetcher.fetch_count()
    );
    assert!(stats.new_pages <= 4);
}

#[tokio::test]
async fn exhausted_budget_stops_new_batches() {
    let (_tmp, store) = test_store().await;

    let fetcher = Arc::new(MockFetcher::with_pages(vec![(
        "https://acme.test/a",
        Page::Content("a body".to_string()),
    )]));
    let embedder = Arc::new(MockEmbedder::new());
    let mut opts = options();
    opts.budget = Duration::ZERO;
    let runner = SyncRunner::new(fetcher.clone(), embedder, store, opts);

    let (stats, events) =
        run_collecting(&runner, "acme", vec!["https://acme.test/a".to_string()]).await;

    // No batch started; the stream still frames the run.
    assert_eq!(stats, SyncStats::default());
    assert_eq!(fetcher.fetch_count(), 0);
    assert!(matches!(events.first(), Some(ProgressEvent::Start { .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::Complete { .. })));
}

// ============ Manual text ============

#[tokio::test]
async fn manual_text_roundtrip_and_skip() {
    let (_tmp, store) = test_store().await;
    let fetcher = MockFetcher::with_pages(vec![]);
    let embedder = Arc::new(MockEmbedder::new());
    let runner = runner(fetcher, embedder, store.clone());

    let (status, chunks) = runner.ingest_text("acme", "Our support hours are 9-5.").await.unwrap();
    assert_eq!(status, PageStatus::New);
    assert_eq!(chunks, 1);

    let (status, _) = runner.ingest_text("acme", "Our support hours are 9-5.").await.unwrap();
    assert_eq!(status, PageStatus::Skipped);

    let (status, _) = runner.ingest_text("acme", "Our support hours are 24/7.").await.unwrap();
    assert_eq!(status, PageStatus::Updated);

    assert_eq!(
        store.find_checksum("acme", "manual").await.unwrap(),
        Some(kb_sync::checksum::fingerprint("Our support hours are 24/7."))
    );
}

// ============ Bulk ingest ============

#[tokio::test]
async fn bulk_ingest_replaces_the_whole_corpus() {
    let (_tmp, store) = test_store().await;
    // Stale source from a previous ingest; must be gone afterwards.
    seed_source(&store, "acme", "https://acme.test/stale", "stale page").await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/", Page::Content("home page body".to_string())),
        ("https://acme.test/docs", Page::Content("docs page body".to_string())),
        ("https://acme.test/blank", Page::Empty),
    ])
    .with_discover(vec![
        "https://acme.test/",
        "https://acme.test/docs",
        "https://acme.test/blank",
    ]);
    let embedder = Arc::new(MockEmbedder::new());

    let summary = run_bulk_ingest(
        Arc::new(fetcher),
        embedder,
        &store,
        &options(),
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap();

    assert_eq!(summary.pages_count, 2);
    assert_eq!(summary.empty_pages, 1);
    assert_eq!(summary.chunks_count, 2);

    assert!(store.find_checksum("acme", "https://acme.test/stale").await.unwrap().is_none());
    assert!(store.find_checksum("acme", "https://acme.test/docs").await.unwrap().is_some());
}

#[tokio::test]
async fn bulk_ingest_aborts_without_mutation_on_crawl_failure() {
    let (_tmp, store) = test_store().await;
    seed_source(&store, "acme", "https://acme.test/a", "existing page").await;

    let fetcher = MockFetcher::with_pages(vec![]).with_failed_crawl("failed");
    let embedder = Arc::new(MockEmbedder::new());

    let err = run_bulk_ingest(
        Arc::new(fetcher),
        embedder.clone(),
        &store,
        &options(),
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("crawl"));
    assert_eq!(embedder.call_count(), 0);
    // Store untouched.
    assert_eq!(store.count_chunks("acme").await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_ingest_fails_when_every_page_is_empty() {
    let (_tmp, store) = test_store().await;
    seed_source(&store, "acme", "https://acme.test/a", "existing page").await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/x", Page::Empty),
        ("https://acme.test/y", Page::Empty),
    ])
    .with_discover(vec!["https://acme.test/x", "https://acme.test/y"]);
    let embedder = Arc::new(MockEmbedder::new());

    let err = run_bulk_ingest(
        Arc::new(fetcher),
        embedder,
        &store,
        &options(),
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("empty"));
    assert_eq!(store.count_chunks("acme").await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_ingest_aborts_on_zero_discovered_pages() {
    let (_tmp, store) = test_store().await;

    let fetcher = MockFetcher::with_pages(vec![]).with_discover(vec![]);
    let embedder = Arc::new(MockEmbedder::new());

    let err = run_bulk_ingest(
        Arc::new(fetcher),
        embedder,
        &store,
        &options(),
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("no pages"));
}

#[tokio::test]
async fn bulk_ingest_budget_expiry_leaves_corpus_untouched() {
    let (_tmp, store) = test_store().await;
    seed_source(&store, "acme", "https://acme.test/a", "existing page").await;

    let fetcher = MockFetcher::with_pages(vec![(
        "https://acme.test/x",
        Page::Content("x body".to_string()),
    )])
    .with_discover(vec!["https://acme.test/x"]);
    let embedder = Arc::new(MockEmbedder::new());
    let mut opts = options();
    opts.budget = Duration::ZERO;

    let err = run_bulk_ingest(
        Arc::new(fetcher),
        embedder.clone(),
        &store,
        &opts,
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap_err();

    assert!(format!("{err:#}").contains("wall-clock budget"));
    assert_eq!(embedder.call_count(), 0);
    assert_eq!(store.count_chunks("acme").await.unwrap(), 1);
}

#[tokio::test]
async fn bulk_ingest_survives_per_page_fetch_errors() {
    let (_tmp, store) = test_store().await;

    let fetcher = MockFetcher::with_pages(vec![
        ("https://acme.test/ok", Page::Content("fine page".to_string())),
        ("https://acme.test/bad", Page::Fail("503".to_string())),
    ])
    .with_discover(vec!["https://acme.test/ok", "https://acme.test/bad"]);
    let embedder = Arc::new(MockEmbedder::new());

    let summary = run_bulk_ingest(
        Arc::new(fetcher),
        embedder,
        &store,
        &options(),
        "acme",
        "https://acme.test",
    )
    .await
    .unwrap();

    assert_eq!(summary.pages_count, 1);
    assert_eq!(summary.empty_pages, 1);
}
