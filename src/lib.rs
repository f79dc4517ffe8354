//! # kb-sync
//!
//! Multi-tenant knowledge-base ingestion and synchronization for
//! retrieval-augmented chat.
//!
//! Each tenant's source content (web pages, manually entered text) is
//! fetched, change-detected, split into bounded chunks, embedded, and
//! stored so a downstream chat service can retrieve relevant passages
//! per query.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │ Crawl svc   │──▶│  Pipeline         │──▶│  SQLite   │
//! │ map/scrape  │   │ checksum → chunk  │   │ chunks +  │
//! └─────────────┘   │ → embed → replace │   │ vectors   │
//!                   └──────────────────┘   └────┬─────┘
//!                                               │
//!                           ┌───────────────────┤
//!                           ▼                   ▼
//!                      ┌──────────┐       ┌──────────┐
//!                      │   CLI    │       │  HTTP    │
//!                      │  (kbs)   │       │  (SSE)   │
//!                      └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbs init                                    # create database
//! kbs ingest acme https://acme.test          # first-time full-site ingest
//! kbs sync acme https://acme.test/docs       # incremental re-sync
//! kbs stats acme                              # corpus overview
//! kbs serve                                   # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`checksum`] | Content fingerprinting for change detection |
//! | [`chunk`] | Bounded text chunking |
//! | [`fetch`] | Crawl-service client with two-phase fetch |
//! | [`embedding`] | Embedding client abstraction |
//! | [`store`] | Tenant-scoped chunk store |
//! | [`rate_limit`] | Per-caller fixed-window rate limiting |
//! | [`sync`] | Incremental bounded-concurrency sync |
//! | [`bulk`] | First-time full-site ingest |
//! | [`progress`] | Progress events and reporters |
//! | [`server`] | HTTP server (bulk ingest, SSE sync, health) |
//! | [`db`] / [`migrate`] | Database connection and schema |

pub mod bulk;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod fetch;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod rate_limit;
pub mod server;
pub mod stats;
pub mod store;
pub mod sync;
