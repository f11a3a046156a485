//! zenfeed: feed ingestion with LLM enrichment over a hybrid store
//!
//! The engine ingests feed items, enriches them with LLM-generated
//! embeddings and semantic fields, stores them in time-partitioned
//! blocks (mmap'd vector matrix + inverted label index + fingerprint
//! map), serves semantic queries with structured filters, and evaluates
//! notification rules over fresh items.

pub mod block;
pub mod config;
pub mod crawl;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod meta;
pub mod model;
pub mod query;
pub mod rules;
pub mod schedule;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use model::{EnrichedRecord, FeedItem, LabelFilter, LabelMatch, QueryHit, StoredRecord, TimeRange};
pub use query::QueryRequest;
