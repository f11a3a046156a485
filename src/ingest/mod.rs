//! Feed ingestion
//!
//! One ingester per feed source. A tick fetches the feed, drops items at
//! or below the persisted watermark, optionally crawls article bodies,
//! dedups by fingerprint against the store, enriches, and appends. The
//! watermark advances to the highest published-at that reached the store,
//! so a partial tick resumes where it left off.

mod jsonfeed;

pub use jsonfeed::JsonFeedParser;

use crate::config::SourceConfig;
use crate::crawl::{cancellable, Crawler};
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::meta::{MetaDb, CF_WATERMARKS};
use crate::model::FeedItem;
use crate::schedule::{Clock, ShutdownToken};
use crate::store::Store;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A feed item as delivered by the parser, before crawling.
#[derive(Debug, Clone)]
pub struct RawFeedItem {
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    /// Item body from the feed itself (HTML or text).
    pub content: String,
}

/// Feed fetching and parsing capability. The wire formats (RSS, Atom)
/// live behind this seam.
#[async_trait]
pub trait FeedParser: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<RawFeedItem>>;
}

/// Counters for one ingestion tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: usize,
    pub below_watermark: usize,
    pub duplicate: usize,
    pub crawl_failed: usize,
    pub appended: usize,
    pub dropped: usize,
}

pub struct Ingester {
    source: SourceConfig,
    parser: Arc<dyn FeedParser>,
    crawler: Arc<Crawler>,
    enricher: Arc<Enricher>,
    store: Arc<Store>,
    db: Arc<MetaDb>,
    clock: Arc<dyn Clock>,
}

impl Ingester {
    pub fn new(
        source: SourceConfig,
        parser: Arc<dyn FeedParser>,
        crawler: Arc<Crawler>,
        enricher: Arc<Enricher>,
        store: Arc<Store>,
        db: Arc<MetaDb>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            parser,
            crawler,
            enricher,
            store,
            db,
            clock,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }

    /// One poll of the feed. Items are processed in published order, one
    /// at a time; upstream failures leave partial progress behind and the
    /// next tick resumes from the watermark.
    pub async fn tick(&self, token: &ShutdownToken) -> Result<IngestStats> {
        let mut stats = IngestStats::default();

        let items = cancellable(token, self.parser.fetch(&self.source.url)).await??;
        stats.fetched = items.len();
        if items.is_empty() {
            debug!(source = %self.source.id, "feed empty");
            return Ok(stats);
        }

        let watermark = self.load_watermark()?;
        let mut seen_links: HashSet<String> = HashSet::new();
        let mut candidates: Vec<RawFeedItem> = items
            .into_iter()
            .filter(|item| {
                // First wins for duplicate links within one fetch.
                if !seen_links.insert(item.link.clone()) {
                    return false;
                }
                match watermark {
                    Some(mark) if item.published_at <= mark => {
                        stats.below_watermark += 1;
                        false
                    }
                    _ => true,
                }
            })
            .collect();
        candidates.sort_by_key(|item| item.published_at);

        for raw in candidates {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let fingerprint = crate::model::fingerprint(&self.source.id, &raw.link, &raw.title);
            if self.store.contains_fingerprint(fingerprint) {
                debug!(source = %self.source.id, link = %raw.link, "already ingested");
                stats.duplicate += 1;
                self.save_watermark(raw.published_at)?;
                continue;
            }

            let mut item = FeedItem {
                source_id: self.source.id.clone(),
                link: raw.link,
                title: raw.title,
                published_at: raw.published_at,
                raw_content: raw.content,
                content_markdown: String::new(),
            };

            if self.source.crawl {
                match self.crawler.markdown(&item.link, token).await {
                    Ok(markdown) => item.content_markdown = markdown,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        // The item still ingests, without crawled content.
                        warn!(
                            source = %self.source.id,
                            link = %item.link,
                            error = %e,
                            "crawl failed"
                        );
                        stats.crawl_failed += 1;
                    }
                }
            }

            let record = match self
                .enricher
                .enrich(&item, &self.source, self.clock.now(), token)
                .await
            {
                Ok(record) => record,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        source = %self.source.id,
                        link = %item.link,
                        error = %e,
                        kind = e.kind(),
                        "enrichment failed, dropping item"
                    );
                    stats.dropped += 1;
                    continue;
                }
            };

            match self.store.append(&record) {
                Ok(_) => {
                    stats.appended += 1;
                    self.save_watermark(item.published_at)?;
                }
                Err(Error::Duplicate(_)) => {
                    info!(source = %self.source.id, link = %item.link, "duplicate append");
                    stats.duplicate += 1;
                    self.save_watermark(item.published_at)?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            source = %self.source.id,
            fetched = stats.fetched,
            appended = stats.appended,
            duplicate = stats.duplicate,
            dropped = stats.dropped,
            "ingestion tick done"
        );
        Ok(stats)
    }

    fn load_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.db.get(CF_WATERMARKS, self.source.id.as_bytes())?;
        Ok(raw.filter(|v| v.len() == 8).and_then(|v| {
            Utc.timestamp_millis_opt(LittleEndian::read_u64(&v) as i64)
                .single()
        }))
    }

    /// Monotonic: never moves the watermark backwards.
    fn save_watermark(&self, published_at: DateTime<Utc>) -> Result<()> {
        if let Some(current) = self.load_watermark()? {
            if published_at <= current {
                return Ok(());
            }
        }
        let mut value = [0u8; 8];
        LittleEndian::write_u64(&mut value, published_at.timestamp_millis() as u64);
        self.db.put(CF_WATERMARKS, self.source.id.as_bytes(), &value)
    }
}
