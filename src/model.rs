//! Core data types shared across the ingestion pipeline and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known label names. The set is closed per deployment but extensible
/// through per-source `labels_extra` configuration.
pub mod label {
    pub const SOURCE: &str = "source";
    pub const CATEGORY: &str = "category";
    pub const TITLE: &str = "title";
    pub const LINK: &str = "link";
    pub const CONTENT: &str = "content";
    pub const TAGS: &str = "tags";
    pub const SUMMARY: &str = "summary";
}

/// Label map. BTreeMap keeps journal encoding deterministic.
pub type Labels = BTreeMap<String, String>;

/// A feed item before enrichment.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub source_id: String,
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    /// Raw body as delivered by the feed (HTML or plain text).
    pub raw_content: String,
    /// Markdown body, populated by the crawler when enabled.
    pub content_markdown: String,
}

impl FeedItem {
    /// Stable 64-bit identity of this item across ingestions.
    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.source_id, &self.link, &self.title)
    }
}

/// Compute the item fingerprint from source id, canonical link and
/// whitespace/case-normalized title.
pub fn fingerprint(source_id: &str, link: &str, title: &str) -> u64 {
    let normalized_title = normalize_title(title);
    let mut buf = Vec::with_capacity(source_id.len() + link.len() + normalized_title.len() + 2);
    buf.extend_from_slice(source_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(link.as_bytes());
    buf.push(0);
    buf.extend_from_slice(normalized_title.as_bytes());
    twox_hash::xxh3::hash64(&buf)
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A record ready for the store: enrichment done, vector normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub fingerprint: u64,
    /// Ingestion timestamp, authoritative for block partitioning.
    pub time: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub labels: Labels,
    pub vector: Vec<f32>,
    pub score: f32,
}

/// A record as returned from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Local id within the owning block.
    pub id: u64,
    pub fingerprint: u64,
    pub time: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub labels: Labels,
    pub vector: Vec<f32>,
    pub score: f32,
}

/// One label constraint of a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LabelMatch {
    Eq(String),
    In(Vec<String>),
    NotEq(String),
    Prefix(String),
}

/// Named label constraint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelFilter {
    pub name: String,
    #[serde(flatten)]
    pub matcher: LabelMatch,
}

impl LabelFilter {
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            matcher: LabelMatch::Eq(value.into()),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.name).map(String::as_str).unwrap_or("");
        match &self.matcher {
            LabelMatch::Eq(v) => value == v,
            LabelMatch::In(vs) => vs.iter().any(|v| v == value),
            LabelMatch::NotEq(v) => value != v.as_str(),
            LabelMatch::Prefix(p) => !value.is_empty() && value.starts_with(p.as_str()),
        }
    }
}

/// Half-open time interval `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.from && t < self.to
    }

    /// Overlap with another half-open interval.
    pub fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.from < to && from < self.to
    }
}

/// A query against the store.
#[derive(Debug, Clone)]
pub struct Query {
    pub time_range: TimeRange,
    pub label_filters: Vec<LabelFilter>,
    pub vector: Option<Vec<f32>>,
    pub limit: usize,
    pub threshold: Option<f32>,
}

/// One query result.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub record: StoredRecord,
    /// Cosine similarity to the query vector, when one was given.
    pub similarity: Option<f32>,
}

/// L2-normalize a vector in place. A zero vector is left unchanged.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product over same-length slices. With normalized inputs this is
/// cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
