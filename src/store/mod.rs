//! Feed store
//!
//! Manages the ordered set of time-window blocks: routes appends to the
//! head block, rotates when the head's window ends, fans queries out over
//! every overlapping block, and drops blocks past retention. Appends are
//! serialized through a single writer lock; queries snapshot the block
//! list and run lock-free over sealed blocks.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::model::{EnrichedRecord, Query, QueryHit, StoredRecord};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct StoreOptions {
    pub dim: usize,
    pub block_window: Duration,
    pub retention: Duration,
    pub fsync_every: u64,
}

pub struct Store {
    dir: PathBuf,
    options: StoreOptions,
    /// Blocks ordered by t_start ascending; the last one is the head.
    blocks: RwLock<Vec<Arc<Block>>>,
    /// Serializes the whole append path (rotation + fingerprint check + write).
    writer: Mutex<()>,
}

impl Store {
    /// Open the store, reopening every block directory under `dir`.
    /// Corrupt block directories are quarantined (renamed to
    /// `broken-<name>`) and skipped.
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut blocks: Vec<Arc<Block>> = Vec::new();

        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| e.path().is_dir())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("broken-") {
                continue;
            }
            match Block::open(&entry.path(), options.dim, options.fsync_every) {
                Ok(block) => blocks.push(Arc::new(block)),
                Err(Error::Corruption(reason)) => {
                    let broken = dir.join(format!("broken-{}", name));
                    warn!(block = %name, %reason, "quarantining corrupt block");
                    std::fs::rename(entry.path(), broken)?;
                }
                Err(e) => return Err(e),
            }
        }

        blocks.sort_by_key(|b| b.t_start());
        info!(blocks = blocks.len(), dir = %dir.display(), "store opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            blocks: RwLock::new(blocks),
            writer: Mutex::new(()),
        })
    }

    /// Append a record, routing by its ingestion time. Rotates the head
    /// block when the record's time falls past the head window. Returns
    /// `Duplicate` when the fingerprint exists in any live block.
    pub fn append(&self, record: &EnrichedRecord) -> Result<u64> {
        let _writer = self.writer.lock();

        // Fingerprint check across all live blocks, newest first.
        {
            let blocks = self.blocks.read();
            for block in blocks.iter().rev() {
                if block.contains_fingerprint(record.fingerprint) {
                    return Err(Error::Duplicate(record.fingerprint));
                }
            }
        }

        let head = self.head_for(record.time)?;
        head.append(record)
    }

    /// The head block able to take a record at `time`, creating or
    /// rotating as needed. Caller holds the writer lock.
    fn head_for(&self, time: DateTime<Utc>) -> Result<Arc<Block>> {
        {
            let blocks = self.blocks.read();
            if let Some(head) = blocks.last() {
                if time < head.t_end() && !head.is_sealed() {
                    return Ok(head.clone());
                }
            }
        }

        let mut blocks = self.blocks.write();
        if let Some(head) = blocks.last() {
            if time < head.t_end() && !head.is_sealed() {
                return Ok(head.clone());
            }
            if !head.is_sealed() {
                head.seal()?;
            }
        }

        let t_start = time;
        let t_end = t_start + self.options.block_window;
        // A sealed block can share this wall-clock second after a reopen;
        // the directory name only needs to be unique.
        let mut dir = self.dir.join(format!("{}", t_start.timestamp()));
        let mut suffix = 1;
        while dir.exists() {
            dir = self.dir.join(format!("{}-{}", t_start.timestamp(), suffix));
            suffix += 1;
        }
        let block = Arc::new(Block::create(
            &dir,
            self.options.dim,
            t_start,
            t_end,
            self.options.fsync_every,
        )?);
        info!(t_start = %t_start, t_end = %t_end, "rotated to new head block");
        blocks.push(block.clone());
        Ok(block)
    }

    /// Newest record carrying this fingerprint, across all live blocks.
    pub fn get_by_fingerprint(&self, fingerprint: u64) -> Option<StoredRecord> {
        let blocks = self.snapshot();
        blocks
            .iter()
            .rev()
            .find_map(|b| b.get_by_fingerprint(fingerprint))
    }

    pub fn contains_fingerprint(&self, fingerprint: u64) -> bool {
        let blocks = self.snapshot();
        blocks.iter().rev().any(|b| b.contains_fingerprint(fingerprint))
    }

    /// Run a query: label scan per overlapping block, optional KNN over
    /// the candidates, then a global merge. Older records shadowed by a
    /// newer record with the same fingerprint are dropped.
    pub fn query(&self, query: &Query) -> Result<Vec<QueryHit>> {
        let blocks = self.snapshot();
        let mut hits: Vec<QueryHit> = Vec::new();

        for block in blocks.iter() {
            if !query.time_range.overlaps(block.t_start(), block.t_end()) {
                continue;
            }

            let ids: Vec<u64> = block
                .scan(&query.label_filters)
                .into_iter()
                .filter(|&id| {
                    block
                        .time_of(id)
                        .map(|t| query.time_range.contains(t))
                        .unwrap_or(false)
                })
                .collect();
            if ids.is_empty() {
                continue;
            }

            match &query.vector {
                Some(vector) => {
                    for (id, sim) in block.knn(vector, query.limit, Some(&ids)) {
                        if let Some(threshold) = query.threshold {
                            if sim < threshold {
                                continue;
                            }
                        }
                        hits.push(QueryHit {
                            record: block.record(id)?,
                            similarity: Some(sim),
                        });
                    }
                }
                None => {
                    for id in ids {
                        hits.push(QueryHit {
                            record: block.record(id)?,
                            similarity: None,
                        });
                    }
                }
            }
        }

        // Same fingerprint across blocks: only the newest survives.
        let mut newest: HashMap<u64, DateTime<Utc>> = HashMap::new();
        for hit in &hits {
            newest
                .entry(hit.record.fingerprint)
                .and_modify(|t| {
                    if hit.record.time > *t {
                        *t = hit.record.time;
                    }
                })
                .or_insert(hit.record.time);
        }
        let mut taken: std::collections::HashSet<u64> = std::collections::HashSet::new();
        hits.retain(|h| {
            newest[&h.record.fingerprint] == h.record.time && taken.insert(h.record.fingerprint)
        });

        match query.vector {
            Some(_) => hits.sort_by(|a, b| {
                b.similarity
                    .unwrap_or(0.0)
                    .total_cmp(&a.similarity.unwrap_or(0.0))
                    .then(b.record.time.cmp(&a.record.time))
            }),
            None => hits.sort_by(|a, b| b.record.time.cmp(&a.record.time)),
        }
        hits.truncate(query.limit);
        Ok(hits)
    }

    /// Drop blocks whose retention has expired and unlink their files.
    pub fn gc(&self, now: DateTime<Utc>) -> Result<usize> {
        let _writer = self.writer.lock();
        let expired: Vec<Arc<Block>> = {
            let mut blocks = self.blocks.write();
            let (dead, live): (Vec<_>, Vec<_>) = blocks
                .drain(..)
                .partition(|b| b.t_end() + self.options.retention < now);
            *blocks = live;
            dead
        };

        let count = expired.len();
        for block in expired {
            if !block.is_sealed() {
                block.seal()?;
            }
            let dir = block.dir().to_path_buf();
            drop(block);
            std::fs::remove_dir_all(&dir)?;
            info!(dir = %dir.display(), "expired block dropped");
        }
        Ok(count)
    }

    /// Seal the head and flush every block. Idempotent.
    pub fn close(&self) -> Result<()> {
        let _writer = self.writer.lock();
        let blocks = self.snapshot();
        if let Some(head) = blocks.last() {
            if !head.is_sealed() {
                head.seal()?;
            }
        }
        for block in blocks.iter() {
            block.close()?;
        }
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn record_count(&self) -> u64 {
        self.snapshot().iter().map(|b| b.len()).sum()
    }

    fn snapshot(&self) -> Vec<Arc<Block>> {
        self.blocks.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize, LabelFilter, Labels, TimeRange};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn options() -> StoreOptions {
        StoreOptions {
            dim: 3,
            block_window: Duration::hours(1),
            retention: Duration::hours(2),
            fsync_every: 1,
        }
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::minutes(minutes)
    }

    fn record(fingerprint: u64, time: DateTime<Utc>, vector: Vec<f32>) -> EnrichedRecord {
        let mut labels = Labels::new();
        labels.insert("source".into(), "hn".into());
        let mut vector = vector;
        normalize(&mut vector);
        EnrichedRecord {
            fingerprint,
            time,
            published_at: time,
            labels,
            vector,
            score: 0.5,
        }
    }

    fn all_time() -> TimeRange {
        TimeRange::new(at(-600), at(600))
    }

    fn query(range: TimeRange, vector: Option<Vec<f32>>, limit: usize) -> Query {
        Query {
            time_range: range,
            label_filters: Vec::new(),
            vector,
            limit,
            threshold: None,
        }
    }

    #[test]
    fn rotation_creates_second_block() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        // S3: appends at 00:30 and 01:30 with a 1h window span two blocks.
        store.append(&record(1, at(30), vec![1.0, 0.0, 0.0])).unwrap();
        store.append(&record(2, at(90), vec![0.0, 1.0, 0.0])).unwrap();
        assert_eq!(store.block_count(), 2);

        let hits = store
            .query(&query(TimeRange::new(at(0), at(120)), None, 10))
            .unwrap();
        assert_eq!(hits.len(), 2);
        // Sorted newest first without a query vector.
        assert_eq!(hits[0].record.fingerprint, 2);
        assert_eq!(hits[1].record.fingerprint, 1);
    }

    #[test]
    fn duplicate_across_blocks_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        store.append(&record(7, at(30), vec![1.0, 0.0, 0.0])).unwrap();
        // Same fingerprint after rotation still rejected.
        let err = store
            .append(&record(7, at(90), vec![0.0, 1.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(7)));

        let hits = store.query(&query(all_time(), None, 10)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn gc_drops_expired_blocks_and_files() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        store.append(&record(1, at(30), vec![1.0, 0.0, 0.0])).unwrap();
        store.append(&record(2, at(90), vec![0.0, 1.0, 0.0])).unwrap();
        let first_dir = dir.path().join(format!("{}", at(30).timestamp()));
        assert!(first_dir.exists());

        // S4: at 04:00 the 00:30 block (t_end 01:30 + 2h retention) is gone.
        let dropped = store.gc(at(240)).unwrap();
        assert_eq!(dropped, 1);
        assert!(!first_dir.exists());

        let hits = store.query(&query(all_time(), None, 10)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 2);
    }

    #[test]
    fn knn_merges_across_blocks() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        // S1 spread over two blocks: q·A=0.9ish, q·B, q·C descending.
        store.append(&record(1, at(10), vec![1.0, 0.0, 0.0])).unwrap();
        store.append(&record(2, at(20), vec![0.8, 0.6, 0.0])).unwrap();
        store.append(&record(3, at(70), vec![0.6, 0.8, 0.0])).unwrap();
        assert_eq!(store.block_count(), 2);

        let hits = store
            .query(&query(all_time(), Some(vec![1.0, 0.0, 0.0]), 2))
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.fingerprint, 1);
        assert_eq!(hits[1].record.fingerprint, 2);
        assert!(hits[0].similarity.unwrap() > hits[1].similarity.unwrap());
    }

    #[test]
    fn threshold_filters_low_similarity() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        store.append(&record(1, at(10), vec![1.0, 0.0, 0.0])).unwrap();
        store.append(&record(2, at(11), vec![0.0, 0.0, 0.0])).unwrap();

        let mut q = query(all_time(), Some(vec![1.0, 0.0, 0.0]), 10);
        q.threshold = Some(0.5);
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 1);
    }

    #[test]
    fn label_filter_applies_before_knn() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        let mut rec = record(1, at(10), vec![1.0, 0.0, 0.0]);
        rec.labels.insert("category".into(), "tech".into());
        store.append(&rec).unwrap();
        let mut rec = record(2, at(11), vec![1.0, 0.0, 0.0]);
        rec.labels.insert("category".into(), "biz".into());
        store.append(&rec).unwrap();

        let mut q = query(all_time(), Some(vec![1.0, 0.0, 0.0]), 10);
        q.label_filters = vec![LabelFilter::eq("category", "tech")];
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 1);
    }

    #[test]
    fn time_range_excludes_outside_records() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        store.append(&record(1, at(10), vec![1.0, 0.0, 0.0])).unwrap();
        store.append(&record(2, at(50), vec![0.0, 1.0, 0.0])).unwrap();

        let hits = store
            .query(&query(TimeRange::new(at(0), at(30)), None, 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 1);
    }

    #[test]
    fn reopen_restores_blocks_and_head() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), options()).unwrap();
            store.append(&record(1, at(30), vec![1.0, 0.0, 0.0])).unwrap();
            store.append(&record(2, at(90), vec![0.0, 1.0, 0.0])).unwrap();
            store.close().unwrap();
        }
        let store = Store::open(dir.path(), options()).unwrap();
        assert_eq!(store.block_count(), 2);
        assert_eq!(store.record_count(), 2);
        assert!(store.get_by_fingerprint(1).is_some());

        // Appends continue routing after reopen; the old head was sealed
        // on close so a new block is created for in-window times too.
        store.append(&record(3, at(100), vec![0.0, 0.0, 1.0])).unwrap();
        assert!(store.get_by_fingerprint(3).is_some());
    }

    #[test]
    fn corrupt_block_is_quarantined_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path(), options()).unwrap();
            store.append(&record(1, at(30), vec![1.0, 0.0, 0.0])).unwrap();
            store.close().unwrap();
        }
        let block_dir = dir.path().join(format!("{}", at(30).timestamp()));
        std::fs::write(block_dir.join("meta.json"), b"{not json").unwrap();

        let store = Store::open(dir.path(), options()).unwrap();
        assert_eq!(store.block_count(), 0);
        assert!(dir
            .path()
            .join(format!("broken-{}", at(30).timestamp()))
            .exists());
    }

    #[test]
    fn out_of_order_times_append_to_head() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), options()).unwrap();

        store.append(&record(1, at(30), vec![1.0, 0.0, 0.0])).unwrap();
        // Older than the head's start: still lands in the head, carrying
        // its own time.
        store.append(&record(2, at(5), vec![0.0, 1.0, 0.0])).unwrap();
        assert_eq!(store.block_count(), 1);
        let got = store.get_by_fingerprint(2).unwrap();
        assert_eq!(got.time, at(5));
    }
}
