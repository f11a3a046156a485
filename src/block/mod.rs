//! One time-window shard
//!
//! A block owns a record journal, a memory-mapped vector matrix, and the
//! in-memory indexes rebuilt from the journal on reopen: a primary map
//! from fingerprint to local id and an inverted index over labels. It is
//! mutated only by the store's single writer and becomes read-only once
//! sealed.

mod journal;
mod vectors;

pub use journal::{JournalRecord, JournalWriter, Replay, JOURNAL_FILE};
pub use vectors::{VectorMatrix, VECTORS_FILE};

use crate::error::{Error, Result};
use crate::model::{EnrichedRecord, LabelFilter, LabelMatch, StoredRecord};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const META_FILE: &str = "meta.json";

/// Block metadata persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub dim: u32,
    pub capacity: u64,
    pub next_id: u64,
    pub t_start_ms: u64,
    pub t_end_ms: u64,
    pub sealed: bool,
}

/// Inverted index: label name -> value -> ascending ids. The value map is
/// ordered so prefix constraints can range-scan it.
type Inverted = HashMap<String, BTreeMap<String, Vec<u64>>>;

struct BlockState {
    journal: JournalWriter,
    vectors: VectorMatrix,
    records: Vec<JournalRecord>,
    primary: HashMap<u64, u64>,
    inverted: Inverted,
    sealed: bool,
}

pub struct Block {
    dir: PathBuf,
    dim: usize,
    t_start: DateTime<Utc>,
    t_end: DateTime<Utc>,
    state: RwLock<BlockState>,
}

impl Block {
    /// Create a fresh block covering `[t_start, t_start + window)`.
    pub fn create(
        dir: &Path,
        dim: usize,
        t_start: DateTime<Utc>,
        t_end: DateTime<Utc>,
        fsync_every: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let vectors = VectorMatrix::create(dir, dim)?;
        let journal = JournalWriter::open(dir, fsync_every)?;
        let block = Self {
            dir: dir.to_path_buf(),
            dim,
            t_start,
            t_end,
            state: RwLock::new(BlockState {
                journal,
                vectors,
                records: Vec::new(),
                primary: HashMap::new(),
                inverted: Inverted::new(),
                sealed: false,
            }),
        };
        block.write_meta()?;
        debug!(dir = %dir.display(), t_start = %t_start, "block created");
        Ok(block)
    }

    /// Reopen a block directory: replay the journal up to the last full
    /// frame, rebuild the indexes, and trust the journal over `meta.json`
    /// for the record count.
    pub fn open(dir: &Path, dim: usize, fsync_every: u64) -> Result<Self> {
        let meta = read_meta(dir)?;
        if meta.dim as usize != dim {
            return Err(Error::Corruption(format!(
                "block {} has dimension {}, deployment uses {}",
                dir.display(),
                meta.dim,
                dim
            )));
        }

        let replay = journal::replay(dir)?;
        let next_id = replay.records.len() as u64;
        // A stale meta (crash between append and meta rewrite) may record a
        // smaller capacity than the journal implies.
        let capacity = meta.capacity.max(next_id.next_power_of_two());
        let vectors = VectorMatrix::open(dir, dim, capacity)?;
        let journal = JournalWriter::open(dir, fsync_every)?;

        let mut primary = HashMap::with_capacity(replay.records.len());
        let mut inverted = Inverted::new();
        for record in &replay.records {
            primary.insert(record.fingerprint, record.id);
            index_labels(&mut inverted, record);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            dim,
            t_start: millis(meta.t_start_ms)?,
            t_end: millis(meta.t_end_ms)?,
            state: RwLock::new(BlockState {
                journal,
                vectors,
                records: replay.records,
                primary,
                inverted,
                sealed: meta.sealed,
            }),
        })
    }

    pub fn t_start(&self) -> DateTime<Utc> {
        self.t_start
    }

    pub fn t_end(&self) -> DateTime<Utc> {
        self.t_end
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> u64 {
        self.state.read().records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.read().sealed
    }

    /// Append a record. Returns the assigned local id, `Duplicate` when the
    /// fingerprint is already present, `Sealed` after rotation.
    pub fn append(&self, record: &EnrichedRecord) -> Result<u64> {
        let mut state = self.state.write();
        if state.sealed {
            return Err(Error::Sealed);
        }
        if record.vector.len() != self.dim {
            return Err(Error::Internal(format!(
                "vector dimension mismatch: expected {}, got {}",
                self.dim,
                record.vector.len()
            )));
        }
        if state.primary.contains_key(&record.fingerprint) {
            return Err(Error::Duplicate(record.fingerprint));
        }

        let id = state.records.len() as u64;
        // Matrix row first; the journal frame is the commit point, so a
        // crash in between leaves a garbage row that replay reuses.
        state.vectors.write_row(id, &record.vector)?;

        let entry = JournalRecord {
            id,
            fingerprint: record.fingerprint,
            time: record.time,
            published_at: record.published_at,
            score: record.score,
            labels: record
                .labels
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        state.journal.append(&entry)?;

        state.primary.insert(entry.fingerprint, id);
        index_labels(&mut state.inverted, &entry);
        state.records.push(entry);
        Ok(id)
    }

    pub fn contains_fingerprint(&self, fingerprint: u64) -> bool {
        self.state.read().primary.contains_key(&fingerprint)
    }

    pub fn get_by_fingerprint(&self, fingerprint: u64) -> Option<StoredRecord> {
        let state = self.state.read();
        let id = *state.primary.get(&fingerprint)?;
        Some(build_record(&state, id).ok()?)
    }

    /// Ingestion time of a record, without materializing it.
    pub fn time_of(&self, id: u64) -> Option<DateTime<Utc>> {
        self.state.read().records.get(id as usize).map(|r| r.time)
    }

    /// Fetch one record by local id.
    pub fn record(&self, id: u64) -> Result<StoredRecord> {
        let state = self.state.read();
        if id >= state.records.len() as u64 {
            return Err(Error::NotFound(format!("record id {}", id)));
        }
        build_record(&state, id)
    }

    /// Ids matching every label constraint, newest (largest id) first.
    pub fn scan(&self, filters: &[LabelFilter]) -> Vec<u64> {
        let state = self.state.read();
        let total = state.records.len() as u64;
        if filters.is_empty() {
            return (0..total).rev().collect();
        }

        let mut lists: Vec<Vec<u64>> = Vec::with_capacity(filters.len());
        for filter in filters {
            lists.push(candidate_ids(&state, filter, total));
        }
        // Drive the intersection from the shortest list.
        lists.sort_by_key(|l| l.len());
        let Some((driver, rest)) = lists.split_first() else {
            return Vec::new();
        };

        let mut out: Vec<u64> = driver
            .iter()
            .copied()
            .filter(|id| rest.iter().all(|l| l.binary_search(id).is_ok()))
            .collect();
        out.reverse();
        out
    }

    /// Brute-force top-k by dot product over the candidate set (or every
    /// row when no candidates are given). Ties break toward larger ids.
    pub fn knn(&self, query: &[f32], k: usize, candidates: Option<&[u64]>) -> Vec<(u64, f32)> {
        let state = self.state.read();
        let total = state.records.len() as u64;
        if k == 0 || total == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(k + 1);
        let mut consider = |id: u64| {
            if id >= total {
                return;
            }
            let sim = match state.vectors.dot_row(id, query) {
                Ok(sim) => sim,
                Err(_) => return,
            };
            heap.push(Reverse(Scored { sim, id }));
            if heap.len() > k {
                heap.pop();
            }
        };

        match candidates {
            Some(ids) => ids.iter().copied().for_each(&mut consider),
            None => (0..total).for_each(&mut consider),
        }

        let mut out: Vec<(u64, f32)> = heap
            .into_iter()
            .map(|Reverse(s)| (s.id, s.sim))
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
        out
    }

    /// Mark read-only. Subsequent appends fail with `Sealed`.
    pub fn seal(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.sealed {
                return Ok(());
            }
            state.sealed = true;
            state.journal.sync()?;
            state.vectors.flush()?;
        }
        self.write_meta()?;
        debug!(dir = %self.dir.display(), "block sealed");
        Ok(())
    }

    /// Flush journal and matrix, refresh meta. Called on shutdown.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.journal.sync()?;
            state.vectors.flush()?;
        }
        self.write_meta()
    }

    fn write_meta(&self) -> Result<()> {
        let state = self.state.read();
        let meta = BlockMeta {
            dim: self.dim as u32,
            capacity: state.vectors.capacity(),
            next_id: state.records.len() as u64,
            t_start_ms: self.t_start.timestamp_millis() as u64,
            t_end_ms: self.t_end.timestamp_millis() as u64,
            sealed: state.sealed,
        };
        let tmp = self.dir.join(format!("{}.tmp", META_FILE));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&meta)?)?;
        std::fs::rename(&tmp, self.dir.join(META_FILE))?;
        Ok(())
    }
}

fn read_meta(dir: &Path) -> Result<BlockMeta> {
    let raw = std::fs::read(dir.join(META_FILE))
        .map_err(|e| Error::Corruption(format!("cannot read {}: {}", dir.display(), e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Corruption(format!("bad meta.json in {}: {}", dir.display(), e)))
}

fn millis(ms: u64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| Error::Corruption(format!("timestamp out of range: {}", ms)))
}

fn index_labels(inverted: &mut Inverted, record: &JournalRecord) {
    for (name, value) in &record.labels {
        if value.is_empty() {
            continue;
        }
        inverted
            .entry(name.clone())
            .or_default()
            .entry(value.clone())
            .or_default()
            .push(record.id);
    }
}

fn build_record(state: &BlockState, id: u64) -> Result<StoredRecord> {
    let entry = &state.records[id as usize];
    Ok(StoredRecord {
        id,
        fingerprint: entry.fingerprint,
        time: entry.time,
        published_at: entry.published_at,
        labels: entry.labels.clone(),
        vector: state.vectors.row(id)?,
        score: entry.score,
    })
}

/// Ascending ids satisfying one constraint.
fn candidate_ids(state: &BlockState, filter: &LabelFilter, total: u64) -> Vec<u64> {
    let values = state.inverted.get(&filter.name);
    match &filter.matcher {
        LabelMatch::Eq(value) => values
            .and_then(|m| m.get(value))
            .cloned()
            .unwrap_or_default(),
        LabelMatch::In(options) => {
            let mut ids: Vec<u64> = Vec::new();
            if let Some(m) = values {
                for value in options {
                    if let Some(list) = m.get(value) {
                        ids.extend_from_slice(list);
                    }
                }
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        }
        LabelMatch::Prefix(prefix) => {
            let mut ids: Vec<u64> = Vec::new();
            if let Some(m) = values {
                for (_, list) in m
                    .range(prefix.clone()..)
                    .take_while(|(v, _)| v.starts_with(prefix.as_str()))
                {
                    ids.extend_from_slice(list);
                }
            }
            ids.sort_unstable();
            ids.dedup();
            ids
        }
        LabelMatch::NotEq(value) => {
            let excluded = values.and_then(|m| m.get(value));
            match excluded {
                None => (0..total).collect(),
                Some(list) => (0..total).filter(|id| list.binary_search(id).is_err()).collect(),
            }
        }
    }
}

struct Scored {
    sim: f32,
    id: u64,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.sim.total_cmp(&other.sim).is_eq() && self.id == other.id
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Similarity first, then id: among equal similarities the larger
        // (newer) id ranks higher and survives heap eviction.
        self.sim
            .total_cmp(&other.sim)
            .then(self.id.cmp(&other.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize, Labels};
    use tempfile::TempDir;

    fn record(fingerprint: u64, vector: Vec<f32>, labels: &[(&str, &str)]) -> EnrichedRecord {
        let mut map = Labels::new();
        for (k, v) in labels {
            map.insert(k.to_string(), v.to_string());
        }
        let mut vector = vector;
        normalize(&mut vector);
        EnrichedRecord {
            fingerprint,
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            published_at: Utc.timestamp_millis_opt(1_699_999_000_000).unwrap(),
            labels: map,
            vector,
            score: 0.5,
        }
    }

    fn open_block(dir: &Path) -> Block {
        let t_start = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        Block::create(dir, 3, t_start, t_start + chrono::Duration::hours(1), 1).unwrap()
    }

    #[test]
    fn append_assigns_sequential_ids() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        assert_eq!(block.append(&record(1, vec![1.0, 0.0, 0.0], &[])).unwrap(), 0);
        assert_eq!(block.append(&record(2, vec![0.0, 1.0, 0.0], &[])).unwrap(), 1);
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn duplicate_fingerprint_rejected() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.append(&record(7, vec![1.0, 0.0, 0.0], &[])).unwrap();
        let err = block.append(&record(7, vec![0.0, 1.0, 0.0], &[])).unwrap_err();
        assert!(matches!(err, Error::Duplicate(7)));
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn sealed_block_rejects_appends() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.seal().unwrap();
        let err = block.append(&record(1, vec![1.0, 0.0, 0.0], &[])).unwrap_err();
        assert!(matches!(err, Error::Sealed));
    }

    #[test]
    fn scan_intersects_filters() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block
            .append(&record(1, vec![1.0, 0.0, 0.0], &[("source", "hn"), ("category", "tech")]))
            .unwrap();
        block
            .append(&record(2, vec![0.0, 1.0, 0.0], &[("source", "hn"), ("category", "biz")]))
            .unwrap();
        block
            .append(&record(3, vec![0.0, 0.0, 1.0], &[("source", "rss"), ("category", "tech")]))
            .unwrap();

        assert_eq!(block.scan(&[LabelFilter::eq("source", "hn")]), vec![1, 0]);
        assert_eq!(
            block.scan(&[
                LabelFilter::eq("source", "hn"),
                LabelFilter::eq("category", "tech"),
            ]),
            vec![0]
        );
        assert_eq!(
            block.scan(&[LabelFilter {
                name: "category".into(),
                matcher: LabelMatch::In(vec!["tech".into(), "biz".into()]),
            }]),
            vec![2, 1, 0]
        );
        assert_eq!(
            block.scan(&[LabelFilter {
                name: "source".into(),
                matcher: LabelMatch::NotEq("hn".into()),
            }]),
            vec![2]
        );
        assert_eq!(
            block.scan(&[LabelFilter {
                name: "source".into(),
                matcher: LabelMatch::Prefix("h".into()),
            }]),
            vec![1, 0]
        );
        assert!(block.scan(&[LabelFilter::eq("source", "none")]).is_empty());
    }

    #[test]
    fn empty_label_values_are_not_indexed() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block
            .append(&record(1, vec![1.0, 0.0, 0.0], &[("category", "")]))
            .unwrap();
        assert!(block.scan(&[LabelFilter::eq("category", "")]).is_empty());
        // The empty value is treated as absent, so not-eq matches it.
        assert_eq!(
            block.scan(&[LabelFilter {
                name: "category".into(),
                matcher: LabelMatch::NotEq("tech".into()),
            }]),
            vec![0]
        );
    }

    #[test]
    fn knn_returns_top_k_sorted() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.append(&record(1, vec![1.0, 0.0, 0.0], &[])).unwrap();
        block.append(&record(2, vec![0.8, 0.6, 0.0], &[])).unwrap();
        block.append(&record(3, vec![0.0, 0.0, 1.0], &[])).unwrap();

        let hits = block.knn(&[1.0, 0.0, 0.0], 2, None);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, 1);
        assert!((hits[1].1 - 0.8).abs() < 1e-6);
    }

    #[test]
    fn knn_ties_prefer_newer_id() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.append(&record(1, vec![1.0, 0.0, 0.0], &[])).unwrap();
        block.append(&record(2, vec![1.0, 0.0, 0.0], &[])).unwrap();
        block.append(&record(3, vec![1.0, 0.0, 0.0], &[])).unwrap();

        let hits = block.knn(&[1.0, 0.0, 0.0], 2, None);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn knn_respects_candidate_prefilter() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.append(&record(1, vec![1.0, 0.0, 0.0], &[])).unwrap();
        block.append(&record(2, vec![0.9, 0.1, 0.0], &[])).unwrap();
        block.append(&record(3, vec![0.8, 0.2, 0.0], &[])).unwrap();

        let hits = block.knn(&[1.0, 0.0, 0.0], 3, Some(&[1, 2]));
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn zero_vector_is_indexable_with_zero_similarity() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        block.append(&record(1, vec![0.0, 0.0, 0.0], &[])).unwrap();

        let hits = block.knn(&[1.0, 0.0, 0.0], 1, None);
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[0].1, 0.0);
    }

    #[test]
    fn reopen_round_trips_records() {
        let dir = TempDir::new().unwrap();
        let rec = record(42, vec![0.6, 0.8, 0.0], &[("source", "hn"), ("title", "x")]);
        {
            let block = open_block(dir.path());
            block.append(&rec).unwrap();
            block.close().unwrap();
        }
        let block = Block::open(dir.path(), 3, 1).unwrap();
        assert_eq!(block.len(), 1);
        let got = block.get_by_fingerprint(42).unwrap();
        assert_eq!(got.labels, rec.labels);
        assert_eq!(got.score, rec.score);
        assert_eq!(got.time, rec.time);
        assert_eq!(got.published_at, rec.published_at);
        assert_eq!(got.vector, rec.vector);
        // Indexes were rebuilt from the journal.
        assert_eq!(block.scan(&[LabelFilter::eq("source", "hn")]), vec![0]);
    }

    #[test]
    fn reopen_preserves_seal() {
        let dir = TempDir::new().unwrap();
        {
            let block = open_block(dir.path());
            block.seal().unwrap();
        }
        let block = Block::open(dir.path(), 3, 1).unwrap();
        assert!(block.is_sealed());
    }

    #[test]
    fn open_with_wrong_dim_is_corruption() {
        let dir = TempDir::new().unwrap();
        {
            let block = open_block(dir.path());
            block.close().unwrap();
        }
        assert!(matches!(
            Block::open(dir.path(), 8, 1),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn open_without_meta_is_corruption() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Block::open(dir.path(), 3, 1),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn growth_preserves_existing_vectors() {
        let dir = TempDir::new().unwrap();
        let block = open_block(dir.path());
        // Push past the initial matrix capacity to force a doubling.
        for i in 0..1100u64 {
            block
                .append(&record(i + 1, vec![1.0, i as f32, 0.0], &[]))
                .unwrap();
        }
        let first = block.record(0).unwrap();
        assert_eq!(first.vector, {
            let mut v = vec![1.0, 0.0, 0.0];
            normalize(&mut v);
            v
        });
        assert_eq!(block.len(), 1100);
    }
}
