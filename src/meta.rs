//! Embedded metadata storage
//!
//! One rocksdb database with a column family per concern:
//! - `llm_cache`: content-addressed LLM outputs
//! - `watermarks`: per-source ingestion high-water marks
//! - `dispatch`: rule dispatch keys for at-most-once delivery
//!
//! All values are raw bytes; callers own the codecs. Writes are
//! last-writer-wins, which is safe here because every key is either
//! write-once or idempotent.

use crate::error::{Error, Result};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use std::path::Path;
use tracing::info;

pub const CF_LLM_CACHE: &str = "llm_cache";
pub const CF_WATERMARKS: &str = "watermarks";
pub const CF_DISPATCH: &str = "dispatch";

const ALL_CFS: &[&str] = &[CF_LLM_CACHE, CF_WATERMARKS, CF_DISPATCH];

pub struct MetaDb {
    db: DB,
}

impl MetaDb {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        info!(path = %path.display(), "metadata store opened");
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", name)))
    }

    pub fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(cf)?, key)?)
    }

    pub fn put(&self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.db.put_cf(self.cf(cf)?, key, value)?)
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        Ok(self.db.delete_cf(self.cf(cf)?, key)?)
    }

    /// Visit every entry of a column family. The callback returns whether
    /// to keep iterating.
    pub fn for_each(
        &self,
        cf: &str,
        mut visit: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let handle = self.cf(cf)?;
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            if !visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
