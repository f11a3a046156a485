//! Content-addressed LLM output cache
//!
//! Maps `(item fingerprint, field, prompt version)` to the raw model
//! output. Entries are write-once; a concurrent populate for the same key
//! writes an equivalent value, so last-writer-wins is safe. Values carry
//! their insertion time so an age-bound sweep can evict old entries.

use crate::error::Result;
use crate::meta::{MetaDb, CF_LLM_CACHE};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

pub struct LlmCache {
    db: Arc<MetaDb>,
}

impl LlmCache {
    pub fn new(db: Arc<MetaDb>) -> Self {
        Self { db }
    }

    fn key(fingerprint: u64, field: &str, prompt_version: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + field.len() + 1 + prompt_version.len());
        key.extend_from_slice(&fingerprint.to_be_bytes());
        key.extend_from_slice(field.as_bytes());
        key.push(0);
        key.extend_from_slice(prompt_version.as_bytes());
        key
    }

    pub fn get(
        &self,
        fingerprint: u64,
        field: &str,
        prompt_version: &str,
    ) -> Result<Option<Vec<u8>>> {
        let key = Self::key(fingerprint, field, prompt_version);
        Ok(self
            .db
            .get(CF_LLM_CACHE, &key)?
            .filter(|v| v.len() >= 8)
            .map(|v| v[8..].to_vec()))
    }

    pub fn put(
        &self,
        fingerprint: u64,
        field: &str,
        prompt_version: &str,
        output: &[u8],
    ) -> Result<()> {
        let key = Self::key(fingerprint, field, prompt_version);
        let mut value = Vec::with_capacity(8 + output.len());
        value.extend_from_slice(&(Utc::now().timestamp_millis() as u64).to_le_bytes());
        value.extend_from_slice(output);
        self.db.put(CF_LLM_CACHE, &key, &value)
    }

    /// Evict entries inserted before `cutoff`. Returns the eviction count.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis() as u64;
        let mut expired: Vec<Vec<u8>> = Vec::new();
        self.db.for_each(CF_LLM_CACHE, |key, value| {
            if value.len() >= 8 && LittleEndian::read_u64(&value[..8]) < cutoff_ms {
                expired.push(key.to_vec());
            }
            true
        })?;
        for key in &expired {
            self.db.delete(CF_LLM_CACHE, key)?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "llm cache entries evicted");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> LlmCache {
        LlmCache::new(Arc::new(MetaDb::open(dir.path()).unwrap()))
    }

    #[test]
    fn miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        assert_eq!(cache.get(1, "summary", "v1").unwrap(), None);
        cache.put(1, "summary", "v1", b"short summary").unwrap();
        assert_eq!(
            cache.get(1, "summary", "v1").unwrap(),
            Some(b"short summary".to_vec())
        );
    }

    #[test]
    fn prompt_version_isolates_entries() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        cache.put(1, "summary", "v1", b"old").unwrap();
        // A version bump invalidates the field's cache.
        assert_eq!(cache.get(1, "summary", "v2").unwrap(), None);
        // Other fields of the same item are unaffected.
        assert_eq!(cache.get(1, "category", "v1").unwrap(), None);
    }

    #[test]
    fn fields_do_not_collide_with_versions() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        // "tag" + "s.v1" must not alias "tags" + ".v1".
        cache.put(1, "tag", "s1", b"a").unwrap();
        assert_eq!(cache.get(1, "tags", "1").unwrap(), None);
    }

    #[test]
    fn sweep_evicts_old_entries_only() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);

        cache.put(1, "summary", "v1", b"keep").unwrap();
        // Everything was inserted "now", so a cutoff in the past removes
        // nothing and one in the future removes all.
        assert_eq!(cache.sweep(Utc::now() - chrono::Duration::hours(1)).unwrap(), 0);
        assert_eq!(cache.sweep(Utc::now() + chrono::Duration::hours(1)).unwrap(), 1);
        assert_eq!(cache.get(1, "summary", "v1").unwrap(), None);
    }
}
