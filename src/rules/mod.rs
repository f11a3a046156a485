//! Rule evaluation and notification dispatch
//!
//! A rule is a stored query (label filter plus an optional embedded
//! natural-language prompt) evaluated periodically against the store.
//! Every hit is dispatched to the rule's channel at most once per
//! (rule version, item fingerprint) within the dedup window. Dispatch
//! keys are persisted so restarts keep the guarantee.

mod channel;

pub use channel::{LogChannel, WebhookChannel};

use crate::config::{LlmConfig, RuleConfig};
use crate::crawl::cancellable;
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::meta::{MetaDb, CF_DISPATCH};
use crate::model::{label, normalize, Query, StoredRecord, TimeRange};
use crate::schedule::{Clock, ShutdownToken};
use crate::store::Store;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Channel acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Ok,
    /// Transient failure: retry on the next tick
    Retryable,
    /// The message can never be delivered; do not retry
    Permanent,
}

/// Notification sink capability (mail, webhook, ...)
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    async fn send(
        &self,
        rule_id: &str,
        record: &StoredRecord,
        message: &str,
    ) -> Result<SendOutcome>;
}

/// Counters for one evaluation tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuleStats {
    pub matched: usize,
    pub dispatched: usize,
    pub deduped: usize,
    pub failed: usize,
}

pub struct RuleEvaluator {
    rule: RuleConfig,
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
    channel: Arc<dyn NotifyChannel>,
    db: Arc<MetaDb>,
    clock: Arc<dyn Clock>,
    /// Embedded once per (rule id, version)
    query_vector: AsyncMutex<Option<Vec<f32>>>,
    /// Recently dispatched keys with their dispatch time
    dispatched: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl RuleEvaluator {
    /// Build an evaluator, reloading this rule's recent dispatch keys
    /// from the metadata store.
    pub fn new(
        rule: RuleConfig,
        store: Arc<Store>,
        llm: Arc<dyn LlmClient>,
        llm_config: LlmConfig,
        channel: Arc<dyn NotifyChannel>,
        db: Arc<MetaDb>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let prefix = db_prefix(&rule.id);
        let mut dispatched = HashMap::new();
        db.for_each(CF_DISPATCH, |key, value| {
            if key.len() == prefix.len() + 8 && key.starts_with(&prefix) && value.len() == 8 {
                let dispatch_key = u64::from_be_bytes(key[prefix.len()..].try_into().unwrap());
                if let Some(at) = Utc
                    .timestamp_millis_opt(LittleEndian::read_u64(value) as i64)
                    .single()
                {
                    dispatched.insert(dispatch_key, at);
                }
            }
            true
        })?;
        debug!(rule = %rule.id, restored = dispatched.len(), "dispatch state loaded");

        Ok(Self {
            rule,
            store,
            llm,
            llm_config,
            channel,
            db,
            clock,
            query_vector: AsyncMutex::new(None),
            dispatched: Mutex::new(dispatched),
        })
    }

    pub fn rule_id(&self) -> &str {
        &self.rule.id
    }

    pub fn config(&self) -> &RuleConfig {
        &self.rule
    }

    /// One evaluation pass, bounded by the rule period.
    pub async fn tick(&self, token: &ShutdownToken) -> Result<RuleStats> {
        let deadline = std::time::Duration::from_secs(self.rule.period_secs);
        match tokio::time::timeout(deadline, self.tick_inner(token)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "rule {} tick exceeded {}s",
                self.rule.id, self.rule.period_secs
            ))),
        }
    }

    async fn tick_inner(&self, token: &ShutdownToken) -> Result<RuleStats> {
        let now = self.clock.now();
        self.purge(now)?;

        let vector = self.query_vector(token).await?;
        let query = Query {
            time_range: TimeRange::new(
                now - Duration::seconds(self.rule.time_range_secs as i64),
                now,
            ),
            label_filters: self.rule.labels_filter.clone(),
            vector,
            limit: self.rule.k,
            threshold: self.rule.threshold,
        };

        let hits = self.store.query(&query)?;
        let mut stats = RuleStats {
            matched: hits.len(),
            ..Default::default()
        };

        for hit in hits {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let key = dispatch_key(&self.rule.id, &self.rule.version, hit.record.fingerprint);
            if self.dispatched.lock().contains_key(&key) {
                stats.deduped += 1;
                continue;
            }

            let message = render(&hit.record);
            match cancellable(
                token,
                self.channel.send(&self.rule.id, &hit.record, &message),
            )
            .await?
            {
                Ok(SendOutcome::Ok) => {
                    self.record_dispatch(key, now)?;
                    stats.dispatched += 1;
                }
                Ok(SendOutcome::Permanent) => {
                    // Retrying cannot succeed; remember the key so the
                    // item is not re-attempted every tick.
                    warn!(rule = %self.rule.id, fingerprint = hit.record.fingerprint, "permanent channel failure");
                    self.record_dispatch(key, now)?;
                    stats.failed += 1;
                }
                Ok(SendOutcome::Retryable) => {
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!(rule = %self.rule.id, error = %e, "channel send failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.dispatched > 0 {
            info!(
                rule = %self.rule.id,
                matched = stats.matched,
                dispatched = stats.dispatched,
                deduped = stats.deduped,
                "rule tick done"
            );
        }
        Ok(stats)
    }

    /// Lazily embed the rule's query text, once per evaluator lifetime
    /// (i.e. once per rule version; registration rebuilds the evaluator).
    async fn query_vector(&self, token: &ShutdownToken) -> Result<Option<Vec<f32>>> {
        let text = match &self.rule.query_text {
            Some(text) if !text.is_empty() => text.clone(),
            _ => return Ok(None),
        };

        let mut slot = self.query_vector.lock().await;
        if let Some(vector) = slot.as_ref() {
            return Ok(Some(vector.clone()));
        }
        let mut vector =
            cancellable(token, self.llm.embed(&self.llm_config.embedding_model, &text)).await??;
        if vector.len() != self.llm_config.embedding_dim {
            return Err(Error::Upstream(format!(
                "rule {} query embedding has dimension {}, expected {}",
                self.rule.id,
                vector.len(),
                self.llm_config.embedding_dim
            )));
        }
        normalize(&mut vector);
        *slot = Some(vector.clone());
        Ok(Some(vector))
    }

    fn record_dispatch(&self, key: u64, at: DateTime<Utc>) -> Result<()> {
        let mut value = [0u8; 8];
        LittleEndian::write_u64(&mut value, at.timestamp_millis() as u64);
        self.db.put(CF_DISPATCH, &db_key(&self.rule.id, key), &value)?;
        self.dispatched.lock().insert(key, at);
        Ok(())
    }

    /// Drop dispatch keys older than the dedup window.
    fn purge(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - Duration::seconds(self.rule.dedup_window_secs as i64);
        let expired: Vec<u64> = {
            let dispatched = self.dispatched.lock();
            dispatched
                .iter()
                .filter(|(_, at)| **at < cutoff)
                .map(|(k, _)| *k)
                .collect()
        };
        for key in expired {
            self.db.delete(CF_DISPATCH, &db_key(&self.rule.id, key))?;
            self.dispatched.lock().remove(&key);
        }
        Ok(())
    }
}

/// Deduplication identifier for (rule version, item).
pub fn dispatch_key(rule_id: &str, version: &str, fingerprint: u64) -> u64 {
    let mut buf = Vec::with_capacity(rule_id.len() + version.len() + 10);
    buf.extend_from_slice(rule_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(version.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&fingerprint.to_be_bytes());
    twox_hash::xxh3::hash64(&buf)
}

fn db_prefix(rule_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(rule_id.len() + 1);
    prefix.extend_from_slice(rule_id.as_bytes());
    prefix.push(0);
    prefix
}

fn db_key(rule_id: &str, dispatch_key: u64) -> Vec<u8> {
    let mut key = db_prefix(rule_id);
    key.extend_from_slice(&dispatch_key.to_be_bytes());
    key
}

fn render(record: &StoredRecord) -> String {
    let title = record.labels.get(label::TITLE).map(String::as_str).unwrap_or("");
    let link = record.labels.get(label::LINK).map(String::as_str).unwrap_or("");
    let summary = record
        .labels
        .get(label::SUMMARY)
        .map(String::as_str)
        .unwrap_or("");
    format!("{}\n{}\n\n{}", title, link, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnrichedRecord, LabelFilter, Labels};
    use crate::schedule::{ManualClock, ShutdownHandle};
    use crate::store::StoreOptions;
    use tempfile::TempDir;

    struct FakeLlm;

    #[async_trait]
    impl LlmClient for FakeLlm {
        async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }

        async fn complete(&self, _model: &str, _prompt: &str) -> Result<String> {
            Ok("ok".into())
        }
    }

    struct FakeChannel {
        outcome: Mutex<SendOutcome>,
        sent: Mutex<Vec<String>>,
    }

    impl FakeChannel {
        fn new() -> Self {
            Self {
                outcome: Mutex::new(SendOutcome::Ok),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NotifyChannel for FakeChannel {
        async fn send(
            &self,
            _rule_id: &str,
            record: &StoredRecord,
            _message: &str,
        ) -> Result<SendOutcome> {
            let outcome = *self.outcome.lock();
            if outcome == SendOutcome::Ok {
                self.sent.lock().push(format!("{}", record.fingerprint));
            }
            Ok(outcome)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn record(fingerprint: u64, time: DateTime<Utc>) -> EnrichedRecord {
        let mut labels = Labels::new();
        labels.insert("category".into(), "tech".into());
        labels.insert("title".into(), "t".into());
        labels.insert("link".into(), "https://e.com/a".into());
        EnrichedRecord {
            fingerprint,
            time,
            published_at: time,
            labels,
            vector: vec![1.0, 0.0, 0.0],
            score: 0.5,
        }
    }

    fn rule() -> RuleConfig {
        RuleConfig {
            id: "r1".into(),
            version: "v1".into(),
            query_text: Some("foo".into()),
            labels_filter: vec![LabelFilter::eq("category", "tech")],
            k: 10,
            threshold: Some(0.75),
            time_range_secs: 86_400,
            period_secs: 300,
            channel: "fake".into(),
            dedup_window_secs: 86_400,
        }
    }

    struct Fixture {
        store: Arc<Store>,
        db: Arc<MetaDb>,
        channel: Arc<FakeChannel>,
        clock: Arc<ManualClock>,
        _dirs: (TempDir, TempDir),
    }

    impl Fixture {
        fn new() -> Self {
            let store_dir = TempDir::new().unwrap();
            let db_dir = TempDir::new().unwrap();
            let store = Arc::new(
                Store::open(
                    store_dir.path(),
                    StoreOptions {
                        dim: 3,
                        block_window: chrono::Duration::hours(24),
                        retention: chrono::Duration::hours(48),
                        fsync_every: 1,
                    },
                )
                .unwrap(),
            );
            Self {
                store,
                db: Arc::new(MetaDb::open(db_dir.path()).unwrap()),
                channel: Arc::new(FakeChannel::new()),
                clock: Arc::new(ManualClock::new(t0())),
                _dirs: (store_dir, db_dir),
            }
        }

        fn evaluator(&self, rule: RuleConfig) -> RuleEvaluator {
            let mut llm_config = LlmConfig::default();
            llm_config.embedding_dim = 3;
            RuleEvaluator::new(
                rule,
                self.store.clone(),
                Arc::new(FakeLlm),
                llm_config,
                self.channel.clone(),
                self.db.clone(),
                self.clock.clone(),
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn first_tick_dispatches_then_dedups() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let evaluator = f.evaluator(rule());
        let token = ShutdownHandle::new().token();

        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.dispatched, 1);

        // Still matching on the next tick: deduped, not re-sent.
        f.clock.advance(Duration::minutes(5));
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.deduped, 1);
        assert_eq!(f.channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_next_tick() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let evaluator = f.evaluator(rule());
        let token = ShutdownHandle::new().token();

        *f.channel.outcome.lock() = SendOutcome::Retryable;
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dispatched, 0);

        *f.channel.outcome.lock() = SendOutcome::Ok;
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let evaluator = f.evaluator(rule());
        let token = ShutdownHandle::new().token();

        *f.channel.outcome.lock() = SendOutcome::Permanent;
        evaluator.tick(&token).await.unwrap();

        *f.channel.outcome.lock() = SendOutcome::Ok;
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.deduped, 1);
    }

    #[tokio::test]
    async fn dedup_survives_evaluator_restart() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let token = ShutdownHandle::new().token();

        let evaluator = f.evaluator(rule());
        evaluator.tick(&token).await.unwrap();
        drop(evaluator);

        // Same rule, fresh process: dispatch keys come back from disk.
        let evaluator = f.evaluator(rule());
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.deduped, 1);
    }

    #[tokio::test]
    async fn version_bump_rearms_dispatch() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let token = ShutdownHandle::new().token();

        f.evaluator(rule()).tick(&token).await.unwrap();

        let mut bumped = rule();
        bumped.version = "v2".into();
        let stats = f.evaluator(bumped).tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(f.channel.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn dispatch_rearms_after_dedup_window() {
        let f = Fixture::new();
        f.store.append(&record(1, t0())).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let mut r = rule();
        r.time_range_secs = 10 * 86_400;
        let evaluator = f.evaluator(r);
        let token = ShutdownHandle::new().token();

        evaluator.tick(&token).await.unwrap();
        // Past the dedup window the key is purged and the item, still
        // matching, dispatches again.
        f.clock.advance(Duration::seconds(86_400 + 60));
        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(f.channel.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn threshold_suppresses_weak_matches() {
        let f = Fixture::new();
        let mut weak = record(1, t0());
        weak.vector = vec![0.0, 1.0, 0.0];
        f.store.append(&weak).unwrap();
        f.clock.set(t0() + Duration::minutes(5));
        let evaluator = f.evaluator(rule());
        let token = ShutdownHandle::new().token();

        let stats = evaluator.tick(&token).await.unwrap();
        assert_eq!(stats.matched, 0);
        assert_eq!(stats.dispatched, 0);
    }

    #[test]
    fn dispatch_key_separates_rules_versions_items() {
        let a = dispatch_key("r1", "v1", 1);
        assert_ne!(a, dispatch_key("r2", "v1", 1));
        assert_ne!(a, dispatch_key("r1", "v2", 1));
        assert_ne!(a, dispatch_key("r1", "v1", 2));
        assert_eq!(a, dispatch_key("r1", "v1", 1));
    }
}
