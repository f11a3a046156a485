//! Engine facade
//!
//! The in-process API: append, query, point lookup, rule registration,
//! and lifecycle. `start` wires the scheduler jobs (per-source ingestion,
//! per-rule evaluation, store GC, cache sweep); job closures capture only
//! the capability handles they need, never the engine itself.

use crate::config::{Config, RuleConfig};
use crate::crawl::{cancellable, Crawler, HttpContext, TextExtractor};
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::ingest::{FeedParser, Ingester};
use crate::llm::{LlmCache, LlmClient};
use crate::meta::MetaDb;
use crate::model::{EnrichedRecord, StoredRecord};
use crate::query::{QueryPlanner, QueryRequest};
use crate::rules::{NotifyChannel, RuleEvaluator};
use crate::schedule::{Clock, JobSpec, Scheduler, ShutdownToken};
use crate::store::{Store, StoreOptions};
use chrono::Duration as ChronoDuration;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

type RuleMap = Arc<RwLock<HashMap<String, Arc<RuleEvaluator>>>>;

pub struct Engine {
    config: Config,
    store: Arc<Store>,
    db: Arc<MetaDb>,
    cache: Arc<LlmCache>,
    llm: Arc<dyn LlmClient>,
    enricher: Arc<Enricher>,
    planner: QueryPlanner,
    http: Arc<HttpContext>,
    clock: Arc<dyn Clock>,
    channels: HashMap<String, Arc<dyn NotifyChannel>>,
    rules: RuleMap,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    /// Open the engine: storage, caches, HTTP context, and the rules
    /// declared in configuration.
    pub fn open(
        config: Config,
        llm: Arc<dyn LlmClient>,
        channels: HashMap<String, Arc<dyn NotifyChannel>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(Store::open(
            &config.blocks_dir(),
            StoreOptions {
                dim: config.llm.embedding_dim,
                block_window: ChronoDuration::seconds(config.store.block_window_secs as i64),
                retention: ChronoDuration::seconds(config.store.retention_secs as i64),
                fsync_every: config.store.fsync_every,
            },
        )?);
        let db = Arc::new(MetaDb::open(&config.kv_dir())?);
        let cache = Arc::new(LlmCache::new(db.clone()));
        let enricher = Arc::new(Enricher::new(
            llm.clone(),
            cache.clone(),
            config.enrich.clone(),
            config.llm.clone(),
        ));
        let planner = QueryPlanner::new(store.clone(), llm.clone(), config.llm.clone());
        let http = Arc::new(HttpContext::new(&config.crawl)?);

        let engine = Self {
            store,
            db,
            cache,
            llm,
            enricher,
            planner,
            http,
            clock,
            channels,
            rules: Arc::new(RwLock::new(HashMap::new())),
            scheduler: Mutex::new(None),
            config,
        };

        for rule in engine.config.rules.clone() {
            engine.register_rule(rule)?;
        }
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Shared HTTP state for collaborators (feed parsers, crawlers).
    pub fn http_context(&self) -> &Arc<HttpContext> {
        &self.http
    }

    /// Append a pre-enriched record.
    pub fn append(&self, record: &EnrichedRecord) -> Result<u64> {
        self.store.append(record)
    }

    pub fn get_by_fingerprint(&self, fingerprint: u64) -> Option<StoredRecord> {
        self.store.get_by_fingerprint(fingerprint)
    }

    /// Run a (possibly semantic) query.
    pub async fn query(
        &self,
        request: &QueryRequest,
        token: &ShutdownToken,
    ) -> Result<Vec<crate::model::QueryHit>> {
        self.planner.query(request, token).await
    }

    /// Register (or replace) a rule. If the scheduler is running and the
    /// rule is new, its evaluation job starts immediately.
    pub fn register_rule(&self, rule: RuleConfig) -> Result<()> {
        let channel = self
            .channels
            .get(&rule.channel)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown channel: {}", rule.channel)))?;

        let evaluator = Arc::new(RuleEvaluator::new(
            rule.clone(),
            self.store.clone(),
            self.llm.clone(),
            self.config.llm.clone(),
            channel,
            self.db.clone(),
            self.clock.clone(),
        )?);

        let replaced = self
            .rules
            .write()
            .insert(rule.id.clone(), evaluator)
            .is_some();
        info!(rule = %rule.id, replaced, "rule registered");

        if !replaced {
            if let Some(scheduler) = self.scheduler.lock().as_mut() {
                scheduler.register(rule_job(&rule, self.rules.clone()));
            }
        }
        Ok(())
    }

    pub fn unregister_rule(&self, rule_id: &str) -> Result<()> {
        self.rules
            .write()
            .remove(rule_id)
            .map(|_| info!(rule = rule_id, "rule unregistered"))
            .ok_or_else(|| Error::NotFound(format!("rule {}", rule_id)))
    }

    /// Start the background jobs. Idempotent per process: call once.
    pub fn start(&self, parser: Arc<dyn FeedParser>, token: ShutdownToken) {
        let mut scheduler = Scheduler::new(token);

        // Source ticks run per-source sequentially; across sources they
        // share a bounded worker pool.
        let workers = Arc::new(Semaphore::new(self.config.scheduler.workers));
        for source in &self.config.sources {
            let ingester = Arc::new(Ingester::new(
                source.clone(),
                parser.clone(),
                Arc::new(Crawler::new(self.http.clone(), Arc::new(TextExtractor))),
                self.enricher.clone(),
                self.store.clone(),
                self.db.clone(),
                self.clock.clone(),
            ));
            let workers = workers.clone();
            scheduler.register(JobSpec {
                name: format!("source:{}", source.id),
                period: Duration::from_secs(source.period_secs),
                jitter: source.jitter,
                immediate: true,
                handler: Arc::new(move |token| {
                    let ingester = ingester.clone();
                    let workers = workers.clone();
                    Box::pin(async move {
                        let _permit = cancellable(&token, workers.acquire_owned())
                            .await?
                            .map_err(|_| Error::Internal("worker pool closed".into()))?;
                        ingester.tick(&token).await.map(|_| ())
                    })
                }),
            });
        }

        for evaluator in self.rules.read().values() {
            scheduler.register(rule_job(evaluator.config(), self.rules.clone()));
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        scheduler.register(JobSpec {
            name: "store:gc".into(),
            period: Duration::from_secs((self.config.store.block_window_secs / 4).max(60)),
            jitter: 0.1,
            immediate: true,
            handler: Arc::new(move |_token| {
                let store = store.clone();
                let clock = clock.clone();
                Box::pin(async move { store.gc(clock.now()).map(|_| ()) })
            }),
        });

        let cache = self.cache.clone();
        let clock = self.clock.clone();
        let max_age = ChronoDuration::seconds(self.config.llm.cache_max_age_secs as i64);
        scheduler.register(JobSpec {
            name: "llm:cache-sweep".into(),
            period: Duration::from_secs(self.config.llm.cache_sweep_period_secs),
            jitter: 0.1,
            immediate: false,
            handler: Arc::new(move |_token| {
                let cache = cache.clone();
                let clock = clock.clone();
                let max_age = max_age;
                Box::pin(async move { cache.sweep(clock.now() - max_age).map(|_| ()) })
            }),
        });

        *self.scheduler.lock() = Some(scheduler);
        info!(
            sources = self.config.sources.len(),
            rules = self.rules.read().len(),
            "engine started"
        );
    }

    /// Wait for jobs to wind down after shutdown was signalled, then seal
    /// and flush. Returns false if the grace period expired.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let scheduler = self.scheduler.lock().take();
        let clean = match scheduler {
            Some(scheduler) => scheduler.join(grace).await,
            None => true,
        };
        self.close()?;
        Ok(clean)
    }

    /// Seal the head block, flush everything, release file handles.
    pub fn close(&self) -> Result<()> {
        self.store.close()?;
        self.db.flush()?;
        info!("engine closed");
        Ok(())
    }
}

/// Evaluation job for one rule. Looks the evaluator up per tick so
/// unregistering makes the job a no-op and replacing swaps behavior.
fn rule_job(rule: &RuleConfig, rules: RuleMap) -> JobSpec {
    let rule_id = rule.id.clone();
    JobSpec {
        name: format!("rule:{}", rule_id),
        period: Duration::from_secs(rule.period_secs),
        jitter: 0.0,
        immediate: false,
        handler: Arc::new(move |token| {
            let rules = rules.clone();
            let rule_id = rule_id.clone();
            Box::pin(async move {
                let evaluator = rules.read().get(&rule_id).cloned();
                match evaluator {
                    Some(evaluator) => evaluator.tick(&token).await.map(|_| ()),
                    None => Ok(()),
                }
            })
        }),
    }
}
