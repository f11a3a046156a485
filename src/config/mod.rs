//! Configuration management for zenfeed
//!
//! Handles loading and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::model::LabelFilter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for blocks and the embedded key-value store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub enrich: EnrichConfig,

    #[serde(default)]
    pub crawl: CrawlConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Registered feed sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Registered notification rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
            llm: LlmConfig::default(),
            enrich: EnrichConfig::default(),
            crawl: CrawlConfig::default(),
            scheduler: SchedulerConfig::default(),
            sources: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// Block rotation and retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Time window covered by one block
    #[serde(default = "default_block_window_secs")]
    pub block_window_secs: u64,

    /// How long a sealed block stays queryable past its end
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Journal fsync batching: sync every N appends
    #[serde(default = "default_fsync_every")]
    pub fsync_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_window_secs: default_block_window_secs(),
            retention_secs: default_retention_secs(),
            fsync_every: default_fsync_every(),
        }
    }
}

impl StoreConfig {
    pub fn block_window(&self) -> Duration {
        Duration::from_secs(self.block_window_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// LLM provider configuration (OpenAI-compatible endpoint)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the API key
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Deployment-wide embedding dimension D
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default = "default_completion_model")]
    pub completion_model: String,

    /// Global bound on concurrent LLM calls
    #[serde(default = "default_max_inflight_llm")]
    pub max_inflight: usize,

    /// Per-call deadline
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache entries older than this are evicted
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,

    /// Period of the cache eviction sweep
    #[serde(default = "default_cache_sweep_period_secs")]
    pub cache_sweep_period_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key_env: default_llm_api_key_env(),
            embedding_model: default_embedding_model(),
            embedding_dim: default_embedding_dim(),
            completion_model: default_completion_model(),
            max_inflight: default_max_inflight_llm(),
            timeout_secs: default_llm_timeout_secs(),
            cache_max_age_secs: default_cache_max_age_secs(),
            cache_sweep_period_secs: default_cache_sweep_period_secs(),
        }
    }
}

/// Enrichment prompts and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Retry backoff base for failed embedding calls
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Attempts before an item is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub prompts: PromptConfig,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_attempts: default_max_attempts(),
            prompts: PromptConfig::default(),
        }
    }
}

/// Prompt templates per enriched field. `{content}` and `{title}` expand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_summary_prompt")]
    pub summary: String,

    #[serde(default = "default_category_prompt")]
    pub category: String,

    #[serde(default = "default_tags_prompt")]
    pub tags: String,

    #[serde(default = "default_score_prompt")]
    pub score: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            summary: default_summary_prompt(),
            category: default_category_prompt(),
            tags: default_tags_prompt(),
            score: default_score_prompt(),
        }
    }
}

/// Article crawling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request deadline
    #[serde(default = "default_crawl_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_crawl_timeout_secs(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global worker pool bound for source ingestion
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Grace period for in-flight handlers on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// One feed source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable identifier, becomes the `source` label
    pub id: String,

    /// Feed URL
    pub url: String,

    #[serde(default = "default_source_period_secs")]
    pub period_secs: u64,

    /// Jitter fraction of the period, in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Crawl article pages for full content
    #[serde(default)]
    pub crawl: bool,

    /// Extra labels stamped on every record from this source
    #[serde(default)]
    pub labels_extra: BTreeMap<String, String>,

    /// Prompt version per enriched field; bumping one invalidates that
    /// field's cache entries
    #[serde(default)]
    pub prompt_versions: BTreeMap<String, String>,
}

impl SourceConfig {
    /// Version for a field, defaulting when unset.
    pub fn prompt_version(&self, field: &str) -> String {
        self.prompt_versions
            .get(field)
            .cloned()
            .unwrap_or_else(default_prompt_version)
    }
}

/// One notification rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,

    /// Bumping the version re-arms dispatch for already-seen items
    #[serde(default = "default_prompt_version")]
    pub version: String,

    /// Natural-language query, embedded once per (id, version)
    #[serde(default)]
    pub query_text: Option<String>,

    #[serde(default)]
    pub labels_filter: Vec<LabelFilter>,

    #[serde(default = "default_rule_k")]
    pub k: usize,

    #[serde(default)]
    pub threshold: Option<f32>,

    /// Lookback relative to the tick time
    #[serde(default = "default_rule_time_range_secs")]
    pub time_range_secs: u64,

    #[serde(default = "default_rule_period_secs")]
    pub period_secs: u64,

    /// Name of a registered notification channel
    pub channel: String,

    #[serde(default = "default_rule_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!(
            sources = config.sources.len(),
            rules = config.rules.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Validate invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.llm.embedding_dim == 0 {
            return Err(Error::Config("llm.embedding_dim must be positive".into()));
        }
        if self.llm.max_inflight == 0 {
            return Err(Error::Config("llm.max_inflight must be positive".into()));
        }
        if self.store.block_window_secs == 0 {
            return Err(Error::Config("store.block_window_secs must be positive".into()));
        }
        if self.store.retention_secs < self.store.block_window_secs {
            return Err(Error::Config(
                "store.retention_secs must be at least one block window".into(),
            ));
        }
        if self.scheduler.workers == 0 {
            return Err(Error::Config("scheduler.workers must be positive".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return Err(Error::Config("source id must not be empty".into()));
            }
            if !seen.insert(&source.id) {
                return Err(Error::Config(format!("duplicate source id: {}", source.id)));
            }
            if !(0.0..=1.0).contains(&source.jitter) {
                return Err(Error::Config(format!(
                    "source {}: jitter must be within [0, 1]",
                    source.id
                )));
            }
            if source.period_secs == 0 {
                return Err(Error::Config(format!(
                    "source {}: period_secs must be positive",
                    source.id
                )));
            }
        }

        let mut seen_rules = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen_rules.insert(&rule.id) {
                return Err(Error::Config(format!("duplicate rule id: {}", rule.id)));
            }
            if rule.period_secs == 0 {
                return Err(Error::Config(format!(
                    "rule {}: period_secs must be positive",
                    rule.id
                )));
            }
            if rule.k == 0 {
                return Err(Error::Config(format!("rule {}: k must be positive", rule.id)));
            }
            if let Some(t) = rule.threshold {
                if !(-1.0..=1.0).contains(&t) {
                    return Err(Error::Config(format!(
                        "rule {}: threshold must be within [-1, 1]",
                        rule.id
                    )));
                }
            }
            if rule.query_text.is_none() && rule.labels_filter.is_empty() {
                return Err(Error::Config(format!(
                    "rule {}: needs query_text or labels_filter",
                    rule.id
                )));
            }
        }

        Ok(())
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn kv_dir(&self) -> PathBuf {
        self.data_dir.join("llm_cache")
    }
}
