//! Default values for configuration

use std::path::PathBuf;

pub fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Default block rotation window: 24h
pub fn default_block_window_secs() -> u64 {
    86_400
}

/// Default retention past a block's end: 8 windows
pub fn default_retention_secs() -> u64 {
    8 * 86_400
}

/// Journal fsync batching: sync every N appends
pub fn default_fsync_every() -> u64 {
    64
}

pub fn default_llm_endpoint() -> String {
    std::env::var("ZENFEED_LLM_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8000/v1".to_string())
}

pub fn default_llm_api_key_env() -> String {
    "ZENFEED_LLM_API_KEY".to_string()
}

pub fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

pub fn default_embedding_dim() -> usize {
    384
}

pub fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Global bound on concurrent LLM calls
pub fn default_max_inflight_llm() -> usize {
    8
}

pub fn default_llm_timeout_secs() -> u64 {
    60
}

pub fn default_backoff_base_ms() -> u64 {
    500
}

pub fn default_backoff_factor() -> f64 {
    2.0
}

pub fn default_backoff_cap_ms() -> u64 {
    30_000
}

pub fn default_max_attempts() -> u32 {
    5
}

pub fn default_prompt_version() -> String {
    "v1".to_string()
}

pub fn default_summary_prompt() -> String {
    "Summarize the following article in at most three sentences.\n\n{content}".to_string()
}

pub fn default_category_prompt() -> String {
    "Assign a single short category (e.g. tech, science, business, politics) \
     to the following article. Reply with the category only.\n\n{content}"
        .to_string()
}

pub fn default_tags_prompt() -> String {
    "List up to five comma-separated tags for the following article. \
     Reply with the tags only.\n\n{content}"
        .to_string()
}

pub fn default_score_prompt() -> String {
    "Rate the quality and relevance of the following article from 0.0 to 1.0. \
     Reply with the number only.\n\n{content}"
        .to_string()
}

/// User agent sent with all outbound feed and crawl traffic
pub fn default_user_agent() -> String {
    "ZenFeed".to_string()
}

pub fn default_crawl_timeout_secs() -> u64 {
    30
}

/// Global ingestion worker pool size
pub fn default_workers() -> usize {
    4
}

/// LLM cache entries older than this are evicted by the sweep job
pub fn default_cache_max_age_secs() -> u64 {
    30 * 86_400
}

pub fn default_cache_sweep_period_secs() -> u64 {
    3600
}

pub fn default_source_period_secs() -> u64 {
    3600
}

pub fn default_jitter() -> f64 {
    0.1
}

pub fn default_rule_k() -> usize {
    10
}

pub fn default_rule_period_secs() -> u64 {
    300
}

pub fn default_rule_time_range_secs() -> u64 {
    86_400
}

pub fn default_rule_dedup_window_secs() -> u64 {
    86_400
}

/// Grace period for in-flight handlers on shutdown
pub fn default_shutdown_timeout_secs() -> u64 {
    30
}
