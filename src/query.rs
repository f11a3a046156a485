//! Query planning
//!
//! Translates user queries into store calls: an optional free-text prompt
//! is embedded once (cached by text and model) and combined with the
//! structured label filters.

use crate::config::LlmConfig;
use crate::crawl::cancellable;
use crate::error::{Error, Result};
use crate::llm::LlmClient;
use crate::model::{normalize, LabelFilter, Query, QueryHit, TimeRange};
use crate::schedule::ShutdownToken;
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A user-facing query before planning.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub time_range: TimeRange,
    pub labels: Vec<LabelFilter>,
    /// Free-text prompt, embedded for semantic matching
    pub text: Option<String>,
    pub limit: usize,
    pub threshold: Option<f32>,
}

pub struct QueryPlanner {
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    llm_config: LlmConfig,
    /// Write-once embeddings keyed by (text, model) hash
    text_cache: Mutex<HashMap<u64, Vec<f32>>>,
}

impl QueryPlanner {
    pub fn new(store: Arc<Store>, llm: Arc<dyn LlmClient>, llm_config: LlmConfig) -> Self {
        Self {
            store,
            llm,
            llm_config,
            text_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn query(
        &self,
        request: &QueryRequest,
        token: &ShutdownToken,
    ) -> Result<Vec<QueryHit>> {
        let vector = match &request.text {
            Some(text) if !text.is_empty() => Some(self.embed_text(text, token).await?),
            _ => None,
        };

        self.store.query(&Query {
            time_range: request.time_range,
            label_filters: request.labels.clone(),
            vector,
            limit: request.limit,
            threshold: request.threshold,
        })
    }

    async fn embed_text(&self, text: &str, token: &ShutdownToken) -> Result<Vec<f32>> {
        let key = cache_key(text, &self.llm_config.embedding_model);
        if let Some(vector) = self.text_cache.lock().get(&key) {
            debug!(key = format!("{:#018x}", key), "query embedding cache hit");
            return Ok(vector.clone());
        }

        let mut vector =
            cancellable(token, self.llm.embed(&self.llm_config.embedding_model, text)).await??;
        if vector.len() != self.llm_config.embedding_dim {
            return Err(Error::Upstream(format!(
                "query embedding has dimension {}, expected {}",
                vector.len(),
                self.llm_config.embedding_dim
            )));
        }
        normalize(&mut vector);
        self.text_cache.lock().entry(key).or_insert_with(|| vector.clone());
        Ok(vector)
    }
}

fn cache_key(text: &str, model: &str) -> u64 {
    let mut buf = Vec::with_capacity(text.len() + model.len() + 1);
    buf.extend_from_slice(model.as_bytes());
    buf.push(0);
    buf.extend_from_slice(text.as_bytes());
    twox_hash::xxh3::hash64(&buf)
}
