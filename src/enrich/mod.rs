//! LLM enrichment
//!
//! Turns a raw feed item into a record ready for the store: a normalized
//! embedding plus summary, category, tags and score fields. Each field
//! result is cached by `(fingerprint, field, prompt_version)` so restarts
//! and prompt-version bumps only pay for what changed. A global semaphore
//! bounds concurrent LLM calls across all items and fields.

use crate::config::{EnrichConfig, LlmConfig, SourceConfig};
use crate::crawl::cancellable;
use crate::error::{Error, Result};
use crate::llm::{LlmCache, LlmClient};
use crate::model::{label, normalize, EnrichedRecord, FeedItem, Labels};
use crate::schedule::ShutdownToken;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const FIELD_EMBEDDING: &str = "embedding";
pub const FIELD_SUMMARY: &str = "summary";
pub const FIELD_CATEGORY: &str = "category";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_SCORE: &str = "score";

/// Cap on the article text interpolated into prompts and embeddings.
const MAX_PROMPT_CHARS: usize = 8000;

pub struct Enricher {
    llm: Arc<dyn LlmClient>,
    cache: Arc<LlmCache>,
    semaphore: Arc<Semaphore>,
    config: EnrichConfig,
    llm_config: LlmConfig,
}

impl Enricher {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        cache: Arc<LlmCache>,
        config: EnrichConfig,
        llm_config: LlmConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(llm_config.max_inflight));
        Self {
            llm,
            cache,
            semaphore,
            config,
            llm_config,
        }
    }

    /// Enrich one item. Non-critical field failures degrade to empty
    /// values; an embedding failure after all retry attempts fails the
    /// item with the upstream error.
    pub async fn enrich(
        &self,
        item: &FeedItem,
        source: &SourceConfig,
        now: DateTime<Utc>,
        token: &ShutdownToken,
    ) -> Result<EnrichedRecord> {
        let fingerprint = item.fingerprint();
        let text = prompt_text(item);

        let (vector, summary, category, tags, score_raw) = tokio::join!(
            self.embedding(fingerprint, &text, token),
            self.field(fingerprint, FIELD_SUMMARY, &self.config.prompts.summary, item, source, token),
            self.field(fingerprint, FIELD_CATEGORY, &self.config.prompts.category, item, source, token),
            self.field(fingerprint, FIELD_TAGS, &self.config.prompts.tags, item, source, token),
            self.field(fingerprint, FIELD_SCORE, &self.config.prompts.score, item, source, token),
        );

        let mut vector = vector?;
        normalize(&mut vector);

        let score = score_raw
            .trim()
            .parse::<f32>()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        let mut labels = Labels::new();
        labels.insert(label::SOURCE.into(), item.source_id.clone());
        labels.insert(label::TITLE.into(), item.title.clone());
        labels.insert(label::LINK.into(), item.link.clone());
        labels.insert(label::CONTENT.into(), content_of(item).to_string());
        labels.insert(label::SUMMARY.into(), summary);
        labels.insert(label::CATEGORY.into(), category);
        labels.insert(label::TAGS.into(), tags);
        for (k, v) in &source.labels_extra {
            labels.insert(k.clone(), v.clone());
        }

        Ok(EnrichedRecord {
            fingerprint,
            time: now,
            published_at: item.published_at,
            labels,
            vector,
            score,
        })
    }

    /// Embed with retry: exponential backoff between attempts, bounded by
    /// the configured cap and attempt count.
    async fn embedding(
        &self,
        fingerprint: u64,
        text: &str,
        token: &ShutdownToken,
    ) -> Result<Vec<f32>> {
        // The embedding model name doubles as the cache version: switching
        // models invalidates cached vectors.
        let version = self.llm_config.embedding_model.clone();
        if let Some(bytes) = self.cache.get(fingerprint, FIELD_EMBEDDING, &version)? {
            if bytes.len() == self.llm_config.embedding_dim * 4 {
                let mut vector = vec![0.0f32; self.llm_config.embedding_dim];
                LittleEndian::read_f32_into(&bytes, &mut vector);
                return Ok(vector);
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.call_embed(text, token).await;
            match result {
                Ok(vector) => {
                    if vector.len() != self.llm_config.embedding_dim {
                        return Err(Error::Upstream(format!(
                            "embedding dimension mismatch: expected {}, got {}",
                            self.llm_config.embedding_dim,
                            vector.len()
                        )));
                    }
                    let mut bytes = vec![0u8; vector.len() * 4];
                    LittleEndian::write_f32_into(&vector, &mut bytes);
                    self.cache.put(fingerprint, FIELD_EMBEDDING, &version, &bytes)?;
                    return Ok(vector);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = backoff_delay(
                        self.config.backoff_base_ms,
                        self.config.backoff_factor,
                        self.config.backoff_cap_ms,
                        attempt,
                    );
                    warn!(
                        fingerprint = format!("{:#018x}", fingerprint),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding failed, backing off"
                    );
                    cancellable(token, tokio::time::sleep(delay)).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_embed(&self, text: &str, token: &ShutdownToken) -> Result<Vec<f32>> {
        let _permit = cancellable(token, self.semaphore.clone().acquire_owned())
            .await?
            .map_err(|_| Error::Internal("llm semaphore closed".into()))?;
        cancellable(token, self.llm.embed(&self.llm_config.embedding_model, text)).await?
    }

    /// One non-critical completion field. Failures degrade to "".
    async fn field(
        &self,
        fingerprint: u64,
        name: &str,
        template: &str,
        item: &FeedItem,
        source: &SourceConfig,
        token: &ShutdownToken,
    ) -> String {
        let version = source.prompt_version(name);
        match self
            .field_inner(fingerprint, name, template, item, &version, token)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    field = name,
                    fingerprint = format!("{:#018x}", fingerprint),
                    error = %e,
                    kind = e.kind(),
                    "field enrichment failed, leaving empty"
                );
                String::new()
            }
        }
    }

    async fn field_inner(
        &self,
        fingerprint: u64,
        name: &str,
        template: &str,
        item: &FeedItem,
        version: &str,
        token: &ShutdownToken,
    ) -> Result<String> {
        if let Some(cached) = self.cache.get(fingerprint, name, version)? {
            debug!(field = name, "cache hit");
            return Ok(String::from_utf8_lossy(&cached).into_owned());
        }

        let prompt = template
            .replace("{title}", &item.title)
            .replace("{content}", content_of(item));

        let _permit = cancellable(token, self.semaphore.clone().acquire_owned())
            .await?
            .map_err(|_| Error::Internal("llm semaphore closed".into()))?;
        let output = cancellable(
            token,
            self.llm.complete(&self.llm_config.completion_model, &prompt),
        )
        .await??;
        let output = output.trim().to_string();

        self.cache.put(fingerprint, name, version, output.as_bytes())?;
        Ok(output)
    }
}

fn content_of(item: &FeedItem) -> &str {
    let content = if item.content_markdown.is_empty() {
        &item.raw_content
    } else {
        &item.content_markdown
    };
    match content.char_indices().nth(MAX_PROMPT_CHARS) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

fn prompt_text(item: &FeedItem) -> String {
    format!("{}\n\n{}", item.title, content_of(item))
}

fn backoff_delay(base_ms: u64, factor: f64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = factor.powi(attempt.saturating_sub(1) as i32);
    let ms = (base_ms as f64 * exp).min(cap_ms as f64);
    Duration::from_millis(ms as u64)
}
