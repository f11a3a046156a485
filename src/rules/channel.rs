//! Built-in notification channels
//!
//! Real sinks (mail, chat, ...) implement `NotifyChannel`; these two
//! cover the common cases: a webhook POST and a log-only channel for
//! dry runs.

use super::{NotifyChannel, SendOutcome};
use crate::error::Result;
use crate::model::StoredRecord;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

/// POSTs one JSON document per notification to a fixed URL.
pub struct WebhookChannel {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    rule_id: &'a str,
    fingerprint: u64,
    labels: &'a crate::model::Labels,
    score: f32,
    message: &'a str,
}

impl WebhookChannel {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    async fn send(
        &self,
        rule_id: &str,
        record: &StoredRecord,
        message: &str,
    ) -> Result<SendOutcome> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                rule_id,
                fingerprint: record.fingerprint,
                labels: &record.labels,
                score: record.score,
                message,
            })
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => Ok(SendOutcome::Ok),
            Ok(response) if response.status().is_client_error() => {
                warn!(url = %self.url, status = %response.status(), "webhook rejected notification");
                Ok(SendOutcome::Permanent)
            }
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "webhook unavailable");
                Ok(SendOutcome::Retryable)
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "webhook request failed");
                Ok(SendOutcome::Retryable)
            }
        }
    }
}

/// Logs the notification instead of delivering it.
pub struct LogChannel;

#[async_trait]
impl NotifyChannel for LogChannel {
    async fn send(
        &self,
        rule_id: &str,
        record: &StoredRecord,
        message: &str,
    ) -> Result<SendOutcome> {
        info!(
            rule = rule_id,
            fingerprint = format!("{:#018x}", record.fingerprint),
            message,
            "notification"
        );
        Ok(SendOutcome::Ok)
    }
}
