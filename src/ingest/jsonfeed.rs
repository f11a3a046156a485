//! JSON Feed parsing
//!
//! Built-in `FeedParser` for the JSON Feed format
//! (<https://jsonfeed.org/version/1.1>). Other wire formats plug in
//! through the same trait.

use super::{FeedParser, RawFeedItem};
use crate::crawl::HttpContext;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

pub struct JsonFeedParser {
    ctx: Arc<HttpContext>,
}

#[derive(Deserialize)]
struct JsonFeed {
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Deserialize)]
struct JsonFeedItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    external_url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    date_published: Option<String>,
    #[serde(default)]
    content_html: Option<String>,
    #[serde(default)]
    content_text: Option<String>,
}

impl JsonFeedParser {
    pub fn new(ctx: Arc<HttpContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl FeedParser for JsonFeedParser {
    async fn fetch(&self, url: &str) -> Result<Vec<RawFeedItem>> {
        let response = self.ctx.client().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Upstream(format!(
                "feed {} returned status {}",
                url, status
            )));
        }
        let feed: JsonFeed = response.json().await?;
        let items = parse_items(feed);
        debug!(url, items = items.len(), "feed fetched");
        Ok(items)
    }
}

fn parse_items(feed: JsonFeed) -> Vec<RawFeedItem> {
    feed.items
        .into_iter()
        .filter_map(|item| {
            let link = item.url.or(item.external_url)?;
            let published_at = item
                .date_published
                .as_deref()
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(RawFeedItem {
                link,
                title: item.title.unwrap_or_default(),
                published_at,
                content: item.content_html.or(item.content_text).unwrap_or_default(),
            })
        })
        .collect()
}
