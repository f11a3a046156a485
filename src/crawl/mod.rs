//! Article crawling with robots.txt support
//!
//! This module provides:
//! - A shared HTTP context (client + per-host robots policy cache)
//! - Page fetching gated on robots.txt, converted to Markdown
//!
//! robots.txt handling: 200 caches the parsed rules, 404 caches an
//! allow-all, 401/403 caches a denial for the whole host, anything else
//! is an upstream error and is retried on a later fetch.

mod convert;
mod robots;

pub use convert::{HtmlConverter, TextExtractor};
pub use robots::{HostPolicy, RobotsRules};

use crate::config::CrawlConfig;
use crate::error::{Error, Result};
use crate::schedule::ShutdownToken;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Process-wide HTTP state, constructed once at startup and passed into
/// every ingester.
pub struct HttpContext {
    client: Client,
    user_agent: String,
    robots: RwLock<HashMap<String, HostPolicy>>,
}

impl HttpContext {
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            robots: RwLock::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

/// Fetches article pages and converts them to Markdown.
pub struct Crawler {
    ctx: Arc<HttpContext>,
    converter: Arc<dyn HtmlConverter>,
}

impl Crawler {
    pub fn new(ctx: Arc<HttpContext>, converter: Arc<dyn HtmlConverter>) -> Self {
        Self { ctx, converter }
    }

    /// Fetch a page and return its Markdown rendition. Honors robots.txt
    /// and cancellation at every network hop.
    pub async fn markdown(&self, url: &str, token: &ShutdownToken) -> Result<String> {
        let parsed = Url::parse(url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Upstream(format!("url has no host: {}", url)))?;
        // Non-default ports stay part of the robots cache key and URL.
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        match self.host_policy(parsed.scheme(), &authority, token).await? {
            HostPolicy::Denied => {
                return Err(Error::Upstream(format!(
                    "robots.txt access denied for host {}",
                    authority
                )))
            }
            HostPolicy::Rules(rules) => {
                if !rules.is_allowed(parsed.path(), self.ctx.user_agent()) {
                    return Err(Error::Upstream(format!(
                        "disallowed by robots.txt: {}",
                        url
                    )));
                }
            }
        }

        debug!(url, "crawling article");
        let response = cancellable(token, self.ctx.client().get(url).send()).await??;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Error::Upstream(format!(
                "received status {} from {}",
                status, url
            )));
        }
        let body = cancellable(token, response.text()).await??;
        self.converter.to_markdown(&body)
    }

    /// Cached per-host robots policy; fetched once per host per process.
    /// The robots URL follows the crawl URL's scheme and authority.
    async fn host_policy(
        &self,
        scheme: &str,
        authority: &str,
        token: &ShutdownToken,
    ) -> Result<HostPolicy> {
        if let Some(policy) = self.ctx.robots.read().await.get(authority) {
            return Ok(policy.clone());
        }

        let robots_url = format!("{}://{}/robots.txt", scheme, authority);
        let response = cancellable(token, self.ctx.client().get(&robots_url).send()).await??;
        let status = response.status();

        let policy = match status {
            StatusCode::OK => {
                let content = cancellable(token, response.text()).await??;
                HostPolicy::Rules(RobotsRules::parse(&content))
            }
            StatusCode::NOT_FOUND => HostPolicy::Rules(RobotsRules::allow_all()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(host = authority, status = %status, "robots.txt denied, skipping host");
                HostPolicy::Denied
            }
            other => {
                return Err(Error::Upstream(format!(
                    "unexpected status {} fetching {}",
                    other, robots_url
                )))
            }
        };

        // First writer wins; a concurrent fetch stored an equivalent value.
        let mut cache = self.ctx.robots.write().await;
        Ok(cache.entry(authority.to_string()).or_insert(policy).clone())
    }
}

/// Race a future against shutdown.
pub async fn cancellable<T>(
    token: &ShutdownToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}
