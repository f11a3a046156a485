//! robots.txt parsing and per-host policy

use robotstxt::DefaultMatcher;

/// Parsed robots.txt rules
#[derive(Debug, Clone)]
pub struct RobotsRules {
    content: String,
}

impl RobotsRules {
    /// Parse robots.txt content
    pub fn parse(content: &str) -> Self {
        Self {
            content: content.to_string(),
        }
    }

    /// Create rules that allow everything
    pub fn allow_all() -> Self {
        Self {
            content: String::new(),
        }
    }

    /// Check if a path is allowed for a user agent
    pub fn is_allowed(&self, path: &str, user_agent: &str) -> bool {
        if self.content.is_empty() {
            return true;
        }
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.content, user_agent, path)
    }
}

/// Cached crawl policy for one host. Write-once per host.
#[derive(Debug, Clone)]
pub enum HostPolicy {
    /// robots.txt fetched (or absent): per-path rules apply
    Rules(RobotsRules),
    /// robots.txt returned 401/403: the host refuses robots inspection,
    /// every crawl against it is skipped
    Denied,
}
