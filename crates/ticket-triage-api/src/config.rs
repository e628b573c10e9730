use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ticket_triage_client::DEFAULT_CLASSIFIER_URL;

use crate::retry::RetryPolicy;

pub const CLASSIFIER_URL_ENV: &str = "TICKET_TRIAGE_CLASSIFIER_URL";
pub const FEED_URL_ENV: &str = "TICKET_TRIAGE_FEED_URL";
pub const TIMEOUT_MS_ENV: &str = "TICKET_TRIAGE_TIMEOUT_MS";
pub const MAX_RETRIES_ENV: &str = "TICKET_TRIAGE_MAX_RETRIES";
pub const RETRY_DELAY_MS_ENV: &str = "TICKET_TRIAGE_RETRY_DELAY_MS";
pub const DB_PATH_ENV: &str = "TICKET_TRIAGE_DB";

pub const DEFAULT_DB_PATH: &str = "./ticket_triage.sqlite3";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageConfig {
    pub db_path: PathBuf,
    pub classifier_url: String,
    /// Remote source for the support ticket page. Without it that page
    /// starts empty.
    pub feed_url: Option<String>,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            classifier_url: DEFAULT_CLASSIFIER_URL.to_string(),
            feed_url: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

impl TriageConfig {
    /// Defaults overlaid with the `TICKET_TRIAGE_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`TriageConfig::from_env`] with an injectable variable source.
    /// Unparseable numbers fall back to defaults; parsed ones are clamped.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |var: &str| {
            lookup(var).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
        };
        let number = |var: &str| text(var).and_then(|value| value.parse::<u64>().ok());

        Self {
            db_path: text(DB_PATH_ENV).map_or(defaults.db_path, PathBuf::from),
            classifier_url: text(CLASSIFIER_URL_ENV)
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.classifier_url),
            feed_url: text(FEED_URL_ENV),
            timeout_ms: number(TIMEOUT_MS_ENV).map_or(defaults.timeout_ms, clamp_timeout_ms),
            retry: RetryPolicy::new(
                number(MAX_RETRIES_ENV)
                    .and_then(|value| u32::try_from(value).ok())
                    .unwrap_or(defaults.retry.max_retries),
                number(RETRY_DELAY_MS_ENV).unwrap_or(defaults.retry.retry_delay_ms),
            ),
        }
    }

    #[must_use]
    pub fn with_db_path(mut self, db_path: Option<PathBuf>) -> Self {
        if let Some(db_path) = db_path {
            self.db_path = db_path;
        }
        self
    }

    #[must_use]
    pub fn with_classifier_url(mut self, classifier_url: Option<String>) -> Self {
        if let Some(classifier_url) = classifier_url {
            self.classifier_url = classifier_url;
        }
        self
    }

    #[must_use]
    pub fn with_feed_url(mut self, feed_url: Option<String>) -> Self {
        if feed_url.is_some() {
            self.feed_url = feed_url;
        }
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        if let Some(timeout_ms) = timeout_ms {
            self.timeout_ms = clamp_timeout_ms(timeout_ms);
        }
        self
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn clamp_timeout_ms(value: u64) -> u64 {
    value.clamp(100, 30_000)
}
