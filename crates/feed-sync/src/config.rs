/// Client configuration
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{FeedError, Result};

/// The one quiet period used everywhere: typing expiry (local and remote)
/// and the grace window for self-echoes.
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(2);

pub const DEFAULT_API_URL: &str = "http://localhost:3003/api";
pub const DEFAULT_CHANNEL_URL: &str = "ws://localhost:3003/ws";

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("feed_client")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub api_base_url: String,
    pub channel_url: String,
    pub settle_window: Duration,
    pub request_timeout: Duration,
    pub page_size: usize,
    pub comment_page_size: usize,
    pub viewed_capacity: usize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub data_dir: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            channel_url: DEFAULT_CHANNEL_URL.to_string(),
            settle_window: DEFAULT_SETTLE_WINDOW,
            request_timeout: Duration::from_secs(30),
            page_size: 10,
            comment_page_size: 20,
            viewed_capacity: 500,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            data_dir: app_data_dir(),
        }
    }
}

impl FeedConfig {
    /// Defaults overlaid with `FEED_API_URL`, `FEED_CHANNEL_URL`,
    /// `FEED_SETTLE_MS` and `FEED_DATA_DIR`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("FEED_API_URL") {
            config.api_base_url = url;
        }
        if let Some(url) = lookup("FEED_CHANNEL_URL") {
            config.channel_url = url;
        }
        if let Some(raw) = lookup("FEED_SETTLE_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                FeedError::ValidationError(format!("FEED_SETTLE_MS is not a number: {raw}"))
            })?;
            config.settle_window = Duration::from_millis(ms);
        }
        if let Some(dir) = lookup("FEED_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.settle_window.is_zero() {
            return Err(FeedError::ValidationError(
                "settle window must be positive".to_string(),
            ));
        }
        if self.page_size == 0 || self.comment_page_size == 0 {
            return Err(FeedError::ValidationError(
                "page sizes must be positive".to_string(),
            ));
        }
        if self.reconnect_min > self.reconnect_max {
            return Err(FeedError::ValidationError(
                "reconnect_min exceeds reconnect_max".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn api_base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }
}
