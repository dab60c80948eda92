// src/models/config.rs

//! Application configuration structures.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CollectError, Result};
use crate::models::Platform;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Egress address discovery and probing
    #[serde(default)]
    pub egress: EgressConfig,

    /// Provider request behavior
    #[serde(default)]
    pub transport: TransportConfig,

    /// PostgreSQL connection and outage handling
    #[serde(default)]
    pub storage: StorageConfig,

    /// Review feed collection
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Daemon loop timing
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        for target in Platform::ALL {
            let canary = self.egress.canary_url(target);
            if canary.trim().is_empty() {
                return Err(CollectError::validation(format!(
                    "egress canary URL for {target} is empty"
                )));
            }
            url::Url::parse(canary)?;
        }
        if self.egress.probe_timeout_secs == 0 {
            return Err(CollectError::validation(
                "egress.probe_timeout_secs must be > 0",
            ));
        }
        if self.egress.min_probe_body_bytes == 0 {
            return Err(CollectError::validation(
                "egress.min_probe_body_bytes must be > 0",
            ));
        }
        if self.transport.user_agent.trim().is_empty() {
            return Err(CollectError::validation("transport.user_agent is empty"));
        }
        if self.transport.timeout_secs == 0 {
            return Err(CollectError::validation("transport.timeout_secs must be > 0"));
        }
        if self.transport.rate_limit_backoff_secs.is_empty() {
            return Err(CollectError::validation(
                "transport.rate_limit_backoff_secs must not be empty",
            ));
        }
        if self.storage.database_url().trim().is_empty() {
            return Err(CollectError::validation("storage.url is empty"));
        }
        if self.storage.connect_timeout_secs == 0 {
            return Err(CollectError::validation(
                "storage.connect_timeout_secs must be > 0",
            ));
        }
        if self.storage.outage_backoff_secs.is_empty() {
            return Err(CollectError::validation(
                "storage.outage_backoff_secs must not be empty",
            ));
        }
        for target in Platform::ALL {
            if let Some(feed) = self.collection.feed(target) {
                feed.validate(target)?;
            }
        }
        if self.daemon.cooldown_floor_secs == 0 {
            return Err(CollectError::validation(
                "daemon.cooldown_floor_secs must be > 0",
            ));
        }
        Ok(())
    }
}

/// Egress address discovery and canary probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Canary URL used to test App Store reachability
    #[serde(default = "defaults::app_store_canary")]
    pub app_store_canary: String,

    /// Canary URL used to test Play Store reachability
    #[serde(default = "defaults::play_store_canary")]
    pub play_store_canary: String,

    /// Probe request timeout in seconds
    #[serde(default = "defaults::probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Minimum canary body size counted as a real response
    #[serde(default = "defaults::min_probe_body_bytes")]
    pub min_probe_body_bytes: usize,
}

impl EgressConfig {
    /// Canary endpoint for a target provider.
    pub fn canary_url(&self, target: Platform) -> &str {
        match target {
            Platform::AppStore => &self.app_store_canary,
            Platform::PlayStore => &self.play_store_canary,
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            app_store_canary: defaults::app_store_canary(),
            play_store_canary: defaults::play_store_canary(),
            probe_timeout_secs: defaults::probe_timeout(),
            min_probe_body_bytes: defaults::min_probe_body_bytes(),
        }
    }
}

/// Provider request behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// User-Agent header for provider requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::request_timeout")]
    pub timeout_secs: u64,

    /// Sleep sequence between HTTP 429 retries, in seconds. The sequence
    /// length is also the retry budget.
    #[serde(default = "defaults::rate_limit_backoff")]
    pub rate_limit_backoff_secs: Vec<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::request_timeout(),
            rate_limit_backoff_secs: defaults::rate_limit_backoff(),
        }
    }
}

/// PostgreSQL connection and outage handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Connection URL; the DATABASE_URL environment variable overrides it
    #[serde(default = "defaults::database_url")]
    pub url: String,

    /// Connect/acquire timeout in seconds
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Sleep sequence between reconnect attempts during an outage, in
    /// seconds. The sequence length is also the retry budget.
    #[serde(default = "defaults::outage_backoff")]
    pub outage_backoff_secs: Vec<u64>,
}

impl StorageConfig {
    /// Effective connection URL, environment override applied.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.url.clone())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: defaults::database_url(),
            connect_timeout_secs: defaults::connect_timeout(),
            outage_backoff_secs: defaults::outage_backoff(),
        }
    }
}

/// Paged review feed description for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Page URL template with `{entity}` and `{page}` placeholders
    pub url_template: String,

    /// Dot path to the review array inside the response JSON
    #[serde(default = "defaults::feed_items_path")]
    pub items_path: String,

    /// Dot path to the review id inside one array item
    #[serde(default = "defaults::feed_id_path")]
    pub id_path: String,

    /// Provider page ceiling; walking past it is not possible
    #[serde(default = "defaults::feed_max_pages")]
    pub max_pages: u32,

    /// Drop the first item of every page. The App Store RSS leads each page
    /// with the app's own envelope entry, which is not a review. On by
    /// default.
    #[serde(default = "defaults::feed_skip_first_item")]
    pub skip_first_item: bool,
}

impl FeedConfig {
    /// Render the page URL for an entity.
    pub fn page_url(&self, entity_id: &str, page: u32) -> String {
        self.url_template
            .replace("{entity}", entity_id)
            .replace("{page}", &page.to_string())
    }

    fn validate(&self, target: Platform) -> Result<()> {
        if !self.url_template.contains("{entity}") || !self.url_template.contains("{page}") {
            return Err(CollectError::validation(format!(
                "collection feed for {target} must contain {{entity}} and {{page}} placeholders"
            )));
        }
        if self.max_pages == 0 {
            return Err(CollectError::validation(format!(
                "collection feed for {target}: max_pages must be > 0"
            )));
        }
        if self.items_path.trim().is_empty() || self.id_path.trim().is_empty() {
            return Err(CollectError::validation(format!(
                "collection feed for {target}: items_path and id_path must not be empty"
            )));
        }
        Ok(())
    }
}

/// Review feed collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// App Store review feed (RSS JSON by default)
    #[serde(default = "defaults::app_store_feed")]
    pub app_store: Option<FeedConfig>,

    /// Play Store review feed; no public JSON feed exists, so this must be
    /// configured explicitly (e.g. an internal proxy)
    #[serde(default)]
    pub play_store: Option<FeedConfig>,
}

impl CollectionConfig {
    /// Feed description for a platform, if one is configured.
    pub fn feed(&self, platform: Platform) -> Option<&FeedConfig> {
        match platform {
            Platform::AppStore => self.app_store.as_ref(),
            Platform::PlayStore => self.play_store.as_ref(),
        }
    }

    /// Platforms that have a collector configured, in processing order.
    pub fn enabled_platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.feed(*p).is_some())
            .collect()
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            app_store: defaults::app_store_feed(),
            play_store: None,
        }
    }
}

/// Daemon loop timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between cycles
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// Minimum wait after a storage outage aborted a cycle
    #[serde(default = "defaults::cooldown_floor")]
    pub cooldown_floor_secs: u64,
}

impl DaemonConfig {
    /// Wait after an aborted cycle: never shorter than the floor, never
    /// shorter than the regular interval.
    pub fn cooldown_secs(&self, interval_secs: u64) -> u64 {
        self.cooldown_floor_secs.max(interval_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::interval(),
            cooldown_floor_secs: defaults::cooldown_floor(),
        }
    }
}

mod defaults {
    use super::FeedConfig;

    // Egress defaults: the canaries are the same endpoints collection uses,
    // so a passing probe means real requests will pass too.
    pub fn app_store_canary() -> String {
        "https://itunes.apple.com/us/rss/customerreviews/page=1/id=284882215/sortBy=mostRecent/json"
            .into()
    }
    pub fn play_store_canary() -> String {
        "https://play.google.com/store/apps/details?id=com.whatsapp&hl=en&gl=us".into()
    }
    pub fn probe_timeout() -> u64 {
        10
    }
    pub fn min_probe_body_bytes() -> usize {
        100
    }

    // Transport defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            .into()
    }
    pub fn request_timeout() -> u64 {
        30
    }
    pub fn rate_limit_backoff() -> Vec<u64> {
        vec![5, 10, 30]
    }

    // Storage defaults
    pub fn database_url() -> String {
        "postgres://reviewsync@localhost:5432/reviewsync".into()
    }
    pub fn connect_timeout() -> u64 {
        10
    }
    pub fn outage_backoff() -> Vec<u64> {
        vec![5, 10, 20]
    }

    // Collection defaults
    pub fn app_store_feed() -> Option<FeedConfig> {
        Some(FeedConfig {
            url_template:
                "https://itunes.apple.com/us/rss/customerreviews/page={page}/id={entity}/sortBy=mostRecent/json"
                    .into(),
            items_path: feed_items_path(),
            id_path: feed_id_path(),
            max_pages: feed_max_pages(),
            skip_first_item: feed_skip_first_item(),
        })
    }
    pub fn feed_items_path() -> String {
        "feed.entry".into()
    }
    pub fn feed_id_path() -> String {
        "id.label".into()
    }
    pub fn feed_max_pages() -> u32 {
        10
    }
    pub fn feed_skip_first_item() -> bool {
        true
    }

    // Daemon defaults
    pub fn interval() -> u64 {
        10
    }
    pub fn cooldown_floor() -> u64 {
        60
    }
}
