//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the built-in content catalog.

use crate::gateway::catalog::{Category, SourceCatalog};
use crate::gateway::fetcher::RetryPolicy;
use crate::gateway::validator::MediaKind;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Minimum asserted age accepted by `/verify`.
pub const MINIMUM_AGE: u32 = 18;
/// Default cooldown window between accepted fetches of one identity.
pub const COOLDOWN_SECS: u64 = 30;
/// Default interval of the expired-cooldown sweep (0 disables it).
pub const COOLDOWN_SWEEP_SECS: u64 = 600;
/// Per-attempt timeout for upstream calls and validation probes.
pub const FETCH_TIMEOUT_SECS: u64 = 4;
/// Attempts spent on the primary endpoint of a category.
pub const PRIMARY_RETRY_BUDGET: usize = 2;
/// Attempts spent on each fallback endpoint.
pub const FALLBACK_RETRY_BUDGET: usize = 1;
/// First backoff delay, doubled per retry.
pub const BACKOFF_BASE_MS: u64 = 500;
/// Upper bound for a single backoff delay.
pub const BACKOFF_MAX_MS: u64 = 10_000;
/// Jitter applied around each backoff delay (+/-).
pub const BACKOFF_JITTER_MS: u64 = 100;
/// Cumulative elapsed time after which an attempt is reported as slow.
pub const SLOW_CALL_THRESHOLD_MS: u64 = 5_000;
/// First retry delay for Telegram API calls.
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum retry delay for Telegram API calls.
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4_000;
/// Retries after the first failed Telegram API call.
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;
/// User agent sent to upstream content APIs.
pub const USER_AGENT: &str = concat!("blacksky-gateway/", env!("CARGO_PKG_VERSION"));

/// Pinned still image served when every endpoint of a static category fails.
pub const LAST_RESORT_STATIC_URL: &str =
    "https://upload.wikimedia.org/wikipedia/commons/3/3a/Cat03.jpg";
/// Pinned GIF served when every endpoint of an animated category fails.
pub const LAST_RESORT_ANIMATED_URL: &str =
    "https://upload.wikimedia.org/wikipedia/commons/2/2c/Rotating_earth_%28large%29.gif";

/// Built-in catalog: name, media kind, endpoints (primary first), caption.
/// The last resort follows from the media kind.
const DEFAULT_CATEGORIES: &[(&str, MediaKind, &[&str], &str)] = &[
    (
        "waifu",
        MediaKind::Static,
        &[
            "https://api.waifu.pics/sfw/waifu",
            "https://api.waifu.im/search?included_tags=waifu",
            "https://nekos.life/api/v2/img/waifu",
        ],
        "Here is your waifu",
    ),
    (
        "neko",
        MediaKind::Static,
        &[
            "https://api.waifu.pics/sfw/neko",
            "https://nekos.life/api/v2/img/neko",
        ],
        "Nya~",
    ),
    (
        "maid",
        MediaKind::Static,
        &[
            "https://api.waifu.im/search?included_tags=maid",
            "https://api.waifu.pics/sfw/waifu",
        ],
        "At your service",
    ),
    (
        "hug",
        MediaKind::Animated,
        &[
            "https://api.waifu.pics/sfw/hug",
            "https://nekos.life/api/v2/img/hug",
        ],
        "*hugs*",
    ),
    (
        "pat",
        MediaKind::Animated,
        &[
            "https://api.waifu.pics/sfw/pat",
            "https://nekos.life/api/v2/img/pat",
        ],
        "*pats*",
    ),
];

/// Application settings loaded from config files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewaySettings {
    /// Telegram Bot API token
    #[serde(default)]
    pub telegram_token: String,

    /// Directory holding the verification snapshot and group settings
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Domain appended to bare user ids when normalizing identities
    #[serde(default = "default_identity_domain")]
    pub identity_domain: String,

    /// Sub-key this gateway owns inside each conversation's settings
    #[serde(default = "default_feature_key")]
    pub feature_key: String,

    /// Minimum asserted age for verification
    #[serde(default = "default_minimum_age")]
    pub minimum_age: u32,

    /// Cooldown window in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Sweep interval for expired cooldown entries, 0 disables the sweep
    #[serde(default = "default_cooldown_sweep_secs")]
    pub cooldown_sweep_secs: u64,

    /// Per-attempt upstream timeout in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Attempts on the primary endpoint
    #[serde(default = "default_primary_retry_budget")]
    pub primary_retry_budget: usize,

    /// Attempts on each fallback endpoint
    #[serde(default = "default_fallback_retry_budget")]
    pub fallback_retry_budget: usize,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Backoff jitter in milliseconds
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// Slow-call threshold in milliseconds
    #[serde(default = "default_slow_call_threshold_ms")]
    pub slow_call_threshold_ms: u64,

    /// User agent for upstream requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Category overrides; the built-in catalog is used when absent
    #[serde(default)]
    pub categories: Option<Vec<Category>>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_identity_domain() -> String {
    "telegram".to_string()
}

fn default_feature_key() -> String {
    "media".to_string()
}

const fn default_minimum_age() -> u32 {
    MINIMUM_AGE
}

const fn default_cooldown_secs() -> u64 {
    COOLDOWN_SECS
}

const fn default_cooldown_sweep_secs() -> u64 {
    COOLDOWN_SWEEP_SECS
}

const fn default_fetch_timeout_secs() -> u64 {
    FETCH_TIMEOUT_SECS
}

const fn default_primary_retry_budget() -> usize {
    PRIMARY_RETRY_BUDGET
}

const fn default_fallback_retry_budget() -> usize {
    FALLBACK_RETRY_BUDGET
}

const fn default_backoff_base_ms() -> u64 {
    BACKOFF_BASE_MS
}

const fn default_backoff_max_ms() -> u64 {
    BACKOFF_MAX_MS
}

const fn default_backoff_jitter_ms() -> u64 {
    BACKOFF_JITTER_MS
}

const fn default_slow_call_threshold_ms() -> u64 {
    SLOW_CALL_THRESHOLD_MS
}

fn default_user_agent() -> String {
    USER_AGENT.to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            telegram_token: String::new(),
            data_dir: default_data_dir(),
            identity_domain: default_identity_domain(),
            feature_key: default_feature_key(),
            minimum_age: MINIMUM_AGE,
            cooldown_secs: COOLDOWN_SECS,
            cooldown_sweep_secs: COOLDOWN_SWEEP_SECS,
            fetch_timeout_secs: FETCH_TIMEOUT_SECS,
            primary_retry_budget: PRIMARY_RETRY_BUDGET,
            fallback_retry_budget: FALLBACK_RETRY_BUDGET,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            backoff_jitter_ms: BACKOFF_JITTER_MS,
            slow_call_threshold_ms: SLOW_CALL_THRESHOLD_MS,
            user_agent: default_user_agent(),
            categories: None,
        }
    }
}

/// Build the layered configuration source.
///
/// # Errors
///
/// Returns a `ConfigError` if any present source cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        // Eg.. `APP__COOLDOWN_SECS=60 ./target/app`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Environment::default() maps UPPER_SNAKE_CASE to snake_case
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl GatewaySettings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use blacksky_gateway::config::GatewaySettings;
    ///
    /// let settings = GatewaySettings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Path of the verification snapshot file
    #[must_use]
    pub fn verification_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("verifications.json")
    }

    /// Path of the group settings file
    #[must_use]
    pub fn group_settings_path(&self) -> PathBuf {
        self.data_dir.join("group_settings.json")
    }

    /// Per-attempt timeout for upstream calls
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Cooldown window
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Retry and backoff policy for the fallback fetcher
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            primary_budget: self.primary_retry_budget,
            fallback_budget: self.fallback_retry_budget,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
            attempt_timeout: Duration::from_secs(self.fetch_timeout_secs),
            slow_call_threshold: Duration::from_millis(self.slow_call_threshold_ms),
        }
    }

    /// Content catalog from the configured categories or the built-in one
    #[must_use]
    pub fn catalog(&self) -> SourceCatalog {
        match &self.categories {
            Some(categories) if !categories.is_empty() => {
                SourceCatalog::new(categories.iter().cloned())
            }
            _ => default_catalog(),
        }
    }
}

const fn last_resort_for(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Animated => LAST_RESORT_ANIMATED_URL,
        MediaKind::Static | MediaKind::Any => LAST_RESORT_STATIC_URL,
    }
}

/// The built-in content catalog
#[must_use]
pub fn default_catalog() -> SourceCatalog {
    SourceCatalog::new(
        DEFAULT_CATEGORIES
            .iter()
            .map(|(name, kind, endpoints, caption)| Category {
                name: (*name).to_string(),
                kind: *kind,
                endpoints: endpoints.iter().map(ToString::to_string).collect(),
                last_resort: Some(last_resort_for(*kind).to_string()),
                caption: Some((*caption).to_string()),
            }),
    )
}
