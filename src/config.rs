use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::storage::{repository, Database};

pub const ENV_BASE_URL: &str = "BOARDSYNC_BASE_URL";
pub const ENV_TOKEN: &str = "BOARDSYNC_TOKEN";
pub const ENV_LOG_ENDPOINT: &str = "BOARDSYNC_LOG_ENDPOINT";
pub const ENV_BOARDS_ENDPOINT: &str = "BOARDSYNC_BOARDS_ENDPOINT";
pub const ENV_PAGE_SIZE: &str = "BOARDSYNC_PAGE_SIZE";
pub const ENV_DEFAULT_STATUS: &str = "BOARDSYNC_DEFAULT_STATUS";

// `app_config` keys. The token is only read from the environment.
pub const KEY_BASE_URL: &str = "base_url";
pub const KEY_LOG_ENDPOINT: &str = "log_endpoint";
pub const KEY_BOARDS_ENDPOINT: &str = "boards_endpoint";
pub const KEY_PAGE_SIZE: &str = "page_size";
pub const KEY_BATCH_SIZE: &str = "batch_size";
pub const KEY_DEFAULT_STATUS: &str = "default_status";

pub const DEFAULT_LOG_ENDPOINT: &str = "webhook-logs/?full_raw_body=true";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_BATCH_SIZE: u32 = 200;
pub const DEFAULT_MAX_BOARD_PAGES: u32 = 50;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for talking to the remote board and sizing pulls.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    /// Log endpoint, absolute or relative to `base_url`.
    pub log_endpoint: String,
    pub boards_endpoint: Option<String>,
    pub page_size: u32,
    pub batch_size: u32,
    pub max_board_pages: u32,
    pub timeout: Duration,
    /// Local status name given to snapshots that carry no status. `None`
    /// uses the local default status.
    pub default_status: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            log_endpoint: DEFAULT_LOG_ENDPOINT.to_string(),
            boards_endpoint: None,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            max_board_pages: DEFAULT_MAX_BOARD_PAGES,
            timeout: DEFAULT_TIMEOUT,
            default_status: None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl SyncConfig {
    /// Defaults, then values stored in `app_config`, then `BOARDSYNC_*`
    /// environment variables. CLI flags are applied by the caller on top.
    pub async fn load(db: &Database) -> Result<Self> {
        let stored: HashMap<String, String> = db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?
            .into_iter()
            .collect();
        let mut config = Self::default();
        config.apply(|key| stored.get(key).cloned(), &STORED_KEYS)?;
        config.apply(|key| std::env::var(key).ok(), &ENV_KEYS)?;
        Ok(config)
    }

    /// Defaults overlaid with the environment only.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply(|key| std::env::var(key).ok(), &ENV_KEYS)?;
        Ok(config)
    }

    fn apply(&mut self, lookup: impl Fn(&str) -> Option<String>, keys: &Keys) -> Result<()> {
        let get = |key: Option<&str>| key.and_then(|k| non_empty(lookup(k)));
        if let Some(v) = get(keys.base_url) {
            self.base_url = Some(v);
        }
        if let Some(v) = get(keys.token) {
            self.token = Some(v);
        }
        if let Some(v) = get(keys.log_endpoint) {
            self.log_endpoint = v;
        }
        if let Some(v) = get(keys.boards_endpoint) {
            self.boards_endpoint = Some(v);
        }
        if let (Some(key), Some(v)) = (keys.page_size, get(keys.page_size)) {
            self.page_size = parse_positive(key, &v)?;
        }
        if let (Some(key), Some(v)) = (keys.batch_size, get(keys.batch_size)) {
            self.batch_size = parse_positive(key, &v)?;
        }
        if let Some(v) = get(keys.default_status) {
            self.default_status = Some(v);
        }
        Ok(())
    }

    pub fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{ENV_TOKEN} is not set")))
    }

    pub fn boards_endpoint(&self) -> Result<&str> {
        self.boards_endpoint.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "no boards endpoint: set {ENV_BOARDS_ENDPOINT} or config key {KEY_BOARDS_ENDPOINT}"
            ))
        })
    }
}

/// Where each setting is looked up in one source. `None` means the source
/// never provides it.
struct Keys {
    base_url: Option<&'static str>,
    token: Option<&'static str>,
    log_endpoint: Option<&'static str>,
    boards_endpoint: Option<&'static str>,
    page_size: Option<&'static str>,
    batch_size: Option<&'static str>,
    default_status: Option<&'static str>,
}

const ENV_KEYS: Keys = Keys {
    base_url: Some(ENV_BASE_URL),
    token: Some(ENV_TOKEN),
    log_endpoint: Some(ENV_LOG_ENDPOINT),
    boards_endpoint: Some(ENV_BOARDS_ENDPOINT),
    page_size: Some(ENV_PAGE_SIZE),
    batch_size: None,
    default_status: Some(ENV_DEFAULT_STATUS),
};

const STORED_KEYS: Keys = Keys {
    base_url: Some(KEY_BASE_URL),
    token: None,
    log_endpoint: Some(KEY_LOG_ENDPOINT),
    boards_endpoint: Some(KEY_BOARDS_ENDPOINT),
    page_size: Some(KEY_PAGE_SIZE),
    batch_size: Some(KEY_BATCH_SIZE),
    default_status: Some(KEY_DEFAULT_STATUS),
};

pub fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!("{key} must be a positive integer, got {value:?}"))),
    }
}
