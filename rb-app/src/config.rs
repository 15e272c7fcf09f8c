//! relaybot configuration loader.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

/// Lock and queue store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `redis://...`; when absent an in-process store is used.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_queue_ttl_secs")]
    pub queue_ttl_secs: u64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_queue_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_queue_depth() -> usize {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            lock_ttl_secs: default_lock_ttl_secs(),
            queue_ttl_secs: default_queue_ttl_secs(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_min_edit_interval_ms")]
    pub min_edit_interval_ms: u64,
    /// Overrides the channel's own per-message limit when smaller.
    #[serde(default)]
    pub message_limit: Option<usize>,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
}

fn default_min_edit_interval_ms() -> u64 {
    500
}

fn default_placeholder() -> String {
    "…".to_string()
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_edit_interval_ms: default_min_edit_interval_ms(),
            message_limit: None,
            placeholder: default_placeholder(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Sent to the user when a turn fails. Failures are silent when unset.
    #[serde(default)]
    pub failure_notice: Option<String>,
}

fn default_turn_timeout_secs() -> u64 {
    120
}

fn default_history_limit() -> usize {
    20
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_turn_timeout_secs(),
            history_limit: default_history_limit(),
            failure_notice: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `~/.relaybot/data/relaybot.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_server_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_http_max_in_flight() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind_addr: default_bind_addr(),
            http_timeout_secs: default_http_timeout_secs(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// If true, relaybot answers any sender.
    ///
    /// Default is false: senders must be listed in `security.allowed_users`.
    #[serde(default)]
    pub allow_all_senders: bool,
}

impl SecurityConfig {
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_all_senders || self.allowed_users.iter().any(|u| u.trim() == sender_id)
    }
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("RELAYBOT_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = non_empty_env("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = non_empty_env("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = non_empty_env("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram.bot_token = v;
            self.channels.telegram.enabled = true;
        }
        if let Some(v) = non_empty_env("REDIS_URL") {
            self.store.redis_url = Some(v);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.channels.telegram.enabled && self.channels.telegram.bot_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "channels.telegram.bot_token is required when telegram is enabled"
            ));
        }
        if self.store.lock_ttl_secs == 0 || self.store.queue_ttl_secs == 0 {
            return Err(anyhow::anyhow!(
                "store.lock_ttl_secs and store.queue_ttl_secs must be > 0"
            ));
        }
        if self.turn.timeout_secs == 0 {
            return Err(anyhow::anyhow!("turn.timeout_secs must be > 0"));
        }
        // A turn must give up before its lock can expire under it.
        if self.turn.timeout_secs >= self.store.lock_ttl_secs {
            return Err(anyhow::anyhow!(
                "turn.timeout_secs ({}) must be smaller than store.lock_ttl_secs ({})",
                self.turn.timeout_secs,
                self.store.lock_ttl_secs
            ));
        }
        if self.render.message_limit == Some(0) {
            return Err(anyhow::anyhow!("render.message_limit must be > 0"));
        }
        if self.render.placeholder.trim().is_empty() {
            return Err(anyhow::anyhow!("render.placeholder must not be blank"));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.store.lock_ttl_secs)
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.store.queue_ttl_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn.timeout_secs)
    }

    pub fn min_edit_interval(&self) -> Duration {
        Duration::from_millis(self.render.min_edit_interval_ms)
    }

    pub fn database_path(&self) -> PathBuf {
        match self.database.path.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => expand_home(p),
            _ => default_data_dir().join("relaybot.db"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home_dir().join(rest),
        None => PathBuf::from(path),
    }
}

pub fn default_config_path() -> PathBuf {
    Path::new(&home_dir()).join(".relaybot").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    Path::new(&home_dir()).join(".relaybot").join("data")
}
