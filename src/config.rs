//! Gateway configuration: TOML on disk, `serde` in memory, polled for changes
//! by [`RuntimeConfig`] so that reload never interrupts in-flight requests.
//!
//! Loading and hot-reload are treated as a boundary concern: the core
//! dispatcher only ever sees an `Arc<GatewayConfig>` snapshot handed to it
//! by [`RuntimeConfig::snapshot`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::warn;

fn humantime_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn humantime_duration_opt<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw {
        Some(s) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8089
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// One upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub group: String,
    #[serde(default)]
    pub group_priority: u32,
    #[serde(default)]
    pub priority: u32,
    /// Inline bearer token. Prefer `token_env` for anything checked into
    /// version control.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default, deserialize_with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
    /// Optional model allow-list; empty means "supports everything"
    /// (generalized from the teacher's `supported_models`).
    #[serde(default)]
    pub supported_models: HashMap<String, bool>,
    /// Optional external->upstream model name remap.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

impl EndpointConfig {
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(t) = self.token.as_deref()
            && !t.trim().is_empty()
        {
            return Some(t.to_string());
        }
        if let Some(env_name) = self.token_env.as_deref()
            && let Ok(v) = std::env::var(env_name)
            && !v.trim().is_empty()
        {
            return Some(v);
        }
        None
    }

    /// Whether this endpoint can serve `model`, honoring an empty allow-list
    /// as "accepts everything".
    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        if let Some(allowed) = self.supported_models.get(model) {
            return *allowed;
        }
        self.supported_models
            .iter()
            .any(|(pattern, allowed)| *allowed && wildcard_match(pattern, model))
    }

    pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

/// `*`-glob match against a model name, e.g. `claude-3-5-*`.
pub(crate) fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            if !rest.ends_with(part) {
                return false;
            }
        } else if let Some(pos) = rest.find(part) {
            rest = &rest[pos + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", deserialize_with = "humantime_duration")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", deserialize_with = "humantime_duration")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSuspendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_suspend_timeout",
        deserialize_with = "humantime_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_max_suspended")]
    pub max_suspended_requests: usize,
}

fn default_true() -> bool {
    true
}
fn default_suspend_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_max_suspended() -> usize {
    256
}

impl Default for RequestSuspendConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            timeout: default_suspend_timeout(),
            max_suspended_requests: default_max_suspended(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub auto_switch_between_groups: bool,
    #[serde(default = "default_cooldown", deserialize_with = "humantime_duration")]
    pub cooldown: Duration,
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            auto_switch_between_groups: false,
            cooldown: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(
        default = "default_check_interval",
        deserialize_with = "humantime_duration"
    )]
    pub check_interval: Duration,
    #[serde(
        default = "default_health_timeout",
        deserialize_with = "humantime_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            timeout: default_health_timeout(),
            health_path: default_health_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ModelRate {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_creation: f64,
    #[serde(default)]
    pub cache_read: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_sink_path")]
    pub sink_path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(
        default = "default_flush_interval",
        deserialize_with = "humantime_duration"
    )]
    pub flush_interval: Duration,
}

fn default_sink_path() -> PathBuf {
    gateway_home_dir().join("usage.sqlite3")
}
fn default_batch_size() -> usize {
    32
}
fn default_flush_interval() -> Duration {
    Duration::from_millis(500)
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sink_path: default_sink_path(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub request_suspend: RequestSuspendConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub model_pricing: HashMap<String, ModelRate>,
    #[serde(default = "default_body_cap")]
    pub body_cap_bytes: usize,
    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn default_body_cap() -> usize {
    10 * 1024 * 1024
}

pub fn gateway_home_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RELAY_GATEWAY_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay-gateway")
}

pub fn config_file_path() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_GATEWAY_CONFIG") {
        return PathBuf::from(p);
    }
    gateway_home_dir().join("config.toml")
}

pub async fn load_config() -> Result<GatewayConfig> {
    let path = config_file_path();
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading config file at {}", path.display()))?;
    let cfg: GatewayConfig = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(cfg)
}

pub fn load_config_sync(path: &std::path::Path) -> Result<GatewayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file at {}", path.display()))?;
    let cfg: GatewayConfig = toml::from_str(&text)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(cfg)
}

/// Polls the config file's mtime on a floor interval and swaps in a fresh
/// snapshot. Modeled directly on the teacher's `proxy/runtime_config.rs`.
pub struct RuntimeConfig {
    current: AsyncRwLock<Arc<GatewayConfig>>,
    reload: AsyncMutex<ReloadState>,
}

struct ReloadState {
    last_check_at: Instant,
    last_mtime: Option<SystemTime>,
}

impl RuntimeConfig {
    pub fn new(initial: Arc<GatewayConfig>) -> Self {
        Self {
            current: AsyncRwLock::new(initial),
            reload: AsyncMutex::new(ReloadState {
                last_check_at: Instant::now()
                    .checked_sub(Duration::from_secs(60))
                    .unwrap_or_else(Instant::now),
                last_mtime: None,
            }),
        }
    }

    pub async fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.read().await.clone()
    }

    pub async fn maybe_reload_from_disk(&self) {
        const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(800);

        let last_mtime = {
            let mut st = self.reload.lock().await;
            if st.last_check_at.elapsed() < MIN_CHECK_INTERVAL {
                return;
            }
            st.last_check_at = Instant::now();
            st.last_mtime
        };

        let path = config_file_path();
        let mtime = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        if mtime == last_mtime {
            return;
        }

        match load_config().await {
            Ok(cfg) => {
                *self.current.write().await = Arc::new(cfg);
            }
            Err(err) => {
                warn!(error = %err, "failed to reload config from disk");
            }
        }

        let mut st = self.reload.lock().await;
        st.last_mtime = mtime;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
            [listener]
            port = 9000

            [[endpoints]]
            name = "primary"
            url = "https://api.example.com"
            group = "main"
        "#;
        let cfg: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.listener.port, 9000);
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.endpoints[0].group, "main");
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn endpoint_token_prefers_inline_over_env() {
        let ep = EndpointConfig {
            name: "e".to_string(),
            url: "https://x".to_string(),
            group: "g".to_string(),
            group_priority: 0,
            priority: 0,
            token: Some("inline-token".to_string()),
            token_env: Some("SOME_ENV_THAT_DOES_NOT_EXIST_XYZ".to_string()),
            timeout: None,
            supported_models: HashMap::new(),
            model_mapping: HashMap::new(),
        };
        assert_eq!(ep.resolve_token().as_deref(), Some("inline-token"));
    }

    #[test]
    fn wildcard_model_matching() {
        assert!(wildcard_match("claude-3-5-*", "claude-3-5-sonnet"));
        assert!(!wildcard_match("claude-3-5-*", "claude-3-opus"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("exact", "exact"));
        assert!(!wildcard_match("exact", "not-exact"));
    }
}
