//! Configuration loading, validation, and hot-reloadable snapshots.
//!
//! Four JSON files live in the config directory: `server.json`,
//! `upstreams.json`, `tenants.json`, `pricing.json`. They are parsed into one
//! immutable [`Config`] value at startup and replaced atomically on reload;
//! readers always see a consistent snapshot.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::constants::DEFAULT_PROXY_TIMEOUT_SECS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// server.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerFile {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Upstream request timeout in milliseconds
    pub timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROXY_TIMEOUT_SECS * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub path: String,
    pub username: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/admin".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub directory: String,
    pub max_file_size: Option<u64>,
    pub max_files: Option<u32>,
    pub enable_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            max_file_size: None,
            max_files: None,
            enable_console: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenAiConfig {
    pub enabled: bool,
    /// OpenAI model name -> Claude model name
    pub models: serde_json::Map<String, Value>,
    pub default_model: Option<String>,
}

impl OpenAiConfig {
    /// Resolve an incoming OpenAI model name to the Claude model to request.
    pub fn resolve_model(&self, requested: &str) -> String {
        if let Some(mapped) = self.models.get(requested).and_then(|v| v.as_str()) {
            return mapped.to_string();
        }
        self.default_model
            .clone()
            .unwrap_or_else(|| requested.to_string())
    }
}

// ---------------------------------------------------------------------------
// upstreams.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamsFile {
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub path: Option<String>,
    /// Probe timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    pub strategy: String,
    pub health_check_enabled: bool,
    pub failover_enabled: bool,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "weighted_round_robin".to_string(),
            health_check_enabled: false,
            failover_enabled: true,
        }
    }
}

fn default_weight() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// tenants.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TenantsFile {
    pub tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub limits: Option<TenantLimits>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantLimits {
    #[serde(default)]
    pub daily: Option<DailyLimit>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DailyLimit {
    #[serde(default, rename = "maxUSD")]
    pub max_usd: Option<f64>,
}

impl Tenant {
    /// Daily spend cap in USD; None means unlimited.
    pub fn daily_max_usd(&self) -> Option<f64> {
        self.limits.as_ref()?.daily.as_ref()?.max_usd
    }
}

// ---------------------------------------------------------------------------
// pricing.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingFile {
    /// Model glob pattern -> per-1K-token prices. Object order is semantic
    /// (first wildcard match wins), hence serde_json's preserve_order.
    model_pricing: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
}

#[derive(Debug, Clone)]
pub struct PricingEntry {
    pub pattern: String,
    pub price: ModelPrice,
}

// ---------------------------------------------------------------------------
// Combined config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
    pub openai: OpenAiConfig,
    pub upstreams: Vec<Upstream>,
    pub load_balancer: LoadBalancerConfig,
    pub tenants: Vec<Tenant>,
    pub pricing: Vec<PricingEntry>,
}

impl Config {
    /// Load and validate all four config files from `dir`.
    ///
    /// The `PORT` environment variable, when set and parseable, overrides
    /// `server.port`.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let server_file: ServerFile = read_json(&dir.join("server.json"))?;
        let upstreams_file: UpstreamsFile = read_json(&dir.join("upstreams.json"))?;
        let tenants_file: TenantsFile = read_json(&dir.join("tenants.json"))?;
        let pricing_file: PricingFile = read_json(&dir.join("pricing.json"))?;

        let pricing = parse_pricing(pricing_file)?;

        let mut config = Config {
            server: server_file.server,
            proxy: server_file.proxy,
            admin: server_file.admin,
            logging: server_file.logging,
            openai: server_file.openai,
            upstreams: upstreams_file.upstreams,
            load_balancer: upstreams_file.load_balancer,
            tenants: tenants_file.tenants,
            pricing,
        };

        config.server.port = resolve_port(config.server.port, env::var("PORT").ok());
        config.validate()?;
        Ok(config)
    }

    pub fn tenant_by_key(&self, key: &str) -> Option<&Tenant> {
        use subtle::ConstantTimeEq;
        self.tenants
            .iter()
            .find(|t| t.key.as_bytes().ct_eq(key.as_bytes()).into())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one upstream must be configured".to_string(),
            ));
        }

        let mut upstream_ids = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.id.is_empty() {
                return Err(ConfigError::Invalid("upstream id must not be empty".into()));
            }
            if !upstream_ids.insert(upstream.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate upstream id: {}",
                    upstream.id
                )));
            }
            url::Url::parse(&upstream.url).map_err(|e| {
                ConfigError::Invalid(format!("upstream {} has invalid url: {e}", upstream.id))
            })?;
        }

        let mut tenant_ids = HashSet::new();
        let mut tenant_keys = HashSet::new();
        for tenant in &self.tenants {
            if !tenant_ids.insert(tenant.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tenant id: {}",
                    tenant.id
                )));
            }
            if tenant.key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tenant {} has an empty key",
                    tenant.id
                )));
            }
            if !tenant_keys.insert(tenant.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tenant {} reuses another tenant's key",
                    tenant.id
                )));
            }
            if let Some(max) = tenant.daily_max_usd()
                && max < 0.0
            {
                return Err(ConfigError::Invalid(format!(
                    "tenant {} has a negative daily limit",
                    tenant.id
                )));
            }
        }

        for entry in &self.pricing {
            let p = &entry.price;
            if p.input < 0.0 || p.output < 0.0 || p.cache_creation < 0.0 || p.cache_read < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "pricing entry {} has a negative price",
                    entry.pattern
                )));
            }
        }

        if self.admin.enabled && (self.admin.username.is_empty() || self.admin.password.is_empty())
        {
            return Err(ConfigError::Invalid(
                "admin API enabled but username/password not set".to_string(),
            ));
        }

        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_pricing(file: PricingFile) -> Result<Vec<PricingEntry>, ConfigError> {
    file.model_pricing
        .into_iter()
        .map(|(pattern, value)| {
            let price: ModelPrice = serde_json::from_value(value).map_err(|e| {
                ConfigError::Invalid(format!("pricing entry {pattern} is malformed: {e}"))
            })?;
            Ok(PricingEntry { pattern, price })
        })
        .collect()
}

fn resolve_port(file_port: u16, env_port: Option<String>) -> u16 {
    env_port
        .and_then(|p| p.parse().ok())
        .unwrap_or(file_port)
}

// ---------------------------------------------------------------------------
// Hot-reloadable store
// ---------------------------------------------------------------------------

/// Shared configuration handle. Readers take a cheap `Arc` snapshot; reload
/// re-reads the config directory, validates, and swaps the pointer. A failed
/// reload keeps the previous snapshot.
pub struct ConfigStore {
    dir: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(dir: PathBuf, initial: Config) -> Self {
        Self {
            dir,
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    pub async fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let fresh = Arc::new(Config::load(&self.dir)?);
        *self.current.write().await = fresh.clone();
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config {
            server: ServerConfig::default(),
            proxy: ProxyConfig::default(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            openai: OpenAiConfig::default(),
            upstreams: vec![Upstream {
                id: "up-1".to_string(),
                name: "primary".to_string(),
                url: "https://api.anthropic.com".to_string(),
                key: Some("sk-upstream".to_string()),
                weight: 100,
                enabled: true,
                health_check: None,
            }],
            load_balancer: LoadBalancerConfig::default(),
            tenants: vec![Tenant {
                id: "acme".to_string(),
                name: "Acme".to_string(),
                key: "sk-tenant-acme".to_string(),
                enabled: true,
                allowed_models: vec!["*".to_string()],
                limits: None,
            }],
            pricing: Vec::new(),
        }
    }

    #[test]
    fn validate_accepts_minimal() {
        assert!(minimal_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_upstreams() {
        let mut config = minimal_config();
        config.upstreams.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_tenant_keys() {
        let mut config = minimal_config();
        let mut dup = config.tenants[0].clone();
        dup.id = "other".to_string();
        config.tenants.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_negative_daily_limit() {
        let mut config = minimal_config();
        config.tenants[0].limits = Some(TenantLimits {
            daily: Some(DailyLimit {
                max_usd: Some(-1.0),
            }),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn port_env_override() {
        assert_eq!(resolve_port(3000, Some("8080".to_string())), 8080);
        assert_eq!(resolve_port(3000, Some("not-a-port".to_string())), 3000);
        assert_eq!(resolve_port(3000, None), 3000);
    }

    #[test]
    fn upstream_defaults() {
        let parsed: UpstreamsFile = serde_json::from_str(
            r#"{
                "upstreams": [
                    {"id": "a", "name": "A", "url": "https://a.example.com"}
                ]
            }"#,
        )
        .unwrap();
        let up = &parsed.upstreams[0];
        assert_eq!(up.weight, 100);
        assert!(up.enabled);
        assert!(up.key.is_none());
        assert_eq!(parsed.load_balancer.strategy, "weighted_round_robin");
    }

    #[test]
    fn pricing_preserves_declaration_order() {
        let file: PricingFile = serde_json::from_str(
            r#"{
                "modelPricing": {
                    "*haiku*": {"input": 0.001, "output": 0.005, "cacheCreation": 0.00125, "cacheRead": 0.0001},
                    "*sonnet*": {"input": 0.003, "output": 0.015, "cacheCreation": 0.00375, "cacheRead": 0.0003},
                    "*": {"input": 0.01, "output": 0.05, "cacheCreation": 0.0, "cacheRead": 0.0}
                }
            }"#,
        )
        .unwrap();
        let entries = parse_pricing(file).unwrap();
        let patterns: Vec<&str> = entries.iter().map(|e| e.pattern.as_str()).collect();
        assert_eq!(patterns, vec!["*haiku*", "*sonnet*", "*"]);
    }

    #[test]
    fn tenant_limit_lookup() {
        let tenant: Tenant = serde_json::from_str(
            r#"{
                "id": "t", "name": "T", "key": "sk",
                "allowedModels": ["*haiku*"],
                "limits": {"daily": {"maxUSD": 100.0}}
            }"#,
        )
        .unwrap();
        assert_eq!(tenant.daily_max_usd(), Some(100.0));
        assert!(tenant.enabled);
    }

    #[test]
    fn openai_model_resolution() {
        let openai: OpenAiConfig = serde_json::from_str(
            r#"{
                "enabled": true,
                "models": {"gpt-5-mini": "claude-3-7-sonnet-20250219"},
                "defaultModel": "claude-3-5-haiku-20241022"
            }"#,
        )
        .unwrap();
        assert_eq!(
            openai.resolve_model("gpt-5-mini"),
            "claude-3-7-sonnet-20250219"
        );
        assert_eq!(
            openai.resolve_model("gpt-4o"),
            "claude-3-5-haiku-20241022"
        );

        let bare = OpenAiConfig::default();
        assert_eq!(bare.resolve_model("gpt-4o"), "gpt-4o");
    }
}
