//! # Configuration Management Module
//!
//! TOML-backed configuration for the gateway binary: `Config::load` /
//! `apply_env_overrides` / `validate`. Only the typed, validated surface
//! handed to `switchboard-core`'s constructors lives here.
//!
//! ## Configuration file example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//! timeout = "30s"
//! max_body_size = 10485760
//!
//! [providers.openai]
//! family = "openai-shaped"
//! api_key = "sk-..."
//! base_url = "https://api.openai.com/v1"
//!
//! [providers.cloudflare]
//! family = "cloudflare-shaped"
//! api_key = "..."
//! account_id = "acct-123"
//! is_free = true
//!
//! [router.weights]
//! w_tier = 0.4
//! w_health = 0.3
//! w_latency = 0.2
//! w_cost = 0.1
//!
//! [circuit_breaker.cooldown_by_class]
//! rate_limit = "60s"
//! server_error = "30s"
//! auth_error = "1h"
//! transport_error = "30s"
//!
//! [quota]
//! window = "60s"
//!
//! [registry_sync]
//! catalog_sync_cadence = "24h"
//! discovery_cadence = "1h"
//! staleness_horizon = "2h"
//!
//! [canonical_aliases]
//! fast = ["m-lite", "m-mid"]
//! ```

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_core::health::CircuitCooldowns;
use switchboard_core::providers::AdapterConfig;
use switchboard_core::router::RouterWeights;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM provider adapter configurations, keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub registry_sync: RegistrySyncConfig,
    /// `canonical-aliases[name]`: a semantic alias to an ordered list of
    /// canonical `GlobalModel` ids.
    #[serde(default)]
    pub canonical_aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "switchboard_core::common::duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// `router.weights`. `RouterWeights` already carries sensible defaults
/// (see `switchboard_core::router`), so this wrapper only exists to
/// give the weights a named TOML table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    pub weights: RouterWeights,
}

/// `circuit.cooldown-by-class` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(flatten)]
    pub cooldown_by_class: CircuitCooldowns,
}

/// `quota.window`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(with = "switchboard_core::common::duration_serde")]
    pub window: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
        }
    }
}

/// `catalog-sync.cadence`, `discovery.cadence`, `staleness-horizon`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySyncConfig {
    #[serde(with = "switchboard_core::common::duration_serde")]
    pub catalog_sync_cadence: Duration,
    #[serde(with = "switchboard_core::common::duration_serde")]
    pub discovery_cadence: Duration,
    #[serde(with = "switchboard_core::common::duration_serde")]
    pub staleness_horizon: Duration,
}

impl Default for RegistrySyncConfig {
    fn default() -> Self {
        Self {
            catalog_sync_cadence: Duration::from_secs(86_400),
            discovery_cadence: Duration::from_secs(3_600),
            staleness_horizon: Duration::from_secs(7_200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: HashMap::new(),
            router: RouterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            quota: QuotaConfig::default(),
            registry_sync: RegistrySyncConfig::default(),
            canonical_aliases: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// `GATEWAY_HOST` / `GATEWAY_PORT` / `GATEWAY_TIMEOUT` /
    /// `GATEWAY_LOG_LEVEL` server overrides, plus
    /// `{PROVIDER}_API_KEY` per configured provider.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid GATEWAY_PORT: {port_str}"))?;
            if port > 0 {
                self.server.port = port;
            }
        }
        if let Ok(timeout) = env::var("GATEWAY_TIMEOUT") {
            self.server.timeout = parse_duration(&timeout)?;
        }
        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }

        for (provider_name, adapter_config) in &mut self.providers {
            let env_key = format!("{}_API_KEY", provider_name.to_uppercase().replace('-', "_"));
            if let Ok(api_key) = env::var(&env_key) {
                if !api_key.is_empty() {
                    adapter_config.api_key = api_key;
                    tracing::debug!(provider = %provider_name, "loaded API key from environment");
                }
            } else if adapter_config.api_key.is_empty() {
                tracing::warn!(
                    provider = %provider_name,
                    env_key,
                    "no API key configured or found in environment"
                );
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("server host cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("server port must be between 1 and 65535");
        }
        if self.server.max_body_size == 0 {
            anyhow::bail!("server max_body_size cannot be 0");
        }

        for (name, adapter) in &self.providers {
            if adapter.api_key.is_empty() {
                anyhow::bail!("provider {name} has no api_key configured");
            }
            if let Some(base_url) = &adapter.base_url {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    anyhow::bail!("provider {name} has an invalid base_url: {base_url}");
                }
            }
        }

        let weights = &self.router.weights;
        let total = weights.w_tier + weights.w_health + weights.w_latency + weights.w_cost;
        if (total - 1.0).abs() > 0.05 {
            anyhow::bail!("router.weights must sum to ~1.0, got {total}");
        }

        for (alias, targets) in &self.canonical_aliases {
            if targets.is_empty() {
                anyhow::bail!("canonical_aliases.{alias} has no target models");
            }
        }

        Ok(())
    }
}

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    switchboard_core::common::duration_serde::parse_duration(s).map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut config = Config::default();
        config.providers.insert(
            "openai".to_string(),
            AdapterConfig::new("openai-shaped", "test-key"),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_missing_api_key_is_rejected() {
        let mut config = Config::default();
        config
            .providers
            .insert("openai".to_string(), AdapterConfig::new("openai-shaped", ""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn unbalanced_router_weights_are_rejected() {
        let mut config = Config::default();
        config.router.weights.w_tier = 10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_server_settings() {
        let mut config = Config::default();
        std::env::set_var("GATEWAY_HOST", "0.0.0.0");
        std::env::set_var("GATEWAY_PORT", "8080");
        std::env::set_var("GATEWAY_LOG_LEVEL", "debug");
        config.apply_env_overrides().unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "debug");
        std::env::remove_var("GATEWAY_HOST");
        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("GATEWAY_LOG_LEVEL");
    }

    #[test]
    fn duration_parsing_supports_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("nonsense").is_err());
    }
}
