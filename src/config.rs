use crate::secret::{DEFAULT_HASH_COST, MAX_HASH_COST, MIN_HASH_COST};
use dotenvy::dotenv;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MIN_RETRY_INTERVAL_MS: u64 = 100;
const MAX_RETRY_INTERVAL_MS: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::ParsingError(format!(
                "STORE_BACKEND must be 'sqlite' or 'memory', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Negative means retry forever.
    pub max_retries: i32,
    pub retry_interval_ms: u64,
    pub subscribe_topic: String,
}

#[derive(Debug, Clone)]
pub struct AdminAccount {
    pub mqtt_id: String,
    pub password: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: SocketAddr,
    pub store_backend: StoreBackend,
    pub database_path: String,
    pub mqtt: MqttSettings,
    pub threshold_cache_ttl: Duration,
    pub threshold_cache_max_entries: usize,
    pub alert_recipients: Vec<String>,
    pub alert_webhook_url: Option<String>,
    pub auth_ignore_anonymous: bool,
    /// bcrypt work factor for newly stored secrets.
    pub secret_hash_cost: u32,
    pub admin: Option<AdminAccount>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mqtt_enabled = parse_bool(&get, "MQTT_ENABLED", true)?;
        let mqtt_host = match get("MQTT_HOST") {
            Some(host) => host,
            None if mqtt_enabled => {
                return Err(ConfigError::MissingOrInvalid("MQTT_HOST".to_string()))
            }
            None => String::new(),
        };

        let admin = match (get("ADMIN_MQTT_ID"), get("ADMIN_PASSWORD")) {
            (Some(mqtt_id), Some(password)) => Some(AdminAccount {
                mqtt_id,
                password,
                client_id: get("ADMIN_CLIENT_ID").unwrap_or_else(|| "ADMIN_CLIENT".to_string()),
            }),
            _ => None,
        };

        let config = Self {
            http_bind: parse_or(&get, "HTTP_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            store_backend: match get("STORE_BACKEND") {
                Some(value) => value.parse()?,
                None => StoreBackend::Sqlite,
            },
            database_path: get("DATABASE_PATH").unwrap_or_else(|| "sensor_guard.db".to_string()),
            mqtt: MqttSettings {
                enabled: mqtt_enabled,
                host: mqtt_host,
                port: parse_or(&get, "MQTT_PORT", 1883)?,
                username: get("MQTT_USERNAME").unwrap_or_default(),
                password: get("MQTT_PASSWORD").unwrap_or_default(),
                max_retries: parse_or(&get, "MQTT_MAX_RETRIES", -1)?,
                retry_interval_ms: parse_or(&get, "MQTT_RETRY_INTERVAL_MS", 5000)?,
                subscribe_topic: get("MQTT_SUBSCRIBE_TOPIC").unwrap_or_else(|| "sensor/+/+".to_string()),
            },
            threshold_cache_ttl: Duration::from_secs(parse_or(&get, "THRESHOLD_CACHE_TTL_SECS", 1800)?),
            threshold_cache_max_entries: parse_or(&get, "THRESHOLD_CACHE_MAX_ENTRIES", 1000)?,
            alert_recipients: get("ALERT_RECIPIENTS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
            auth_ignore_anonymous: parse_bool(&get, "AUTH_IGNORE_ANONYMOUS", false)?,
            secret_hash_cost: parse_or(&get, "SECRET_HASH_COST", DEFAULT_HASH_COST)?,
            admin,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_RETRY_INTERVAL_MS..=MAX_RETRY_INTERVAL_MS).contains(&self.mqtt.retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_RETRY_INTERVAL_MS, MAX_RETRY_INTERVAL_MS
            )));
        }
        if self.threshold_cache_ttl.is_zero() {
            return Err(ConfigError::ParsingError(
                "THRESHOLD_CACHE_TTL_SECS must be greater than 0".to_string(),
            ));
        }
        if self.threshold_cache_max_entries == 0 {
            return Err(ConfigError::ParsingError(
                "THRESHOLD_CACHE_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }
        if !(MIN_HASH_COST..=MAX_HASH_COST).contains(&self.secret_hash_cost) {
            return Err(ConfigError::ParsingError(format!(
                "SECRET_HASH_COST must be between {} and {}",
                MIN_HASH_COST, MAX_HASH_COST
            )));
        }
        if !crate::topic::is_valid_pattern(&self.mqtt.subscribe_topic) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_SUBSCRIBE_TOPIC '{}' is not a valid topic filter",
                self.mqtt.subscribe_topic
            )));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{key} has an invalid value '{raw}'"))),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        None => Ok(default),
        Some("true" | "1" | "yes" | "on") => Ok(true),
        Some("false" | "0" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::ParsingError(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("MQTT_HOST", "broker")]).unwrap();
        assert_eq!(config.http_bind.port(), 8080);
        assert_eq!(config.store_backend, StoreBackend::Sqlite);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.max_retries, -1);
        assert_eq!(config.mqtt.subscribe_topic, "sensor/+/+");
        assert_eq!(config.threshold_cache_ttl, Duration::from_secs(1800));
        assert_eq!(config.threshold_cache_max_entries, 1000);
        assert!(config.alert_recipients.is_empty());
        assert!(!config.auth_ignore_anonymous);
        assert!(config.admin.is_none());
        assert_eq!(config.secret_hash_cost, DEFAULT_HASH_COST);
    }

    #[test]
    fn secret_hash_cost_is_bounded() {
        let config = load(&[("MQTT_HOST", "b"), ("SECRET_HASH_COST", "10")]).unwrap();
        assert_eq!(config.secret_hash_cost, 10);
        assert!(load(&[("MQTT_HOST", "b"), ("SECRET_HASH_COST", "3")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("SECRET_HASH_COST", "32")]).is_err());
    }

    #[test]
    fn mqtt_host_required_only_when_enabled() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::MissingOrInvalid(key)) if key == "MQTT_HOST"
        ));
        let config = load(&[("MQTT_ENABLED", "false")]).unwrap();
        assert!(!config.mqtt.enabled);
    }

    #[test]
    fn retry_interval_is_bounded() {
        assert!(load(&[("MQTT_HOST", "b"), ("MQTT_RETRY_INTERVAL_MS", "10")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("MQTT_RETRY_INTERVAL_MS", "abc")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("MQTT_RETRY_INTERVAL_MS", "100")]).is_ok());
    }

    #[test]
    fn lists_and_admin_are_parsed() {
        let config = load(&[
            ("MQTT_HOST", "b"),
            ("ALERT_RECIPIENTS", "ops@example.com, ,oncall@example.com"),
            ("ADMIN_MQTT_ID", "admin"),
            ("ADMIN_PASSWORD", "pw"),
            ("STORE_BACKEND", "Memory"),
        ])
        .unwrap();
        assert_eq!(
            config.alert_recipients,
            vec!["ops@example.com".to_string(), "oncall@example.com".to_string()]
        );
        let admin = config.admin.unwrap();
        assert_eq!(admin.client_id, "ADMIN_CLIENT");
        assert_eq!(config.store_backend, StoreBackend::Memory);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("MQTT_HOST", "b"), ("STORE_BACKEND", "postgres")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("THRESHOLD_CACHE_TTL_SECS", "0")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("AUTH_IGNORE_ANONYMOUS", "maybe")]).is_err());
        assert!(load(&[("MQTT_HOST", "b"), ("MQTT_SUBSCRIBE_TOPIC", "sensor/#/x")]).is_err());
    }
}
