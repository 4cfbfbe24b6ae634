//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

use crate::error::AppError;
use crate::federation::VerifyPolicy;
use crate::queue::QueueSettings;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub actor: ActorConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub key_cache: KeyCacheConfig,
    pub verify: VerifyConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Local actor whose key signs every delivery
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    /// Published key URL, e.g. "https://social.example.com/users/me#main-key"
    pub key_id: String,
    /// PEM private key (PKCS#8 or PKCS#1)
    pub private_key_path: PathBuf,
}

/// Durable queue configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Path to SQLite database file
    pub database_path: PathBuf,
    /// Lease length for a popped message
    pub visibility_timeout_seconds: u64,
    /// Retry sweeps before a message is dead-lettered
    pub max_retries: u32,
}

impl QueueConfig {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            max_retries: self.max_retries,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_seconds),
        }
    }
}

/// Delivery worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent worker loops
    pub workers: usize,
    /// Per-attempt request timeout
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Sleep between polls of an empty queue
    pub idle_poll_millis: u64,
    /// Treat any 2xx as delivered (default: only 200)
    pub accept_any_2xx: bool,
}

/// Retry sweeper schedule
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub interval_seconds: u64,
}

/// Remote public key cache
#[derive(Debug, Clone, Deserialize)]
pub struct KeyCacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub fetch_timeout_seconds: u64,
    /// Allow fetching actors on loopback/private addresses (development only)
    pub allow_private_hosts: bool,
}

/// Inbound signature checks
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Accepted clock skew for the signed Date header (0 disables)
    pub max_date_skew_seconds: u64,
    /// Compare the Digest header against the received body
    pub require_digest_match: bool,
}

impl VerifyConfig {
    pub fn policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            max_date_skew: (self.max_date_skew_seconds > 0)
                .then(|| Duration::from_secs(self.max_date_skew_seconds)),
            require_digest_match: self.require_digest_match,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDCOURIER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("queue.database_path", "data/queue.db")?
            .set_default("queue.visibility_timeout_seconds", 60)?
            .set_default("queue.max_retries", 3)?
            .set_default("delivery.workers", 1)?
            .set_default("delivery.timeout_seconds", 10)?
            .set_default("delivery.user_agent", crate::federation::DEFAULT_USER_AGENT)?
            .set_default("delivery.idle_poll_millis", 500)?
            .set_default("delivery.accept_any_2xx", false)?
            .set_default("retry.interval_seconds", 300)?
            .set_default("key_cache.ttl_seconds", 3600)?
            .set_default("key_cache.max_entries", 10_000)?
            .set_default("key_cache.fetch_timeout_seconds", 10)?
            .set_default("key_cache.allow_private_hosts", false)?
            .set_default("verify.max_date_skew_seconds", 300)?
            .set_default("verify.require_digest_match", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDCOURIER__*)
            .add_source(
                Environment::with_prefix("FEDCOURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.queue.max_retries == 0 {
            return Err(AppError::Config(
                "queue.max_retries must be at least 1".to_string(),
            ));
        }

        if self.delivery.workers == 0 {
            return Err(AppError::Config(
                "delivery.workers must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("queue.visibility_timeout_seconds", self.queue.visibility_timeout_seconds),
            ("delivery.timeout_seconds", self.delivery.timeout_seconds),
            ("delivery.idle_poll_millis", self.delivery.idle_poll_millis),
            ("retry.interval_seconds", self.retry.interval_seconds),
            ("key_cache.ttl_seconds", self.key_cache.ttl_seconds),
            ("key_cache.fetch_timeout_seconds", self.key_cache.fetch_timeout_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.queue.visibility_timeout_seconds <= self.delivery.timeout_seconds {
            tracing::warn!(
                visibility_timeout_seconds = self.queue.visibility_timeout_seconds,
                delivery_timeout_seconds = self.delivery.timeout_seconds,
                "Queue lease is not longer than the delivery timeout; slow deliveries may be attempted twice"
            );
        }

        match url::Url::parse(&self.actor.key_id) {
            Ok(key_url) if matches!(key_url.scheme(), "http" | "https") && key_url.has_host() => {}
            _ => {
                return Err(AppError::Config(
                    "actor.key_id must be an absolute http(s) URL".to_string(),
                ));
            }
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Running with a local server domain"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
