//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_pool_size: usize,
    /// TLS is negotiated when the URL carries `sslmode=require`
    pub require_tls: bool,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Governance engine tuning
#[derive(Debug, Clone, Deserialize)]
pub struct GovernanceConfig {
    /// Lifetime of a new proposal when the proposer gives no expiry
    pub proposal_ttl_days: i64,
    /// Attempts for one read-modify-write unit before giving up
    pub max_write_attempts: u32,
    /// Upper bound on a single store round trip
    pub store_timeout_ms: u64,
    /// Eager expiry sweep; `None` leaves expiry purely lazy
    pub sweep_interval_secs: Option<u64>,
    /// How long a claim on applying an approved proposal blocks reconciliation
    pub apply_lease_secs: i64,
}

impl GovernanceConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn proposal_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.proposal_ttl_days)
    }

    pub fn apply_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.apply_lease_secs)
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            proposal_ttl_days: 7,
            max_write_attempts: 5,
            store_timeout_ms: 5_000,
            sweep_interval_secs: None,
            apply_lease_secs: 300,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// Absent means the in-memory adapters are used
    pub database: Option<DatabaseConfig>,
    pub cors: CorsConfig,
    pub governance: GovernanceConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env_parse("HOST").unwrap_or_else(|| ServerConfig::default().host),
            port: env_parse("PORT").unwrap_or_else(|| ServerConfig::default().port),
        };

        let database = match std::env::var("DATABASE_URL") {
            Ok(database_url) => Some(Self::parse_database_url(&database_url)?),
            Err(_) => None,
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let defaults = GovernanceConfig::default();
        let governance = GovernanceConfig {
            proposal_ttl_days: env_parse("GOVERNANCE_PROPOSAL_TTL_DAYS")
                .unwrap_or(defaults.proposal_ttl_days),
            max_write_attempts: env_parse("GOVERNANCE_MAX_WRITE_ATTEMPTS")
                .unwrap_or(defaults.max_write_attempts),
            store_timeout_ms: env_parse("GOVERNANCE_STORE_TIMEOUT_MS")
                .unwrap_or(defaults.store_timeout_ms),
            sweep_interval_secs: env_parse("GOVERNANCE_SWEEP_INTERVAL_SECS"),
            apply_lease_secs: env_parse("GOVERNANCE_APPLY_LEASE_SECS")
                .unwrap_or(defaults.apply_lease_secs),
        };
        Self::validate_governance(&governance)?;

        Ok(Self {
            server,
            database,
            cors,
            governance,
        })
    }

    fn validate_governance(governance: &GovernanceConfig) -> Result<(), ConfigError> {
        if governance.proposal_ttl_days <= 0 {
            return Err(ConfigError::InvalidValue(
                "GOVERNANCE_PROPOSAL_TTL_DAYS must be positive".to_string(),
            ));
        }
        if governance.max_write_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "GOVERNANCE_MAX_WRITE_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if governance.apply_lease_secs <= 0 {
            return Err(ConfigError::InvalidValue(
                "GOVERNANCE_APPLY_LEASE_SECS must be positive".to_string(),
            ));
        }
        if governance.sweep_interval_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "GOVERNANCE_SWEEP_INTERVAL_SECS must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a DATABASE_URL connection string (postgresql://...)
    fn parse_database_url(url: &str) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;

        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme '{}'",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| ConfigError::InvalidValue("Missing host in DATABASE_URL".to_string()))?
            .to_string();

        let database = parsed.path().trim_start_matches('/').to_string();
        if database.is_empty() {
            return Err(ConfigError::InvalidValue(
                "Missing database name in DATABASE_URL".to_string(),
            ));
        }

        let require_tls = parsed
            .query_pairs()
            .any(|(k, v)| k == "sslmode" && v == "require");

        Ok(DatabaseConfig {
            port: parsed.port().unwrap_or(5432),
            user: parsed.username().to_string(),
            password: parsed.password().map(|p| p.to_string()).unwrap_or_default(),
            host,
            database,
            max_pool_size: env_parse("DB_MAX_CONNECTIONS").unwrap_or(10),
            require_tls,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
