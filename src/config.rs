use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::auth::MAX_TOKEN_TTL_DAYS;
use crate::{log_system_event, log_validation};

pub const PLACEHOLDER_SECRET_KEY: &str = "change-me-in-production";

/// Complete application configuration loaded from environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Access token signing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub secret_key: String,
    pub token_ttl_days: i64,
}

/// Attachment storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub upload_folder: String,
    pub max_upload_bytes: usize,
}

/// Logging system configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub log_directory: String,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        log_system_event!(config, "Loading application configuration");

        let config = Config {
            database: DatabaseConfig::from_lookup(&lookup)?,
            server: ServerConfig::from_lookup(&lookup)?,
            auth: AuthConfig::from_lookup(&lookup)?,
            storage: StorageConfig::from_lookup(&lookup)?,
            logging: LoggingConfig::from_lookup(&lookup),
        };

        log_system_event!(config, "Configuration loaded successfully");
        config.log_configuration_summary();

        Ok(config)
    }

    /// Log a summary of loaded configuration (without sensitive data)
    fn log_configuration_summary(&self) {
        info!(
            database_url_masked = %mask_sensitive_data(&self.database.url),
            max_connections = self.database.max_connections,
            server_address = %self.server.address(),
            secret_key_masked = %mask_sensitive_data(&self.auth.secret_key),
            token_ttl_days = self.auth.token_ttl_days,
            upload_folder = %self.storage.upload_folder,
            max_upload_bytes = self.storage.max_upload_bytes,
            log_level = %self.logging.level,
            "Configuration summary"
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            let error = "DATABASE_URL must start with 'sqlite:'";
            log_validation!(failure, "configuration", error = error);
            return Err(anyhow!(error));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Server port must be greater than 0"));
        }

        if !(1..=MAX_TOKEN_TTL_DAYS).contains(&self.auth.token_ttl_days) {
            return Err(anyhow!(
                "TOKEN_TTL_DAYS must be between 1 and {}",
                MAX_TOKEN_TTL_DAYS
            ));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(anyhow!("MAX_UPLOAD_BYTES must be greater than 0"));
        }

        if self.auth.secret_key.trim().is_empty() || self.auth.secret_key == PLACEHOLDER_SECRET_KEY {
            let error = "SECRET_KEY must be set to a private value";
            log_validation!(failure, "configuration", error = error);
            return Err(anyhow!(error));
        }

        if !self.logging.level.contains(',')
            && !["trace", "debug", "info", "warn", "error"]
                .contains(&self.logging.level.to_lowercase().as_str())
        {
            warn!("Invalid log level '{}', using 'info' as fallback", self.logging.level);
        }

        log_validation!(success, "configuration", "Configuration validation completed successfully");
        Ok(())
    }
}

impl DatabaseConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:zettel.db?mode=rwc".to_string());
        let max_connections = parse_or("DATABASE_MAX_CONNECTIONS", lookup, 5)?;

        Ok(DatabaseConfig { url, max_connections })
    }
}

impl ServerConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port_str = lookup("PORT").unwrap_or_else(|| "8080".to_string());

        let port = port_str.parse::<u16>().map_err(|_| {
            anyhow!("Invalid PORT value: '{}'. Must be a number between 1-65535", port_str)
        })?;

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        Ok(ServerConfig { port, host })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl AuthConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secret_key =
            lookup("SECRET_KEY").unwrap_or_else(|| PLACEHOLDER_SECRET_KEY.to_string());
        let token_ttl_days = parse_or("TOKEN_TTL_DAYS", lookup, 15)?;

        Ok(AuthConfig {
            secret_key,
            token_ttl_days,
        })
    }
}

impl StorageConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let upload_folder = lookup("UPLOAD_FOLDER").unwrap_or_else(|| "uploads".to_string());
        let max_upload_bytes = parse_or("MAX_UPLOAD_BYTES", lookup, 50 * 1024 * 1024)?;

        Ok(StorageConfig {
            upload_folder,
            max_upload_bytes,
        })
    }
}

impl LoggingConfig {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("RUST_LOG").unwrap_or_else(|| "info,zettel_server=debug".to_string());

        let file_enabled = lookup("LOG_FILE_ENABLED")
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let console_enabled = lookup("LOG_CONSOLE_ENABLED")
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let log_directory = lookup("LOG_DIRECTORY").unwrap_or_else(|| "logs".to_string());

        LoggingConfig {
            level,
            file_enabled,
            console_enabled,
            log_directory,
        }
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> Result<T>
where
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("Invalid {} value: '{}'", key, raw)),
        None => Ok(default),
    }
}

/// Mask sensitive data in configuration for safe logging
fn mask_sensitive_data(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}***{}", head, tail)
    }
}
