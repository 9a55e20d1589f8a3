//! Configuration schema and loading.
//!
//! Configuration is layered with figment: built-in defaults, then an
//! optional `pansou.yaml`, then the environment. The environment keys are
//! the service's long-standing contract (`CACHE_PATH`, `AUTH_ENABLED`,
//! `AUTH_USERS`, `AUTH_JWT_SECRET`, `AUTH_TOKEN_EXPIRY`, `CHANNELS`,
//! `ENABLED_PLUGINS`, `PORT`) and override everything else.

use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LoggingConfig;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration extraction failed: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Root directory for per-user sub-service state.
    pub cache_path: String,
    /// Default chat channels searched when a request names none.
    pub channels: Vec<String>,
    /// Plugin names to enable; empty means all built-ins.
    pub enabled_plugins: Vec<String>,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache_path: "./cache".to_string(),
            channels: Vec::new(),
            enabled_plugins: Vec::new(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// username → password.
    pub users: HashMap<String, String>,
    pub jwt_secret: String,
    /// Token lifetime in hours.
    pub token_expiry_hours: u64,
    /// Path prefixes that bypass auth. The sub-service management pages are
    /// public by design: their own hash is the credential.
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            users: HashMap::new(),
            jwt_secret: String::new(),
            token_expiry_hours: 24,
            public_paths: Self::default_public_paths(),
        }
    }
}

impl AuthConfig {
    pub fn token_expiry(&self) -> Duration {
        let hours = if self.token_expiry_hours == 0 {
            24
        } else {
            self.token_expiry_hours
        };
        Duration::from_secs(hours * 3600)
    }

    fn default_public_paths() -> Vec<String> {
        vec![
            "/api/auth/".to_string(),
            "/api/health".to_string(),
            "/qqpd/".to_string(),
            "/weibo/".to_string(),
        ]
    }
}

impl AppConfig {
    /// Defaults ← `pansou.yaml` (if present) ← environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file("pansou.yaml")))
    }

    fn load_from(figment: Figment) -> Result<Self, ConfigError> {
        let mut config: AppConfig = figment.extract().map_err(Box::new)?;
        config.apply_env()?;
        if config.auth.public_paths.is_empty() {
            config.auth.public_paths = AuthConfig::default_public_paths();
        }
        Ok(config)
    }

    /// The environment contract wins over file values.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(cache_path) = std::env::var("CACHE_PATH") {
            if !cache_path.is_empty() {
                self.cache_path = cache_path;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                reason: format!("'{port}' is not a port number"),
            })?;
        }
        if let Ok(channels) = std::env::var("CHANNELS") {
            self.channels = split_csv(&channels);
        }
        if let Ok(plugins) = std::env::var("ENABLED_PLUGINS") {
            self.enabled_plugins = split_csv(&plugins);
        }
        if let Ok(enabled) = std::env::var("AUTH_ENABLED") {
            self.auth.enabled = matches!(enabled.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Ok(users) = std::env::var("AUTH_USERS") {
            self.auth.users = parse_users(&users)?;
        }
        if let Ok(secret) = std::env::var("AUTH_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(expiry) = std::env::var("AUTH_TOKEN_EXPIRY") {
            self.auth.token_expiry_hours = parse_expiry_hours(&expiry)?;
        }
        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// `"user1:pass1,user2:pass2"` → map.
fn parse_users(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut users = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((user, password)) = pair.split_once(':') else {
            return Err(ConfigError::Invalid {
                key: "AUTH_USERS",
                reason: format!("'{pair}' is not user:password"),
            });
        };
        users.insert(user.trim().to_string(), password.trim().to_string());
    }
    Ok(users)
}

/// `"24h"`, `"24"` → hours.
fn parse_expiry_hours(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('h');
    trimmed.parse().map_err(|_| ConfigError::Invalid {
        key: "AUTH_TOKEN_EXPIRY",
        reason: format!("'{raw}' is not an hour count"),
    })
}
