//! Server configuration loading: JSON file plus environment overrides.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Token validation settings. Expiry windows and the refresh-token store
/// belong to the issuing collaborator and are not consumed here.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtSettings {
    /// Expected issuer; empty disables the check.
    pub issuer: String,
    /// Expected audience; empty disables the check.
    pub audience: String,
    /// Shared HS256 secret.
    pub key: String,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            key: "development-only-secret".to_string(),
        }
    }
}

/// Configuration for the fleet server.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:5000`.
    pub listen: String,
    /// sqlx SQLite URL.
    pub database_url: String,
    /// Bearer-token validation settings.
    pub jwt: JwtSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            database_url: "sqlite://fleet.db?mode=rwc".to_string(),
            jwt: JwtSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path` (when present) and apply `FLEET_*` env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("invalid config file {}", path.display()))?
        } else {
            log::info!("no config file at {}; using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("FLEET_LISTEN") {
            self.listen = listen;
        }
        if let Ok(url) = std::env::var("FLEET_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(key) = std::env::var("FLEET_JWT_KEY") {
            self.jwt.key = key;
        }
        if let Ok(issuer) = std::env::var("FLEET_JWT_ISSUER") {
            self.jwt.issuer = issuer;
        }
        if let Ok(audience) = std::env::var("FLEET_JWT_AUDIENCE") {
            self.jwt.audience = audience;
        }
    }

    /// Issuer as an option (empty string means "do not validate").
    #[must_use]
    pub fn issuer(&self) -> Option<String> {
        (!self.jwt.issuer.is_empty()).then(|| self.jwt.issuer.clone())
    }

    /// Audience as an option.
    #[must_use]
    pub fn audience(&self) -> Option<String> {
        (!self.jwt.audience.is_empty()).then(|| self.jwt.audience.clone())
    }
}
