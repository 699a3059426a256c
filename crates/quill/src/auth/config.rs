//! Authentication configuration.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT secret used to verify bearer tokens.
    ///
    /// Supports `env:VAR_NAME` syntax to read the secret from the
    /// environment at startup.
    pub jwt_secret: Option<String>,
    /// Accept `dev:<user_id>` bearer tokens (local development only).
    pub dev_mode: bool,
    /// Allowed CORS origins.
    pub allowed_origins: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            dev_mode: false,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

impl AuthConfig {
    /// Resolve `env:VAR_NAME` syntax in the configured secret.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>> {
        match &self.jwt_secret {
            Some(value) => match value.strip_prefix("env:") {
                Some(var) => std::env::var(var)
                    .map(Some)
                    .map_err(|_| anyhow!("jwt_secret references unset env var: {var}")),
                None => Ok(Some(value.clone())),
            },
            None => Ok(None),
        }
    }

    /// Validate the configuration before serving.
    pub fn validate(&self) -> Result<()> {
        if !self.dev_mode && self.jwt_secret.is_none() {
            anyhow::bail!("auth.jwt_secret is required outside dev mode");
        }
        Ok(())
    }
}
