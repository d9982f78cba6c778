//! Server configuration loaded from environment variables

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_address: String,
    /// Postgres connection string. When absent the server runs against the
    /// in-memory store (development and demo setups).
    pub database_url: Option<String>,
    /// Shared secret for verifying webhook delivery signatures.
    pub webhook_secret: String,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let webhook_secret =
            std::env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?;
        if webhook_secret.trim().is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must not be empty");
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            bind_address,
            database_url,
            webhook_secret,
            allowed_origins,
        })
    }
}
