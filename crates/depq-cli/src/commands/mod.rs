//! CLI command implementations.

pub mod report;
pub mod stats;

use anyhow::{Context as _, Result};
use depq_config::{SystemConfig, load_config};
use depq_db::{PgJobStore, PgPool};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Settings shared by every command.
pub struct Context {
    config: SystemConfig,
    json: bool,
}

impl Context {
    pub fn load(config: Option<&Path>, database_url: Option<String>, json: bool) -> Result<Self> {
        let mut config = match config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => SystemConfig::default(),
        };
        if database_url.is_some() {
            config.database.url = database_url;
        }
        Ok(Self { config, json })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    async fn pool(&self) -> Result<PgPool> {
        let url = self
            .config
            .database
            .url
            .as_deref()
            .context("No database configured: pass --database-url or set DEPQ_DATABASE_URL")?;
        let pool = depq_db::create_pool(url, self.config.database.max_connections)
            .await
            .context("Failed to connect to database")?;
        Ok(pool)
    }

    pub async fn store(&self) -> Result<PgJobStore> {
        let pool = self.pool().await?;
        Ok(PgJobStore::new(pool, self.config.queue.lock_timeout))
    }

    /// Print `value` as JSON when requested, otherwise run `human`.
    pub fn emit<T: Serialize + ?Sized>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

/// Parse a `--since` / `--window` argument.
pub fn parse_window(field: &str, value: &str) -> Result<Duration> {
    Ok(depq_config::parse_duration(field, value)?)
}

pub async fn migrate(ctx: &Context) -> Result<()> {
    let pool = ctx.pool().await?;
    info!("Running migrations...");
    depq_db::run_migrations(&pool)
        .await
        .context("Failed to apply migrations")?;
    info!("Migrations complete");
    Ok(())
}

pub fn validate(path: &Path) -> Result<()> {
    let config = load_config(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;
    println!("Configuration is valid");
    println!(
        "  queue group {:?}, {} workers, lock timeout {:?}",
        config.queue.group, config.queue.workers, config.queue.lock_timeout
    );
    Ok(())
}
