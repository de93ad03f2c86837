use crate::{config::AppConfig, server, storage::Storage};
use anyhow::{Context, Result};
use std::sync::Arc;

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub async fn run(self) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;
        tracing::info!(db = %storage.path().display(), "record store ready");

        let server_handle = server::spawn(self.config.clone(), storage).await?;

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutdown signal received");

        server_handle.shutdown().await?;
        Ok(())
    }
}
