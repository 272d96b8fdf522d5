use serde::Deserialize;
use std::time::Duration;

use crate::extractor::{EncodingStrategy, HeaderDetector, RowExtractor};
use crate::queue::QueueSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub import_queue: String,
    pub queue_lease_secs: u64,
    pub queue_max_deliveries: i32,
    pub queue_retry_delay_secs: u64,
    pub worker_poll_interval_ms: u64,
    pub worker_restart_backoff_secs: u64,
    pub max_concurrent_imports: usize,
    /// Ordered encoding labels for text files; `None` keeps the built-in order.
    pub import_encodings: Option<Vec<String>>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        _ => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            import_queue: std::env::var("IMPORT_QUEUE")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "import_queue".to_string()),
            queue_lease_secs: env_or("QUEUE_LEASE_SECS", 300)?,
            queue_max_deliveries: env_or("QUEUE_MAX_DELIVERIES", 5)?,
            queue_retry_delay_secs: env_or("QUEUE_RETRY_DELAY_SECS", 30)?,
            worker_poll_interval_ms: env_or("WORKER_POLL_INTERVAL_MS", 1000)?,
            worker_restart_backoff_secs: env_or("WORKER_RESTART_BACKOFF_SECS", 5)?,
            max_concurrent_imports: env_or("MAX_CONCURRENT_IMPORTS", 2)?,
            import_encodings: std::env::var("IMPORT_ENCODINGS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|label| label.trim().to_string())
                        .filter(|label| !label.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|labels| !labels.is_empty()),
        };

        if config.queue_lease_secs == 0 {
            anyhow::bail!("QUEUE_LEASE_SECS must be greater than zero");
        }
        if config.queue_max_deliveries < 1 {
            anyhow::bail!("QUEUE_MAX_DELIVERIES must be at least 1");
        }
        if config.max_concurrent_imports == 0 {
            anyhow::bail!("MAX_CONCURRENT_IMPORTS must be at least 1");
        }
        // Fail at startup rather than on the first import.
        config.row_extractor()?;

        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!(
            "Queue '{}': lease {}s, max deliveries {}, retry delay {}s",
            config.import_queue,
            config.queue_lease_secs,
            config.queue_max_deliveries,
            config.queue_retry_delay_secs
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            queue_name: self.import_queue.clone(),
            lease: Duration::from_secs(self.queue_lease_secs),
            max_deliveries: self.queue_max_deliveries,
            retry_delay: Duration::from_secs(self.queue_retry_delay_secs),
        }
    }

    pub fn row_extractor(&self) -> anyhow::Result<RowExtractor> {
        let encodings = match &self.import_encodings {
            Some(labels) => EncodingStrategy::from_labels(labels)
                .map_err(|e| anyhow::anyhow!("IMPORT_ENCODINGS: {}", e))?,
            None => EncodingStrategy::default(),
        };
        Ok(RowExtractor::new(encodings, HeaderDetector::default()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.worker_restart_backoff_secs)
    }
}
