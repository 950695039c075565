//! Persistence for the queue-wide configuration record.

use queue_core::QueueConfig;
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::time::to_micros;
use crate::{Database, DbError};

/// Key of the single settings record.
const SETTINGS_ID: &str = "queue";

/// Repository for the `settings:queue` record.
#[derive(Clone)]
pub struct ConfigRepository {
    db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
struct SettingsRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    config: QueueConfig,
    updated_at: i64,
}

impl ConfigRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load the stored configuration, or the defaults if none was saved.
    pub async fn load(&self) -> Result<QueueConfig, DbError> {
        let record: Option<SettingsRecord> = self.db.select(("settings", SETTINGS_ID)).await?;

        let config = record.map(|r| r.config).unwrap_or_default();
        config
            .validate()
            .map_err(|e| DbError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Validate and store the configuration.
    pub async fn save(&self, config: &QueueConfig) -> Result<QueueConfig, DbError> {
        config.validate()?;

        let record = SettingsRecord {
            id: None,
            config: config.clone(),
            updated_at: to_micros(chrono::Utc::now()),
        };
        let saved: Option<SettingsRecord> = self
            .db
            .upsert(("settings", SETTINGS_ID))
            .content(record)
            .await?;

        tracing::info!("Queue configuration saved");

        saved
            .map(|r| r.config)
            .ok_or_else(|| DbError::Query("Failed to save configuration".into()))
    }

    /// Read one setting by its command-line key.
    pub async fn get(&self, key: &str) -> Result<String, DbError> {
        Ok(self.load().await?.get(key)?)
    }

    /// Change one setting by its command-line key and persist the result.
    pub async fn set(&self, key: &str, value: &str) -> Result<QueueConfig, DbError> {
        let mut config = self.load().await?;
        config.set(key, value)?;
        self.save(&config).await
    }
}
