//! Retention cleaner for terminal tasks.
//!
//! COMPLETED rows go after a short window, exhausted FAILED rows after a
//! longer one. PENDING and IN_PROGRESS rows are never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::model::cutoff_before;
use crate::error::Result;
use crate::store::{PurgeCounts, QueueStore};

const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    pub interval: Duration,
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            completed_ttl: DAY * 7,
            failed_ttl: DAY * 30,
        }
    }
}

pub struct RetentionCleaner {
    store: Arc<dyn QueueStore>,
    config: RetentionConfig,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn QueueStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub async fn clean(&self) -> Result<PurgeCounts> {
        self.clean_at(Utc::now()).await
    }

    pub async fn clean_at(&self, now: DateTime<Utc>) -> Result<PurgeCounts> {
        let completed_before = cutoff_before(now, self.config.completed_ttl);
        let failed_before = cutoff_before(now, self.config.failed_ttl);

        let counts = self
            .store
            .purge_terminal(completed_before, failed_before)
            .await?;
        if counts.total() > 0 {
            info!(
                completed = counts.completed,
                failed = counts.failed,
                "Purged terminal tasks"
            );
        } else {
            debug!("Retention pass found nothing to purge");
        }
        Ok(counts)
    }
}

/// Spawn the periodic retention pass.
pub fn spawn_retention_task(cleaner: Arc<RetentionCleaner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = cleaner.config.interval.as_secs(),
            "Retention cleaner started"
        );
        let mut interval = tokio::time::interval(cleaner.config.interval);
        loop {
            interval.tick().await;
            if let Err(e) = cleaner.clean().await {
                warn!(error = %e, "Retention pass failed");
            }
        }
    })
}
