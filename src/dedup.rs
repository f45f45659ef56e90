//! Duplicate-open suppression within a trailing window
//!
//! The check reads the same record store the ingestion path writes to. Check
//! and insert are separate calls, so two identical requests racing through
//! the gap can both be recorded.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::clock::Clock;
use crate::config::ServiceSettings;
use crate::error::Result;
use crate::ratelimit::is_unknown_identifier;
use crate::store::{bounded, OpenRecordStore};

pub struct DedupGuard {
    records: Arc<dyn OpenRecordStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
    timeout: Duration,
}

impl DedupGuard {
    pub fn new(
        records: Arc<dyn OpenRecordStore>,
        clock: Arc<dyn Clock>,
        window: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            records,
            clock,
            window,
            timeout,
        }
    }

    pub fn from_settings(
        records: Arc<dyn OpenRecordStore>,
        clock: Arc<dyn Clock>,
        settings: &ServiceSettings,
    ) -> Self {
        Self::new(
            records,
            clock,
            settings.dedup_window(),
            settings.store_timeout(),
        )
    }

    /// Strict check: store failures and timeouts are returned to the caller
    pub async fn check(&self, tracking_id: &str, identifier: &str) -> Result<bool> {
        if is_unknown_identifier(identifier) {
            return Ok(false);
        }
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
        let since = self.clock.now() - window;
        bounded(
            self.timeout,
            self.records.exists_since(tracking_id, identifier.trim(), since),
        )
        .await
    }

    /// Fail-open check: any store failure counts as not a duplicate
    pub async fn is_duplicate(&self, tracking_id: &str, identifier: &str) -> bool {
        match self.check(tracking_id, identifier).await {
            Ok(duplicate) => duplicate,
            Err(e) => {
                warn!(identifier, error = %e, "dedup check failed, allowing");
                false
            }
        }
    }
}
