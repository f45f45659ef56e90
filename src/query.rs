//! Read side: per-pixel summaries and the admin listing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::codec::{self, KeySet};
use crate::config::ServiceSettings;
use crate::error::{Result, TrackingError};
use crate::keystore::KeyRing;
use crate::store::{bounded, OpenRecord, OpenRecordStore, RecordFilter};

/// One open as shown to the sender; omits the source identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenView {
    pub opened_at: DateTime<Utc>,
    pub user_agent: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub is_bot: bool,
    pub bot_type: Option<String>,
}

impl From<&OpenRecord> for OpenView {
    fn from(record: &OpenRecord) -> Self {
        Self {
            opened_at: record.opened_at,
            user_agent: record.user_agent.clone(),
            country: record.geo.country.clone(),
            city: record.geo.city.clone(),
            is_bot: record.is_bot,
            bot_type: record.bot_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub tracking_id: String,
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
    /// Oldest first
    pub opens: Vec<OpenView>,
    pub total_opens: usize,
    pub human_opens: usize,
    pub first_human_open: Option<DateTime<Utc>>,
}

pub struct QueryService {
    records: Arc<dyn OpenRecordStore>,
    keys: KeySet,
    admin_key: String,
    timeout: Duration,
    max_limit: usize,
}

impl QueryService {
    pub fn new(ring: &KeyRing, records: Arc<dyn OpenRecordStore>, settings: &ServiceSettings) -> Self {
        Self {
            records,
            keys: ring.codec_keys().clone(),
            admin_key: ring.admin_key().to_string(),
            timeout: settings.store_timeout(),
            max_limit: settings.admin_list_max.max(1),
        }
    }

    /// Summary for one pixel; a blob the key ring cannot open is `NotFound`
    pub async fn by_tracking_id(&self, blob: &str) -> Result<TrackingSummary> {
        let tracking_id = blob.trim();
        let payload = codec::decrypt(tracking_id, &self.keys, None).map_err(|e| {
            debug!(error = %e, "summary requested for undecryptable blob");
            TrackingError::NotFound("tracking id".into())
        })?;

        let records = bounded(self.timeout, self.records.by_tracking_id(tracking_id)).await?;
        let humans: Vec<&OpenRecord> = records.iter().filter(|r| !r.is_bot).collect();

        Ok(TrackingSummary {
            tracking_id: tracking_id.to_string(),
            recipient: payload.recipient,
            sent_at: DateTime::<Utc>::from_timestamp(payload.sent_at, 0).unwrap_or_default(),
            total_opens: records.len(),
            human_opens: humans.len(),
            first_human_open: humans.iter().map(|r| r.opened_at).min(),
            opens: records.iter().map(OpenView::from).collect(),
        })
    }

    fn authorize(&self, caller_token: &str) -> Result<()> {
        if self.admin_key.is_empty() {
            return Err(TrackingError::Auth);
        }
        let matches: bool = self
            .admin_key
            .as_bytes()
            .ct_eq(caller_token.trim().as_bytes())
            .into();
        if matches {
            Ok(())
        } else {
            Err(TrackingError::Auth)
        }
    }

    /// Newest-first listing; `limit` is clamped to `[1, admin_list_max]`
    pub async fn admin_list(
        &self,
        caller_token: &str,
        recipient: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<OpenRecord>> {
        self.authorize(caller_token)?;
        let filter = RecordFilter {
            recipient: recipient.map(str::to_string),
            since,
            limit: limit.clamp(1, self.max_limit),
        };
        bounded(self.timeout, self.records.list(&filter)).await
    }
}
