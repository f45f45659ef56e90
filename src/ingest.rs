//! Pixel ingestion
//!
//! `record_open` returns the same neutral pixel on every path. Rate limiting,
//! undecryptable blobs, duplicates and store failures only show up in logs
//! and the `pixeltrack_opens_total` counter.

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::PixelResponse;
use crate::classify::{BotClassifier, OpenSignals};
use crate::clock::Clock;
use crate::codec::{self, KeySet, KeyVersion};
use crate::config::ServiceSettings;
use crate::dedup::DedupGuard;
use crate::keystore::KeyRing;
use crate::ratelimit::RateLimiter;
use crate::store::{bounded, CounterStore, GeoHints, OpenRecord, OpenRecordStore};

/// Client metadata accompanying a pixel fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenRequest {
    pub blob: String,
    pub source_identifier: String,
    pub user_agent: String,
    pub geo: GeoHints,
}

/// What happened to a pixel fetch internally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded,
    RateLimited,
    Undecryptable,
    Duplicate,
    StoreError,
}

impl IngestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestOutcome::Recorded => "recorded",
            IngestOutcome::RateLimited => "rate_limited",
            IngestOutcome::Undecryptable => "undecryptable",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::StoreError => "store_error",
        }
    }
}

pub struct IngestionService {
    rate_limiter: RateLimiter,
    dedup: DedupGuard,
    records: Arc<dyn OpenRecordStore>,
    classifier: Arc<dyn BotClassifier>,
    clock: Arc<dyn Clock>,
    keys: KeySet,
    hint: Option<KeyVersion>,
    timeout: Duration,
}

impl IngestionService {
    pub fn new(
        ring: &KeyRing,
        counters: Arc<dyn CounterStore>,
        records: Arc<dyn OpenRecordStore>,
        classifier: Arc<dyn BotClassifier>,
        clock: Arc<dyn Clock>,
        settings: &ServiceSettings,
    ) -> Self {
        Self {
            rate_limiter: RateLimiter::from_settings(counters, clock.clone(), settings),
            dedup: DedupGuard::from_settings(records.clone(), clock.clone(), settings),
            records,
            classifier,
            clock,
            keys: ring.codec_keys().clone(),
            hint: Some(ring.current_version()),
            timeout: settings.store_timeout(),
        }
    }

    /// Handle one pixel fetch; always answers with the neutral pixel
    pub async fn record_open(&self, request: &OpenRequest) -> PixelResponse {
        let outcome = self.ingest(request).await;
        increment_counter!("pixeltrack_opens_total", "outcome" => outcome.as_str());
        PixelResponse::neutral()
    }

    /// Run the gates and persist; the outcome is for logs and tests only
    pub async fn ingest(&self, request: &OpenRequest) -> IngestOutcome {
        let source = request.source_identifier.trim();

        if self.rate_limiter.is_limited(source).await {
            return IngestOutcome::RateLimited;
        }

        let tracking_id = request.blob.trim();
        let payload = match codec::decrypt(tracking_id, &self.keys, self.hint) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "ignoring undecryptable pixel");
                return IngestOutcome::Undecryptable;
            }
        };

        if self.dedup.is_duplicate(tracking_id, source).await {
            debug!(source, "duplicate open suppressed");
            return IngestOutcome::Duplicate;
        }

        let opened_at = self.clock.now();
        let sent_at = DateTime::<Utc>::from_timestamp(payload.sent_at, 0).unwrap_or_default();
        let classification = self.classifier.classify(&OpenSignals {
            user_agent: &request.user_agent,
            source_identifier: source,
            since_sent: (opened_at - sent_at).to_std().ok(),
        });

        let record = OpenRecord {
            id: Uuid::new_v4(),
            tracking_id: tracking_id.to_string(),
            recipient: payload.recipient,
            subject_hash: payload.subject_hash,
            sent_at,
            opened_at,
            source_identifier: source.to_string(),
            user_agent: request.user_agent.clone(),
            geo: request.geo.clone(),
            is_bot: classification.is_bot,
            bot_type: classification.bot_type,
        };
        let is_bot = record.is_bot;

        match bounded(self.timeout, self.records.insert(record)).await {
            Ok(()) => {
                info!(is_bot, "open recorded");
                IngestOutcome::Recorded
            }
            Err(e) => {
                warn!(error = %e, "failed to persist open");
                IngestOutcome::StoreError
            }
        }
    }
}
