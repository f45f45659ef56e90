//! Shared fixtures for the integration tests

#![allow(dead_code)]

use pixeltrack::{
    subject_hash, HeuristicClassifier, IngestionService, KeyRing, KeySet, KeyVersion, ManualClock,
    MemoryCounterStore, MemoryRecordStore, OpenRequest, QueryService, ServiceSettings,
    TrackingKey, TrackingPayload,
};
use std::sync::Arc;

/// Top of an hour, so rate windows start fresh
pub const SENT_AT: i64 = 1_700_002_800;

pub const DESKTOP_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/128.0";

pub fn payload() -> TrackingPayload {
    TrackingPayload::new("reader@example.com", subject_hash("Launch plan"), SENT_AT)
}

pub fn single_key_ring(admin_key: &str) -> KeyRing {
    let mut keys = KeySet::new();
    keys.insert(KeyVersion::INITIAL, TrackingKey::generate());
    KeyRing::new(KeyVersion::INITIAL, keys, admin_key).expect("ring with current key")
}

/// Services wired to in-memory stores and a manual clock one hour after send
pub struct Deployment {
    pub clock: Arc<ManualClock>,
    pub records: Arc<MemoryRecordStore>,
    pub ingest: IngestionService,
    pub query: QueryService,
}

pub fn deploy(ring: &KeyRing, settings: ServiceSettings) -> Deployment {
    let clock = Arc::new(ManualClock::at_epoch(SENT_AT + 3_600));
    let records = Arc::new(MemoryRecordStore::new());
    let ingest = IngestionService::new(
        ring,
        Arc::new(MemoryCounterStore::new(clock.clone())),
        records.clone(),
        Arc::new(HeuristicClassifier::default()),
        clock.clone(),
        &settings,
    );
    let query = QueryService::new(ring, records.clone(), &settings);
    Deployment {
        clock,
        records,
        ingest,
        query,
    }
}

pub fn open(blob: &str, source: &str) -> OpenRequest {
    OpenRequest {
        blob: blob.to_string(),
        source_identifier: source.to_string(),
        user_agent: DESKTOP_AGENT.to_string(),
        ..Default::default()
    }
}
