//! Persisted state behind the ingestion and query services
//!
//! Both stores are non-transactional: a read followed by a write is two
//! independent calls, and concurrent callers can interleave between them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TrackingError};

/// Run a store call under a deadline; a timeout becomes `StorageTimeout`
pub async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TrackingError::StorageTimeout(limit)),
    }
}

/// Coarse location hints supplied by the edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoHints {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub timezone: Option<String>,
}

/// One accepted open; never mutated after insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRecord {
    pub id: Uuid,
    pub tracking_id: String,
    pub recipient: String,
    pub subject_hash: String,
    pub sent_at: DateTime<Utc>,
    pub opened_at: DateTime<Utc>,
    pub source_identifier: String,
    pub user_agent: String,
    #[serde(flatten)]
    pub geo: GeoHints,
    pub is_bot: bool,
    pub bot_type: Option<String>,
}

/// Admin listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub recipient: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[async_trait]
pub trait OpenRecordStore: Send + Sync {
    async fn insert(&self, record: OpenRecord) -> Result<()>;

    /// Whether a record for (tracking id, source) was opened at or after `since`
    async fn exists_since(
        &self,
        tracking_id: &str,
        source_identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// All records for a tracking id, oldest first
    async fn by_tracking_id(&self, tracking_id: &str) -> Result<Vec<OpenRecord>>;

    /// Filtered records, newest first, at most `filter.limit`
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OpenRecord>>;
}

/// Fast key-value counters with per-key expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count, zero when absent or expired
    async fn get(&self, key: &str) -> Result<u64>;

    /// Increment and return the new count; the expiry is set on first write only
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<Vec<OpenRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn any_since(
    records: &[OpenRecord],
    tracking_id: &str,
    source_identifier: &str,
    since: DateTime<Utc>,
) -> bool {
    records.iter().any(|r| {
        r.tracking_id == tracking_id && r.source_identifier == source_identifier && r.opened_at >= since
    })
}

fn select_tracking_id(records: &[OpenRecord], tracking_id: &str) -> Vec<OpenRecord> {
    let mut matching: Vec<OpenRecord> = records
        .iter()
        .filter(|r| r.tracking_id == tracking_id)
        .cloned()
        .collect();
    matching.sort_by_key(|r| r.opened_at);
    matching
}

fn select_filtered(records: &[OpenRecord], filter: &RecordFilter) -> Vec<OpenRecord> {
    let mut matching: Vec<OpenRecord> = records
        .iter()
        .filter(|r| {
            filter
                .recipient
                .as_deref()
                .map_or(true, |recipient| r.recipient == recipient)
        })
        .filter(|r| filter.since.map_or(true, |since| r.opened_at >= since))
        .cloned()
        .collect();
    matching.sort_by(|a, b| b.opened_at.cmp(&a.opened_at));
    matching.truncate(filter.limit);
    matching
}

#[async_trait]
impl OpenRecordStore for MemoryRecordStore {
    async fn insert(&self, record: OpenRecord) -> Result<()> {
        debug!(id = %record.id, tracking_id = %record.tracking_id, "open record stored");
        self.records.write().await.push(record);
        Ok(())
    }

    async fn exists_since(
        &self,
        tracking_id: &str,
        source_identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let records = self.records.read().await;
        Ok(any_since(&records, tracking_id, source_identifier, since))
    }

    async fn by_tracking_id(&self, tracking_id: &str) -> Result<Vec<OpenRecord>> {
        Ok(select_tracking_id(&self.records.read().await, tracking_id))
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OpenRecord>> {
        Ok(select_filtered(&self.records.read().await, filter))
    }
}

/// Append-only JSON-lines record log
///
/// Every record is kept in memory for queries and appended to the file on
/// insert, so a restarted server sees everything written before it.
/// A trailing line that fails to parse (a torn write) is skipped on open.
pub struct FileRecordStore {
    path: PathBuf,
    records: RwLock<Vec<OpenRecord>>,
}

impl FileRecordStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                if !contents.is_empty() && !contents.ends_with('\n') {
                    // Terminate a torn tail so the next append starts on its own line
                    Self::append_to(&path, b"\n").await.map_err(|e| {
                        TrackingError::Storage(format!("repairing {}: {}", path.display(), e))
                    })?;
                }
                parse_record_lines(&path, &contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(TrackingError::Storage(format!(
                    "reading {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        info!(path = %path.display(), records = records.len(), "open record log loaded");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn append_to(path: &Path, line: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(path).await?;
        file.write_all(line).await?;
        file.flush().await
    }
}

fn parse_record_lines(path: &Path, contents: &str) -> Vec<OpenRecord> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<OpenRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable open record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl OpenRecordStore for FileRecordStore {
    async fn insert(&self, record: OpenRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        // Held across the append so file order matches memory order
        let mut records = self.records.write().await;
        Self::append_to(&self.path, &line)
            .await
            .map_err(|e| TrackingError::Storage(format!("appending {}: {}", self.path.display(), e)))?;
        debug!(id = %record.id, tracking_id = %record.tracking_id, "open record appended");
        records.push(record);
        Ok(())
    }

    async fn exists_since(
        &self,
        tracking_id: &str,
        source_identifier: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let records = self.records.read().await;
        Ok(any_since(&records, tracking_id, source_identifier, since))
    }

    async fn by_tracking_id(&self, tracking_id: &str) -> Result<Vec<OpenRecord>> {
        Ok(select_tracking_id(&self.records.read().await, tracking_id))
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<OpenRecord>> {
        Ok(select_filtered(&self.records.read().await, filter))
    }
}

struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-memory counters
///
/// Every increment sweeps out expired entries, so keys that are never read
/// again (old rate-limit buckets) do not accumulate.
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, Counter>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Live and not-yet-swept entries
    pub async fn len(&self) -> usize {
        self.counters.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.lock().await.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut counters = self.counters.lock().await;
        let entry = counters.get(key).map(|c| (c.count, c.expires_at > now));
        match entry {
            Some((count, true)) => Ok(count),
            Some((_, false)) => {
                counters.remove(key);
                Ok(0)
            }
            None => Ok(0),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut counters = self.counters.lock().await;
        counters.retain(|_, c| c.expires_at > now);
        let counter = counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + ttl,
        });
        counter.count += 1;
        Ok(counter.count)
    }
}
