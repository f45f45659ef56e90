//! Prelude
//!
//! Commonly used types for wiring up the tracking services.
//!
//! ```rust
//! use pixeltrack::prelude::*;
//!
//! # fn example() -> Result<()> {
//! let mut keys = KeySet::new();
//! keys.insert(KeyVersion::INITIAL, TrackingKey::generate());
//! let ring = KeyRing::new(KeyVersion::INITIAL, keys, "admin")?;
//! let payload = TrackingPayload::new("reader@example.com", subject_hash("Hello"), 1_700_000_000);
//! let url = mint_pixel_url("https://t.example.com", &payload, &ring)?;
//! assert!(url.ends_with(".gif"));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub use crate::api::{mint_pixel_url, subject_hash, ApiResponse, PixelResponse};
pub use crate::classify::{BotClassifier, HeuristicClassifier};
pub use crate::clock::{Clock, SystemClock};
pub use crate::codec::{KeySet, KeyVersion, TrackingKey, TrackingPayload};
pub use crate::config::{ServiceSettings, TrackingConfig};
pub use crate::error::{Result, TrackingError};
pub use crate::ingest::{IngestionService, OpenRequest};
pub use crate::keystore::{KeyRing, KeyStore, SecretStore};
pub use crate::query::QueryService;
pub use crate::store::{CounterStore, OpenRecordStore};
