mod api;
mod classify;
mod clock;
mod codec;
mod config;
mod dedup;
mod error;
mod ingest;
mod keystore;
mod query;
mod ratelimit;
mod store;

pub mod prelude;

pub use api::{
    blob_from_segment, handle_admin_list, handle_pixel, handle_query, mint_pixel_url,
    parse_bearer, subject_hash, AdminListParams, ApiResponse, PixelRequest, PixelResponse,
    DEFAULT_ADMIN_LIMIT, PIXEL_PATH, PIXEL_SUFFIX, TRANSPARENT_GIF,
};
pub use classify::{BotClassifier, Classification, HeuristicClassifier, OpenSignals};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    decrypt, encrypt, encrypt_legacy, generate_key, plan_attempts, validate_key_version,
    DecodeAttempt, DecodeStrategy, KeySet, KeyVersion, TrackingKey, TrackingPayload, KEY_LENGTH,
    MAX_KEY_VERSION, NONCE_LENGTH, TAG_LENGTH,
};
pub use config::{resolve_config_path, ServiceSettings, TrackingConfig, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
pub use dedup::DedupGuard;
pub use error::{Result, TrackingError};
pub use ingest::{IngestOutcome, IngestionService, OpenRequest};
pub use keystore::{
    generate_admin_key, tracking_key_name, FileSecretStore, KeyRing, KeyStore, MemorySecretStore,
    RotationReport, SecretStore, ADMIN_KEY_SECRET, CURRENT_VERSION_SECRET, LEGACY_TRACKING_KEY_SECRET,
};
pub use query::{OpenView, QueryService, TrackingSummary};
pub use ratelimit::{is_unknown_identifier, RateLimiter, UNKNOWN_IDENTIFIER};
pub use store::{
    bounded, CounterStore, FileRecordStore, GeoHints, MemoryCounterStore, MemoryRecordStore,
    OpenRecord, OpenRecordStore, RecordFilter,
};
