//! HTTP-facing contract, independent of any transport
//!
//! Routes:
//! - `GET /pixel/{blob}.gif` always answers with [`PixelResponse::neutral`]
//! - `GET /track/{blob}` answers with a [`TrackingSummary`](crate::query::TrackingSummary)
//! - `GET /admin/opens` requires `Authorization: Bearer <admin key>` and
//!   answers with a JSON array of open records, newest first
//!
//! Error bodies are `{"error": "<generic message>"}` and never say why a
//! lookup or credential check failed.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::codec::{self, TrackingPayload};
use crate::error::{Result, TrackingError};
use crate::ingest::{IngestionService, OpenRequest};
use crate::keystore::KeyRing;
use crate::query::QueryService;
use crate::store::GeoHints;

pub const PIXEL_PATH: &str = "/pixel/";
pub const PIXEL_SUFFIX: &str = ".gif";

/// 1x1 transparent GIF89a
pub const TRANSPARENT_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-store, no-cache, must-revalidate, private"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// The only response the pixel endpoint ever produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: &'static [(&'static str, &'static str)],
    pub body: &'static [u8],
}

impl PixelResponse {
    pub const fn neutral() -> Self {
        Self {
            status: 200,
            content_type: "image/gif",
            headers: &NO_CACHE_HEADERS,
            body: &TRANSPARENT_GIF,
        }
    }
}

impl Default for PixelResponse {
    fn default() -> Self {
        Self::neutral()
    }
}

/// JSON response for the query and admin routes
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn from_error(err: &TrackingError) -> Self {
        let status = err.status_code();
        let message = match status {
            400 => "bad request",
            401 => "unauthorized",
            404 => "not found",
            503 => "service unavailable",
            _ => "internal error",
        };
        Self {
            status,
            body: json!({ "error": message }),
        }
    }
}

impl From<Result<Value>> for ApiResponse {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(e) => {
                if e.is_storage() {
                    warn!(error = %e, "request failed");
                } else {
                    debug!(error = %e, "request rejected");
                }
                Self::from_error(&e)
            }
        }
    }
}

/// Hash of the trimmed subject line: first 16 hex chars of SHA-256
pub fn subject_hash(subject: &str) -> String {
    let digest = Sha256::digest(subject.trim().as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}

/// Encrypt a payload under the ring's current key and build the pixel URL
pub fn mint_pixel_url(worker_url: &str, payload: &TrackingPayload, ring: &KeyRing) -> Result<String> {
    let worker_url = worker_url.trim().trim_end_matches('/');
    if worker_url.is_empty() {
        return Err(TrackingError::Validation("worker url is empty".into()));
    }
    let blob = codec::encrypt(payload, ring.current_key().as_slice(), ring.current_version())?;
    Ok(format!("{}{}{}{}", worker_url, PIXEL_PATH, blob, PIXEL_SUFFIX))
}

/// Blob from a pixel path segment, with or without the `.gif` suffix
pub fn blob_from_segment(segment: &str) -> &str {
    let segment = segment.trim().trim_start_matches('/');
    let segment = segment.strip_prefix("pixel/").unwrap_or(segment);
    segment.strip_suffix(PIXEL_SUFFIX).unwrap_or(segment)
}

/// Token from an `Authorization: Bearer <token>` header value
pub fn parse_bearer(header: Option<&str>) -> Option<&str> {
    let header = header?.trim();
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Pixel fetch as seen by the edge
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PixelRequest {
    pub path: String,
    pub source_identifier: String,
    pub user_agent: String,
    #[serde(flatten)]
    pub geo: GeoHints,
}

pub async fn handle_pixel(service: &IngestionService, request: &PixelRequest) -> PixelResponse {
    let open = OpenRequest {
        blob: blob_from_segment(&request.path).to_string(),
        source_identifier: request.source_identifier.clone(),
        user_agent: request.user_agent.clone(),
        geo: request.geo.clone(),
    };
    service.record_open(&open).await
}

pub async fn handle_query(service: &QueryService, blob: &str) -> ApiResponse {
    let result = async {
        let summary = service.by_tracking_id(blob_from_segment(blob)).await?;
        Ok::<Value, TrackingError>(serde_json::to_value(summary)?)
    }
    .await;
    ApiResponse::from(result)
}

/// Admin listing query string
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdminListParams {
    pub recipient: Option<String>,
    /// RFC 3339 timestamp or unix seconds
    pub since: Option<String>,
    pub limit: Option<usize>,
}

pub const DEFAULT_ADMIN_LIMIT: usize = 100;

fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| TrackingError::Validation(format!("since out of range: {}", raw)));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrackingError::Validation(format!("invalid since: {}", e)))
}

pub async fn handle_admin_list(
    service: &QueryService,
    authorization: Option<&str>,
    params: &AdminListParams,
) -> ApiResponse {
    let result = async {
        let token = parse_bearer(authorization).ok_or(TrackingError::Auth)?;
        let since = params.since.as_deref().map(parse_since).transpose()?;
        let recipient = params
            .recipient
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let limit = params.limit.unwrap_or(DEFAULT_ADMIN_LIMIT);
        let opens = service.admin_list(token, recipient, since, limit).await?;
        Ok::<Value, TrackingError>(serde_json::to_value(opens)?)
    }
    .await;
    ApiResponse::from(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeySet, KeyVersion, TrackingKey};

    #[test]
    fn test_pixel_is_valid_gif() {
        let pixel = PixelResponse::neutral();
        assert_eq!(pixel.status, 200);
        assert_eq!(pixel.content_type, "image/gif");
        assert_eq!(pixel.body.len(), 43);
        assert!(pixel.body.starts_with(b"GIF89a"));
        assert_eq!(pixel.body.last(), Some(&0x3b));
        assert!(pixel
            .headers
            .iter()
            .any(|(name, value)| *name == "Cache-Control" && value.contains("no-store")));
    }

    #[test]
    fn test_subject_hash() {
        let hash = subject_hash("  Quarterly report ");
        assert_eq!(hash.len(), 16);
        assert_eq!(hash, subject_hash("Quarterly report"));
        assert_ne!(hash, subject_hash("quarterly report"));
        // sha256("") prefix
        assert_eq!(subject_hash(""), "e3b0c44298fc1c14");
    }

    #[test]
    fn test_mint_pixel_url() -> Result<()> {
        let mut keys = KeySet::new();
        keys.insert(KeyVersion::INITIAL, TrackingKey::generate());
        let ring = KeyRing::new(KeyVersion::INITIAL, keys, "")?;
        let payload = TrackingPayload::new("a@example.com", subject_hash("hi"), 1_700_000_000);

        let url = mint_pixel_url("https://t.example.com/", &payload, &ring)?;
        let blob = url
            .strip_prefix("https://t.example.com/pixel/")
            .and_then(|rest| rest.strip_suffix(".gif"))
            .expect("pixel url shape");
        assert_eq!(codec::decrypt(blob, ring.codec_keys(), None)?, payload);
        assert_eq!(blob_from_segment(&url[url.find("/pixel/").unwrap()..]), blob);

        assert!(mint_pixel_url("  ", &payload, &ring).is_err());
        Ok(())
    }

    #[test]
    fn test_blob_from_segment() {
        assert_eq!(blob_from_segment("abc.gif"), "abc");
        assert_eq!(blob_from_segment("/pixel/abc.gif"), "abc");
        assert_eq!(blob_from_segment("abc"), "abc");
    }

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer(Some("Bearer s3cret")), Some("s3cret"));
        assert_eq!(parse_bearer(Some("bearer  s3cret ")), Some("s3cret"));
        assert_eq!(parse_bearer(Some("Basic s3cret")), None);
        assert_eq!(parse_bearer(Some("Bearer ")), None);
        assert_eq!(parse_bearer(None), None);
    }

    #[test]
    fn test_error_bodies_are_generic() {
        let resp = ApiResponse::from_error(&TrackingError::Storage("pg: relation opens missing".into()));
        assert_eq!(resp.status, 503);
        assert_eq!(resp.body, json!({ "error": "service unavailable" }));

        let resp = ApiResponse::from_error(&TrackingError::Auth);
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body, json!({ "error": "unauthorized" }));
    }

    #[test]
    fn test_parse_since() -> Result<()> {
        assert_eq!(parse_since("1700000000")?.timestamp(), 1_700_000_000);
        assert_eq!(
            parse_since("2023-11-14T22:13:20Z")?.timestamp(),
            1_700_000_000
        );
        assert!(parse_since("yesterday").is_err());
        Ok(())
    }
}
