//! Error taxonomy shared by the codec, key store and services

use std::time::Duration;
use thiserror::Error;

/// Errors raised by tracking operations
#[derive(Debug, Error)]
pub enum TrackingError {
    /// Bad key version, empty admin/tracking key, malformed save parameters
    #[error("validation error: {0}")]
    Validation(String),

    /// Cipher init failure, authentication failure, malformed or short blob
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Every versioned and legacy decode attempt failed
    #[error("decrypt failed (versioned: {versioned}; legacy: {legacy})")]
    DecryptFailed { versioned: String, legacy: String },

    /// No retained key decrypts the blob
    #[error("not found: {0}")]
    NotFound(String),

    #[error("admin token mismatch")]
    Auth,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("storage call timed out after {0:?}")]
    StorageTimeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackingError {
    /// HTTP-style status for the query and admin surfaces
    pub fn status_code(&self) -> u16 {
        match self {
            TrackingError::Validation(_)
            | TrackingError::Crypto(_)
            | TrackingError::DecryptFailed { .. }
            | TrackingError::Base64(_)
            | TrackingError::Json(_) => 400,
            TrackingError::NotFound(_) => 404,
            TrackingError::Auth => 401,
            TrackingError::Storage(_) | TrackingError::StorageTimeout(_) | TrackingError::Io(_) => {
                503
            }
        }
    }

    /// True for failures of the persisted stores
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TrackingError::Storage(_) | TrackingError::StorageTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrackingError>;
