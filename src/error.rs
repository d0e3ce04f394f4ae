//! Error types for the repository cache.
//!
//! Network and decode failures leave the cache intact; storage failures may not.

use thiserror::Error;

/// Failures surfaced by `load_page`, `refresh` and the storage layer.
///
/// Variants carry rendered messages rather than source errors so a single
/// failed fetch can be handed to every caller attached to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Authentication failed: invalid or expired token")]
  Unauthorized,

  #[error("Rate limit exceeded, resets at {reset_at}")]
  RateLimited { reset_at: String },

  /// The remote refused the request itself (unknown owner, bad parameters)
  #[error("Request rejected (HTTP {status}): {message}")]
  Rejected { status: u16, message: String },

  #[error("Malformed response: {0}")]
  Decode(String),

  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("Fetch was cancelled before it committed")]
  Cancelled,
}

impl Error {
  /// Transient failures worth retrying later. The cache is untouched.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      Error::Network(_) | Error::RateLimited { .. } | Error::Cancelled
    )
  }

  /// Local persistence faults. Cached data may have been lost.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Error::Storage(_))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::Decode(e.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      Error::Decode(e.to_string())
    } else {
      Error::Network(e.to_string())
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
