//! Error types for the store, cache and sync layers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::entity::LocalId;

/// Errors raised by a remote service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// The request never produced a response (DNS, connect, timeout).
  #[error("network error: {0}")]
  Network(String),

  /// The service answered with a non-success status.
  #[error("remote returned status {status}: {message}")]
  Status { status: u16, message: String },

  /// The service requires an authenticated user.
  #[error("authentication required")]
  AuthRequired,

  /// The requested resource does not exist remotely.
  #[error("not found: {0}")]
  NotFound(String),

  /// The response body could not be decoded.
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// Whether trying again later may succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(_) => true,
      Self::Status { status, .. } => *status >= 500 || *status == 429,
      _ => false,
    }
  }
}

/// Errors raised by the persisted store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A row with the same stable key already exists.
  #[error("{entity_type} with key {key} already exists")]
  Conflict { entity_type: &'static str, key: String },

  /// A row the operation depends on does not exist.
  #[error("{entity_type} {local_id} does not exist")]
  Missing {
    entity_type: &'static str,
    local_id: LocalId,
  },

  #[error("invalid stored value: {0}")]
  Corrupt(String),

  #[error("lock poisoned")]
  LockPoisoned,
}

/// Errors returned by [`crate::cache::CacheAsideStore`].
///
/// Cloneable so that every caller sharing a single in-flight fetch receives
/// the same outcome.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// Every source failed; carries the error of the highest priority source.
  #[error("fetch failed: {0}")]
  Remote(#[from] RemoteError),

  #[error(transparent)]
  Store(Arc<StoreError>),

  #[error("cache store has no remote sources")]
  NoSources,
}

impl From<StoreError> for CacheError {
  fn from(err: StoreError) -> Self {
    Self::Store(Arc::new(err))
  }
}

/// The phase of an outbox sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  ResolveHandle,
  PushUploads,
  PushDeletes,
  Pull,
}

impl fmt::Display for SyncPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::ResolveHandle => "resolve-handle",
      Self::PushUploads => "push-uploads",
      Self::PushDeletes => "push-deletes",
      Self::Pull => "pull",
    };
    f.write_str(name)
  }
}

/// Errors returned by an outbox sync cycle.
///
/// A failed cycle leaves pending entries untouched; they are retried by the
/// next call.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("{phase} failed: {source}")]
  Remote {
    phase: SyncPhase,
    #[source]
    source: RemoteError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl SyncError {
  pub fn phase(&self) -> Option<SyncPhase> {
    match self {
      Self::Remote { phase, .. } => Some(*phase),
      Self::Store(_) => None,
    }
  }
}
