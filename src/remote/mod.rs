//! Remote collaborators consumed by the cache and the outbox.

pub mod api_types;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::{Entity, Show};
use crate::error::RemoteError;

/// A remote source able to fetch a single entity by stable key.
#[async_trait]
pub trait RemoteEntityService<E: Entity>: Send + Sync {
  /// Short name used in logs.
  fn name(&self) -> &str;

  async fn fetch(&self, key: &E::Key) -> Result<E, RemoteError>;
}

/// Identifier of a remote list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListHandle(pub u64);

impl fmt::Display for ListHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A show as listed in a remote list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListMember {
  pub show: Show,
  pub listed_at: Option<DateTime<Utc>>,
}

/// A remote list of shows, addressed by the shows' stable keys.
#[async_trait]
pub trait RemoteListService: Send + Sync {
  async fn list_handle(&self) -> Result<ListHandle, RemoteError>;

  async fn add_members(&self, handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError>;

  async fn remove_members(&self, handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError>;

  async fn fetch_members(&self, handle: ListHandle) -> Result<Vec<ListMember>, RemoteError>;
}

/// An episode as referenced by the remote watch history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEpisode {
  pub trakt_id: u64,
  pub season: Option<u32>,
  pub number: Option<u32>,
  pub title: Option<String>,
}

/// One entry of the remote watch history.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWatch {
  pub history_id: u64,
  pub episode: RemoteEpisode,
  pub watched_at: DateTime<Utc>,
}

/// A watch to add to the remote history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewWatch {
  /// Episode stable key.
  pub episode: u64,
  pub watched_at: DateTime<Utc>,
}

/// The user's remote watch history.
#[async_trait]
pub trait RemoteWatchService: Send + Sync {
  /// Every watch of the show with stable key `show`.
  async fn fetch_show_watches(&self, show: u64) -> Result<Vec<RemoteWatch>, RemoteError>;

  async fn add_watches(&self, watches: &[NewWatch]) -> Result<(), RemoteError>;

  /// Remove history entries by their remote id.
  async fn remove_watches(&self, history_ids: &[u64]) -> Result<(), RemoteError>;
}
