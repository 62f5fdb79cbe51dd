//! Last-request bookkeeping used to decide when cached data is stale.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use std::fmt;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{Database, Tx};
use crate::error::StoreError;

/// The kind of remote request whose freshness is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
  ShowDetails,
  FollowedShows,
  EpisodeWatches,
}

impl RequestKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ShowDetails => "show_details",
      Self::FollowedShows => "followed_shows",
      Self::EpisodeWatches => "episode_watches",
    }
  }
}

impl fmt::Display for RequestKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Records the time of the last successful request per (kind, entity).
pub struct StalenessTracker {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
}

impl StalenessTracker {
  pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>) -> Self {
    Self { db, clock }
  }

  /// Record "now" for the pair. Last write wins.
  pub fn update_last_request(&self, kind: RequestKind, entity_id: &str) -> Result<(), StoreError> {
    self
      .db
      .transaction(|tx| self.record_in(tx, kind, entity_id))
  }

  /// Record "now" for the pair as part of a larger transaction.
  pub fn record_in(
    &self,
    tx: &Tx<'_>,
    kind: RequestKind,
    entity_id: &str,
  ) -> Result<(), StoreError> {
    let now = self.clock.now();
    tx.conn().execute(
      "INSERT OR REPLACE INTO last_requests (request, entity_id, requested_at)
       VALUES (?1, ?2, ?3)",
      params![
        kind.as_str(),
        entity_id,
        now.to_rfc3339_opts(SecondsFormat::Millis, true)
      ],
    )?;
    Ok(())
  }

  pub fn last_request(
    &self,
    kind: RequestKind,
    entity_id: &str,
  ) -> Result<Option<DateTime<Utc>>, StoreError> {
    let stored: Option<String> = self.db.read(|tx| {
      tx.conn()
        .query_row(
          "SELECT requested_at FROM last_requests WHERE request = ?1 AND entity_id = ?2",
          params![kind.as_str(), entity_id],
          |row| row.get(0),
        )
        .optional()
        .map_err(StoreError::from)
    })?;

    stored.as_deref().map(parse_datetime).transpose()
  }

  /// `true` if the pair was never requested or was last requested at least
  /// `threshold` ago.
  pub fn is_expired(
    &self,
    kind: RequestKind,
    entity_id: &str,
    threshold: Duration,
  ) -> Result<bool, StoreError> {
    Ok(match self.last_request(kind, entity_id)? {
      Some(last) => self.clock.now() - last >= threshold,
      None => true,
    })
  }

  /// `true` if the pair was never requested or was last requested before
  /// `instant`.
  pub fn is_request_before(
    &self,
    kind: RequestKind,
    entity_id: &str,
    instant: DateTime<Utc>,
  ) -> Result<bool, StoreError> {
    Ok(match self.last_request(kind, entity_id)? {
      Some(last) => last < instant,
      None => true,
    })
  }

  pub fn has_been_requested(&self, kind: RequestKind, entity_id: &str) -> Result<bool, StoreError> {
    Ok(self.last_request(kind, entity_id)?.is_some())
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}
