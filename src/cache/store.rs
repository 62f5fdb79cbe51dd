//! Cache-aside store that orchestrates local reads with remote fetching.

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use super::staleness::{RequestKind, StalenessTracker};
use crate::db::Database;
use crate::entity::{Entity, LocalId, Merge};
use crate::error::{CacheError, RemoteError, StoreError};
use crate::remote::RemoteEntityService;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;
type InFlight<V> = Mutex<HashMap<String, SharedFetch<V>>>;

/// Read-through store for one entity type.
///
/// Serves values from the local database and refreshes them from a
/// prioritized list of remote sources when missing or stale. Concurrent
/// fetches of the same key share a single remote round-trip.
pub struct CacheAsideStore<V: Entity> {
  db: Arc<Database>,
  staleness: Arc<StalenessTracker>,
  sources: Arc<[Arc<dyn RemoteEntityService<V>>]>,
  request: RequestKind,
  /// How long before cached data is considered stale
  stale_time: Duration,
  in_flight: Arc<InFlight<V>>,
}

impl<V: Entity + Merge> CacheAsideStore<V> {
  /// Create a store. Sources are tried in the given order.
  pub fn new(
    db: Arc<Database>,
    staleness: Arc<StalenessTracker>,
    request: RequestKind,
    sources: Vec<Arc<dyn RemoteEntityService<V>>>,
  ) -> Result<Self, CacheError> {
    if sources.is_empty() {
      return Err(CacheError::NoSources);
    }

    Ok(Self {
      db,
      staleness,
      sources: sources.into(),
      request,
      stale_time: Duration::hours(1),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn stale_time(&self) -> Duration {
    self.stale_time
  }

  /// The locally stored value, without touching the network.
  pub fn cached(&self, key: &V::Key) -> Result<Option<V>, CacheError> {
    Ok(self.db.read(|tx| tx.get_by_key::<V>(key))?)
  }

  /// Whether the next `get` would go to the network.
  pub fn needs_refresh(&self, key: &V::Key) -> Result<bool, CacheError> {
    if self.cached(key)?.is_none() {
      return Ok(true);
    }
    Ok(
      self
        .staleness
        .is_expired(self.request, &key.to_string(), self.stale_time)?,
    )
  }

  /// Return the local value, fetching first if it is missing or stale.
  pub async fn get(&self, key: &V::Key) -> Result<V, CacheError> {
    if let Some(local) = self.cached(key)? {
      let expired = self
        .staleness
        .is_expired(self.request, &key.to_string(), self.stale_time)?;
      if !expired {
        debug!(request = %self.request, %key, "serving fresh local value");
        return Ok(local);
      }
      debug!(request = %self.request, %key, "local value is stale");
    }

    self.fetch(key).await
  }

  /// Fetch from the remote sources regardless of staleness.
  pub async fn fresh(&self, key: &V::Key) -> Result<V, CacheError> {
    self.fetch(key).await
  }

  /// Current local value, then every committed write for `key`.
  pub fn observe(&self, key: &V::Key) -> BoxStream<'static, Option<V>> {
    self.db.observe::<V>(key)
  }

  /// Join the in-flight fetch for `key`, or start one.
  async fn fetch(&self, key: &V::Key) -> Result<V, CacheError> {
    let fetch = {
      let mut in_flight = self
        .in_flight
        .lock()
        .map_err(|_| StoreError::LockPoisoned)?;
      let id = key.to_string();

      match in_flight.get(&id) {
        Some(fetch) => {
          debug!(request = %self.request, %key, "joining in-flight fetch");
          fetch.clone()
        }
        None => {
          let fetch = self.start_fetch(key.clone(), id.clone());
          in_flight.insert(id, fetch.clone());
          fetch
        }
      }
    };

    fetch.await
  }

  fn start_fetch(&self, key: V::Key, id: String) -> SharedFetch<V> {
    let this = self.clone();
    let in_flight: Weak<InFlight<V>> = Arc::downgrade(&self.in_flight);

    async move {
      let result = this.fetch_and_store(&key).await;
      if let Some(in_flight) = in_flight.upgrade() {
        if let Ok(mut in_flight) = in_flight.lock() {
          in_flight.remove(&id);
        }
      }
      result
    }
    .boxed()
    .shared()
  }

  async fn fetch_and_store(&self, key: &V::Key) -> Result<V, CacheError> {
    let remote = self.fetch_remote(key).await?;
    let id = key.to_string();

    let stored = self.db.transaction(|tx| {
      let existing = tx.get_by_key::<V>(key)?;
      let local_id = existing
        .as_ref()
        .map(|e| e.local_id())
        .unwrap_or(LocalId::UNSET);

      let mut merged = V::merge(remote, existing.as_ref());
      merged.set_local_id(local_id);
      let local_id = tx.upsert(&merged)?;
      merged.set_local_id(local_id);

      self.staleness.record_in(tx, self.request, &id)?;
      Ok::<_, StoreError>(merged)
    })?;

    debug!(request = %self.request, %key, local_id = %stored.local_id(), "stored fetched value");
    Ok(stored)
  }

  /// Try each source in priority order. If all fail, the first source's
  /// error is returned. A value whose key differs from `key` counts as a
  /// failure of that source.
  async fn fetch_remote(&self, key: &V::Key) -> Result<V, CacheError> {
    let mut first_error = None;

    for source in self.sources.iter() {
      match source.fetch(key).await {
        Ok(value) if value.stable_key() != *key => {
          // A stored row keeps its key for life.
          let returned = value.stable_key();
          warn!(
            source = source.name(),
            requested = %key,
            %returned,
            "source returned a different key"
          );
          first_error.get_or_insert(RemoteError::Decode(format!(
            "{} answered {} with {}",
            source.name(),
            key,
            returned
          )));
        }
        Ok(value) => {
          debug!(source = source.name(), %key, "fetched from remote");
          return Ok(value);
        }
        Err(e) => {
          warn!(source = source.name(), %key, error = %e, "remote source failed");
          first_error.get_or_insert(e);
        }
      }
    }

    Err(first_error.map(CacheError::Remote).unwrap_or(CacheError::NoSources))
  }
}

impl<V: Entity> Clone for CacheAsideStore<V> {
  fn clone(&self) -> Self {
    Self {
      db: Arc::clone(&self.db),
      staleness: Arc::clone(&self.staleness),
      sources: Arc::clone(&self.sources),
      request: self.request,
      stale_time: self.stale_time,
      in_flight: Arc::clone(&self.in_flight),
    }
  }
}
