//! SQLite-backed persisted store.
//!
//! All access goes through a single connection guarded by a mutex. Writes run
//! inside [`Database::transaction`]; once a transaction commits, every row it
//! touched is announced on a broadcast channel, which is what
//! [`Database::observe`] streams are built on.

mod schema;

use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::cell::RefCell;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::entity::{Entity, LocalId, Outboxed, PendingAction};
use crate::error::StoreError;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A committed write to a single row.
#[derive(Debug, Clone)]
pub struct Change {
  pub entity_type: &'static str,
  pub key: String,
  pub local_id: LocalId,
  /// Serialized entity after the write, `None` when the row was deleted.
  pub data: Option<Arc<[u8]>>,
}

impl Change {
  pub fn is_delete(&self) -> bool {
    self.data.is_none()
  }

  fn decode<E: Entity>(&self) -> Result<Option<E>, StoreError> {
    match &self.data {
      None => Ok(None),
      Some(data) => {
        let mut entity: E = serde_json::from_slice(data)?;
        entity.set_local_id(self.local_id);
        Ok(Some(entity))
      }
    }
  }
}

/// Database connection wrapper
pub struct Database {
  conn: Mutex<Connection>,
  changes: broadcast::Sender<Change>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    Self::from_connection(Connection::open(path)?)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

    let db = Self {
      conn: Mutex::new(conn),
      changes,
    };
    db.run_migrations()?;

    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<(), StoreError> {
    self.lock()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }

  /// Run `f` inside an immediate transaction.
  ///
  /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
  pub fn transaction<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
  where
    E: From<StoreError>,
  {
    let mut conn = self.lock()?;
    let txn = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(StoreError::from)?;

    let tx = Tx::new(&txn);
    let value = f(&tx)?;
    let changes = tx.into_changes();

    txn.commit().map_err(StoreError::from)?;

    // Still holding the connection: commit order == announcement order.
    for change in changes {
      let _ = self.changes.send(change);
    }

    Ok(value)
  }

  /// Run read-only queries outside of an explicit transaction.
  pub fn read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
    let conn = self.lock()?;
    f(&Tx::new(&conn))
  }

  /// Receive every change committed from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<Change> {
    self.changes.subscribe()
  }

  /// Stream the value stored under `key`: the current value first, then the
  /// value after each committed write, in commit order.
  ///
  /// The current value is read when `observe` is called, not on first poll.
  pub fn observe<E: Entity>(self: &Arc<Self>, key: &E::Key) -> BoxStream<'static, Option<E>> {
    let key_text = key.to_string();
    let (initial, rx) = match self.snapshot::<E>(key) {
      Ok((value, rx)) => (Some(value), rx),
      Err(e) => {
        warn!(key = %key_text, error = %e, "failed to read observed value");
        (None, self.subscribe())
      }
    };

    let observer = Observer::<E> {
      db: Arc::clone(self),
      rx,
      key: key.clone(),
      key_text,
      initial,
    };

    stream::unfold(observer, |mut observer| async move {
      let value = observer.next_value().await?;
      Some((value, observer))
    })
    .boxed()
  }

  /// Read `key` and subscribe under the connection lock. Commits are
  /// announced while that lock is held, so the receiver carries exactly the
  /// changes committed after the returned value.
  fn snapshot<E: Entity>(
    &self,
    key: &E::Key,
  ) -> Result<(Option<E>, broadcast::Receiver<Change>), StoreError> {
    let conn = self.lock()?;
    let rx = self.changes.subscribe();
    let value = Tx::new(&conn).get_by_key::<E>(key)?;
    Ok((value, rx))
  }
}

struct Observer<E: Entity> {
  db: Arc<Database>,
  rx: broadcast::Receiver<Change>,
  key: E::Key,
  key_text: String,
  initial: Option<Option<E>>,
}

impl<E: Entity> Observer<E> {
  async fn next_value(&mut self) -> Option<Option<E>> {
    if let Some(initial) = self.initial.take() {
      return Some(initial);
    }

    loop {
      match self.rx.recv().await {
        Ok(change) => {
          if change.entity_type != E::entity_type() || change.key != self.key_text {
            continue;
          }
          match change.decode::<E>() {
            Ok(value) => return Some(value),
            Err(e) => warn!(key = %self.key_text, error = %e, "dropping undecodable change"),
          }
        }
        Err(RecvError::Lagged(skipped)) => {
          // The backlog is older than a fresh read; drop it with the receiver.
          debug!(key = %self.key_text, skipped, "observer lagged, re-reading current value");
          match self.db.snapshot::<E>(&self.key) {
            Ok((value, rx)) => {
              self.rx = rx;
              return Some(value);
            }
            Err(e) => {
              warn!(key = %self.key_text, error = %e, "failed to read observed value");
              self.rx = self.rx.resubscribe();
            }
          }
        }
        Err(RecvError::Closed) => return None,
      }
    }
  }
}

/// Handle to the connection for the duration of a transaction or read.
pub struct Tx<'a> {
  conn: &'a Connection,
  changes: RefCell<Vec<Change>>,
}

impl<'a> Tx<'a> {
  fn new(conn: &'a Connection) -> Self {
    Self {
      conn,
      changes: RefCell::new(Vec::new()),
    }
  }

  fn into_changes(self) -> Vec<Change> {
    self.changes.into_inner()
  }

  pub(crate) fn conn(&self) -> &Connection {
    self.conn
  }

  fn record<E: Entity>(&self, key: String, local_id: LocalId, data: Option<Arc<[u8]>>) {
    self.changes.borrow_mut().push(Change {
      entity_type: E::entity_type(),
      key,
      local_id,
      data,
    });
  }

  /// Get a single entity by local id.
  pub fn get<E: Entity>(&self, id: LocalId) -> Result<Option<E>, StoreError> {
    let row: Option<(i64, Vec<u8>)> = self
      .conn
      .query_row(
        "SELECT local_id, data FROM entities WHERE entity_type = ?1 AND local_id = ?2",
        params![E::entity_type(), id.0],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    row.map(decode_row::<E>).transpose()
  }

  /// Get a single entity by stable key.
  pub fn get_by_key<E: Entity>(&self, key: &E::Key) -> Result<Option<E>, StoreError> {
    let row: Option<(i64, Vec<u8>)> = self
      .conn
      .query_row(
        "SELECT local_id, data FROM entities WHERE entity_type = ?1 AND stable_key = ?2",
        params![E::entity_type(), key.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    row.map(decode_row::<E>).transpose()
  }

  pub fn id_for_key<E: Entity>(&self, key: &E::Key) -> Result<Option<LocalId>, StoreError> {
    let id: Option<i64> = self
      .conn
      .query_row(
        "SELECT local_id FROM entities WHERE entity_type = ?1 AND stable_key = ?2",
        params![E::entity_type(), key.to_string()],
        |row| row.get(0),
      )
      .optional()?;

    Ok(id.map(LocalId))
  }

  /// All entities of a type, oldest first.
  pub fn query_all<E: Entity>(&self) -> Result<Vec<E>, StoreError> {
    let mut stmt = self.conn.prepare(
      "SELECT local_id, data FROM entities WHERE entity_type = ?1 ORDER BY local_id",
    )?;
    let rows = stmt
      .query_map(params![E::entity_type()], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<Result<Vec<(i64, Vec<u8>)>, _>>()?;

    rows.into_iter().map(decode_row::<E>).collect()
  }

  pub fn query_by_pending_action<E: Entity>(
    &self,
    action: PendingAction,
  ) -> Result<Vec<E>, StoreError> {
    let mut stmt = self.conn.prepare(
      "SELECT local_id, data FROM entities
       WHERE entity_type = ?1 AND pending_action = ?2
       ORDER BY local_id",
    )?;
    let rows = stmt
      .query_map(params![E::entity_type(), action.as_i64()], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })?
      .collect::<Result<Vec<(i64, Vec<u8>)>, _>>()?;

    rows.into_iter().map(decode_row::<E>).collect()
  }

  /// Insert a new row. Fails with [`StoreError::Conflict`] when the stable
  /// key is already taken.
  pub fn insert<E: Entity>(&self, entity: &E) -> Result<LocalId, StoreError> {
    self.insert_row(entity, None)
  }

  fn insert_row<E: Entity>(&self, entity: &E, id: Option<LocalId>) -> Result<LocalId, StoreError> {
    let key = entity.stable_key();
    let data = serde_json::to_vec(entity)?;

    self
      .conn
      .execute(
        "INSERT INTO entities (local_id, entity_type, stable_key, pending_action, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
          id.map(|id| id.0),
          E::entity_type(),
          key.to_string(),
          entity.pending_action().as_i64(),
          &data
        ],
      )
      .map_err(|e| conflict_or::<E>(e, &key))?;

    let local_id = LocalId(self.conn.last_insert_rowid());
    self.record::<E>(key.to_string(), local_id, Some(Arc::from(data)));

    Ok(local_id)
  }

  /// Overwrite the row with the entity's local id. Returns `false` if no
  /// such row exists.
  pub fn update<E: Entity>(&self, entity: &E) -> Result<bool, StoreError> {
    let key = entity.stable_key();
    let local_id = entity.local_id();
    let data = serde_json::to_vec(entity)?;

    let changed = self
      .conn
      .execute(
        "UPDATE entities
         SET stable_key = ?1, pending_action = ?2, data = ?3, updated_at = datetime('now')
         WHERE entity_type = ?4 AND local_id = ?5",
        params![
          key.to_string(),
          entity.pending_action().as_i64(),
          &data,
          E::entity_type(),
          local_id.0
        ],
      )
      .map_err(|e| conflict_or::<E>(e, &key))?;

    if changed > 0 {
      self.record::<E>(key.to_string(), local_id, Some(Arc::from(data)));
    }

    Ok(changed > 0)
  }

  /// Insert when the entity has no local id yet, update otherwise.
  ///
  /// An entity whose row disappeared is re-inserted under the same id.
  pub fn upsert<E: Entity>(&self, entity: &E) -> Result<LocalId, StoreError> {
    let local_id = entity.local_id();
    if !local_id.is_set() {
      return self.insert(entity);
    }

    if self.update(entity)? {
      Ok(local_id)
    } else {
      self.insert_row(entity, Some(local_id))
    }
  }

  pub fn delete<E: Entity>(&self, id: LocalId) -> Result<bool, StoreError> {
    let key: Option<String> = self
      .conn
      .query_row(
        "DELETE FROM entities WHERE entity_type = ?1 AND local_id = ?2 RETURNING stable_key",
        params![E::entity_type(), id.0],
        |row| row.get(0),
      )
      .optional()?;

    match key {
      Some(key) => {
        self.record::<E>(key, id, None);
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Delete the rows in `ids` that still carry `action`.
  pub fn delete_pending<E: Entity>(
    &self,
    ids: &[LocalId],
    action: PendingAction,
  ) -> Result<usize, StoreError> {
    let mut deleted = 0;
    for id in ids {
      let key: Option<String> = self
        .conn
        .query_row(
          "DELETE FROM entities
           WHERE entity_type = ?1 AND local_id = ?2 AND pending_action = ?3
           RETURNING stable_key",
          params![E::entity_type(), id.0, action.as_i64()],
          |row| row.get(0),
        )
        .optional()?;

      if let Some(key) = key {
        self.record::<E>(key, *id, None);
        deleted += 1;
      }
    }
    Ok(deleted)
  }

  /// Move the rows in `ids` from pending action `from` to `to`. Rows whose
  /// action changed in the meantime are left alone.
  pub fn transition_pending<E: Outboxed>(
    &self,
    ids: &[LocalId],
    from: PendingAction,
    to: PendingAction,
  ) -> Result<usize, StoreError> {
    let mut updated = 0;
    for id in ids {
      let Some(mut entity) = self.get::<E>(*id)? else {
        continue;
      };
      if entity.pending_action() != from {
        continue;
      }
      entity.set_pending_action(to);
      if self.update(&entity)? {
        updated += 1;
      }
    }
    Ok(updated)
  }
}

fn decode_row<E: Entity>((local_id, data): (i64, Vec<u8>)) -> Result<E, StoreError> {
  let mut entity: E = serde_json::from_slice(&data)?;
  entity.set_local_id(LocalId(local_id));
  Ok(entity)
}

fn conflict_or<E: Entity>(err: rusqlite::Error, key: &E::Key) -> StoreError {
  match &err {
    rusqlite::Error::SqliteFailure(e, _)
      if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
    {
      StoreError::Conflict {
        entity_type: E::entity_type(),
        key: key.to_string(),
      }
    }
    _ => StoreError::Sqlite(err),
  }
}
