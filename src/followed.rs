//! The user's followed shows, editable offline and synced through an outbox.
//!
//! Local edits only flip an entry's [`PendingAction`]. [`FollowedShowsRepository::sync`]
//! pushes those edits to the remote list and then pulls the list back down,
//! reconciling it into the local table.

use chrono::Duration;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::cache::{RequestKind, StalenessTracker};
use crate::clock::Clock;
use crate::db::{Database, Tx};
use crate::entity::{FollowedShowEntry, LocalId, PendingAction, Show};
use crate::error::{RemoteError, StoreError, SyncError, SyncPhase};
use crate::remote::{ListHandle, RemoteListService};
use crate::sync::{placeholder, reconcile_entities, SyncResult};

/// Staleness entity id for the whole followed collection.
pub const COLLECTION: &str = "followed_shows";

#[derive(Debug, Default)]
struct SyncState {
  list_handle: Option<ListHandle>,
}

pub struct FollowedShowsRepository {
  db: Arc<Database>,
  staleness: Arc<StalenessTracker>,
  remote: Arc<dyn RemoteListService>,
  auth: Arc<dyn AuthState>,
  clock: Arc<dyn Clock>,
  sync_state: Mutex<SyncState>,
}

impl FollowedShowsRepository {
  pub fn new(
    db: Arc<Database>,
    staleness: Arc<StalenessTracker>,
    remote: Arc<dyn RemoteListService>,
    auth: Arc<dyn AuthState>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      db,
      staleness,
      remote,
      auth,
      clock,
      sync_state: Mutex::new(SyncState::default()),
    }
  }

  /// Mark `show_id` as followed. Never touches the network.
  pub async fn add_local(&self, show_id: LocalId) -> Result<(), StoreError> {
    self.db.transaction(|tx| {
      let entry = tx.get_by_key::<FollowedShowEntry>(&show_id)?;
      debug!(%show_id, ?entry, "add followed show");

      match entry {
        Some(entry) if entry.pending_action != PendingAction::Delete => Ok(()),
        entry => {
          let followed_at = entry
            .as_ref()
            .and_then(|e| e.followed_at)
            .unwrap_or_else(|| self.clock.now());
          let entry = FollowedShowEntry {
            local_id: entry.map(|e| e.local_id).unwrap_or(LocalId::UNSET),
            show_id,
            followed_at: Some(followed_at),
            pending_action: PendingAction::Upload,
          };
          tx.upsert(&entry)?;
          Ok(())
        }
      }
    })
  }

  /// Mark `show_id` as unfollowed. Never touches the network.
  pub async fn remove_local(&self, show_id: LocalId) -> Result<(), StoreError> {
    self.db.transaction(|tx| {
      let Some(mut entry) = tx.get_by_key::<FollowedShowEntry>(&show_id)? else {
        return Ok(());
      };
      if entry.pending_action == PendingAction::Delete {
        return Ok(());
      }

      debug!(%show_id, "marking followed show for deletion");
      entry.pending_action = PendingAction::Delete;
      tx.update(&entry)?;
      Ok(())
    })
  }

  /// Every entry, including those waiting to be deleted.
  pub fn followed_shows(&self) -> Result<Vec<FollowedShowEntry>, StoreError> {
    self.db.read(|tx| tx.query_all::<FollowedShowEntry>())
  }

  pub fn entry_for_show(&self, show_id: LocalId) -> Result<Option<FollowedShowEntry>, StoreError> {
    self
      .db
      .read(|tx| tx.get_by_key::<FollowedShowEntry>(&show_id))
  }

  pub fn is_followed(&self, show_id: LocalId) -> Result<bool, StoreError> {
    Ok(
      self
        .entry_for_show(show_id)?
        .is_some_and(|e| e.is_active()),
    )
  }

  pub fn observe_is_followed(&self, show_id: LocalId) -> BoxStream<'static, bool> {
    self
      .db
      .observe::<FollowedShowEntry>(&show_id)
      .map(|entry| entry.is_some_and(|e| e.is_active()))
      .boxed()
  }

  /// Whether the last completed sync is older than `threshold`.
  pub fn needs_sync(&self, threshold: Duration) -> Result<bool, StoreError> {
    self
      .staleness
      .is_expired(RequestKind::FollowedShows, COLLECTION, threshold)
  }

  /// Push pending edits, then pull the remote list.
  ///
  /// Cycles are serialized. When a push fails the other push still runs,
  /// the pull is skipped and the first failure is returned; pending entries
  /// stay pending for the next cycle.
  pub async fn sync(&self) -> Result<SyncResult<LocalId>, SyncError> {
    let mut state = self.sync_state.lock().await;

    let handle = self.resolve_handle(&mut state).await?;
    info!(remote = handle.is_some(), "syncing followed shows");

    let uploads = self.push_uploads(handle).await?;
    let deletes = self.push_deletes(handle).await?;

    if let Some(e) = uploads.err().or(deletes.err()) {
      return Err(e);
    }

    let result = match handle {
      Some(handle) => self.pull(handle).await?,
      None => {
        self.staleness.update_last_request(RequestKind::FollowedShows, COLLECTION)?;
        SyncResult::default()
      }
    };

    info!(
      added = result.added.len(),
      updated = result.updated.len(),
      removed = result.removed.len(),
      "followed shows synced"
    );
    Ok(result)
  }

  async fn resolve_handle(&self, state: &mut SyncState) -> Result<Option<ListHandle>, SyncError> {
    if !self.auth.is_authenticated() {
      // The handle belongs to the signed out account.
      state.list_handle = None;
      return Ok(None);
    }
    if let Some(handle) = state.list_handle {
      return Ok(Some(handle));
    }

    match self.remote.list_handle().await {
      Ok(handle) => {
        debug!(%handle, "resolved followed list");
        state.list_handle = Some(handle);
        Ok(Some(handle))
      }
      Err(RemoteError::AuthRequired) => {
        warn!("remote rejected credentials, syncing locally only");
        Ok(None)
      }
      Err(source) => Err(SyncError::Remote {
        phase: SyncPhase::ResolveHandle,
        source,
      }),
    }
  }

  /// Outer error: local store failure. Inner error: the push itself failed.
  async fn push_uploads(
    &self,
    handle: Option<ListHandle>,
  ) -> Result<Result<(), SyncError>, StoreError> {
    let (ids, keys) = self.pending(PendingAction::Upload)?;
    if ids.is_empty() {
      return Ok(Ok(()));
    }
    debug!(count = ids.len(), remote = handle.is_some(), "pushing pending uploads");

    if let Some(handle) = handle {
      if let Err(source) = self.remote.add_members(handle, &keys).await {
        warn!(error = %source, count = ids.len(), "failed to push uploads");
        return Ok(Err(SyncError::Remote {
          phase: SyncPhase::PushUploads,
          source,
        }));
      }
    }

    self.db.transaction(|tx| {
      tx.transition_pending::<FollowedShowEntry>(&ids, PendingAction::Upload, PendingAction::None)
    })?;
    Ok(Ok(()))
  }

  async fn push_deletes(
    &self,
    handle: Option<ListHandle>,
  ) -> Result<Result<(), SyncError>, StoreError> {
    let (ids, keys) = self.pending(PendingAction::Delete)?;
    if ids.is_empty() {
      return Ok(Ok(()));
    }
    debug!(count = ids.len(), remote = handle.is_some(), "pushing pending deletes");

    if let Some(handle) = handle {
      if let Err(source) = self.remote.remove_members(handle, &keys).await {
        warn!(error = %source, count = ids.len(), "failed to push deletes");
        return Ok(Err(SyncError::Remote {
          phase: SyncPhase::PushDeletes,
          source,
        }));
      }
    }

    self
      .db
      .transaction(|tx| tx.delete_pending::<FollowedShowEntry>(&ids, PendingAction::Delete))?;
    Ok(Ok(()))
  }

  /// Entry ids with `action`, and the stable keys of their shows.
  ///
  /// Entries whose show row is gone are left out of both.
  fn pending(&self, action: PendingAction) -> Result<(Vec<LocalId>, Vec<u64>), StoreError> {
    self.db.read(|tx| {
      let entries = tx.query_by_pending_action::<FollowedShowEntry>(action)?;
      let mut ids = Vec::with_capacity(entries.len());
      let mut keys = Vec::with_capacity(entries.len());
      for entry in entries {
        match tx.get::<Show>(entry.show_id)? {
          Some(show) => {
            ids.push(entry.local_id);
            keys.push(show.trakt_id);
          }
          None => warn!(show_id = %entry.show_id, "followed entry references a missing show"),
        }
      }
      Ok((ids, keys))
    })
  }

  async fn pull(&self, handle: ListHandle) -> Result<SyncResult<LocalId>, SyncError> {
    let members = self
      .remote
      .fetch_members(handle)
      .await
      .map_err(|source| SyncError::Remote {
        phase: SyncPhase::Pull,
        source,
      })?;
    debug!(%handle, count = members.len(), "pulled followed list");

    let result = self.db.transaction(|tx| {
      let remote = members
        .iter()
        .map(|member| -> Result<FollowedShowEntry, StoreError> {
          let show_id = placeholder::resolve_in::<Show>(tx, &member.show.trakt_id)?;
          Ok(FollowedShowEntry::remote(show_id, member.listed_at))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

      let result = self.apply_pull(tx, remote)?;
      self
        .staleness
        .record_in(tx, RequestKind::FollowedShows, COLLECTION)?;
      Ok::<_, StoreError>(result)
    })?;

    Ok(result)
  }

  fn apply_pull(
    &self,
    tx: &Tx<'_>,
    remote: Vec<FollowedShowEntry>,
  ) -> Result<SyncResult<LocalId>, StoreError> {
    let local = tx.query_all::<FollowedShowEntry>()?;
    // Entries with unpushed edits belong to the outbox, not to the remote.
    reconcile_entities(local, remote)
      .retain_deletions(|e| e.pending_action == PendingAction::None)
      .apply(tx)
  }
}
