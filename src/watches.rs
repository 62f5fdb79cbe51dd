//! Episode watches, recorded offline and synced per show through an outbox.
//!
//! Works like [`crate::followed`]: local edits flip a [`PendingAction`] and
//! [`EpisodeWatchesRepository::sync_show`] pushes them before pulling the
//! show's watch history. Deletes are pushed before uploads.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::AuthState;
use crate::cache::{RequestKind, StalenessTracker};
use crate::db::{Database, Tx};
use crate::entity::{
  Entity, Episode, EpisodeWatchEntry, LocalId, Merge, PendingAction, Show, WatchKey,
};
use crate::error::{StoreError, SyncError, SyncPhase};
use crate::remote::{NewWatch, RemoteEpisode, RemoteWatchService};
use crate::sync::{reconcile_entities, SyncResult};

pub struct EpisodeWatchesRepository {
  db: Arc<Database>,
  staleness: Arc<StalenessTracker>,
  remote: Arc<dyn RemoteWatchService>,
  auth: Arc<dyn AuthState>,
  sync_lock: Mutex<()>,
}

impl EpisodeWatchesRepository {
  pub fn new(
    db: Arc<Database>,
    staleness: Arc<StalenessTracker>,
    remote: Arc<dyn RemoteWatchService>,
    auth: Arc<dyn AuthState>,
  ) -> Self {
    Self {
      db,
      staleness,
      remote,
      auth,
      sync_lock: Mutex::new(()),
    }
  }

  /// Local id of the episode, creating or refreshing its row under `show_id`.
  pub fn ensure_episode(
    &self,
    show_id: LocalId,
    episode: &RemoteEpisode,
  ) -> Result<LocalId, StoreError> {
    self.db.transaction(|tx| episode_in(tx, show_id, episode))
  }

  pub fn episode_id(&self, trakt_id: u64) -> Result<Option<LocalId>, StoreError> {
    self.db.read(|tx| tx.id_for_key::<Episode>(&trakt_id))
  }

  /// Record a watch. Never touches the network.
  ///
  /// Recording the same episode at the same instant twice yields one watch.
  pub async fn add_watch(
    &self,
    episode_id: LocalId,
    watched_at: DateTime<Utc>,
  ) -> Result<LocalId, StoreError> {
    let entry = EpisodeWatchEntry::local(episode_id, watched_at);

    self.db.transaction(|tx| {
      if tx.get::<Episode>(episode_id)?.is_none() {
        return Err(StoreError::Missing {
          entity_type: Episode::entity_type(),
          local_id: episode_id,
        });
      }
      if let Some(existing) = tx.get_by_key::<EpisodeWatchEntry>(&entry.stable_key())? {
        return Ok(existing.local_id);
      }

      let id = tx.insert(&entry)?;
      debug!(%episode_id, watch_id = %id, "recorded watch");
      Ok(id)
    })
  }

  /// Mark one watch for deletion.
  pub async fn remove_watch(&self, watch_id: LocalId) -> Result<(), StoreError> {
    self.db.transaction(|tx| {
      let Some(entry) = tx.get::<EpisodeWatchEntry>(watch_id)? else {
        return Ok(());
      };
      mark_deleted(tx, entry)
    })
  }

  /// Mark every watch of the episode for deletion.
  pub async fn remove_all_watches(&self, episode_id: LocalId) -> Result<usize, StoreError> {
    self.db.transaction(|tx| {
      let mut marked = 0;
      for entry in watches_in(tx, episode_id)? {
        if entry.is_active() {
          mark_deleted(tx, entry)?;
          marked += 1;
        }
      }
      Ok(marked)
    })
  }

  /// Every watch of the episode, including those waiting to be deleted.
  pub fn watches_for_episode(
    &self,
    episode_id: LocalId,
  ) -> Result<Vec<EpisodeWatchEntry>, StoreError> {
    self.db.read(|tx| watches_in(tx, episode_id))
  }

  pub fn has_been_watched(&self, episode_id: LocalId) -> Result<bool, StoreError> {
    Ok(
      self
        .watches_for_episode(episode_id)?
        .iter()
        .any(EpisodeWatchEntry::is_active),
    )
  }

  /// Whether the show's last completed sync is older than `threshold`.
  pub fn needs_sync(&self, show_id: LocalId, threshold: Duration) -> Result<bool, StoreError> {
    self
      .staleness
      .is_expired(RequestKind::EpisodeWatches, &show_id.to_string(), threshold)
  }

  /// Push the show's pending watch edits, then pull its watch history.
  ///
  /// Signed out, pending edits settle locally and nothing is pulled. A failed
  /// push does not stop the other push; the pull is skipped and the first
  /// failure is returned.
  pub async fn sync_show(&self, show_id: LocalId) -> Result<SyncResult<WatchKey>, SyncError> {
    let _guard = self.sync_lock.lock().await;

    let show = self
      .db
      .read(|tx| tx.get::<Show>(show_id))?
      .ok_or(StoreError::Missing {
        entity_type: Show::entity_type(),
        local_id: show_id,
      })?;
    let remote = self.auth.is_authenticated();
    info!(show = show.trakt_id, remote, "syncing episode watches");

    let deletes = self.push_deletes(show_id, remote).await?;
    let uploads = self.push_uploads(show_id, remote).await?;

    if let Some(e) = deletes.err().or(uploads.err()) {
      return Err(e);
    }

    let result = if remote {
      self.pull(&show).await?
    } else {
      self
        .staleness
        .update_last_request(RequestKind::EpisodeWatches, &show_id.to_string())?;
      SyncResult::default()
    };

    info!(
      show = show.trakt_id,
      added = result.added.len(),
      updated = result.updated.len(),
      removed = result.removed.len(),
      "episode watches synced"
    );
    Ok(result)
  }

  /// Outer error: local store failure. Inner error: the push itself failed.
  async fn push_deletes(
    &self,
    show_id: LocalId,
    remote: bool,
  ) -> Result<Result<(), SyncError>, StoreError> {
    let pending = self.pending(show_id, PendingAction::Delete)?;
    if pending.is_empty() {
      return Ok(Ok(()));
    }

    // Watches never pulled back have nothing to remove remotely.
    let history_ids: Vec<u64> = pending.iter().filter_map(|(w, _)| w.trakt_id).collect();
    debug!(count = pending.len(), known = history_ids.len(), "pushing pending watch deletes");

    if remote && !history_ids.is_empty() {
      if let Err(source) = self.remote.remove_watches(&history_ids).await {
        warn!(error = %source, count = history_ids.len(), "failed to push watch deletes");
        return Ok(Err(SyncError::Remote {
          phase: SyncPhase::PushDeletes,
          source,
        }));
      }
    }

    let ids: Vec<LocalId> = pending.iter().map(|(w, _)| w.local_id).collect();
    self
      .db
      .transaction(|tx| tx.delete_pending::<EpisodeWatchEntry>(&ids, PendingAction::Delete))?;
    Ok(Ok(()))
  }

  async fn push_uploads(
    &self,
    show_id: LocalId,
    remote: bool,
  ) -> Result<Result<(), SyncError>, StoreError> {
    let pending = self.pending(show_id, PendingAction::Upload)?;
    if pending.is_empty() {
      return Ok(Ok(()));
    }
    debug!(count = pending.len(), remote, "pushing pending watches");

    if remote {
      let watches: Vec<NewWatch> = pending
        .iter()
        .map(|(w, episode)| NewWatch {
          episode: *episode,
          watched_at: w.watched_at,
        })
        .collect();
      if let Err(source) = self.remote.add_watches(&watches).await {
        warn!(error = %source, count = watches.len(), "failed to push watches");
        return Ok(Err(SyncError::Remote {
          phase: SyncPhase::PushUploads,
          source,
        }));
      }
    }

    let ids: Vec<LocalId> = pending.iter().map(|(w, _)| w.local_id).collect();
    self.db.transaction(|tx| {
      tx.transition_pending::<EpisodeWatchEntry>(&ids, PendingAction::Upload, PendingAction::None)
    })?;
    Ok(Ok(()))
  }

  /// The show's watches with `action`, paired with their episode keys.
  fn pending(
    &self,
    show_id: LocalId,
    action: PendingAction,
  ) -> Result<Vec<(EpisodeWatchEntry, u64)>, StoreError> {
    self.db.read(|tx| {
      let episodes = episodes_of(tx, show_id)?;
      let entries = tx.query_by_pending_action::<EpisodeWatchEntry>(action)?;
      Ok(
        entries
          .into_iter()
          .filter_map(|w| episodes.get(&w.episode_id).map(|&key| (w, key)))
          .collect(),
      )
    })
  }

  async fn pull(&self, show: &Show) -> Result<SyncResult<WatchKey>, SyncError> {
    let watches = self
      .remote
      .fetch_show_watches(show.trakt_id)
      .await
      .map_err(|source| SyncError::Remote {
        phase: SyncPhase::Pull,
        source,
      })?;
    debug!(show = show.trakt_id, count = watches.len(), "pulled watch history");

    let show_id = show.local_id;
    let result = self.db.transaction(|tx| {
      let remote = watches
        .iter()
        .map(|watch| -> Result<EpisodeWatchEntry, StoreError> {
          let episode_id = episode_in(tx, show_id, &watch.episode)?;
          Ok(EpisodeWatchEntry::remote(
            episode_id,
            watch.history_id,
            watch.watched_at,
          ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

      let episodes = episodes_of(tx, show_id)?;
      let local: Vec<EpisodeWatchEntry> = tx
        .query_all::<EpisodeWatchEntry>()?
        .into_iter()
        .filter(|w| episodes.contains_key(&w.episode_id))
        .collect();

      let result = reconcile_entities(local, remote)
        .retain_deletions(|w| w.pending_action == PendingAction::None)
        .apply(tx)?;
      self
        .staleness
        .record_in(tx, RequestKind::EpisodeWatches, &show_id.to_string())?;
      Ok::<_, StoreError>(result)
    })?;

    Ok(result)
  }
}

/// Get or refresh the episode row for `episode` within `tx`.
fn episode_in(
  tx: &Tx<'_>,
  show_id: LocalId,
  episode: &RemoteEpisode,
) -> Result<LocalId, StoreError> {
  let incoming = Episode {
    local_id: LocalId::UNSET,
    trakt_id: episode.trakt_id,
    show_id,
    season: episode.season,
    number: episode.number,
    title: episode.title.clone(),
  };
  let existing = tx.get_by_key::<Episode>(&episode.trakt_id)?;
  let merged = Episode::merge(incoming, existing.as_ref());

  match existing {
    Some(existing) if existing == merged => Ok(existing.local_id),
    _ => tx.upsert(&merged),
  }
}

/// Local id to stable key of every episode of the show.
fn episodes_of(tx: &Tx<'_>, show_id: LocalId) -> Result<HashMap<LocalId, u64>, StoreError> {
  Ok(
    tx.query_all::<Episode>()?
      .into_iter()
      .filter(|e| e.show_id == show_id)
      .map(|e| (e.local_id, e.trakt_id))
      .collect(),
  )
}

fn watches_in(tx: &Tx<'_>, episode_id: LocalId) -> Result<Vec<EpisodeWatchEntry>, StoreError> {
  Ok(
    tx.query_all::<EpisodeWatchEntry>()?
      .into_iter()
      .filter(|w| w.episode_id == episode_id)
      .collect(),
  )
}

fn mark_deleted(tx: &Tx<'_>, mut entry: EpisodeWatchEntry) -> Result<(), StoreError> {
  if entry.pending_action == PendingAction::Delete {
    return Ok(());
  }
  debug!(watch_id = %entry.local_id, "marking watch for deletion");
  entry.pending_action = PendingAction::Delete;
  tx.update(&entry)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::PlaceholderResolver;
  use crate::testing::{self, FakeAuth, FakeWatches};
  use std::sync::atomic::Ordering;

  const SHOW: u64 = 1388;

  struct Fixture {
    db: Arc<Database>,
    remote: Arc<FakeWatches>,
    auth: Arc<FakeAuth>,
    repo: EpisodeWatchesRepository,
    show_id: LocalId,
  }

  impl Fixture {
    fn new(auth: FakeAuth) -> Self {
      let db = Arc::new(Database::open_in_memory().unwrap());
      let clock = Arc::new(testing::clock());
      let staleness = Arc::new(StalenessTracker::new(db.clone(), clock));
      let remote = Arc::new(FakeWatches::new(SHOW));
      let auth = Arc::new(auth);
      let repo = EpisodeWatchesRepository::new(db.clone(), staleness, remote.clone(), auth.clone());
      let show_id = PlaceholderResolver::new(db.clone())
        .get_or_create_key::<Show>(&SHOW)
        .unwrap();
      Self {
        db,
        remote,
        auth,
        repo,
        show_id,
      }
    }

    fn online() -> Self {
      Self::new(FakeAuth::signed_in())
    }

    fn episode(&self, trakt_id: u64) -> LocalId {
      let episode = RemoteEpisode {
        trakt_id,
        season: Some(1),
        number: None,
        title: None,
      };
      self.repo.ensure_episode(self.show_id, &episode).unwrap()
    }

    fn all_watches(&self) -> Vec<EpisodeWatchEntry> {
      self
        .db
        .read(|tx| tx.query_all::<EpisodeWatchEntry>())
        .unwrap()
    }
  }

  #[tokio::test]
  async fn test_add_watch_is_idempotent_per_instant() {
    let fixture = Fixture::online();
    let episode = fixture.episode(501);

    let first = fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();
    let again = fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();
    assert_eq!(first, again);

    let later = testing::start_time() + Duration::hours(1);
    let rewatch = fixture.repo.add_watch(episode, later).await.unwrap();
    assert_ne!(rewatch, first);
    assert_eq!(fixture.repo.watches_for_episode(episode).unwrap().len(), 2);
    assert!(fixture.repo.has_been_watched(episode).unwrap());
  }

  #[tokio::test]
  async fn test_add_watch_for_unknown_episode_fails() {
    let fixture = Fixture::online();
    let err = fixture
      .repo
      .add_watch(LocalId(404), testing::start_time())
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Missing { entity_type: "episode", .. }));
  }

  #[tokio::test]
  async fn test_offline_watch_settles_locally() {
    let fixture = Fixture::new(FakeAuth::signed_out());
    let episode = fixture.episode(501);
    fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();

    let result = fixture.repo.sync_show(fixture.show_id).await.unwrap();
    assert!(result.is_empty());

    let watches = fixture.all_watches();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].pending_action, PendingAction::None);
    assert_eq!(fixture.remote.add_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(!fixture.repo.needs_sync(fixture.show_id, Duration::hours(1)).unwrap());
  }

  #[tokio::test]
  async fn test_uploaded_watch_comes_back_with_history_id() {
    let fixture = Fixture::online();
    let episode = fixture.episode(501);
    fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();

    let result = fixture.repo.sync_show(fixture.show_id).await.unwrap();
    let history = fixture.remote.entries();
    assert_eq!(history.len(), 1);
    let (history_id, episode_key) = history[0];
    assert_eq!(episode_key, 501);

    // The local-only row is replaced by the pulled one.
    assert_eq!(result.added, vec![WatchKey::Remote(history_id)]);
    assert_eq!(result.removed.len(), 1);
    let watches = fixture.all_watches();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].trakt_id, Some(history_id));
    assert_eq!(watches[0].episode_id, episode);
    assert_eq!(watches[0].pending_action, PendingAction::None);
  }

  #[tokio::test]
  async fn test_pull_creates_episodes_for_remote_watches() {
    let fixture = Fixture::online();
    let history_id = fixture.remote.record(502, testing::start_time());

    fixture.repo.sync_show(fixture.show_id).await.unwrap();

    let episode = fixture.repo.episode_id(502).unwrap().unwrap();
    let stored = fixture.db.read(|tx| tx.get::<Episode>(episode)).unwrap().unwrap();
    assert_eq!(stored.show_id, fixture.show_id);
    let watches = fixture.repo.watches_for_episode(episode).unwrap();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].trakt_id, Some(history_id));
  }

  #[tokio::test]
  async fn test_remove_pushes_history_id_and_deletes_row() {
    let fixture = Fixture::online();
    fixture.remote.record(501, testing::start_time());
    fixture.repo.sync_show(fixture.show_id).await.unwrap();

    let episode = fixture.repo.episode_id(501).unwrap().unwrap();
    assert_eq!(fixture.repo.remove_all_watches(episode).await.unwrap(), 1);
    assert!(!fixture.repo.has_been_watched(episode).unwrap());

    fixture.repo.sync_show(fixture.show_id).await.unwrap();
    assert_eq!(fixture.remote.remove_calls.load(Ordering::SeqCst), 1);
    assert!(fixture.remote.entries().is_empty());
    assert!(fixture.all_watches().is_empty());
  }

  #[tokio::test]
  async fn test_removing_unsynced_watch_stays_local() {
    let fixture = Fixture::online();
    let episode = fixture.episode(501);
    let watch = fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();
    fixture.repo.remove_watch(watch).await.unwrap();

    fixture.repo.sync_show(fixture.show_id).await.unwrap();
    assert_eq!(fixture.remote.remove_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.add_calls.load(Ordering::SeqCst), 0);
    assert!(fixture.all_watches().is_empty());
  }

  #[tokio::test]
  async fn test_failed_upload_keeps_watch_pending_and_skips_pull() {
    let fixture = Fixture::online();
    let episode = fixture.episode(501);
    fixture.repo.add_watch(episode, testing::start_time()).await.unwrap();

    fixture.remote.fail_add.store(true, Ordering::SeqCst);
    let err = fixture.repo.sync_show(fixture.show_id).await.unwrap_err();
    assert_eq!(err.phase(), Some(SyncPhase::PushUploads));
    assert_eq!(fixture.all_watches()[0].pending_action, PendingAction::Upload);
    assert_eq!(fixture.remote.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(fixture.repo.needs_sync(fixture.show_id, Duration::hours(1)).unwrap());

    fixture.remote.fail_add.store(false, Ordering::SeqCst);
    fixture.repo.sync_show(fixture.show_id).await.unwrap();
    assert_eq!(fixture.remote.entries().len(), 1);
    assert!(!fixture.repo.needs_sync(fixture.show_id, Duration::hours(1)).unwrap());
  }

  #[tokio::test]
  async fn test_pull_keeps_watch_pending_delete() {
    let fixture = Fixture::online();
    fixture.remote.record(501, testing::start_time());
    fixture.repo.sync_show(fixture.show_id).await.unwrap();

    let watch = fixture.all_watches()[0].local_id;
    fixture.repo.remove_watch(watch).await.unwrap();

    let show = fixture
      .db
      .read(|tx| tx.get::<Show>(fixture.show_id))
      .unwrap()
      .unwrap();
    let result = fixture.repo.pull(&show).await.unwrap();
    assert_eq!(result.updated.len(), 1);

    let watches = fixture.all_watches();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].local_id, watch);
    assert_eq!(watches[0].pending_action, PendingAction::Delete);
  }

  #[tokio::test]
  async fn test_other_shows_are_left_alone() {
    let fixture = Fixture::online();
    let other_show = PlaceholderResolver::new(fixture.db.clone())
      .get_or_create_key::<Show>(&99)
      .unwrap();
    let other_episode = fixture
      .repo
      .ensure_episode(
        other_show,
        &RemoteEpisode {
          trakt_id: 901,
          season: None,
          number: None,
          title: None,
        },
      )
      .unwrap();
    fixture
      .repo
      .add_watch(other_episode, testing::start_time())
      .await
      .unwrap();

    fixture.repo.sync_show(fixture.show_id).await.unwrap();
    assert_eq!(fixture.remote.add_calls.load(Ordering::SeqCst), 0);
    let watches = fixture.repo.watches_for_episode(other_episode).unwrap();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].pending_action, PendingAction::Upload);
  }

  #[tokio::test]
  async fn test_signed_out_delete_drops_pulled_watch_locally() {
    let fixture = Fixture::online();
    fixture.remote.record(501, testing::start_time());
    fixture.repo.sync_show(fixture.show_id).await.unwrap();

    fixture.auth.0.store(false, Ordering::SeqCst);
    let watch = fixture.all_watches()[0].local_id;
    fixture.repo.remove_watch(watch).await.unwrap();
    fixture.repo.sync_show(fixture.show_id).await.unwrap();

    assert!(fixture.all_watches().is_empty());
    assert_eq!(fixture.remote.remove_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fixture.remote.entries().len(), 1);
  }

  #[tokio::test]
  async fn test_sync_of_unknown_show_fails() {
    let fixture = Fixture::online();
    let err = fixture.repo.sync_show(LocalId(404)).await.unwrap_err();
    assert!(matches!(
      err,
      SyncError::Store(StoreError::Missing {
        entity_type: "show",
        ..
      })
    ));
  }
}
