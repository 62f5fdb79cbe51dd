//! In-process fakes shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

use crate::auth::AuthState;
use crate::clock::ManualClock;
use crate::entity::Show;
use crate::error::RemoteError;
use crate::remote::{
  ListHandle, ListMember, NewWatch, RemoteEntityService, RemoteEpisode, RemoteListService,
  RemoteWatch, RemoteWatchService,
};

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn clock() -> ManualClock {
  ManualClock::new(start_time())
}

/// Count a call, then fail it if `flag` is set.
fn check(flag: &AtomicBool, calls: &AtomicUsize) -> Result<(), RemoteError> {
  calls.fetch_add(1, Ordering::SeqCst);
  if flag.load(Ordering::SeqCst) {
    Err(RemoteError::Network("simulated outage".into()))
  } else {
    Ok(())
  }
}

async fn wait_for(calls: &AtomicUsize, n: usize) {
  while calls.load(Ordering::SeqCst) < n {
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
  }
}

/// Show source answering `Show {id} from {name}` for every id.
pub struct FakeShowSource {
  name: String,
  error: Option<RemoteError>,
  calls: AtomicUsize,
  gate: Option<watch::Sender<bool>>,
  answer: Option<u64>,
}

impl FakeShowSource {
  pub fn ok(name: &str) -> Self {
    Self {
      name: name.into(),
      error: None,
      calls: AtomicUsize::new(0),
      gate: None,
      answer: None,
    }
  }

  pub fn failing(name: &str, error: RemoteError) -> Self {
    Self {
      error: Some(error),
      ..Self::ok(name)
    }
  }

  /// A source whose fetches block until [`FakeShowSource::release`].
  pub fn gated(name: &str) -> Self {
    let (gate, _) = watch::channel(false);
    Self {
      gate: Some(gate),
      ..Self::ok(name)
    }
  }

  /// A source that answers every request with show `key`.
  pub fn answering(name: &str, key: u64) -> Self {
    Self {
      answer: Some(key),
      ..Self::ok(name)
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub async fn wait_for_calls(&self, n: usize) {
    wait_for(&self.calls, n).await;
  }

  pub fn release(&self) {
    if let Some(gate) = &self.gate {
      gate.send_replace(true);
    }
  }
}

#[async_trait]
impl RemoteEntityService<Show> for FakeShowSource {
  fn name(&self) -> &str {
    &self.name
  }

  async fn fetch(&self, key: &u64) -> Result<Show, RemoteError> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if let Some(gate) = &self.gate {
      let mut rx = gate.subscribe();
      let _ = rx.wait_for(|open| *open).await;
    }

    let key = self.answer.unwrap_or(*key);
    match &self.error {
      Some(e) => Err(e.clone()),
      None => Ok(Show {
        trakt_id: key,
        title: Some(format!("Show {} from {}", key, self.name)),
        ..Show::default()
      }),
    }
  }
}

/// Remote list held in memory, with switchable failures.
pub struct FakeList {
  members: Mutex<BTreeMap<u64, Option<DateTime<Utc>>>>,
  pub fail_handle: AtomicBool,
  pub fail_add: AtomicBool,
  pub fail_remove: AtomicBool,
  pub fail_fetch: AtomicBool,
  pub handle_calls: AtomicUsize,
  pub add_calls: AtomicUsize,
  pub remove_calls: AtomicUsize,
  pub fetch_calls: AtomicUsize,
  add_gate: Option<watch::Sender<bool>>,
}

impl FakeList {
  pub fn new() -> Self {
    Self {
      members: Mutex::new(BTreeMap::new()),
      fail_handle: AtomicBool::new(false),
      fail_add: AtomicBool::new(false),
      fail_remove: AtomicBool::new(false),
      fail_fetch: AtomicBool::new(false),
      handle_calls: AtomicUsize::new(0),
      add_calls: AtomicUsize::new(0),
      remove_calls: AtomicUsize::new(0),
      fetch_calls: AtomicUsize::new(0),
      add_gate: None,
    }
  }

  /// A list whose `add_members` calls block until [`FakeList::release`].
  pub fn gated() -> Self {
    let (gate, _) = watch::channel(false);
    Self {
      add_gate: Some(gate),
      ..Self::new()
    }
  }

  pub fn release(&self) {
    if let Some(gate) = &self.add_gate {
      gate.send_replace(true);
    }
  }

  pub async fn wait_for_adds(&self, n: usize) {
    wait_for(&self.add_calls, n).await;
  }

  pub fn with_members(keys: &[u64]) -> Self {
    let list = Self::new();
    for key in keys {
      list.insert(*key, None);
    }
    list
  }

  pub fn insert(&self, key: u64, listed_at: Option<DateTime<Utc>>) {
    self.members.lock().unwrap().insert(key, listed_at);
  }

  pub fn keys(&self) -> Vec<u64> {
    self.members.lock().unwrap().keys().copied().collect()
  }

  pub fn remove(&self, key: u64) {
    self.members.lock().unwrap().remove(&key);
  }
}

#[async_trait]
impl RemoteListService for FakeList {
  async fn list_handle(&self) -> Result<ListHandle, RemoteError> {
    check(&self.fail_handle, &self.handle_calls)?;
    Ok(ListHandle(42))
  }

  async fn add_members(&self, _handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError> {
    check(&self.fail_add, &self.add_calls)?;
    if let Some(gate) = &self.add_gate {
      let mut rx = gate.subscribe();
      let _ = rx.wait_for(|open| *open).await;
    }
    let mut members = self.members.lock().unwrap();
    for key in keys {
      members.entry(*key).or_insert(Some(start_time()));
    }
    Ok(())
  }

  async fn remove_members(&self, _handle: ListHandle, keys: &[u64]) -> Result<(), RemoteError> {
    check(&self.fail_remove, &self.remove_calls)?;
    let mut members = self.members.lock().unwrap();
    for key in keys {
      members.remove(key);
    }
    Ok(())
  }

  async fn fetch_members(&self, _handle: ListHandle) -> Result<Vec<ListMember>, RemoteError> {
    check(&self.fail_fetch, &self.fetch_calls)?;
    let members = self.members.lock().unwrap();
    Ok(
      members
        .iter()
        .map(|(key, listed_at)| ListMember {
          show: Show {
            trakt_id: *key,
            title: Some(format!("Listed {}", key)),
            ..Show::default()
          },
          listed_at: *listed_at,
        })
        .collect(),
    )
  }
}

/// Watch history of a single show, held in memory.
pub struct FakeWatches {
  show: u64,
  history: Mutex<BTreeMap<u64, RemoteWatch>>,
  next_id: AtomicU64,
  pub fail_add: AtomicBool,
  pub fail_remove: AtomicBool,
  pub fail_fetch: AtomicBool,
  pub add_calls: AtomicUsize,
  pub remove_calls: AtomicUsize,
  pub fetch_calls: AtomicUsize,
}

impl FakeWatches {
  pub fn new(show: u64) -> Self {
    Self {
      show,
      history: Mutex::new(BTreeMap::new()),
      next_id: AtomicU64::new(3000),
      fail_add: AtomicBool::new(false),
      fail_remove: AtomicBool::new(false),
      fail_fetch: AtomicBool::new(false),
      add_calls: AtomicUsize::new(0),
      remove_calls: AtomicUsize::new(0),
      fetch_calls: AtomicUsize::new(0),
    }
  }

  /// Add a watch as if made on another device. Returns its history id.
  pub fn record(&self, episode: u64, watched_at: DateTime<Utc>) -> u64 {
    let history_id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let watch = RemoteWatch {
      history_id,
      episode: RemoteEpisode {
        trakt_id: episode,
        season: Some(1),
        number: None,
        title: None,
      },
      watched_at,
    };
    self.history.lock().unwrap().insert(history_id, watch);
    history_id
  }

  /// (history id, episode key) pairs, oldest first.
  pub fn entries(&self) -> Vec<(u64, u64)> {
    let history = self.history.lock().unwrap();
    history
      .values()
      .map(|watch| (watch.history_id, watch.episode.trakt_id))
      .collect()
  }
}

#[async_trait]
impl RemoteWatchService for FakeWatches {
  async fn fetch_show_watches(&self, show: u64) -> Result<Vec<RemoteWatch>, RemoteError> {
    check(&self.fail_fetch, &self.fetch_calls)?;
    if show != self.show {
      return Ok(Vec::new());
    }
    Ok(self.history.lock().unwrap().values().cloned().collect())
  }

  async fn add_watches(&self, watches: &[NewWatch]) -> Result<(), RemoteError> {
    check(&self.fail_add, &self.add_calls)?;
    for watch in watches {
      self.record(watch.episode, watch.watched_at);
    }
    Ok(())
  }

  async fn remove_watches(&self, history_ids: &[u64]) -> Result<(), RemoteError> {
    check(&self.fail_remove, &self.remove_calls)?;
    let mut history = self.history.lock().unwrap();
    for id in history_ids {
      history.remove(id);
    }
    Ok(())
  }
}

/// Authentication flag flipped by tests.
pub struct FakeAuth(pub AtomicBool);

impl FakeAuth {
  pub fn signed_in() -> Self {
    Self(AtomicBool::new(true))
  }

  pub fn signed_out() -> Self {
    Self(AtomicBool::new(false))
  }
}

impl AuthState for FakeAuth {
  fn is_authenticated(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}
