//! Entity model shared by the cache, the reconciler and the outbox.
//!
//! Every persisted record carries two identities:
//! - a [`LocalId`] assigned by the database on first insert and never reused
//! - a stable key meaningful to the remote service (e.g. a Trakt show id)

mod episode;
mod followed;
mod show;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

pub use episode::{Episode, EpisodeWatchEntry, WatchKey};
pub use followed::FollowedShowEntry;
pub use show::Show;

/// Database-assigned identity. `0` means "not yet persisted".
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl LocalId {
  pub const UNSET: LocalId = LocalId(0);

  pub fn is_set(self) -> bool {
    self.0 != 0
  }
}

impl fmt::Display for LocalId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Optimistic local mutation waiting to be pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
  #[default]
  None,
  Upload,
  Delete,
}

impl PendingAction {
  pub fn as_i64(self) -> i64 {
    match self {
      Self::None => 0,
      Self::Upload => 1,
      Self::Delete => 2,
    }
  }

  pub fn from_i64(value: i64) -> Option<Self> {
    match value {
      0 => Some(Self::None),
      1 => Some(Self::Upload),
      2 => Some(Self::Delete),
      _ => None,
    }
  }
}

/// A record that can be persisted in the local store.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Externally meaningful identifier, unique per entity type.
  type Key: Clone + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

  /// Storage namespace (e.g. "show").
  fn entity_type() -> &'static str;

  fn local_id(&self) -> LocalId;

  fn set_local_id(&mut self, id: LocalId);

  fn stable_key(&self) -> Self::Key;

  fn pending_action(&self) -> PendingAction {
    PendingAction::None
  }
}

/// Entities managed through the outbox.
pub trait Outboxed: Entity {
  fn set_pending_action(&mut self, action: PendingAction);
}

/// Explicit per-type merge of a freshly fetched value into the stored one.
///
/// Implementations enumerate the fields the remote side may override. The
/// result always carries the existing local id.
pub trait Merge: Entity {
  fn merge(remote: Self, existing: Option<&Self>) -> Self;
}

/// Entities that can be created from their stable key alone.
pub trait Placeholder: Entity {
  fn placeholder(key: &Self::Key) -> Self;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_pending_action_round_trips_through_column_value() {
    for action in [
      PendingAction::None,
      PendingAction::Upload,
      PendingAction::Delete,
    ] {
      assert_eq!(PendingAction::from_i64(action.as_i64()), Some(action));
    }
    assert_eq!(PendingAction::from_i64(7), None);
  }

  #[test]
  fn test_unset_local_id() {
    assert!(!LocalId::UNSET.is_set());
    assert!(LocalId(3).is_set());
  }
}
