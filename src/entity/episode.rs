use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Entity, LocalId, Merge, Outboxed, PendingAction};

/// An episode of a locally known show, keyed remotely by its Trakt id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
  #[serde(default)]
  pub local_id: LocalId,
  pub trakt_id: u64,
  pub show_id: LocalId,
  pub season: Option<u32>,
  pub number: Option<u32>,
  pub title: Option<String>,
}

impl Entity for Episode {
  type Key = u64;

  fn entity_type() -> &'static str {
    "episode"
  }

  fn local_id(&self) -> LocalId {
    self.local_id
  }

  fn set_local_id(&mut self, id: LocalId) {
    self.local_id = id;
  }

  fn stable_key(&self) -> u64 {
    self.trakt_id
  }
}

impl Merge for Episode {
  fn merge(remote: Self, existing: Option<&Self>) -> Self {
    let Some(local) = existing else {
      return Self {
        local_id: LocalId::UNSET,
        ..remote
      };
    };

    Self {
      local_id: local.local_id,
      trakt_id: remote.trakt_id,
      show_id: if remote.show_id.is_set() {
        remote.show_id
      } else {
        local.show_id
      },
      season: remote.season.or(local.season),
      number: remote.number.or(local.number),
      title: remote.title.or_else(|| local.title.clone()),
    }
  }
}

/// Stable key of a watch.
///
/// Watches created locally have no remote id until a pull brings them back,
/// so until then they are keyed by episode and time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
  /// Remote history id.
  Remote(u64),
  Local {
    episode_id: LocalId,
    /// Milliseconds since the epoch.
    watched_at: i64,
  },
}

impl fmt::Display for WatchKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Remote(id) => write!(f, "{}", id),
      Self::Local {
        episode_id,
        watched_at,
      } => write!(f, "local:{}@{}", episode_id, watched_at),
    }
  }
}

/// One viewing of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeWatchEntry {
  #[serde(default)]
  pub local_id: LocalId,
  pub episode_id: LocalId,
  /// Remote history id, unknown for watches not yet pulled back.
  pub trakt_id: Option<u64>,
  pub watched_at: DateTime<Utc>,
  #[serde(default)]
  pub pending_action: PendingAction,
}

impl EpisodeWatchEntry {
  /// A watch recorded on this device, waiting to be uploaded.
  pub fn local(episode_id: LocalId, watched_at: DateTime<Utc>) -> Self {
    Self {
      local_id: LocalId::UNSET,
      episode_id,
      trakt_id: None,
      watched_at,
      pending_action: PendingAction::Upload,
    }
  }

  /// A watch as reported by the remote history.
  pub fn remote(episode_id: LocalId, history_id: u64, watched_at: DateTime<Utc>) -> Self {
    Self {
      local_id: LocalId::UNSET,
      episode_id,
      trakt_id: Some(history_id),
      watched_at,
      pending_action: PendingAction::None,
    }
  }

  pub fn is_active(&self) -> bool {
    self.pending_action != PendingAction::Delete
  }
}

impl Entity for EpisodeWatchEntry {
  type Key = WatchKey;

  fn entity_type() -> &'static str {
    "episode_watch"
  }

  fn local_id(&self) -> LocalId {
    self.local_id
  }

  fn set_local_id(&mut self, id: LocalId) {
    self.local_id = id;
  }

  fn stable_key(&self) -> WatchKey {
    match self.trakt_id {
      Some(id) => WatchKey::Remote(id),
      None => WatchKey::Local {
        episode_id: self.episode_id,
        watched_at: self.watched_at.timestamp_millis(),
      },
    }
  }

  fn pending_action(&self) -> PendingAction {
    self.pending_action
  }
}

impl Outboxed for EpisodeWatchEntry {
  fn set_pending_action(&mut self, action: PendingAction) {
    self.pending_action = action;
  }
}

impl Merge for EpisodeWatchEntry {
  /// The remote history owns the watch itself; the pending action is local.
  fn merge(remote: Self, existing: Option<&Self>) -> Self {
    match existing {
      Some(local) => Self {
        local_id: local.local_id,
        trakt_id: remote.trakt_id.or(local.trakt_id),
        pending_action: local.pending_action,
        ..remote
      },
      None => Self {
        local_id: LocalId::UNSET,
        pending_action: PendingAction::None,
        ..remote
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_watch_key_follows_remote_id() {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let local = EpisodeWatchEntry::local(LocalId(4), at);
    assert_eq!(
      local.stable_key(),
      WatchKey::Local {
        episode_id: LocalId(4),
        watched_at: at.timestamp_millis()
      }
    );
    assert_eq!(local.stable_key().to_string(), "local:4@1704164645000");

    let pulled = EpisodeWatchEntry::remote(LocalId(4), 900, at);
    assert_eq!(pulled.stable_key(), WatchKey::Remote(900));
    assert_eq!(pulled.stable_key().to_string(), "900");
  }

  #[test]
  fn test_merge_keeps_pending_delete() {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let local = EpisodeWatchEntry {
      local_id: LocalId(8),
      pending_action: PendingAction::Delete,
      ..EpisodeWatchEntry::remote(LocalId(4), 900, at)
    };

    let remote = EpisodeWatchEntry::remote(LocalId(4), 900, at);
    let merged = EpisodeWatchEntry::merge(remote, Some(&local));
    assert_eq!(merged.local_id, LocalId(8));
    assert_eq!(merged.pending_action, PendingAction::Delete);
  }

  #[test]
  fn test_episode_merge_keeps_known_fields() {
    let local = Episode {
      local_id: LocalId(2),
      trakt_id: 77,
      show_id: LocalId(1),
      season: Some(1),
      number: Some(3),
      title: Some("Pilot".into()),
    };
    let remote = Episode {
      trakt_id: 77,
      ..Episode::default()
    };

    let merged = Episode::merge(remote, Some(&local));
    assert_eq!(merged, local);
  }
}
