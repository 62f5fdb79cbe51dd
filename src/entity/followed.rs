use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, LocalId, Merge, Outboxed, PendingAction};

/// Membership of a show in the user's followed list.
///
/// Keyed by the show's local id: a show is followed at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowedShowEntry {
  #[serde(default)]
  pub local_id: LocalId,
  pub show_id: LocalId,
  pub followed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub pending_action: PendingAction,
}

impl FollowedShowEntry {
  /// An entry as reported by the remote list.
  pub fn remote(show_id: LocalId, listed_at: Option<DateTime<Utc>>) -> Self {
    Self {
      local_id: LocalId::UNSET,
      show_id,
      followed_at: listed_at,
      pending_action: PendingAction::None,
    }
  }

  /// Whether the user currently considers the show followed.
  pub fn is_active(&self) -> bool {
    self.pending_action != PendingAction::Delete
  }
}

impl Entity for FollowedShowEntry {
  type Key = LocalId;

  fn entity_type() -> &'static str {
    "followed_show"
  }

  fn local_id(&self) -> LocalId {
    self.local_id
  }

  fn set_local_id(&mut self, id: LocalId) {
    self.local_id = id;
  }

  fn stable_key(&self) -> LocalId {
    self.show_id
  }

  fn pending_action(&self) -> PendingAction {
    self.pending_action
  }
}

impl Outboxed for FollowedShowEntry {
  fn set_pending_action(&mut self, action: PendingAction) {
    self.pending_action = action;
  }
}

impl Merge for FollowedShowEntry {
  /// The remote list owns membership and the listing time; the pending
  /// action is local state and always survives a pull.
  fn merge(remote: Self, existing: Option<&Self>) -> Self {
    match existing {
      Some(local) => Self {
        local_id: local.local_id,
        show_id: remote.show_id,
        followed_at: remote.followed_at.or(local.followed_at),
        pending_action: local.pending_action,
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
  fn test_merge_keeps_pending_action_and_followed_at() {
    let followed_at = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
    let local = FollowedShowEntry {
      local_id: LocalId(3),
      show_id: LocalId(10),
      followed_at: Some(followed_at),
      pending_action: PendingAction::Delete,
    };

    let remote = FollowedShowEntry::remote(LocalId(10), None);
    let merged = FollowedShowEntry::merge(remote, Some(&local));
    assert_eq!(merged.local_id, LocalId(3));
    assert_eq!(merged.followed_at, Some(followed_at));
    assert_eq!(merged.pending_action, PendingAction::Delete);
  }
}
