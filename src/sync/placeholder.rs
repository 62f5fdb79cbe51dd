//! Get-or-create local identities for remotely referenced entities.

use std::sync::Arc;
use tracing::debug;

use crate::db::{Database, Tx};
use crate::entity::{LocalId, Placeholder};
use crate::error::StoreError;

/// Attempts before a persistent unique-constraint race is reported.
pub const MAX_ATTEMPTS: usize = 3;

/// Mints local ids for entities known only by their stable key.
///
/// A placeholder row holds the key and defaults. It is later overwritten in
/// place by a richer write, so the local id stays valid for anything that
/// references it.
pub struct PlaceholderResolver {
  db: Arc<Database>,
}

impl PlaceholderResolver {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Local id for `remote`'s stable key. Existing rows are never overwritten.
  pub fn get_or_create<E: Placeholder>(&self, remote: &E) -> Result<LocalId, StoreError> {
    self.get_or_create_key::<E>(&remote.stable_key())
  }

  pub fn get_or_create_key<E: Placeholder>(&self, key: &E::Key) -> Result<LocalId, StoreError> {
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.db.transaction(|tx| resolve_in::<E>(tx, key)) {
        Err(StoreError::Conflict { .. }) if attempt < MAX_ATTEMPTS => {
          debug!(
            entity_type = E::entity_type(),
            %key,
            attempt,
            "placeholder insert raced, retrying"
          );
        }
        result => return result,
      }
    }
  }
}

/// Resolve `key` inside an open transaction.
///
/// Used by callers that need the id and their own writes to commit together.
pub fn resolve_in<E: Placeholder>(tx: &Tx<'_>, key: &E::Key) -> Result<LocalId, StoreError> {
  if let Some(id) = tx.id_for_key::<E>(key)? {
    return Ok(id);
  }

  match tx.insert(&E::placeholder(key)) {
    Ok(id) => {
      debug!(entity_type = E::entity_type(), %key, local_id = %id, "inserted placeholder");
      Ok(id)
    }
    // Someone else won the insert; use their row.
    Err(StoreError::Conflict { .. }) => match tx.id_for_key::<E>(key)? {
      Some(id) => Ok(id),
      None => Err(StoreError::Conflict {
        entity_type: E::entity_type(),
        key: key.to_string(),
      }),
    },
    Err(e) => Err(e),
  }
}
