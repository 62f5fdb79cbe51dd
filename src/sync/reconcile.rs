//! Diff a local collection against a freshly fetched remote one.
//!
//! [`reconcile`] is pure: it pairs records by stable key and decides what to
//! insert, update and delete. [`Reconciliation::apply`] then writes the plan
//! through any [`ApplyChanges`] sink, typically an open [`Tx`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, warn};

use crate::db::Tx;
use crate::entity::{Entity, LocalId, Merge};
use crate::error::StoreError;

/// Keys touched by one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult<K> {
  pub added: Vec<K>,
  pub updated: Vec<K>,
  pub removed: Vec<K>,
}

impl<K> Default for SyncResult<K> {
  fn default() -> Self {
    Self {
      added: Vec::new(),
      updated: Vec::new(),
      removed: Vec::new(),
    }
  }
}

impl<K> SyncResult<K> {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
  /// Delete local records whose key is absent remotely.
  pub remove_unmatched: bool,
}

impl Default for ReconcileOptions {
  fn default() -> Self {
    Self {
      remove_unmatched: true,
    }
  }
}

/// A matched record: the merged value and what is stored today.
#[derive(Debug, Clone)]
pub struct Update<E> {
  pub merged: E,
  pub existing: E,
}

/// The write plan produced by [`reconcile`].
#[derive(Debug, Clone)]
pub struct Reconciliation<E, K> {
  inserts: Vec<(K, E)>,
  updates: Vec<(K, Update<E>)>,
  deletes: Vec<(K, E)>,
}

/// Destination of a reconciliation's writes.
pub trait ApplyChanges<E> {
  type Error;

  fn insert(&self, entity: &E) -> Result<(), Self::Error>;

  fn update(&self, entity: &E) -> Result<(), Self::Error>;

  fn delete(&self, entity: &E) -> Result<(), Self::Error>;
}

impl<E: Entity> ApplyChanges<E> for Tx<'_> {
  type Error = StoreError;

  fn insert(&self, entity: &E) -> Result<(), StoreError> {
    Tx::insert(self, entity).map(|_| ())
  }

  fn update(&self, entity: &E) -> Result<(), StoreError> {
    self.upsert(entity).map(|_| ())
  }

  fn delete(&self, entity: &E) -> Result<(), StoreError> {
    Tx::delete::<E>(self, entity.local_id()).map(|_| ())
  }
}

/// Reconcile with the default options.
pub fn reconcile<E, R, K>(
  local: Vec<E>,
  remote: Vec<R>,
  local_key: impl Fn(&E) -> K,
  remote_key: impl Fn(&R) -> K,
  merge: impl Fn(R, Option<&E>) -> E,
) -> Reconciliation<E, K>
where
  E: Entity,
  K: Clone + Eq + Hash + Debug,
{
  reconcile_with(
    ReconcileOptions::default(),
    local,
    remote,
    local_key,
    remote_key,
    merge,
  )
}

/// Reconcile two collections of the same entity type using its [`Merge`] impl.
pub fn reconcile_entities<E: Entity + Merge>(
  local: Vec<E>,
  remote: Vec<E>,
) -> Reconciliation<E, E::Key> {
  reconcile(local, remote, E::stable_key, E::stable_key, E::merge)
}

pub fn reconcile_with<E, R, K>(
  options: ReconcileOptions,
  local: Vec<E>,
  remote: Vec<R>,
  local_key: impl Fn(&E) -> K,
  remote_key: impl Fn(&R) -> K,
  merge: impl Fn(R, Option<&E>) -> E,
) -> Reconciliation<E, K>
where
  E: Entity,
  K: Clone + Eq + Hash + Debug,
{
  let mut deletes = Vec::new();

  // Index local records. A repeated key should be impossible given the
  // unique constraint; keep the first row and drop the rest.
  let mut local_index: HashMap<K, usize> = HashMap::with_capacity(local.len());
  let mut locals: Vec<Option<(K, E)>> = Vec::with_capacity(local.len());
  for entity in local {
    let key = local_key(&entity);
    if local_index.contains_key(&key) {
      warn!(?key, local_id = %entity.local_id(), "duplicate local key, scheduling delete");
      deletes.push((key, entity));
      continue;
    }
    local_index.insert(key.clone(), locals.len());
    locals.push(Some((key, entity)));
  }

  // Collapse repeated remote keys, last occurrence wins.
  let mut remote_index: HashMap<K, usize> = HashMap::with_capacity(remote.len());
  let mut remotes: Vec<(K, R)> = Vec::with_capacity(remote.len());
  for entity in remote {
    let key = remote_key(&entity);
    match remote_index.get(&key) {
      Some(&i) => {
        warn!(?key, "duplicate key in remote collection, keeping the last one");
        remotes[i].1 = entity;
      }
      None => {
        remote_index.insert(key.clone(), remotes.len());
        remotes.push((key, entity));
      }
    }
  }

  let mut inserts = Vec::new();
  let mut updates = Vec::new();

  for (key, remote) in remotes {
    let existing = local_index
      .get(&key)
      .and_then(|&i| locals[i].take())
      .map(|(_, existing)| existing);

    match existing {
      Some(existing) => {
        let mut merged = merge(remote, Some(&existing));
        merged.set_local_id(existing.local_id());
        updates.push((key, Update { merged, existing }));
      }
      None => {
        let mut merged = merge(remote, None);
        merged.set_local_id(LocalId::UNSET);
        inserts.push((key, merged));
      }
    }
  }

  if options.remove_unmatched {
    deletes.extend(locals.into_iter().flatten());
  }

  debug!(
    inserts = inserts.len(),
    updates = updates.len(),
    deletes = deletes.len(),
    "reconciled collections"
  );

  Reconciliation {
    inserts,
    updates,
    deletes,
  }
}

impl<E, K: Clone> Reconciliation<E, K> {
  pub fn inserts(&self) -> impl Iterator<Item = &E> {
    self.inserts.iter().map(|(_, e)| e)
  }

  pub fn updates(&self) -> impl Iterator<Item = &Update<E>> {
    self.updates.iter().map(|(_, u)| u)
  }

  pub fn deletes(&self) -> impl Iterator<Item = &E> {
    self.deletes.iter().map(|(_, e)| e)
  }

  /// Keep only the deletions for which `keep` returns `true`.
  pub fn retain_deletions(mut self, keep: impl Fn(&E) -> bool) -> Self {
    self.deletes.retain(|(_, e)| keep(e));
    self
  }

  pub fn result(&self) -> SyncResult<K> {
    SyncResult {
      added: self.inserts.iter().map(|(k, _)| k.clone()).collect(),
      updated: self.updates.iter().map(|(k, _)| k.clone()).collect(),
      removed: self.deletes.iter().map(|(k, _)| k.clone()).collect(),
    }
  }

  /// Write the plan: inserts, then updates, then deletes.
  ///
  /// Updates whose merged value equals the stored one are not rewritten but
  /// are still reported as updated.
  pub fn apply<S>(self, sink: &S) -> Result<SyncResult<K>, S::Error>
  where
    S: ApplyChanges<E>,
    E: PartialEq,
  {
    let result = self.result();

    for (_, entity) in &self.inserts {
      sink.insert(entity)?;
    }
    for (_, update) in &self.updates {
      if update.merged != update.existing {
        sink.update(&update.merged)?;
      }
    }
    for (_, entity) in &self.deletes {
      sink.delete(entity)?;
    }

    Ok(result)
  }
}
