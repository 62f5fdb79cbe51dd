//! Building blocks for keeping local collections in step with a remote.

pub mod placeholder;
pub mod reconcile;

pub use placeholder::{PlaceholderResolver, MAX_ATTEMPTS};
pub use reconcile::{
  reconcile, reconcile_entities, reconcile_with, ApplyChanges, ReconcileOptions, Reconciliation,
  SyncResult, Update,
};
