//! Read-through caching over the local database.
//!
//! - [`StalenessTracker`] remembers when each (request kind, entity) pair was
//!   last fetched successfully
//! - [`CacheAsideStore`] serves local values and refreshes them from remote
//!   sources once they go stale

mod staleness;
mod store;

pub use staleness::{RequestKind, StalenessTracker};
pub use store::CacheAsideStore;
