//! Offline-first cache and sync engine for followed TV shows.
//!
//! The local SQLite store is the source of truth for reads. Remote services
//! refresh it through [`cache::CacheAsideStore`] and the outboxes in
//! [`followed::FollowedShowsRepository`] and [`watches::EpisodeWatchesRepository`].

pub mod app;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod followed;
pub mod logging;
pub mod remote;
pub mod sync;
pub mod watches;

#[cfg(test)]
mod testing;
