use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, LocalId, Merge, Placeholder};

/// A TV show, keyed remotely by its Trakt id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Show {
  #[serde(default)]
  pub local_id: LocalId,
  pub trakt_id: u64,
  pub tmdb_id: Option<u64>,
  pub title: Option<String>,
  pub original_title: Option<String>,
  pub summary: Option<String>,
  pub homepage: Option<String>,
  pub network: Option<String>,
  pub certification: Option<String>,
  pub runtime: Option<u32>,
  pub country: Option<String>,
  pub first_aired: Option<DateTime<Utc>>,
  pub genres: Option<Vec<String>>,
  pub status: Option<String>,
  pub trakt_rating: Option<f32>,
  pub trakt_data_update: Option<DateTime<Utc>>,
}

impl Entity for Show {
  type Key = u64;

  fn entity_type() -> &'static str {
    "show"
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

impl Placeholder for Show {
  fn placeholder(key: &u64) -> Self {
    Self {
      trakt_id: *key,
      ..Self::default()
    }
  }
}

impl Merge for Show {
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
      tmdb_id: remote.tmdb_id.or(local.tmdb_id),
      title: remote.title.or_else(|| local.title.clone()),
      original_title: remote
        .original_title
        .or_else(|| local.original_title.clone()),
      summary: remote.summary.or_else(|| local.summary.clone()),
      homepage: remote.homepage.or_else(|| local.homepage.clone()),
      network: remote.network.or_else(|| local.network.clone()),
      certification: remote
        .certification
        .or_else(|| local.certification.clone()),
      runtime: remote.runtime.or(local.runtime),
      country: remote.country.or_else(|| local.country.clone()),
      first_aired: remote.first_aired.or(local.first_aired),
      genres: remote.genres.or_else(|| local.genres.clone()),
      status: remote.status.or_else(|| local.status.clone()),
      trakt_rating: remote.trakt_rating.or(local.trakt_rating),
      trakt_data_update: remote.trakt_data_update.or(local.trakt_data_update),
    }
  }
}
