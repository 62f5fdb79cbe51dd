//! Serde types matching the show service's JSON.
//!
//! Kept apart from the entity types so the wire format can drift without
//! touching what is stored locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ListMember, NewWatch, RemoteEpisode, RemoteWatch};
use crate::entity::{LocalId, Show};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiIds {
  pub trakt: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub slug: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tmdb: Option<u64>,
}

// ============================================================================
// Shows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiShow {
  pub title: Option<String>,
  #[serde(default)]
  pub ids: ApiIds,
  pub overview: Option<String>,
  pub first_aired: Option<DateTime<Utc>>,
  pub runtime: Option<u32>,
  pub certification: Option<String>,
  pub network: Option<String>,
  pub country: Option<String>,
  pub homepage: Option<String>,
  pub status: Option<String>,
  pub rating: Option<f32>,
  pub genres: Option<Vec<String>>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl ApiShow {
  /// Convert to a [`Show`]. Shows without a Trakt id are unusable.
  pub fn into_show(self) -> Option<Show> {
    let trakt_id = self.ids.trakt?;
    Some(Show {
      local_id: LocalId::UNSET,
      trakt_id,
      tmdb_id: self.ids.tmdb,
      title: self.title,
      original_title: None,
      summary: self.overview,
      homepage: self.homepage,
      network: self.network,
      certification: self.certification,
      runtime: self.runtime,
      country: self.country,
      first_aired: self.first_aired,
      genres: self.genres,
      status: self.status,
      trakt_rating: self.rating,
      trakt_data_update: self.updated_at,
    })
  }
}

// ============================================================================
// Lists
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiList {
  pub name: Option<String>,
  #[serde(default)]
  pub ids: ApiIds,
}

#[derive(Debug, Deserialize)]
pub struct ApiListItem {
  pub listed_at: Option<DateTime<Utc>>,
  pub show: Option<ApiShow>,
}

impl ApiListItem {
  pub fn into_member(self) -> Option<ListMember> {
    Some(ListMember {
      show: self.show?.into_show()?,
      listed_at: self.listed_at,
    })
  }
}

/// Body of the add/remove list items endpoints.
#[derive(Debug, Serialize)]
pub struct ApiMembersBody {
  pub shows: Vec<ApiShowRef>,
}

#[derive(Debug, Serialize)]
pub struct ApiShowRef {
  pub ids: ApiIds,
}

impl ApiMembersBody {
  pub fn from_keys(keys: &[u64]) -> Self {
    Self {
      shows: keys
        .iter()
        .map(|key| ApiShowRef {
          ids: ApiIds {
            trakt: Some(*key),
            ..ApiIds::default()
          },
        })
        .collect(),
    }
  }
}

// ============================================================================
// Watch history
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiEpisode {
  pub season: Option<u32>,
  pub number: Option<u32>,
  pub title: Option<String>,
  #[serde(default)]
  pub ids: ApiIds,
}

impl ApiEpisode {
  pub fn into_episode(self) -> Option<RemoteEpisode> {
    Some(RemoteEpisode {
      trakt_id: self.ids.trakt?,
      season: self.season,
      number: self.number,
      title: self.title,
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiHistoryItem {
  pub id: Option<u64>,
  pub watched_at: Option<DateTime<Utc>>,
  pub episode: Option<ApiEpisode>,
}

impl ApiHistoryItem {
  /// `None` for entries that are not episode watches.
  pub fn into_watch(self) -> Option<RemoteWatch> {
    Some(RemoteWatch {
      history_id: self.id?,
      watched_at: self.watched_at?,
      episode: self.episode?.into_episode()?,
    })
  }
}

/// Body of the add-to-history endpoint.
#[derive(Debug, Serialize)]
pub struct ApiHistoryBody {
  pub episodes: Vec<ApiEpisodeWatch>,
}

#[derive(Debug, Serialize)]
pub struct ApiEpisodeWatch {
  pub watched_at: DateTime<Utc>,
  pub ids: ApiIds,
}

impl ApiHistoryBody {
  pub fn from_watches(watches: &[NewWatch]) -> Self {
    Self {
      episodes: watches
        .iter()
        .map(|watch| ApiEpisodeWatch {
          watched_at: watch.watched_at,
          ids: ApiIds {
            trakt: Some(watch.episode),
            ..ApiIds::default()
          },
        })
        .collect(),
    }
  }
}

/// Body of the remove-from-history endpoint.
#[derive(Debug, Serialize)]
pub struct ApiHistoryRemoveBody {
  pub ids: Vec<u64>,
}
