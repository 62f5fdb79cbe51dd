use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthState, TokenAuth};
use crate::cache::{CacheAsideStore, RequestKind, StalenessTracker};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::entity::Show;
use crate::followed::FollowedShowsRepository;
use crate::remote::http::{HttpClient, HttpListService, HttpShowSource, HttpWatchService};
use crate::remote::{RemoteEntityService, RemoteListService, RemoteWatchService};
use crate::sync::PlaceholderResolver;
use crate::watches::EpisodeWatchesRepository;

/// Everything the commands need, built once at start-up.
pub struct Services {
  pub config: Config,
  pub db: Arc<Database>,
  pub staleness: Arc<StalenessTracker>,
  pub placeholders: PlaceholderResolver,
  pub shows: CacheAsideStore<Show>,
  pub followed: FollowedShowsRepository,
  pub watches: EpisodeWatchesRepository,
}

impl Services {
  /// Wire the services against the configured database and remote.
  pub fn build(config: Config, auth: TokenAuth) -> Result<Self> {
    let path = config.database_path()?;
    info!(path = %path.display(), "opening database");
    let db = Database::open(&path)
      .map_err(|e| eyre!("Failed to open database {}: {}", path.display(), e))?;
    let db = Arc::new(db);

    let client_id = config.remote.client_id.clone();
    let token = auth.token().map(str::to_string);
    let primary = HttpClient::new(&config.remote.url, client_id.clone(), token.clone())?;

    let mut sources: Vec<Arc<dyn RemoteEntityService<Show>>> = Vec::new();
    sources.push(Arc::new(HttpShowSource::new(primary.clone())));
    for url in &config.remote.fallback_urls {
      let client = HttpClient::new(url, client_id.clone(), token.clone())?;
      sources.push(Arc::new(HttpShowSource::new(client)));
    }

    let list: Arc<dyn RemoteListService> =
      Arc::new(HttpListService::new(primary.clone(), config.remote.list.clone()));
    let history: Arc<dyn RemoteWatchService> = Arc::new(HttpWatchService::new(primary));
    let auth: Arc<dyn AuthState> = Arc::new(auth);

    Self::assemble(
      config,
      db,
      sources,
      list,
      history,
      auth,
      Arc::new(SystemClock),
    )
  }

  /// Assemble the graph from already constructed collaborators.
  pub fn assemble(
    config: Config,
    db: Arc<Database>,
    sources: Vec<Arc<dyn RemoteEntityService<Show>>>,
    list: Arc<dyn RemoteListService>,
    history: Arc<dyn RemoteWatchService>,
    auth: Arc<dyn AuthState>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let staleness = Arc::new(StalenessTracker::new(db.clone(), clock.clone()));

    let shows = CacheAsideStore::new(
      db.clone(),
      staleness.clone(),
      RequestKind::ShowDetails,
      sources,
    )?
    .with_stale_time(config.cache.show_details_stale_time());

    let followed =
      FollowedShowsRepository::new(db.clone(), staleness.clone(), list, auth.clone(), clock);
    let watches = EpisodeWatchesRepository::new(db.clone(), staleness.clone(), history, auth);
    let placeholders = PlaceholderResolver::new(db.clone());

    Ok(Self {
      config,
      db,
      staleness,
      placeholders,
      shows,
      followed,
      watches,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{CacheConfig, RemoteConfig};
  use crate::remote::RemoteEpisode;
  use crate::testing::{self, FakeAuth, FakeList, FakeShowSource, FakeWatches};

  fn services(list: Arc<FakeList>, history: Arc<FakeWatches>) -> Services {
    let config = Config {
      remote: RemoteConfig {
        url: "http://localhost".into(),
        fallback_urls: Vec::new(),
        client_id: None,
        list: "followed".into(),
      },
      cache: CacheConfig::default(),
      database: None,
    };
    Services::assemble(
      config,
      Arc::new(Database::open_in_memory().unwrap()),
      vec![Arc::new(FakeShowSource::ok("primary")) as Arc<dyn RemoteEntityService<Show>>],
      list,
      history,
      Arc::new(FakeAuth::signed_in()),
      Arc::new(testing::clock()),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_follow_sync_and_fetch_details() {
    let list = Arc::new(FakeList::new());
    let services = services(list.clone(), Arc::new(FakeWatches::new(5)));

    let show_id = services.placeholders.get_or_create_key::<Show>(&5).unwrap();
    services.followed.add_local(show_id).await.unwrap();
    services.followed.sync().await.unwrap();
    assert_eq!(list.keys(), vec![5]);

    // Details replace the placeholder in place.
    let show = services.shows.get(&5).await.unwrap();
    assert_eq!(show.local_id, show_id);
    assert_eq!(show.title.as_deref(), Some("Show 5 from primary"));
    assert!(services.followed.is_followed(show_id).unwrap());
  }

  #[tokio::test]
  async fn test_watch_recorded_offline_reaches_history() {
    let history = Arc::new(FakeWatches::new(5));
    let services = services(Arc::new(FakeList::new()), history.clone());

    let show_id = services.placeholders.get_or_create_key::<Show>(&5).unwrap();
    let episode = RemoteEpisode {
      trakt_id: 51,
      season: Some(1),
      number: Some(1),
      title: None,
    };
    let episode_id = services.watches.ensure_episode(show_id, &episode).unwrap();
    services
      .watches
      .add_watch(episode_id, testing::start_time())
      .await
      .unwrap();

    services.watches.sync_show(show_id).await.unwrap();
    assert_eq!(history.entries().len(), 1);
    assert!(services.watches.has_been_watched(episode_id).unwrap());
  }
}
