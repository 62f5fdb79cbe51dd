use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use showsync::app::Services;
use showsync::auth::{AuthState, TokenAuth};
use showsync::cache::RequestKind;
use showsync::config::{self, Config};
use showsync::entity::{LocalId, PendingAction, Show};
use showsync::followed::COLLECTION;
use showsync::logging;
use showsync::remote::RemoteEpisode;

#[derive(Parser, Debug)]
#[command(name = "showsync")]
#[command(about = "Follow TV shows offline and sync them with your remote list")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/showsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Follow a show (applied locally, pushed on the next sync)
  Follow { trakt_id: u64 },
  /// Unfollow a show
  Unfollow { trakt_id: u64 },
  /// List followed shows
  List,
  /// Push local changes and pull the remote list
  Sync,
  /// Show details, from cache unless stale
  Show {
    trakt_id: u64,
    /// Always fetch from the remote
    #[arg(long)]
    fresh: bool,
  },
  /// Mark an episode as watched now
  Watch {
    /// Show Trakt id
    show: u64,
    /// Episode Trakt id
    episode: u64,
    #[arg(long)]
    season: Option<u32>,
    #[arg(long)]
    number: Option<u32>,
  },
  /// Remove every watch of an episode
  Unwatch { episode: u64 },
  /// Push and pull episode watches of a show
  SyncWatches {
    show: u64,
    /// Skip the sync unless the last one is older than the configured time
    #[arg(long)]
    if_stale: bool,
  },
  /// Print sync status
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&config::data_dir()?, args.verbose);

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let auth = TokenAuth::from_env();
  let signed_in = auth.is_authenticated();
  let services = Services::build(config, auth)?;

  match args.command {
    Command::Follow { trakt_id } => {
      let show_id = services.placeholders.get_or_create_key::<Show>(&trakt_id)?;
      services.followed.add_local(show_id).await?;
      println!("Following {}", trakt_id);
    }
    Command::Unfollow { trakt_id } => {
      let show_id = services.placeholders.get_or_create_key::<Show>(&trakt_id)?;
      services.followed.remove_local(show_id).await?;
      println!("Unfollowed {}", trakt_id);
    }
    Command::List => list(&services)?,
    Command::Sync => {
      let result = services.followed.sync().await?;
      println!(
        "Synced: {} added, {} updated, {} removed",
        result.added.len(),
        result.updated.len(),
        result.removed.len()
      );
    }
    Command::Show { trakt_id, fresh } => {
      let show = if fresh {
        services.shows.fresh(&trakt_id).await?
      } else {
        services.shows.get(&trakt_id).await?
      };
      print_show(&show);
    }
    Command::Watch {
      show,
      episode,
      season,
      number,
    } => {
      let show_id = services.placeholders.get_or_create_key::<Show>(&show)?;
      let episode_id = services.watches.ensure_episode(
        show_id,
        &RemoteEpisode {
          trakt_id: episode,
          season,
          number,
          title: None,
        },
      )?;
      services.watches.add_watch(episode_id, Utc::now()).await?;
      println!("Watched {}", episode);
    }
    Command::Unwatch { episode } => {
      let removed = match services.watches.episode_id(episode)? {
        Some(episode_id) => services.watches.remove_all_watches(episode_id).await?,
        None => 0,
      };
      println!("Removed {} watches of {}", removed, episode);
    }
    Command::SyncWatches { show, if_stale } => {
      let show_id = services.placeholders.get_or_create_key::<Show>(&show)?;
      let stale_time = services.config.cache.episode_watches_stale_time();
      if if_stale && !services.watches.needs_sync(show_id, stale_time)? {
        println!("Watches of {} are up to date", show);
        return Ok(());
      }
      let result = services.watches.sync_show(show_id).await?;
      println!(
        "Synced watches: {} added, {} updated, {} removed",
        result.added.len(),
        result.updated.len(),
        result.removed.len()
      );
    }
    Command::Status => status(&services, signed_in)?,
  }

  Ok(())
}

fn list(services: &Services) -> Result<()> {
  for entry in services.followed.followed_shows()? {
    if !entry.is_active() {
      continue;
    }
    let show = services.db.read(|tx| tx.get::<Show>(entry.show_id))?;
    let (trakt_id, title) = match &show {
      Some(show) => (show.trakt_id.to_string(), show.title.as_deref().unwrap_or("(not fetched)")),
      None => ("?".to_string(), "(missing)"),
    };
    let marker = match entry.pending_action {
      PendingAction::Upload => " *",
      _ => "",
    };
    println!("{:>8}  {}{}", trakt_id, title, marker);
  }
  Ok(())
}

fn status(services: &Services, signed_in: bool) -> Result<()> {
  let entries = services.followed.followed_shows()?;
  let pending = |action| entries.iter().filter(|e| e.pending_action == action).count();
  let last_sync = services
    .staleness
    .last_request(RequestKind::FollowedShows, COLLECTION)?;
  let stale_time = services.config.cache.followed_shows_stale_time();

  println!("Signed in:        {}", signed_in);
  println!("Followed shows:   {}", entries.iter().filter(|e| e.is_active()).count());
  println!("Pending uploads:  {}", pending(PendingAction::Upload));
  println!("Pending deletes:  {}", pending(PendingAction::Delete));
  match last_sync {
    Some(at) => println!("Last sync:        {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
    None => println!("Last sync:        never"),
  }
  println!("Needs sync:       {}", services.followed.needs_sync(stale_time)?);
  Ok(())
}

fn print_show(show: &Show) {
  println!("{} ({})", show.title.as_deref().unwrap_or("Untitled"), show.trakt_id);
  if show.local_id != LocalId::UNSET {
    println!("  local id:  {}", show.local_id);
  }
  if let Some(network) = &show.network {
    println!("  network:   {}", network);
  }
  if let Some(status) = &show.status {
    println!("  status:    {}", status);
  }
  if let Some(first_aired) = show.first_aired {
    println!("  aired:     {}", first_aired.format("%Y-%m-%d"));
  }
  if let Some(genres) = &show.genres {
    println!("  genres:    {}", genres.join(", "));
  }
  if let Some(summary) = &show.summary {
    println!();
    println!("{}", summary);
  }
}
