//! Command line front end over the sync coordinator.

use clap::Subcommand;
use color_eyre::Result;
use repocat::cache::{PageLoad, Snapshot, SqliteStorage, SyncCoordinator};
use repocat::config::Config;
use repocat::pager::Pager;
use repocat::remote::GitHubClient;
use repocat::{Error, Item};

type Coordinator = SyncCoordinator<SqliteStorage, GitHubClient>;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Load pages from the start and print the cached list
  List {
    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: u32,
  },
  /// Load the page after the last cached one
  More,
  /// Replace the cache with a fresh first page
  Refresh,
  /// Show one cached repository
  Show { id: i64 },
  /// Print a slice of the cache without contacting GitHub
  Cached {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
  },
  /// Load pages in the background and print every update until Ctrl-C
  Watch {
    /// Highest page to load and display
    #[arg(long, default_value_t = 3)]
    ceiling: u32,
  },
  /// Print cache size and ceiling
  Stats,
  /// Drop every cached repository fetched as part of a page
  Evict { page: u32 },
}

pub async fn run(command: Command, config: &Config) -> Result<()> {
  let storage = SqliteStorage::open(&config.cache_path()?)?;
  let sync = SyncCoordinator::new(storage, GitHubClient::from_config(config)?);
  let page_size = config.cache.page_size;

  match command {
    Command::List { pages } => list(&sync, pages, page_size).await,
    Command::More => {
      let mut pager = Pager::new(sync, page_size)?;
      match pager.load_next().await {
        Ok(Some(load)) => report_load(&load),
        Ok(None) => println!("No more repositories."),
        Err(e) => warn_offline(&e)?,
      }
      print_snapshot(pager.view().current());
      Ok(())
    }
    Command::Refresh => {
      let mut pager = Pager::new(sync, page_size)?;
      match pager.refresh().await {
        Ok(load) => report_load(&load),
        Err(e) => warn_offline(&e)?,
      }
      print_snapshot(pager.view().current());
      Ok(())
    }
    Command::Show { id } => {
      match sync.get_by_id(id)? {
        Some(item) => print_detail(&item),
        None => println!("Repository {} not found in cache.", id),
      }
      Ok(())
    }
    Command::Cached { limit, offset } => {
      let items = sync.query_paged(limit, offset)?;
      if items.is_empty() {
        println!("No cached repositories in that range.");
      }
      for item in &items {
        print_row(item);
      }
      Ok(())
    }
    Command::Watch { ceiling } => watch(&sync, ceiling, page_size).await,
    Command::Stats => {
      let state = sync.cache_state()?;
      println!("Database: {}", config.cache_path()?.display());
      println!("Repositories: {}", state.count);
      match state.ceiling {
        Some(page) => println!("Pages: 1-{}", page),
        None => println!("Pages: none"),
      }
      Ok(())
    }
    Command::Evict { page } => {
      sync.evict_page(page).await?;
      println!("Evicted page {}.", page);
      Ok(())
    }
  }
}

async fn list(sync: &Coordinator, pages: u32, page_size: u32) -> Result<()> {
  for page in 1..=pages {
    match sync.load_page(page, page_size).await {
      Ok(load) => {
        report_load(&load);
        if !load.has_more {
          break;
        }
      }
      Err(e) => {
        warn_offline(&e)?;
        break;
      }
    }
  }

  print_snapshot(sync.observe_up_to(pages)?.current());
  Ok(())
}

async fn watch(sync: &Coordinator, ceiling: u32, page_size: u32) -> Result<()> {
  let mut view = sync.observe_up_to(ceiling)?;

  let loader = tokio::spawn({
    let sync = sync.clone();
    async move {
      for page in 1..=ceiling {
        match sync.load_page(page, page_size).await {
          Ok(load) if !load.has_more => break,
          Ok(_) => {}
          Err(e) => {
            eprintln!("Load of page {} failed: {}", page, e);
            break;
          }
        }
      }
    }
  });

  loop {
    tokio::select! {
      snapshot = view.next() => match snapshot {
        Some(snapshot) => {
          println!("--- {} repositories ---", snapshot.len());
          print_snapshot(&snapshot);
        }
        None => break,
      },
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  loader.abort();
  Ok(())
}

fn report_load(load: &PageLoad) {
  let end = if load.has_more { "" } else { " (end of list)" };
  println!("Page {}: {} repositories{}", load.page, load.fetched, end);
}

/// Failed fetches still show what is cached; storage faults abort.
fn warn_offline(e: &Error) -> Result<()> {
  if e.is_fatal() {
    return Err(e.clone().into());
  }
  eprintln!("GitHub request failed: {}. Showing cached data.", e);
  Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
  if snapshot.is_empty() {
    println!("No cached repositories.");
    return;
  }
  for item in snapshot.items() {
    print_row(item);
  }
}

fn print_row(item: &Item) {
  println!(
    "{:>12}  {:<40} {:<8} {}",
    item.id,
    item.full_name,
    item.visibility,
    item.description.as_deref().unwrap_or("")
  );
}

fn print_detail(item: &Item) {
  println!("{}", item.full_name);
  println!("  id:          {}", item.id);
  println!("  name:        {}", item.name);
  if let Some(description) = &item.description {
    println!("  description: {}", description);
  }
  println!("  owner:       {} ({})", item.owner_login, item.owner_id);
  println!("  avatar:      {}", item.owner_avatar_url);
  println!("  visibility:  {}", item.visibility);
  println!("  private:     {}", item.is_private);
  println!("  url:         {}", item.url);
}
