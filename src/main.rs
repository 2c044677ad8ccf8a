mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use futures::stream::{self, StreamExt};
use shelfbridge::cache::BookCache;
use shelfbridge::clients::abs::AbsClient;
use shelfbridge::clients::hardcover::{HardcoverClient, HardcoverSearchAdapter};
use shelfbridge::concurrency::{EndpointSemaphore, RateLimiter};
use shelfbridge::config::AppConfig;
use shelfbridge::matcher::{BookMatcher, TitleAuthorScoringWeights};
use shelfbridge::scheduler::Scheduler;
use shelfbridge::session::{SessionManager, SessionManagerConfig};
use shelfbridge::sync::SyncManager;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the full set of per-user runtime pieces: clients, matcher,
/// session manager, sync manager. One `AppConfig` is shared; clients
/// are per-user since each carries its own credentials.
async fn build_user_runtime(
    cache: Arc<BookCache>,
    config: &AppConfig,
    user: &shelfbridge::config::UserConfig,
) -> Result<SyncManager> {
    let hc_rate_limiter = Arc::new(RateLimiter::new(config.hardcover_rate_limit));
    let hc_semaphore = Arc::new(EndpointSemaphore::new(config.hardcover_semaphore));
    let hardcover: Arc<dyn shelfbridge::clients::hardcover::HardcoverSink> = Arc::new(HardcoverClient::new(
        user.hardcover_token.clone(),
        hc_rate_limiter,
        hc_semaphore,
    ));

    let search_source = Arc::new(HardcoverSearchAdapter::new(hardcover.clone()));
    let matcher = Arc::new(BookMatcher::new(
        config.title_author_matching.enabled,
        search_source.clone(),
        search_source,
        TitleAuthorScoringWeights::default(),
    ));

    if let Ok(library) = hardcover.get_user_library().await {
        matcher.set_user_library(&library, false);
    }

    let session_manager = Arc::new(SessionManager::new(
        SessionManagerConfig {
            enabled: config.delayed_updates.enabled,
            session_timeout_secs: config.delayed_updates.session_timeout,
            max_delay_secs: config.delayed_updates.max_delay,
            immediate_completion: config.delayed_updates.immediate_completion,
        },
        Arc::new(shelfbridge::clock::SystemClock),
    )?);

    Ok(SyncManager::new(cache, matcher, session_manager, hardcover, config.clone()))
}

async fn fetch_user_items(
    config: &AppConfig,
    user: &shelfbridge::config::UserConfig,
) -> Result<Vec<shelfbridge::clients::abs::AbsItem>> {
    use shelfbridge::clients::abs::AbsSource;

    let rate_limiter = Arc::new(RateLimiter::new(config.audiobookshelf_rate_limit));
    let semaphore = Arc::new(EndpointSemaphore::new(config.audiobookshelf_semaphore));
    let client = AbsClient::new(user.abs_url.clone(), user.abs_token.clone(), rate_limiter, semaphore);

    let filter = user.libraries.as_ref().unwrap_or(&config.libraries);
    let libraries = client.list_libraries().await.context("listing abs libraries")?;
    let mut items = Vec::new();
    for library in libraries {
        if !filter.include.is_empty() && !filter.include.contains(&library.name) {
            continue;
        }
        if filter.exclude.contains(&library.name) {
            continue;
        }
        let batch = client
            .list_items(&library.id, config.page_size, config.max_books_to_fetch)
            .await
            .with_context(|| format!("listing items for library {}", library.name))?;
        items.extend(batch);
    }
    Ok(items)
}

async fn run_sync_for_user(cache: Arc<BookCache>, config: &AppConfig, user: &shelfbridge::config::UserConfig) {
    info!(user = %user.id, "starting sync");
    let sync_manager = match build_user_runtime(cache, config, user).await {
        Ok(sm) => sm,
        Err(e) => {
            error!(user = %user.id, error = %e, "failed to initialize user runtime, skipping user");
            return;
        }
    };

    let items = match fetch_user_items(config, user).await {
        Ok(items) => items,
        Err(e) => {
            error!(user = %user.id, error = %e, "failed to fetch abs library, skipping user");
            return;
        }
    };

    let results = sync_manager.sync_user(&user.id, &items).await;
    let synced = results.iter().filter(|r| matches!(r.status, shelfbridge::sync::SyncStatus::Synced | shelfbridge::sync::SyncStatus::Completed | shelfbridge::sync::SyncStatus::AutoAdded)).count();
    let errors = results.iter().filter(|r| matches!(r.status, shelfbridge::sync::SyncStatus::Error)).count();
    info!(user = %user.id, total = results.len(), synced, errors, "sync complete");
}

/// Users are processed serially unless `config.parallel` is set, in
/// which case up to `config.workers` users are synced concurrently.
/// Each user carries its own Hardcover/ABS credentials and cache rows
/// keyed by `user_id`, so concurrent users don't interfere with each
/// other beyond sharing the same sqlite connection mutex.
async fn run_sync(config: &AppConfig, only_user: Option<&str>) -> Result<()> {
    let cache = Arc::new(BookCache::connect(&config.cache_path).await?);
    let users: Vec<&shelfbridge::config::UserConfig> = config
        .users
        .iter()
        .filter(|u| only_user.map_or(true, |only| u.id == only))
        .collect();

    if config.parallel {
        let workers = config.workers.max(1);
        stream::iter(users)
            .for_each_concurrent(workers, |user| {
                let cache = cache.clone();
                async move {
                    run_sync_for_user(cache, config, user).await;
                }
            })
            .await;
    } else {
        for user in users {
            run_sync_for_user(cache.clone(), config, user).await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Sync { user, dry_run, skip_validation } => {
            let mut config = config;
            if dry_run {
                config.dry_run = true;
            }
            if !skip_validation {
                config.delayed_updates.validate()?;
            }
            run_sync(&config, user.as_deref()).await?;
        }
        Command::Start => {
            if config.users.is_empty() {
                info!("no users configured, nothing to schedule");
            } else {
                let cache = Arc::new(BookCache::connect(&config.cache_path).await?);
                let mut managers = Vec::with_capacity(config.users.len());
                for user in &config.users {
                    match build_user_runtime(cache.clone(), &config, user).await {
                        Ok(sm) => managers.push((user.id.clone(), Arc::new(sm))),
                        Err(e) => error!(user = %user.id, error = %e, "failed to initialize user runtime, skipping recovery for user"),
                    }
                }

                let scheduler = Scheduler::new(&config.sync_schedule)?;
                scheduler.recover_sessions(&managers).await;

                let config = config.clone();
                scheduler
                    .run_forever(|| async {
                        if let Err(e) = run_sync(&config, None).await {
                            error!(error = %e, "scheduled sync run failed");
                        }
                    })
                    .await;
            }
        }
        Command::Debug { user } => {
            let items = match config.users.iter().find(|u| Some(u.id.as_str()) == user.as_deref()).or_else(|| config.users.first()) {
                Some(u) => fetch_user_items(&config, u).await?,
                None => Vec::new(),
            };
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "item_count": items.len() }))?);
        }
        Command::Validate => {
            config.delayed_updates.validate()?;
            println!("configuration valid");
        }
        Command::Cache { show, clear, export, stats } => {
            let cache = BookCache::connect(&config.cache_path).await?;
            for user in &config.users {
                if clear {
                    cache.clear_cache(&user.id).await?;
                    println!("cleared cache for {}", user.id);
                }
                if show || stats {
                    let stats = cache.get_cache_stats(&user.id).await;
                    println!("{}: {:?}", user.id, stats);
                }
                if let Some(path) = &export {
                    let json = cache.export_to_json(&user.id).await?;
                    std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
                }
            }
        }
        Command::Interactive => {
            println!("interactive mode is not available in this environment; use `sync` or `start`.");
        }
    }

    Ok(())
}
