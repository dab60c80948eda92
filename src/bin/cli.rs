//! reviewsync CLI
//!
//! Local execution entry point for one-shot and daemon collection runs.
//! A storage outage that survives the retry schedule exits with code 75
//! so supervisors can tell it apart from ordinary failures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reviewsync::{
    error::{CollectError, Result, STORAGE_UNAVAILABLE_EXIT_CODE},
    models::{Config, Decision, Platform},
    pipeline::{CycleRunner, DecisionEngine},
    services::{EgressRouter, FeedCollector, ProviderTransport},
    storage::{EntityCatalog, PgStateStore, StateStore},
};

/// reviewsync - App store review collector
#[derive(Parser, Debug)]
#[command(name = "reviewsync", version, about = "App store review collector")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "reviewsync.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create database tables and indexes
    Init,

    /// Probe local egress addresses against the store canaries
    Probe {
        /// Do not persist probe results
        #[arg(long)]
        no_save: bool,
    },

    /// Evaluate the collection decision for one entity
    Check {
        /// Entity identifier (store-specific app id)
        entity_id: String,

        /// Platform: app_store or play_store
        platform: String,

        /// Remote review count to evaluate (default: the cataloged count)
        #[arg(long)]
        remote_count: Option<i64>,
    },

    /// Run one collection cycle and exit
    Run,

    /// Run collection cycles until interrupted
    Daemon {
        /// Seconds between cycles (overrides the config)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show failure statistics and recent activity
    Status {
        /// Restrict failure statistics to one platform
        #[arg(long)]
        platform: Option<String>,

        /// Failure-streak length that counts as worrying
        #[arg(long, default_value_t = 3)]
        min_failures: i32,
    },
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            log::error!("{e}");
            ExitCode::from(STORAGE_UNAVAILABLE_EXIT_CODE)
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config);
    config.validate()?;
    let config = Arc::new(config);

    let store = Arc::new(PgStateStore::from_config(&config.storage));

    let result = dispatch(cli.command, &config, &store).await;
    store.release().await;
    result
}

async fn dispatch(command: Command, config: &Arc<Config>, store: &Arc<PgStateStore>) -> Result<()> {
    match command {
        Command::Init => {
            store.init_schema().await?;
            log::info!("schema ready");
            Ok(())
        }

        Command::Probe { no_save } => {
            let router = probe_egress(config).await;
            if router.candidate_addresses().is_empty() {
                log::warn!("no external IPv4 addresses discovered on this host");
            }
            for probe in router.probe_results() {
                match &probe.error {
                    None => log::info!("{} -> {}: working", probe.address, probe.target),
                    Some(reason) => log::warn!("{} -> {}: {reason}", probe.address, probe.target),
                }
            }
            if !no_save {
                store.init_schema().await?;
                store.save_probe_results(router.probe_results()).await?;
                log::info!("probe results saved");
            }
            Ok(())
        }

        Command::Check {
            entity_id,
            platform,
            remote_count,
        } => {
            let platform: Platform = platform.parse()?;
            let observed = match remote_count {
                Some(count) => count,
                None => store
                    .list_entities(platform)
                    .await?
                    .into_iter()
                    .find(|entry| entry.entity_id == entity_id)
                    .map(|entry| entry.remote_count)
                    .ok_or_else(|| {
                        CollectError::validation(format!(
                            "{entity_id} is not cataloged for {platform}; pass --remote-count"
                        ))
                    })?,
            };

            let engine = DecisionEngine::new(store.clone(), store.clone());
            match engine.should_collect(&entity_id, platform, observed).await? {
                Decision::Collect(mode) => {
                    log::info!("{entity_id} ({platform}): collect in {mode} mode")
                }
                Decision::Skip(reason) => log::info!("{entity_id} ({platform}): skip ({reason})"),
            }
            if let Some(state) = engine.status(&entity_id, platform).await? {
                log::info!(
                    "cursor={} collected={} consecutive_failures={}",
                    state
                        .last_known_remote_count
                        .map_or_else(|| "none".into(), |c| c.to_string()),
                    state.collected_count,
                    state.consecutive_failures
                );
            } else {
                log::info!("no collection state recorded yet");
            }
            Ok(())
        }

        Command::Run => {
            let runner = build_runner(config, store).await?;
            let stats = runner
                .run_cycle(&config.collection.enabled_platforms())
                .await?;
            log::info!("{}", stats.summary());
            Ok(())
        }

        Command::Daemon { interval } => run_daemon(config, store, interval).await,

        Command::Status {
            platform,
            min_failures,
        } => {
            let platform = platform.map(|p| p.parse::<Platform>()).transpose()?;

            let activity = store.recent_activity().await?;
            log::info!(
                "last 24h: {} attempts, {} succeeded, {} failed",
                activity.attempted,
                activity.succeeded,
                activity.failed
            );

            let stats = store.failure_stats(platform).await?;
            if stats.is_empty() {
                log::info!("no recorded failures");
            }
            for stat in &stats {
                log::info!("{}: {} x{}", stat.platform, stat.reason, stat.count);
            }

            for entity in store.failing_entities(min_failures).await? {
                log::warn!(
                    "{} ({}): {} consecutive failures, last reason {}",
                    entity.entity_id,
                    entity.platform,
                    entity.consecutive_failures,
                    entity.last_failure_reason.as_deref().unwrap_or("unknown")
                );
            }
            Ok(())
        }
    }
}

/// Discover local addresses and probe them against every store canary.
async fn probe_egress(config: &Arc<Config>) -> EgressRouter {
    let mut router = EgressRouter::new(config.clone());
    router.initialize().await;
    router
}

/// Wire the full collection stack against the shared store.
async fn build_runner(config: &Arc<Config>, store: &Arc<PgStateStore>) -> Result<CycleRunner> {
    store.init_schema().await?;

    let router = probe_egress(config).await;
    for platform in config.collection.enabled_platforms() {
        if !router.has_addresses(platform) {
            log::warn!("no working egress addresses for {platform}; its requests will fail fast");
        }
    }
    store.save_probe_results(router.probe_results()).await?;

    let transport = Arc::new(ProviderTransport::new(config.clone(), Arc::new(router)));
    let collector = Arc::new(FeedCollector::new(config.clone(), transport, store.clone()));
    let engine = DecisionEngine::new(store.clone(), store.clone());
    Ok(CycleRunner::new(engine, store.clone(), collector))
}

async fn run_daemon(
    config: &Arc<Config>,
    store: &Arc<PgStateStore>,
    interval: Option<u64>,
) -> Result<()> {
    let interval_secs = interval.unwrap_or(config.daemon.interval_secs);
    let platforms = config.collection.enabled_platforms();
    let runner = build_runner(config, store).await?;

    log::info!("daemon started, {interval_secs}s between cycles");
    loop {
        let wait_secs = tokio::select! {
            result = runner.run_cycle(&platforms) => match result {
                Ok(stats) => {
                    log::info!("{}", stats.summary());
                    interval_secs
                }
                // A dead database aborts the cycle but not the daemon. Wait
                // out the cooldown and try again from a fresh connection.
                Err(e) if e.is_fatal() => {
                    let cooldown = config.daemon.cooldown_secs(interval_secs);
                    log::error!("cycle aborted: {e}; cooling down for {cooldown}s");
                    cooldown
                }
                Err(e) => {
                    log::error!("cycle failed: {e}");
                    interval_secs
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        if !sleep_interruptible(Duration::from_secs(wait_secs)).await {
            break;
        }
    }
    log::info!("daemon stopped");
    Ok(())
}

/// Sleep for the given duration; false means ctrl-c cut it short.
async fn sleep_interruptible(duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = tokio::signal::ctrl_c() => false,
    }
}
