use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use poolflow_indexer::client::RateLimitedClient;
use poolflow_indexer::config::Config;
use poolflow_indexer::db::{registry, PgCheckpointStore, PgEventStore};
use poolflow_indexer::enrich::prices::PriceService;
use poolflow_indexer::enrich::{apr, attribution, flows, vesting, JobArgs};
use poolflow_indexer::indexer::activity::ActivityScanner;
use poolflow_indexer::indexer::types::{RunSummary, ScanTarget, TargetKind};
use poolflow_indexer::indexer::window::WindowedScanner;
use poolflow_indexer::runlog::RunLog;
use poolflow_indexer::source::explorer::ExplorerLogSource;
use poolflow_indexer::source::rpc::RpcLogSource;
use poolflow_indexer::source::FallbackLogSource;

#[derive(Debug, PartialEq)]
struct Cli {
    command: String,
    config_path: String,
    limit: Option<i64>,
    offset: Option<i64>,
    concurrency: Option<usize>,
}

const USAGE: &str = "Usage: poolflow-indexer <command> [--config=PATH] [--limit=N] [--offset=N] [--concurrency=N]\n\
Commands: scan, activity-scan, enrich-apr, enrich-vesting, enrich-flows, resolve-pools, seed-incentives";

fn parse_cli(args: impl Iterator<Item = String>) -> eyre::Result<Cli> {
    let mut command = None;
    let mut config_path = "config.toml".to_string();
    let mut limit = None;
    let mut offset = None;
    let mut concurrency = None;

    for arg in args {
        if let Some(value) = arg.strip_prefix("--config=") {
            config_path = value.to_string();
        } else if let Some(value) = arg.strip_prefix("--limit=") {
            limit = Some(
                value
                    .parse::<i64>()
                    .map_err(|_| eyre::eyre!("--limit expects an integer, got '{}'", value))?,
            );
        } else if let Some(value) = arg.strip_prefix("--offset=") {
            offset = Some(
                value
                    .parse::<i64>()
                    .map_err(|_| eyre::eyre!("--offset expects an integer, got '{}'", value))?,
            );
        } else if let Some(value) = arg.strip_prefix("--concurrency=") {
            concurrency = Some(value.parse::<usize>().map_err(|_| {
                eyre::eyre!("--concurrency expects an integer, got '{}'", value)
            })?);
        } else if arg.starts_with("--") {
            return Err(eyre::eyre!("Unknown flag '{}'\n{}", arg, USAGE));
        } else if command.is_none() {
            command = Some(arg);
        } else {
            return Err(eyre::eyre!("Unexpected argument '{}'\n{}", arg, USAGE));
        }
    }

    Ok(Cli {
        command: command.ok_or_else(|| eyre::eyre!("{}", USAGE))?,
        config_path,
        limit,
        offset,
        concurrency,
    })
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Initialize structured logging (set RUST_LOG=info for output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = parse_cli(std::env::args().skip(1))?;
    let config = Config::load(&cli.config_path)?;
    tracing::info!(
        command = %cli.command,
        factories = config.factories.len(),
        "Poolflow indexer starting"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;
    tracing::info!("Database migrations complete");

    match cli.command.as_str() {
        "scan" => run_scan(&config, &pool).await?,
        "activity-scan" => run_activity_scan(&config, &pool).await?,
        "enrich-apr" => {
            let args = job_args(&config, &cli);
            let prices = PriceService::new(&config.prices, &config.tokens)?;
            apr::run(&pool, &prices, &args, config.enrichment.min_tvl_usd).await?;
        }
        "enrich-vesting" => {
            let args = job_args(&config, &cli);
            let prices = PriceService::new(&config.prices, &config.tokens)?;
            vesting::run(&pool, &prices, &config.enrichment, &args).await?;
        }
        "enrich-flows" => {
            let args = job_args(&config, &cli);
            let prices = PriceService::new(&config.prices, &config.tokens)?;
            flows::run(&pool, &prices, &args).await?;
        }
        "resolve-pools" => {
            let args = job_args(&config, &cli);
            let rpc = build_rpc(&config)?;
            let managers = manager_pairs(&config)?;
            attribution::run(&pool, &rpc, &managers, &args).await?;
        }
        "seed-incentives" => {
            let path = config.enrichment.incentives_csv_path.as_deref().ok_or_else(
                || eyre::eyre!("enrichment.incentives_csv_path is not configured"),
            )?;
            let count = registry::seed_incentives(&pool, path).await?;
            tracing::info!(count, "Incentive programs seeded");
        }
        other => return Err(eyre::eyre!("Unknown command '{}'\n{}", other, USAGE)),
    }

    Ok(())
}

fn job_args(config: &Config, cli: &Cli) -> JobArgs {
    JobArgs::new(
        cli.limit.unwrap_or(config.enrichment.limit),
        cli.offset.unwrap_or(config.enrichment.offset),
        cli.concurrency.unwrap_or(config.enrichment.concurrency),
    )
}

fn build_rpc(config: &Config) -> eyre::Result<Arc<RpcLogSource>> {
    let client = RateLimitedClient::new(
        Duration::from_millis(config.rpc.min_interval_ms),
        config.rpc.max_attempts,
        Duration::from_millis(config.rpc.request_timeout_ms),
    )?;
    Ok(Arc::new(RpcLogSource::new(
        client,
        config.rpc.url.clone(),
        config.rpc.chunk_size,
    )))
}

/// Explorer first, raw RPC as the fallback; each adapter gets its own
/// rate limiter instance.
fn build_sources(
    config: &Config,
) -> eyre::Result<(Arc<FallbackLogSource>, Arc<RpcLogSource>)> {
    let explorer_client = RateLimitedClient::new(
        Duration::from_millis(config.explorer.min_interval_ms),
        config.explorer.max_attempts,
        Duration::from_millis(config.rpc.request_timeout_ms),
    )?;
    let explorer = Arc::new(ExplorerLogSource::new(
        explorer_client,
        config.explorer.base_url.clone(),
        config.explorer.api_key.clone(),
        config.explorer.chunk_size,
    ));

    let rpc = build_rpc(config)?;
    let fallback = Arc::new(FallbackLogSource::new(vec![explorer, rpc.clone()]));
    Ok((fallback, rpc))
}

fn factory_targets(config: &Config) -> eyre::Result<Vec<ScanTarget>> {
    let mut targets = Vec::new();
    for factory in &config.factories {
        let factory_address = Address::from_str(&factory.factory)
            .map_err(|e| eyre::eyre!("Invalid factory address '{}': {}", factory.factory, e))?;
        let manager_address = Address::from_str(&factory.position_manager).map_err(|e| {
            eyre::eyre!(
                "Invalid position manager address '{}': {}",
                factory.position_manager,
                e
            )
        })?;
        targets.push(ScanTarget::new(
            TargetKind::Factory,
            factory_address,
            factory.genesis_block,
        ));
        targets.push(ScanTarget::new(
            TargetKind::PositionManager,
            manager_address,
            factory.genesis_block,
        ));
    }
    Ok(targets)
}

fn manager_pairs(config: &Config) -> eyre::Result<Vec<attribution::ManagerPair>> {
    config
        .factories
        .iter()
        .map(|factory| {
            Ok(attribution::ManagerPair {
                position_manager: Address::from_str(&factory.position_manager)
                    .map_err(|e| eyre::eyre!("Invalid position manager: {}", e))?,
                factory: Address::from_str(&factory.factory)
                    .map_err(|e| eyre::eyre!("Invalid factory: {}", e))?,
            })
        })
        .collect()
}

fn build_scanner(
    config: &Config,
    pool: &PgPool,
    source: Arc<FallbackLogSource>,
) -> WindowedScanner {
    WindowedScanner::new(
        source,
        Arc::new(PgEventStore::new(
            pool.clone(),
            config.scan.write_batch_size,
        )),
        Arc::new(PgCheckpointStore::new(pool.clone())),
        config.scan.window_size,
        config.scan.checkpoint_interval,
    )
}

async fn resolve_end_block(config: &Config, rpc: &RpcLogSource) -> eyre::Result<u64> {
    let tip = rpc.fetch_latest_block_number().await?;
    let end = tip.saturating_sub(config.scan.confirmation_depth);
    tracing::info!(
        tip,
        confirmation_depth = config.scan.confirmation_depth,
        end_block = end,
        "Resolved scan end block"
    );
    Ok(end)
}

fn merge_runs(mut a: RunSummary, b: RunSummary) -> RunSummary {
    a.targets += b.targets;
    a.targets_failed += b.targets_failed;
    a.blocks_scanned += b.blocks_scanned;
    a.rows_inserted += b.rows_inserted;
    a.duplicates_skipped += b.duplicates_skipped;
    a.elapsed_secs += b.elapsed_secs;
    a.discovered_pools.extend(b.discovered_pools);
    a
}

/// Full scan: factories and position managers first (discovering pools),
/// then every registered pool.
async fn run_scan(config: &Config, pool: &PgPool) -> eyre::Result<()> {
    let (fallback, rpc) = build_sources(config)?;
    let scanner = build_scanner(config, pool, fallback);
    let end_block = resolve_end_block(config, &rpc).await?;
    let max_concurrent = config.scan.max_concurrent_targets;

    let factory_run = scanner
        .scan_targets(&factory_targets(config)?, end_block, max_concurrent)
        .await;

    if !factory_run.discovered_pools.is_empty() {
        let inserted = registry::upsert_pools(pool, &factory_run.discovered_pools).await?;
        tracing::info!(
            discovered = factory_run.discovered_pools.len(),
            inserted,
            "Pool registry updated"
        );
    }

    let pool_targets = registry::pool_scan_targets(pool).await?;
    let pool_run = scanner
        .scan_targets(&pool_targets, end_block, max_concurrent)
        .await;

    let run = merge_runs(factory_run, pool_run);
    tracing::info!(
        targets = run.targets,
        failed = run.targets_failed,
        blocks = run.blocks_scanned,
        inserted = run.rows_inserted,
        duplicates = run.duplicates_skipped,
        "Scan run complete"
    );
    RunLog::new(&config.run_log_path).record_scan("scan", &run)?;

    if run.targets_failed > 0 && run.targets_failed == run.targets {
        return Err(eyre::eyre!("Every target failed to scan"));
    }
    Ok(())
}

/// Two-phase scan: rank registered pools by quick-scan activity, then
/// fully scan only the most active subset.
async fn run_activity_scan(config: &Config, pool: &PgPool) -> eyre::Result<()> {
    let (fallback, rpc) = build_sources(config)?;
    let scanner = build_scanner(config, pool, fallback.clone());
    let end_block = resolve_end_block(config, &rpc).await?;

    let targets = registry::pool_scan_targets(pool).await?;
    if targets.is_empty() {
        tracing::warn!("Pool registry is empty; run 'scan' first to discover pools");
        return Ok(());
    }

    let activity = ActivityScanner::new(
        fallback,
        config.scan.quick_scan_window,
        config.scan.quick_scan_top_n,
        config.scan.max_concurrent_targets,
    );
    let run = activity.run(&scanner, &targets, end_block).await;

    tracing::info!(
        targets = run.targets,
        failed = run.targets_failed,
        blocks = run.blocks_scanned,
        inserted = run.rows_inserted,
        duplicates = run.duplicates_skipped,
        "Activity scan complete"
    );
    RunLog::new(&config.run_log_path).record_scan("activity-scan", &run)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> eyre::Result<Cli> {
        parse_cli(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_cli_command_and_flags() {
        let cli = parse(&[
            "enrich-apr",
            "--config=custom.toml",
            "--limit=100",
            "--offset=50",
            "--concurrency=4",
        ])
        .unwrap();
        assert_eq!(cli.command, "enrich-apr");
        assert_eq!(cli.config_path, "custom.toml");
        assert_eq!(cli.limit, Some(100));
        assert_eq!(cli.offset, Some(50));
        assert_eq!(cli.concurrency, Some(4));
    }

    #[test]
    fn test_parse_cli_defaults() {
        let cli = parse(&["scan"]).unwrap();
        assert_eq!(cli.config_path, "config.toml");
        assert_eq!(cli.limit, None);
    }

    #[test]
    fn test_parse_cli_rejects_unknown_flags_and_missing_command() {
        assert!(parse(&["scan", "--bogus=1"]).is_err());
        assert!(parse(&[]).is_err());
        assert!(parse(&["scan", "extra"]).is_err());
        assert!(parse(&["scan", "--limit=abc"]).is_err());
    }
}
