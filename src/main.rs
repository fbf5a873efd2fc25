mod api;
mod cli;
mod collectors;
mod config;
mod db;
mod error;
mod http;
mod orchestrator;
mod paginator;
mod shutdown;
mod storage;
mod types;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{
    Cli, Command, ComprehensiveArgs, ComprehensiveMode, FluctuationArgs, MarketInfoArgs, MarketInfoMode,
    OrderDataArgs, OrderMode, PriceDataArgs, PriceMode, UserDataArgs, UserMode,
};
use crate::collectors::{
    CollectorContext, FluctuationMonitor, MarketInfoCollector, OrderCollector, PriceCollector, UserCollector,
};
use crate::config::Config;
use crate::db::RelationshipStore;
use crate::error::{AppError, Result};
use crate::http::LatencyStats;
use crate::orchestrator::{ComprehensiveOrchestrator, EcosystemOptions, TestOptions};
use crate::paginator::Collected;
use crate::shutdown::{shutdown_on_ctrl_c, ShutdownCoordinator};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    let level = cli.log_override().unwrap_or(cfg.log_level.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    let shutdown = ShutdownCoordinator::shared();
    tokio::spawn(shutdown_on_ctrl_c(Arc::clone(&shutdown)));

    let latency = Arc::new(LatencyStats::new());
    let ctx = CollectorContext::new(cfg, Arc::clone(&latency), shutdown);

    if let Err(e) = run(cli.command, &ctx).await {
        error!("Command failed: {e}");
        eprintln!("Error: {e}");
    }

    let summary = latency.summary();
    if summary.samples > 0 {
        info!(
            samples = summary.samples,
            p50_ms = ?summary.p50_ms,
            p95_ms = ?summary.p95_ms,
            p99_ms = ?summary.p99_ms,
            max_ms = ?summary.max_ms,
            "Request latency"
        );
    }
}

async fn run(command: Command, ctx: &CollectorContext) -> Result<()> {
    match command {
        Command::Comprehensive(args) => run_comprehensive(args, ctx).await,
        Command::MarketInfo(args) => run_market_info(args, ctx).await,
        Command::PriceData(args) => run_price_data(args, ctx).await,
        Command::OrderData(args) => run_order_data(args, ctx).await,
        Command::UserData(args) => run_user_data(args, ctx).await,
        Command::Fluctuation(args) => run_fluctuation(args, ctx).await,
        Command::Serve(args) => {
            let store = open_store(ctx).await?;
            let port = args.port.unwrap_or(ctx.config.api_port);
            api::serve(store, port, Arc::clone(&ctx.shutdown)).await
        }
        Command::Cleanup(args) => {
            let orchestrator = ComprehensiveOrchestrator::new(ctx, open_store(ctx).await?)?;
            let deleted = orchestrator.cleanup(args.days).await?;
            print_json(&json!({ "days": args.days, "snapshots_deleted": deleted }))
        }
    }
}

async fn open_store(ctx: &CollectorContext) -> Result<RelationshipStore> {
    RelationshipStore::open(&ctx.config.db_path).await
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn collected_summary(name: &str, collected: &Collected) -> serde_json::Value {
    json!({
        "collection": name,
        "count": collected.items.len(),
        "complete": collected.is_complete(),
        "next_offset": collected.offset,
    })
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

// ---------------------------------------------------------------------------
// comprehensive
// ---------------------------------------------------------------------------

async fn run_comprehensive(args: ComprehensiveArgs, ctx: &CollectorContext) -> Result<()> {
    let orchestrator = ComprehensiveOrchestrator::new(ctx, open_store(ctx).await?)?;
    let monitoring = args.include_monitoring.then(|| minutes(args.monitoring_duration));

    match args.mode {
        ComprehensiveMode::Ecosystem => {
            let options = EcosystemOptions {
                market_ids: args.markets,
                include_users: !args.no_users,
                monitoring,
            };
            print_json(&orchestrator.collect_market_ecosystem(&options).await)
        }
        ComprehensiveMode::Test => {
            let options = TestOptions {
                max_markets: args.max_markets,
                max_users: args.max_users,
                monitoring,
            };
            print_json(&orchestrator.collect_test_data(&options).await)
        }
        ComprehensiveMode::MarketView => {
            let market_id = args
                .markets
                .first()
                .ok_or_else(|| AppError::Config("market-view needs --markets <id>".into()))?;
            print_json(&orchestrator.market_view(market_id).await?)
        }
        ComprehensiveMode::UserView => {
            let user = args
                .user
                .ok_or_else(|| AppError::Config("user-view needs --user <address>".into()))?;
            print_json(&orchestrator.user_view(&user).await?)
        }
        ComprehensiveMode::Correlations => print_json(&orchestrator.correlations_analysis().await?),
        ComprehensiveMode::Report => print_json(&orchestrator.ecosystem_report().await?),
    }
}

// ---------------------------------------------------------------------------
// market-info
// ---------------------------------------------------------------------------

async fn run_market_info(args: MarketInfoArgs, ctx: &CollectorContext) -> Result<()> {
    let collector = MarketInfoCollector::new(ctx)?;
    let page_size = ctx.config.page_size;
    if args.reset && collector.reset(args.market_type) {
        info!(market_type = %args.market_type, "Checkpoint cleared");
    }

    match args.mode {
        MarketInfoMode::Standard => {
            print_json(&collector.run_collection(args.market_type, !args.no_analysis).await)
        }
        MarketInfoMode::Comprehensive => {
            let data = collector
                .collect_comprehensive_market_data(args.include_timeseries, &args.timeseries_interval)
                .await;
            print_json(&data.summary)
        }
        MarketInfoMode::Sampling => {
            let markets = collector.fetch_sampling_markets(page_size, 0).await;
            collector.store().save_json("sampling_markets.json", &markets)?;
            print_json(&json!({ "sampling_markets": markets.len() }))
        }
        MarketInfoMode::Simplified => {
            let markets = collector.fetch_simplified_markets(page_size, 0, None, None).await;
            collector.store().save_json("simplified_markets.json", &markets)?;
            print_json(&json!({ "simplified_markets": markets.len() }))
        }
        MarketInfoMode::Timeseries => {
            let points = collector
                .fetch_timeseries(args.market_id.as_deref(), &args.timeseries_interval, None, None)
                .await;
            let file = format!(
                "timeseries_{}_{}.json",
                args.market_id.as_deref().unwrap_or("all"),
                args.timeseries_interval
            );
            collector.store().save_json(&file, &points)?;
            print_json(&json!({ "interval": args.timeseries_interval, "points": points.len(), "file": file }))
        }
        MarketInfoMode::Single => {
            let market_id = args
                .market_id
                .ok_or_else(|| AppError::Config("single mode needs --market-id".into()))?;
            let market = collector
                .fetch_single_market(&market_id)
                .await
                .ok_or_else(|| AppError::Api(format!("market {market_id} could not be fetched")))?;
            collector.store().save_json(&format!("market_{market_id}.json"), &market)?;
            print_json(&market)
        }
    }
}

// ---------------------------------------------------------------------------
// price-data
// ---------------------------------------------------------------------------

/// Requested markets, or the ids of the first active markets when none were given.
async fn resolve_markets(requested: Vec<String>, max: usize, ctx: &CollectorContext) -> Result<Vec<String>> {
    if !requested.is_empty() {
        return Ok(requested);
    }
    let markets = MarketInfoCollector::new(ctx)?
        .fetch_markets(max, 0, Some(true), Some(false))
        .await;
    let ids: Vec<String> = markets.iter().filter_map(types::entity_id).take(max).collect();
    if ids.is_empty() {
        return Err(AppError::Api("no active markets available".into()));
    }
    info!(markets = ids.len(), "Using first active markets");
    Ok(ids)
}

async fn run_price_data(args: PriceDataArgs, ctx: &CollectorContext) -> Result<()> {
    match args.mode {
        PriceMode::Report => {
            let collector = PriceCollector::new(ctx)?;
            let markets = (!args.markets.is_empty()).then_some(args.markets.as_slice());
            print_json(&collector.generate_price_report(markets, args.days).await)
        }
        PriceMode::Batch => {
            let collector = PriceCollector::new(ctx)?;
            let markets = resolve_markets(args.markets, args.max_markets, ctx).await?;
            print_json(&collector.collect_batch_prices(&markets, args.detailed).await)
        }
        PriceMode::History => {
            let collector = PriceCollector::new(ctx)?;
            let markets = resolve_markets(args.markets, args.max_markets, ctx).await?;
            print_json(&collector.collect_batch_price_history(&markets, args.fidelity).await)
        }
        PriceMode::Monitor => {
            let collector = Arc::new(PriceCollector::new(ctx)?.with_store(open_store(ctx).await?));
            let markets = resolve_markets(args.markets, args.max_markets, ctx).await?;
            let handle = collector.start_continuous_monitoring(markets, Duration::from_secs(args.interval.max(1)));
            ctx.shutdown.wait_for_shutdown().await;
            let ticks = handle.stop().await.unwrap_or(0);
            print_json(&json!({ "monitoring_ticks": ticks }))
        }
    }
}

// ---------------------------------------------------------------------------
// order-data
// ---------------------------------------------------------------------------

async fn run_order_data(args: OrderDataArgs, ctx: &CollectorContext) -> Result<()> {
    let collector = OrderCollector::new(ctx)?;
    let market = args.market.as_deref();
    if args.reset && collector.reset(market, args.status) {
        info!(market = market.unwrap_or("all"), "Checkpoints cleared");
    }

    match args.mode {
        OrderMode::Orders => {
            let orders = collector.fetch_all_orders(market, args.status).await;
            print_json(&collected_summary("orders", &orders))
        }
        OrderMode::Trades => {
            let trades = collector.fetch_all_trades(market).await;
            print_json(&collected_summary("trades", &trades))
        }
        OrderMode::Active => {
            let active = collector.fetch_active_orders(market, None).await;
            let file = format!("active_orders_{}.json", market.unwrap_or("all"));
            collector.store().save_json(&file, &active)?;
            print_json(&json!({ "active_orders": active.len(), "file": file }))
        }
        OrderMode::Comprehensive => {
            print_json(&collector.run_comprehensive_collection(market, !args.no_analysis).await)
        }
    }
}

// ---------------------------------------------------------------------------
// user-data
// ---------------------------------------------------------------------------

async fn run_user_data(args: UserDataArgs, ctx: &CollectorContext) -> Result<()> {
    let collector = UserCollector::new(ctx)?;
    match args.mode {
        UserMode::Single => {
            let user = args
                .user
                .ok_or_else(|| AppError::Config("single mode needs --user <address>".into()))?;
            let data = collector.collect_comprehensive_user_data(&user).await;
            if let Some(reason) = &data.failure {
                warn!(user = %user, "User collection failed: {reason}");
            }
            print_json(&data)
        }
        UserMode::Batch => {
            let mut users = args.users;
            if let Some(path) = &args.users_file {
                users.extend(cli::parse_user_list(&std::fs::read_to_string(path)?));
            }
            if users.is_empty() {
                return Err(AppError::Config("batch mode needs --users or --users-file".into()));
            }
            let batch = collector.batch_collect_users(&users).await;
            print_json(&batch)
        }
    }
}

// ---------------------------------------------------------------------------
// fluctuation
// ---------------------------------------------------------------------------

async fn run_fluctuation(args: FluctuationArgs, ctx: &CollectorContext) -> Result<()> {
    let monitor = FluctuationMonitor::new(ctx)?
        .with_threshold(args.threshold)
        .with_interval(Duration::from_secs(args.interval.max(1)));
    let report = monitor
        .monitor_markets(&args.markets, args.duration.map(minutes))
        .await;
    print_json(&report)
}
