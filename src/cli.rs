//! Command-line surface of the collector.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::{Fidelity, MarketType, OrderStatus};

#[derive(Parser, Debug)]
#[command(name = "collector")]
#[command(about = "Polymarket market, price, order and user data collector")]
#[command(version)]
pub struct Cli {
    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Log filter for this run; `None` keeps the configured level.
    pub fn log_override(&self) -> Option<&'static str> {
        if self.verbose {
            Some("debug")
        } else if self.quiet {
            Some("warn")
        } else {
            None
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Cross-module collection runs and relationship views
    Comprehensive(ComprehensiveArgs),
    /// Events and market listings
    MarketInfo(MarketInfoArgs),
    /// Current prices, history and continuous monitoring
    PriceData(PriceDataArgs),
    /// Orders and trades
    OrderData(OrderDataArgs),
    /// Positions, orders and trades of individual users
    UserData(UserDataArgs),
    /// Price and volume alerting
    Fluctuation(FluctuationArgs),
    /// Read-only HTTP API over the relationship store
    Serve(ServeArgs),
    /// Drop price snapshots older than the retention window
    Cleanup(CleanupArgs),
}

// ---------------------------------------------------------------------------
// comprehensive
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComprehensiveMode {
    Ecosystem,
    Test,
    MarketView,
    UserView,
    Correlations,
    Report,
}

#[derive(Args, Debug)]
pub struct ComprehensiveArgs {
    #[arg(long, value_enum, default_value = "ecosystem")]
    pub mode: ComprehensiveMode,

    /// Market ids to restrict the run to (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub markets: Vec<String>,

    /// User address for `user-view`
    #[arg(long)]
    pub user: Option<String>,

    /// Skip the user collection phase
    #[arg(long)]
    pub no_users: bool,

    /// Run fluctuation monitoring alongside the collection
    #[arg(long)]
    pub include_monitoring: bool,

    /// Monitoring duration in minutes
    #[arg(long, default_value_t = 30)]
    pub monitoring_duration: u64,

    #[arg(long, default_value_t = 3)]
    pub max_markets: usize,

    #[arg(long, default_value_t = 10)]
    pub max_users: usize,
}

// ---------------------------------------------------------------------------
// market-info
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketInfoMode {
    Standard,
    Comprehensive,
    Sampling,
    Simplified,
    Timeseries,
    Single,
}

#[derive(Args, Debug)]
pub struct MarketInfoArgs {
    #[arg(long, value_enum, default_value = "standard")]
    pub mode: MarketInfoMode,

    #[arg(long = "type", value_enum, default_value = "all")]
    pub market_type: MarketType,

    #[arg(long)]
    pub market_id: Option<String>,

    #[arg(long)]
    pub include_timeseries: bool,

    /// One of 1m, 5m, 15m, 1h, 4h, 1d
    #[arg(long, default_value = "1h")]
    pub timeseries_interval: String,

    #[arg(long)]
    pub no_analysis: bool,

    /// Discard the saved checkpoint before collecting
    #[arg(long)]
    pub reset: bool,
}

// ---------------------------------------------------------------------------
// price-data
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceMode {
    Batch,
    Monitor,
    Report,
    History,
}

#[derive(Args, Debug)]
pub struct PriceDataArgs {
    #[arg(long, value_enum, default_value = "batch")]
    pub mode: PriceMode,

    /// Market ids (comma-separated). Defaults to the first active markets.
    #[arg(long, value_delimiter = ',')]
    pub markets: Vec<String>,

    /// Include book, midpoint and spread per market
    #[arg(long)]
    pub detailed: bool,

    /// Monitoring poll interval in seconds
    #[arg(long, default_value_t = 60)]
    pub interval: u64,

    #[arg(long, default_value_t = 30)]
    pub days: i64,

    /// Bucket size in minutes: 1, 60 or 1440
    #[arg(long, default_value = "60", value_parser = parse_fidelity)]
    pub fidelity: Fidelity,

    #[arg(long, default_value_t = 10)]
    pub max_markets: usize,
}

fn parse_fidelity(raw: &str) -> Result<Fidelity, String> {
    raw.parse::<u32>()
        .ok()
        .and_then(Fidelity::from_minutes)
        .ok_or_else(|| format!("unsupported fidelity {raw:?}, expected 1, 60 or 1440"))
}

// ---------------------------------------------------------------------------
// order-data
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    Orders,
    Trades,
    Active,
    Comprehensive,
}

#[derive(Args, Debug)]
pub struct OrderDataArgs {
    #[arg(long, value_enum, default_value = "comprehensive")]
    pub mode: OrderMode,

    #[arg(long)]
    pub market: Option<String>,

    #[arg(long, value_enum)]
    pub status: Option<OrderStatus>,

    #[arg(long)]
    pub no_analysis: bool,

    #[arg(long)]
    pub reset: bool,
}

// ---------------------------------------------------------------------------
// user-data
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMode {
    Single,
    Batch,
}

#[derive(Args, Debug)]
pub struct UserDataArgs {
    #[arg(long, value_enum, default_value = "single")]
    pub mode: UserMode,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long, value_delimiter = ',')]
    pub users: Vec<String>,

    /// File with one address per line; blank lines and `#` comments are skipped
    #[arg(long)]
    pub users_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// fluctuation / serve / cleanup
// ---------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct FluctuationArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    pub markets: Vec<String>,

    /// Minutes to monitor; runs until interrupted when omitted
    #[arg(long)]
    pub duration: Option<u64>,

    /// Relative price change that raises an alert
    #[arg(long, default_value_t = crate::config::PRICE_CHANGE_THRESHOLD)]
    pub threshold: f64,

    /// Seconds between checks
    #[arg(long, default_value_t = crate::config::FLUCTUATION_CHECK_INTERVAL_SECS)]
    pub interval: u64,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Overrides API_PORT
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    #[arg(long, default_value_t = crate::config::SNAPSHOT_RETENTION_DAYS)]
    pub days: i64,
}

/// Addresses from a users file: one per line, `#` starts a comment.
pub fn parse_user_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comprehensive_flags() {
        let cli = Cli::parse_from([
            "collector",
            "-v",
            "comprehensive",
            "--mode",
            "test",
            "--markets",
            "m1,m2",
            "--include-monitoring",
            "--monitoring-duration",
            "5",
        ]);
        assert_eq!(cli.log_override(), Some("debug"));
        let Command::Comprehensive(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.mode, ComprehensiveMode::Test);
        assert_eq!(args.markets, vec!["m1", "m2"]);
        assert!(args.include_monitoring);
        assert_eq!(args.monitoring_duration, 5);
        assert_eq!(args.max_users, 10);
    }

    #[test]
    fn order_status_and_fidelity_values() {
        let cli = Cli::parse_from(["collector", "order-data", "--mode", "orders", "--status", "PARTIALLY_FILLED"]);
        let Command::OrderData(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.status, Some(OrderStatus::PartiallyFilled));

        let cli = Cli::parse_from(["collector", "price-data", "--mode", "history", "--fidelity", "1440"]);
        let Command::PriceData(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.fidelity, Fidelity::Day);

        assert!(Cli::try_parse_from(["collector", "price-data", "--fidelity", "15"]).is_err());
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["collector", "-v", "-q", "cleanup"]).is_err());
        let cli = Cli::parse_from(["collector", "-q", "cleanup"]);
        assert_eq!(cli.log_override(), Some("warn"));
        let Command::Cleanup(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.days, 30);
    }

    #[test]
    fn fluctuation_requires_markets() {
        assert!(Cli::try_parse_from(["collector", "fluctuation"]).is_err());
        let cli = Cli::parse_from(["collector", "fluctuation", "--markets", "a,b", "--duration", "2"]);
        let Command::Fluctuation(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.markets.len(), 2);
        assert_eq!(args.duration, Some(2));
        assert_eq!(args.interval, 10);
    }

    #[test]
    fn user_list_skips_blanks_and_comments() {
        let users = parse_user_list("0xA\n\n# team\n  0xB  # maker\n#0xC\n");
        assert_eq!(users, vec!["0xA", "0xB"]);
    }
}
