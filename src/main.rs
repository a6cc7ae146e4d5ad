//! Trading guard operator tool
//!
//! This binary provides four subcommands:
//! - consume: Spend quota for a key and show the decision and headers
//! - status: Show a key's current window without consuming
//! - reset: Forget a key's window
//! - probe: Call MEXC through a circuit breaker and report its status

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trading_guard::Config;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "trading-guard")]
#[command(about = "Rate limiter and circuit breaker tooling for the trading dashboard API", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Consume quota for a key
    Consume {
        /// Limit class, e.g. "order_create" ("default" is the general quota)
        #[arg(long, default_value = "default")]
        class: String,

        /// Rate limit key, e.g. "user:42" or "ip:203.0.113.7"
        #[arg(short, long)]
        key: String,

        /// Route name used to look up the cost
        #[arg(short, long)]
        route: Option<String>,

        /// Explicit cost (overrides the route cost)
        #[arg(long)]
        cost: Option<u32>,

        /// Number of consecutive requests to simulate
        #[arg(short = 'n', long, default_value = "1")]
        times: u32,
    },

    /// Show the current window for a key
    Status {
        /// Limit class, e.g. "order_create" ("default" is the general quota)
        #[arg(long, default_value = "default")]
        class: String,

        #[arg(short, long)]
        key: String,
    },

    /// Reset the window for a key
    Reset {
        /// Limit class, e.g. "order_create" ("default" is the general quota)
        #[arg(long, default_value = "default")]
        class: String,

        #[arg(short, long)]
        key: String,
    },

    /// Call the MEXC price endpoint through a circuit breaker
    Probe {
        /// Trading pair
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Number of calls
        #[arg(short = 'n', long, default_value = "5")]
        attempts: u32,

        /// Delay between calls in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn,redis=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // File layer - same format but without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Consume { .. } => "consume",
        Commands::Status { .. } => "status",
        Commands::Reset { .. } => "reset",
        Commands::Probe { .. } => "probe",
    };

    setup_logging(cli.verbose, command_name)?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Consume {
            class,
            key,
            route,
            cost,
            times,
        } => commands::limit::consume(&config, class, key, route, cost, times),
        Commands::Status { class, key } => commands::limit::status(&config, class, key),
        Commands::Reset { class, key } => commands::limit::reset(&config, class, key),
        Commands::Probe {
            symbol,
            attempts,
            interval_ms,
        } => commands::probe::run(&config, symbol, attempts, interval_ms),
    }
}
