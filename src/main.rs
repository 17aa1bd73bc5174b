use anyhow::Result;
use clap::{Parser, Subcommand};
use fxengine::commands::{backtest, import_market_data, optimize};
use fxengine::models::Timeframe;
use log::info;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "fxengine.json";
const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "fxengine")]
#[command(about = "Signal, risk and backtest engine for bar-based FX strategies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest every configured symbol
    Backtest {
        /// Path to the JSON configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Write the full results as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Grid-search the parameters of the configured optimization target
    Optimize {
        /// Path to the JSON configuration file
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Worker threads (overrides OPTIMIZATION_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Write the full results as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Import CSV price files into the market data snapshot
    ImportMarketData {
        /// CSV files with a time,open,high,low,close[,volume][,symbol] header
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        /// Timeframe of the imported bars (M1, M5, M15, M30, H1, H4, D1, W1, MN1)
        #[arg(short, long)]
        timeframe: Timeframe,
        /// Symbol for rows without a symbol column
        #[arg(short, long)]
        symbol: Option<String>,
        /// Price increment of the symbol, stored as its metadata
        #[arg(long)]
        point: Option<f64>,
        /// Broker minimum stop distance in points
        #[arg(long = "stops-level")]
        stops_level: Option<i64>,
        /// Quote decimals (derived from the point when omitted)
        #[arg(long)]
        digits: Option<u32>,
        /// Snapshot file to create or extend
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting fxengine. Backtest results do not predict live performance.");

    match cli.command {
        Commands::Backtest {
            config,
            data_file,
            output,
        } => {
            backtest::run(
                &resolve_config_path(config),
                &resolve_market_data_path(data_file),
                output.as_deref(),
            )?;
        }
        Commands::Optimize {
            config,
            data_file,
            workers,
            output,
        } => {
            optimize::run(
                &resolve_config_path(config),
                &resolve_market_data_path(data_file),
                workers,
                output.as_deref(),
            )?;
        }
        Commands::ImportMarketData {
            files,
            timeframe,
            symbol,
            point,
            stops_level,
            digits,
            data_file,
        } => {
            let options = import_market_data::ImportOptions {
                csv_files: files,
                timeframe,
                symbol,
                point,
                stops_level,
                digits,
            };
            import_market_data::run(&resolve_market_data_path(data_file), &options)?;
        }
    }

    Ok(())
}

fn resolve_config_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}
