use crate::data_context::MarketData;
use crate::models::{SymbolInfo, Timeframe};
use anyhow::{anyhow, Context, Result};
use log::info;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub csv_files: Vec<PathBuf>,
    pub timeframe: Timeframe,
    /// Used for rows without a symbol column.
    pub symbol: Option<String>,
    pub point: Option<f64>,
    pub stops_level: Option<i64>,
    pub digits: Option<u32>,
}

/// Imports CSV price files into the snapshot at `market_data_file`,
/// extending it when it already exists.
pub fn run(market_data_file: &Path, options: &ImportOptions) -> Result<()> {
    if options.csv_files.is_empty() {
        return Err(anyhow!("No CSV files given"));
    }

    let mut market_data = if market_data_file.exists() {
        MarketData::load_from_file(market_data_file)?
    } else {
        info!(
            "Creating new market data snapshot at {}",
            market_data_file.display()
        );
        MarketData::new()
    };

    for path in &options.csv_files {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let added = market_data
            .import_csv(
                BufReader::new(file),
                options.timeframe,
                options.symbol.as_deref(),
            )
            .with_context(|| format!("Failed to import {}", path.display()))?;

        let mut symbols: Vec<_> = added.into_iter().collect();
        symbols.sort();
        for (symbol, count) in symbols {
            info!(
                "{}: {} new {} bar(s) for {}",
                path.display(),
                count,
                options.timeframe,
                symbol
            );
        }
    }

    if let Some(point) = options.point {
        let symbol = options
            .symbol
            .as_deref()
            .ok_or_else(|| anyhow!("--point requires --symbol"))?;
        let mut info = SymbolInfo::new(symbol, point, options.stops_level.unwrap_or(0));
        info.digits = options.digits;
        info!(
            "Recording metadata for {}: point {}, stops level {}",
            symbol, info.point, info.stops_level
        );
        market_data.set_symbol_info(info);
    }

    market_data.save_to_file(market_data_file)?;
    info!(
        "Market data snapshot saved to {} ({} series)",
        market_data_file.display(),
        market_data.series_count()
    );
    Ok(())
}
