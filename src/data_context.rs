use crate::bar_utils::{group_bars_by_symbol, normalize_symbol, SymbolBar};
use crate::error::{EngineError, EngineResult};
use crate::models::{Bar, BarSeries, SymbolInfo, Timeframe};
use anyhow::{anyhow, Context, Result};
use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Supplies bar history for a symbol and timeframe.
pub trait HistoricalDataSource {
    /// Bars within `[start, end]` (either bound optional). A symbol or
    /// timeframe the source has never seen is `ExternalUnavailable`, and so
    /// is a range that selects no bars.
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<BarSeries>;
}

/// Supplies price increment and broker stop distance for a symbol.
pub trait SymbolMetadataSource {
    fn symbol_info(&self, symbol: &str) -> EngineResult<SymbolInfo>;
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: Vec<SnapshotSeries>,
    symbols: Vec<SymbolInfo>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotSeries {
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
}

/// In-memory price history and symbol metadata, persisted as a bincode snapshot.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: HashMap<String, HashMap<Timeframe, Vec<Bar>>>,
    symbols: HashMap<String, SymbolInfo>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let mut market_data = Self::new();
        for entry in snapshot.series {
            let series = BarSeries::from_bars(&entry.symbol, entry.timeframe, entry.bars)
                .with_context(|| {
                    format!(
                        "Snapshot holds an invalid series for {} {}",
                        entry.symbol, entry.timeframe
                    )
                })?;
            market_data.insert_series(series);
        }
        for info in snapshot.symbols {
            market_data.set_symbol_info(info);
        }

        info!(
            "Loaded market data snapshot from {} (generated {}, {} series)",
            path.display(),
            snapshot.generated_at.format("%Y-%m-%d %H:%M:%S"),
            market_data.series_count()
        );
        Ok(market_data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);

        let mut series = Vec::with_capacity(self.series_count());
        for (symbol, by_timeframe) in &self.series {
            for (timeframe, bars) in by_timeframe {
                series.push(SnapshotSeries {
                    symbol: symbol.clone(),
                    timeframe: *timeframe,
                    bars: bars.clone(),
                });
            }
        }
        series.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.timeframe.as_str().cmp(b.timeframe.as_str()))
        });
        let mut symbols: Vec<SymbolInfo> = self.symbols.values().cloned().collect();
        symbols.sort_by(|a, b| a.name.cmp(&b.name));

        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            series,
            symbols,
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    /// Replaces any stored history for the series' symbol and timeframe.
    pub fn insert_series(&mut self, series: BarSeries) {
        let symbol = series.symbol().to_string();
        let timeframe = series.timeframe();
        self.series
            .entry(symbol)
            .or_default()
            .insert(timeframe, series.into_bars());
    }

    /// Adds bars to the stored history. Timestamps already present keep
    /// their stored bar. Returns how many bars were added.
    pub fn merge_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        bars: Vec<Bar>,
    ) -> EngineResult<usize> {
        let Some(symbol) = normalize_symbol(symbol) else {
            return Err(EngineError::invalid_parameter("symbol", "symbol is empty"));
        };
        let existing = self
            .series
            .get(&symbol)
            .and_then(|by_timeframe| by_timeframe.get(&timeframe))
            .cloned()
            .unwrap_or_default();
        let before = existing.len();

        let mut combined = existing;
        combined.extend(bars);
        // Stable sort keeps stored bars ahead of new ones sharing a timestamp.
        combined.sort_by(|a, b| a.time.cmp(&b.time));
        combined.dedup_by(|later, earlier| later.time == earlier.time);

        let series = BarSeries::from_bars(&symbol, timeframe, combined)?;
        let added = series.len() - before;
        self.insert_series(series);
        Ok(added)
    }

    pub fn set_symbol_info(&mut self, info: SymbolInfo) {
        let key = normalize_symbol(&info.name).unwrap_or_else(|| info.name.clone());
        self.symbols.insert(key, info);
    }

    pub fn has_data(&self) -> bool {
        self.series.values().any(|by_timeframe| !by_timeframe.is_empty())
    }

    pub fn series_count(&self) -> usize {
        self.series.values().map(HashMap::len).sum()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.series.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn timeframes(&self, symbol: &str) -> Vec<Timeframe> {
        let mut timeframes: Vec<Timeframe> = normalize_symbol(symbol)
            .and_then(|key| self.series.get(&key))
            .map(|by_timeframe| by_timeframe.keys().copied().collect())
            .unwrap_or_default();
        timeframes.sort_by_key(|tf| Timeframe::ALL.iter().position(|known| known == tf));
        timeframes
    }

    /// Reads price rows from CSV and merges them under `timeframe`.
    /// Returns the number of new bars per symbol.
    pub fn import_csv<R: Read>(
        &mut self,
        reader: R,
        timeframe: Timeframe,
        default_symbol: Option<&str>,
    ) -> Result<HashMap<String, usize>> {
        let rows = read_csv_bars(reader, default_symbol)?;
        let grouped = group_bars_by_symbol(rows, None);

        let mut added = HashMap::with_capacity(grouped.len());
        for (symbol, bars) in grouped {
            let count = self
                .merge_bars(&symbol, timeframe, bars)
                .with_context(|| format!("Failed to import bars for {}", symbol))?;
            added.insert(symbol, count);
        }
        Ok(added)
    }
}

impl HistoricalDataSource for MarketData {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<BarSeries> {
        let key = normalize_symbol(symbol).unwrap_or_default();
        let bars = self
            .series
            .get(&key)
            .and_then(|by_timeframe| by_timeframe.get(&timeframe))
            .ok_or_else(|| {
                EngineError::unavailable(symbol, &format!("{} price history", timeframe))
            })?;

        let from = start.map(|s| bars.partition_point(|bar| bar.time < s)).unwrap_or(0);
        let to = end
            .map(|e| bars.partition_point(|bar| bar.time <= e))
            .unwrap_or(bars.len());
        if from >= to {
            return Err(EngineError::unavailable(
                symbol,
                format!("{} price history in range", timeframe),
            ));
        }

        BarSeries::from_bars(&key, timeframe, bars[from..to].to_vec())
    }
}

impl SymbolMetadataSource for MarketData {
    fn symbol_info(&self, symbol: &str) -> EngineResult<SymbolInfo> {
        normalize_symbol(symbol)
            .and_then(|key| self.symbols.get(&key))
            .cloned()
            .ok_or_else(|| EngineError::unavailable(symbol, "symbol metadata"))
    }
}

#[derive(Debug, Deserialize)]
struct CsvBarRow {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(alias = "timestamp", alias = "date", alias = "datetime")]
    time: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default, alias = "tick_volume")]
    volume: Option<f64>,
}

/// Parses CSV rows with a header of `time,open,high,low,close[,volume][,symbol]`.
/// Rows without a symbol column use `default_symbol`.
pub fn read_csv_bars<R: Read>(reader: R, default_symbol: Option<&str>) -> Result<Vec<SymbolBar>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (line, record) in csv_reader.deserialize::<CsvBarRow>().enumerate() {
        let row = record.with_context(|| format!("Invalid CSV row {}", line + 2))?;
        let symbol = match row.symbol.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(symbol) => symbol.to_string(),
            None => match default_symbol {
                Some(symbol) => symbol.to_string(),
                None => {
                    return Err(anyhow!(
                        "CSV row {} has no symbol and no default symbol was given",
                        line + 2
                    ))
                }
            },
        };
        let Some(time) = parse_bar_time(&row.time) else {
            warn!("Skipping CSV row {}: unrecognised time '{}'", line + 2, row.time);
            continue;
        };

        rows.push(SymbolBar {
            symbol,
            bar: Bar {
                time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            },
        });
    }
    Ok(rows)
}

/// Accepts unix seconds, RFC 3339, or `YYYY-MM-DD HH:MM[:SS]` / `YYYY.MM.DD HH:MM` read as UTC.
pub fn parse_bar_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Utc.timestamp_opt(seconds, 0).single();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y.%m.%d %H:%M:%S",
        "%Y.%m.%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
