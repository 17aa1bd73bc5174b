use crate::error::{EngineError, EngineResult};
use anyhow::anyhow;
use chrono::{DateTime, Duration, Months, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::MN1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::MN1 => "MN1",
        }
    }

    /// End of the bar that opens at `open`. Monthly bars follow the calendar.
    pub fn close_time(&self, open: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let minutes = match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1_440,
            Timeframe::W1 => 10_080,
            Timeframe::MN1 => return open.checked_add_months(Months::new(1)),
        };
        open.checked_add_signed(Duration::minutes(minutes))
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| {
                EngineError::invalid_parameter("timeframe", format!("unknown timeframe '{}'", s))
            })
    }
}

/// Time-ordered bars for one symbol and timeframe. Timestamps are strictly
/// increasing; bars are only ever appended.
#[derive(Debug, Clone)]
pub struct BarSeries {
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe,
            bars: Vec::new(),
        }
    }

    pub fn from_bars(symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) -> EngineResult<Self> {
        let mut series = Self::new(symbol, timeframe);
        series.bars.reserve(bars.len());
        for bar in bars {
            series.push(bar)?;
        }
        Ok(series)
    }

    pub fn push(&mut self, bar: Bar) -> EngineResult<()> {
        let index = self.bars.len();
        let invalid = |reason: String| EngineError::InvalidSeries {
            symbol: self.symbol.clone(),
            index,
            reason,
        };

        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(invalid("non-finite price".to_string()));
        }
        if bar.high < bar.low {
            return Err(invalid(format!("high {} below low {}", bar.high, bar.low)));
        }
        if let Some(last) = self.bars.last() {
            if bar.time <= last.time {
                return Err(invalid(format!(
                    "timestamp {} does not follow {}",
                    bar.time, last.time
                )));
            }
        }

        self.bars.push(bar);
        Ok(())
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars
    }

    /// Bars with `start <= time <= end`.
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Bar] {
        let from = self.bars.partition_point(|bar| bar.time < start);
        let to = self.bars.partition_point(|bar| bar.time <= end);
        if from >= to {
            &[]
        } else {
            &self.bars[from..to]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            SignalAction::Buy => Some(Direction::Long),
            SignalAction::Sell => Some(Direction::Short),
            SignalAction::Hold => None,
        }
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
        }
    }

    pub fn entry_action(&self) -> SignalAction {
        match self {
            Direction::Long => SignalAction::Buy,
            Direction::Short => SignalAction::Sell,
        }
    }

    /// The entry signal that runs against a position held in this direction.
    pub fn opposite_action(&self) -> SignalAction {
        match self {
            Direction::Long => SignalAction::Sell,
            Direction::Short => SignalAction::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    OppositeSignal,
    StrategyExit,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "SL Hit",
            ExitReason::TakeProfit => "TP Hit",
            ExitReason::OppositeSignal => "Opposite Signal",
            ExitReason::StrategyExit => "Strategy Exit",
            ExitReason::EndOfData => "End Of Data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
}

impl Position {
    /// Profit or loss in price increments, positive when the move favoured the position.
    pub fn pnl_points(&self, exit_price: f64, point: f64) -> f64 {
        match self.direction {
            Direction::Long => (exit_price - self.entry_price) / point,
            Direction::Short => (self.entry_price - exit_price) / point,
        }
    }

    pub fn close(
        self,
        id: u64,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        exit_reason: ExitReason,
        point: f64,
    ) -> CompletedTrade {
        let pnl_pips = self.pnl_points(exit_price, point);
        CompletedTrade {
            id,
            symbol: self.symbol,
            direction: self.direction,
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            size: self.size,
            exit_time,
            exit_price,
            exit_reason,
            pnl_pips,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTrade {
    pub id: u64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub pnl_pips: f64,
}

fn default_point_value() -> f64 {
    1.0
}

fn default_volume_min() -> f64 {
    0.01
}

fn default_volume_step() -> f64 {
    0.01
}

fn default_volume_max() -> f64 {
    100.0
}

/// Broker metadata for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub name: String,
    /// Smallest quoted price step.
    pub point: f64,
    /// Broker minimum stop distance, in points.
    pub stops_level: i64,
    #[serde(default)]
    pub digits: Option<u32>,
    /// Account-currency value of one point for one unit of volume.
    #[serde(default = "default_point_value")]
    pub point_value: f64,
    #[serde(default = "default_volume_min")]
    pub volume_min: f64,
    #[serde(default = "default_volume_step")]
    pub volume_step: f64,
    #[serde(default = "default_volume_max")]
    pub volume_max: f64,
}

impl SymbolInfo {
    pub fn new(name: &str, point: f64, stops_level: i64) -> Self {
        Self {
            name: name.to_string(),
            point,
            stops_level,
            digits: None,
            point_value: default_point_value(),
            volume_min: default_volume_min(),
            volume_step: default_volume_step(),
            volume_max: default_volume_max(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage of trades with positive pnl.
    pub win_rate: f64,
    pub gross_profit: f64,
    /// Absolute sum of non-positive pnl.
    pub gross_loss: f64,
    pub net_profit: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub pnl_std_dev: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub template_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bars_processed: usize,
    pub trades: Vec<CompletedTrade>,
    pub open_position: Option<Position>,
    pub performance: PerformanceSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    #[serde(deserialize_with = "deserialize_parameters_map")]
    pub parameters: HashMap<String, f64>,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub win_rate: f64,
    pub net_profit: f64,
}

fn normalize_parameter_map(raw: HashMap<String, Value>) -> HashMap<String, f64> {
    let mut cleaned = HashMap::with_capacity(raw.len());

    for (key, value) in raw.into_iter() {
        if let Some(num) = value.as_f64() {
            if num.is_finite() {
                cleaned.insert(key, num);
            } else {
                warn!(
                    "Skipping parameter `{}` due to non-finite numeric value {}",
                    key, value
                );
            }
            continue;
        }

        if let Some(text) = value.as_str() {
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(parsed) if parsed.is_finite() => {
                    cleaned.insert(key, parsed);
                }
                _ => {
                    warn!(
                        "Skipping parameter `{}` due to non-numeric value '{}'",
                        key, trimmed
                    );
                }
            }
            continue;
        }

        if let Some(boolean) = value.as_bool() {
            cleaned.insert(key, if boolean { 1.0 } else { 0.0 });
            continue;
        }

        warn!(
            "Skipping parameter `{}` due to unsupported value {}",
            key, value
        );
    }

    cleaned
}

fn deserialize_parameters_map<'de, D>(deserializer: D) -> Result<HashMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, Value>::deserialize(deserializer)?;
    Ok(normalize_parameter_map(raw))
}

pub fn parameter_map_from_values(raw: HashMap<String, Value>) -> HashMap<String, f64> {
    normalize_parameter_map(raw)
}

#[derive(Debug, Clone)]
pub struct BacktestTask {
    pub id: String,
    pub template_id: String,
    pub parameters: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct BacktestTaskResult {
    pub task_id: String,
    pub result: Option<OptimizationResult>,
    pub error: Option<String>,
    pub cached: bool,
}
