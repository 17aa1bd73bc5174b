use crate::error::{EngineError, EngineResult};
use crate::models::{parameter_map_from_values, SymbolInfo, Timeframe};
use crate::param_utils::{binary_param, finite_param, get_param_f64, require_positive};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_FIXED_VOLUME: f64 = 0.01;

/// Whether a new position may open on the bar that just closed the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentryPolicy {
    SameBar,
    NextBar,
}

impl ReentryPolicy {
    /// `sameBarReentry` overrides the strategy default when present.
    pub fn from_parameters(params: &HashMap<String, f64>, default: ReentryPolicy) -> Self {
        match binary_param(params, "sameBarReentry") {
            Some(true) => ReentryPolicy::SameBar,
            Some(false) => ReentryPolicy::NextBar,
            None => default,
        }
    }
}

/// Stop distance and reward multiple for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskConfig {
    /// Configured stop distance in price increments.
    pub stop_loss_points: f64,
    pub reward_risk_ratio: f64,
}

impl RiskConfig {
    pub fn new(stop_loss_points: f64, reward_risk_ratio: f64) -> EngineResult<Self> {
        if !stop_loss_points.is_finite()
            || stop_loss_points <= 0.0
            || stop_loss_points.fract().abs() > 1e-9
        {
            return Err(EngineError::invalid_parameter(
                "stopLossPoints",
                format!("must be a positive whole number (value: {})", stop_loss_points),
            ));
        }
        if !reward_risk_ratio.is_finite() || reward_risk_ratio <= 0.0 {
            return Err(EngineError::invalid_parameter(
                "rewardRiskRatio",
                format!("must be > 0 (value: {})", reward_risk_ratio),
            ));
        }
        Ok(Self {
            stop_loss_points,
            reward_risk_ratio,
        })
    }

    /// Both keys are required; a missing key is a configuration error.
    pub fn from_parameters(params: &HashMap<String, f64>) -> EngineResult<Self> {
        let stop = params.get("stopLossPoints").copied().ok_or_else(|| {
            EngineError::invalid_parameter("stopLossPoints", "missing required parameter")
        })?;
        let ratio = params.get("rewardRiskRatio").copied().ok_or_else(|| {
            EngineError::invalid_parameter("rewardRiskRatio", "missing required parameter")
        })?;
        Self::new(stop, ratio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionSizing {
    Fixed { volume: f64 },
    /// Size so a stop-out loses `risk_percent` of the account balance.
    Risk { risk_percent: f64 },
}

impl PositionSizing {
    pub fn from_parameters(params: &HashMap<String, f64>) -> EngineResult<Self> {
        if params.contains_key("riskPercent") {
            let risk_percent = require_positive(params, "riskPercent", 1.0)?;
            if risk_percent > 100.0 {
                return Err(EngineError::invalid_parameter(
                    "riskPercent",
                    format!("must be <= 100 (value: {})", risk_percent),
                ));
            }
            return Ok(PositionSizing::Risk { risk_percent });
        }
        let volume = require_positive(params, "volume", DEFAULT_FIXED_VOLUME)?;
        Ok(PositionSizing::Fixed { volume })
    }
}

#[derive(Debug, Clone)]
pub struct EngineRuntimeSettings {
    pub account_balance: f64,
    pub simulated_spread_points: f64,
    pub close_open_position_at_end: bool,
    pub profit_factor_threshold: f64,
    pub optimization_top_n: usize,
    pub optimization_time_budget: Option<Duration>,
    /// 0 means one worker per CPU.
    pub optimization_workers: usize,
    pub backtest_start: Option<DateTime<Utc>>,
    pub backtest_end: Option<DateTime<Utc>>,
}

impl Default for EngineRuntimeSettings {
    fn default() -> Self {
        Self {
            account_balance: 10_000.0,
            simulated_spread_points: 0.0,
            close_open_position_at_end: false,
            profit_factor_threshold: 1.2,
            optimization_top_n: 5,
            optimization_time_budget: None,
            optimization_workers: 0,
            backtest_start: None,
            backtest_end: None,
        }
    }
}

impl EngineRuntimeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let account_balance =
            optional_setting_f64(settings, "ACCOUNT_BALANCE", Some(0.0), None)?
                .unwrap_or(defaults.account_balance);
        let simulated_spread_points =
            optional_setting_f64(settings, "SIMULATED_SPREAD_POINTS", Some(0.0), None)?
                .unwrap_or(defaults.simulated_spread_points);
        let close_open_position_at_end =
            optional_setting_bool(settings, "CLOSE_OPEN_POSITION_AT_END")?
                .unwrap_or(defaults.close_open_position_at_end);
        let profit_factor_threshold =
            optional_setting_f64(settings, "PROFIT_FACTOR_THRESHOLD", Some(0.0), None)?
                .unwrap_or(defaults.profit_factor_threshold);
        let optimization_top_n = optional_setting_usize(settings, "OPTIMIZATION_TOP_N", 1)?
            .unwrap_or(defaults.optimization_top_n);
        let optimization_time_budget =
            optional_setting_usize(settings, "OPTIMIZATION_TIME_BUDGET_SECS", 0)?
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(secs as u64));
        let optimization_workers = optional_setting_usize(settings, "OPTIMIZATION_WORKERS", 0)?
            .unwrap_or(defaults.optimization_workers);

        let backtest_start = optional_setting_date(settings, "BACKTEST_START_DATE")?
            .map(start_of_day);
        let backtest_end = optional_setting_date(settings, "BACKTEST_END_DATE")?
            .map(end_of_day);

        if let (Some(start), Some(end)) = (backtest_start, backtest_end) {
            if end < start {
                return Err(anyhow!(
                    "BACKTEST_END_DATE ({}) must be >= BACKTEST_START_DATE ({})",
                    end.date_naive(),
                    start.date_naive()
                ));
            }
        }

        Ok(Self {
            account_balance,
            simulated_spread_points,
            close_open_position_at_end,
            profit_factor_threshold,
            optimization_top_n,
            optimization_time_budget,
            optimization_workers,
            backtest_start,
            backtest_end,
        })
    }

    pub fn worker_count(&self) -> usize {
        if self.optimization_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.optimization_workers
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 59, 59)
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Immutable, validated settings for one traded symbol.
#[derive(Debug, Clone)]
pub struct SymbolConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub template_id: String,
    /// Strategy, risk and sizing parameters (camelCase keys).
    pub parameters: HashMap<String, f64>,
    pub risk: RiskConfig,
    pub sizing: PositionSizing,
    /// Overrides metadata from the data store when present.
    pub symbol_info: Option<SymbolInfo>,
}

impl SymbolConfig {
    pub fn new(
        symbol: &str,
        timeframe: Timeframe,
        template_id: &str,
        parameters: HashMap<String, f64>,
    ) -> EngineResult<Self> {
        let risk = RiskConfig::from_parameters(&parameters)?;
        let sizing = PositionSizing::from_parameters(&parameters)?;
        Ok(Self {
            symbol: symbol.to_string(),
            timeframe,
            template_id: template_id.to_string(),
            parameters,
            risk,
            sizing,
            symbol_info: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub template_id: String,
    /// Fixed parameters every combination starts from.
    pub base_parameters: HashMap<String, f64>,
    pub grid: BTreeMap<String, Vec<f64>>,
    pub symbol_info: Option<SymbolInfo>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: EngineRuntimeSettings,
    pub symbols: Vec<SymbolConfig>,
    pub optimization: Option<OptimizationConfig>,
}

#[derive(Debug, Deserialize)]
struct RawSymbolSection {
    symbol: String,
    timeframe: String,
    strategy: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default, rename = "symbolInfo")]
    symbol_info: Option<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct RawOptimizationSection {
    #[serde(flatten)]
    target: RawSymbolSection,
    grid: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawAppConfig {
    #[serde(default)]
    settings: HashMap<String, Value>,
    #[serde(default)]
    symbols: Vec<RawSymbolSection>,
    #[serde(default)]
    optimization: Option<RawOptimizationSection>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawAppConfig = serde_json::from_str(text).context("Failed to parse config JSON")?;

        let settings_map: HashMap<String, String> = raw
            .settings
            .into_iter()
            .map(|(key, value)| {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();
        let settings = EngineRuntimeSettings::from_settings_map(&settings_map)?;

        let mut symbols = Vec::with_capacity(raw.symbols.len());
        for section in raw.symbols {
            let name = section.symbol.clone();
            let config = build_symbol_config(section)
                .with_context(|| format!("Invalid symbol section {}", name))?;
            symbols.push(config);
        }

        let optimization = match raw.optimization {
            Some(section) => Some(build_optimization_config(section)?),
            None => None,
        };

        Ok(Self {
            settings,
            symbols,
            optimization,
        })
    }
}

fn build_symbol_config(section: RawSymbolSection) -> Result<SymbolConfig> {
    let timeframe: Timeframe = section.timeframe.parse()?;
    let parameters = parameter_map_from_values(section.parameters);
    let mut config = SymbolConfig::new(&section.symbol, timeframe, &section.strategy, parameters)?;
    config.symbol_info = section.symbol_info;
    Ok(config)
}

fn build_optimization_config(section: RawOptimizationSection) -> Result<OptimizationConfig> {
    let target = section.target;
    let timeframe: Timeframe = target
        .timeframe
        .parse()
        .context("Invalid optimization timeframe")?;

    for (name, values) in &section.grid {
        if values.is_empty() {
            return Err(anyhow!("Optimization grid entry {} has no values", name));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!(
                "Optimization grid entry {} must contain only finite numbers",
                name
            ));
        }
    }

    Ok(OptimizationConfig {
        symbol: target.symbol,
        timeframe,
        template_id: target.strategy,
        base_parameters: parameter_map_from_values(target.parameters),
        grid: section.grid,
        symbol_info: target.symbol_info,
    })
}

/// Spread in points to apply when simulating ask prices, per-symbol override first.
pub fn spread_points_for(params: &HashMap<String, f64>, settings: &EngineRuntimeSettings) -> f64 {
    finite_param(params, "spreadPoints")
        .filter(|v| *v >= 0.0)
        .unwrap_or(settings.simulated_spread_points)
}

/// Balance used for risk-based sizing, per-symbol override first.
pub fn account_balance_for(params: &HashMap<String, f64>, settings: &EngineRuntimeSettings) -> f64 {
    get_param_f64(params, "accountBalance", settings.account_balance)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(value) = optional_setting_f64(settings, key, None, None)? else {
        return Ok(None);
    };
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            value
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            value
        ));
    }
    Ok(Some(value as usize))
}

fn optional_setting_bool(settings: &HashMap<String, String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        _ => Err(anyhow!("Setting {} must be true or false (value: {})", key, raw)),
    }
}

pub fn optional_setting_date(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Option<NaiveDate>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| {
            anyhow!(
                "Setting {} must be a date in YYYY-MM-DD format (value: {})",
                key,
                raw
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn runtime_settings_fall_back_to_defaults() {
        let parsed = EngineRuntimeSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(parsed.profit_factor_threshold, 1.2);
        assert_eq!(parsed.optimization_top_n, 5);
        assert!(!parsed.close_open_position_at_end);
        assert!(parsed.optimization_time_budget.is_none());
    }

    #[test]
    fn runtime_settings_reject_bad_values() {
        let err = EngineRuntimeSettings::from_settings_map(&settings(&[(
            "SIMULATED_SPREAD_POINTS",
            "-1",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("SIMULATED_SPREAD_POINTS"));

        assert!(EngineRuntimeSettings::from_settings_map(&settings(&[(
            "BACKTEST_START_DATE",
            "2024-02-01"
        ), ("BACKTEST_END_DATE", "2024-01-01")]))
        .is_err());

        assert!(EngineRuntimeSettings::from_settings_map(&settings(&[(
            "OPTIMIZATION_TOP_N",
            "2.5"
        )]))
        .is_err());
    }

    #[test]
    fn risk_config_rejects_non_positive_values() {
        assert!(matches!(
            RiskConfig::new(0.0, 2.0),
            Err(EngineError::InvalidParameter { .. })
        ));
        assert!(RiskConfig::new(50.0, 0.0).is_err());
        assert!(RiskConfig::new(50.5, 2.0).is_err());
        assert!(RiskConfig::new(50.0, 2.0).is_ok());
    }

    #[test]
    fn risk_parameters_are_never_defaulted() {
        let mut params = HashMap::new();
        params.insert("stopLossPoints".to_string(), 80.0);
        let err = RiskConfig::from_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("rewardRiskRatio"));
    }

    #[test]
    fn sizing_prefers_risk_percent() {
        let mut params = HashMap::new();
        params.insert("volume".to_string(), 0.5);
        assert_eq!(
            PositionSizing::from_parameters(&params).unwrap(),
            PositionSizing::Fixed { volume: 0.5 }
        );
        params.insert("riskPercent".to_string(), 1.5);
        assert_eq!(
            PositionSizing::from_parameters(&params).unwrap(),
            PositionSizing::Risk { risk_percent: 1.5 }
        );
    }

    #[test]
    fn app_config_parses_symbols_and_grid() {
        let json = r#"{
            "settings": { "ACCOUNT_BALANCE": 25000, "CLOSE_OPEN_POSITION_AT_END": "true" },
            "symbols": [
                {
                    "symbol": "EURUSD",
                    "timeframe": "h1",
                    "strategy": "ma_crossover",
                    "parameters": { "fastPeriod": 10, "slowPeriod": 30, "stopLossPoints": 50, "rewardRiskRatio": 2.0 }
                }
            ],
            "optimization": {
                "symbol": "EURUSD",
                "timeframe": "H1",
                "strategy": "regime_momentum",
                "grid": { "stopLossPoints": [60, 80, 100], "rewardRiskRatio": [1.5, 1.8, 2.0] }
            }
        }"#;

        let config = AppConfig::from_json(json).unwrap();
        assert_eq!(config.settings.account_balance, 25000.0);
        assert!(config.settings.close_open_position_at_end);
        assert_eq!(config.symbols.len(), 1);
        assert_eq!(config.symbols[0].timeframe, Timeframe::H1);
        assert_eq!(config.symbols[0].risk.stop_loss_points, 50.0);

        let optimization = config.optimization.unwrap();
        assert_eq!(optimization.template_id, "regime_momentum");
        assert_eq!(optimization.grid["stopLossPoints"], vec![60.0, 80.0, 100.0]);
    }

    #[test]
    fn app_config_rejects_symbol_without_risk() {
        let json = r#"{
            "symbols": [
                { "symbol": "EURUSD", "timeframe": "H1", "strategy": "ma_crossover", "parameters": {} }
            ]
        }"#;
        let err = AppConfig::from_json(json).unwrap_err();
        assert!(format!("{:#}", err).contains("stopLossPoints"));
    }
}
