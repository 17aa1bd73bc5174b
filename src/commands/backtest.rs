use crate::bar_utils::first_index_at_or_after;
use crate::commands::{format_profit_factor, write_json_output};
use crate::config::{AppConfig, EngineRuntimeSettings, SymbolConfig};
use crate::data_context::{HistoricalDataSource, MarketData, SymbolMetadataSource};
use crate::engine::{Engine, SimulationSettings};
use crate::error::{EngineError, EngineResult};
use crate::models::{BacktestResult, BarSeries, Timeframe};
use crate::risk_manager::RiskManager;
use crate::strategy::create_strategy;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolBacktestOutcome {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub template_id: String,
    pub result: Option<BacktestResult>,
    pub error: Option<String>,
}

pub fn run(config_file: &Path, market_data_file: &Path, output: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(config_file)?;
    if config.symbols.is_empty() {
        return Err(anyhow!(
            "No symbols configured in {}",
            config_file.display()
        ));
    }
    let market_data = MarketData::load_from_file(market_data_file)?;
    if !market_data.has_data() {
        return Err(anyhow!(
            "Market data snapshot {} holds no price history",
            market_data_file.display()
        ));
    }

    info!(
        "Backtesting {} symbol(s) from {}",
        config.symbols.len(),
        market_data_file.display()
    );
    let outcomes = run_backtests(&config.settings, &config.symbols, &market_data);
    print_backtest_report(&outcomes);

    if let Some(path) = output {
        write_json_output(path, &outcomes)?;
        info!("Backtest results written to {}", path.display());
    }

    let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
    if failed == outcomes.len() {
        return Err(anyhow!("Backtest failed for every configured symbol"));
    }
    Ok(())
}

/// Runs each symbol independently and in parallel. A symbol that fails is
/// reported in its outcome without affecting the others.
pub fn run_backtests<S>(
    settings: &EngineRuntimeSettings,
    symbols: &[SymbolConfig],
    source: &S,
) -> Vec<SymbolBacktestOutcome>
where
    S: HistoricalDataSource + SymbolMetadataSource + Sync,
{
    symbols
        .par_iter()
        .map(|symbol_config| {
            let outcome = backtest_symbol(settings, symbol_config, source);
            if let Err(e) = &outcome {
                warn!("Backtest for {} aborted: {}", symbol_config.symbol, e);
            }
            let (result, error) = match outcome {
                Ok(result) => (Some(result), None),
                Err(e) => (None, Some(e.to_string())),
            };
            SymbolBacktestOutcome {
                symbol: symbol_config.symbol.clone(),
                timeframe: symbol_config.timeframe,
                template_id: symbol_config.template_id.clone(),
                result,
                error,
            }
        })
        .collect()
}

pub fn backtest_symbol<S>(
    settings: &EngineRuntimeSettings,
    symbol_config: &SymbolConfig,
    source: &S,
) -> EngineResult<BacktestResult>
where
    S: HistoricalDataSource + SymbolMetadataSource + ?Sized,
{
    let symbol_info = match &symbol_config.symbol_info {
        Some(info) => info.clone(),
        None => source.symbol_info(&symbol_config.symbol)?,
    };
    let strategy = create_strategy(&symbol_config.template_id, &symbol_config.parameters)?;
    let risk = RiskManager::new(&symbol_info, &symbol_config.risk)?;
    // Bars before the backtest start stay in the series as indicator history.
    let series = source.fetch_bars(
        &symbol_config.symbol,
        symbol_config.timeframe,
        None,
        settings.backtest_end,
    )?;
    require_bars_from(&series, settings.backtest_start)?;

    let simulation = SimulationSettings::for_symbol(settings, symbol_config, strategy.as_ref());
    Ok(Engine::new(simulation).backtest(strategy.as_ref(), &risk, &series))
}

/// Fails when `start` lies after the last bar, leaving nothing to simulate.
pub fn require_bars_from(series: &BarSeries, start: Option<DateTime<Utc>>) -> EngineResult<()> {
    let Some(start) = start else {
        return Ok(());
    };
    if first_index_at_or_after(series.bars(), start) >= series.len() {
        return Err(EngineError::unavailable(
            series.symbol(),
            format!(
                "{} price history from {}",
                series.timeframe(),
                start.format("%Y-%m-%d %H:%M")
            ),
        ));
    }
    Ok(())
}

pub fn print_backtest_report(outcomes: &[SymbolBacktestOutcome]) {
    println!();
    println!(
        "{:<10} {:<5} {:<16} {:>7} {:>8} {:>8} {:>12} {:>10} {:>10}",
        "Symbol", "TF", "Strategy", "Trades", "Win %", "PF", "Net (pips)", "Avg win", "Avg loss"
    );
    println!("{}", "-".repeat(94));

    for outcome in outcomes {
        match (&outcome.result, &outcome.error) {
            (Some(result), _) => {
                let p = &result.performance;
                println!(
                    "{:<10} {:<5} {:<16} {:>7} {:>8.2} {:>8} {:>12.1} {:>10.1} {:>10.1}",
                    outcome.symbol,
                    outcome.timeframe.as_str(),
                    outcome.template_id,
                    p.total_trades,
                    p.win_rate,
                    format_profit_factor(p.profit_factor),
                    p.net_profit,
                    p.avg_win,
                    p.avg_loss
                );
                if let Some(position) = &result.open_position {
                    println!(
                        "{:<10} open {} since {} at {}",
                        "",
                        position.direction.as_str(),
                        position.entry_time.format("%Y-%m-%d %H:%M"),
                        position.entry_price
                    );
                }
            }
            (None, Some(error)) => {
                println!(
                    "{:<10} {:<5} {:<16} error: {}",
                    outcome.symbol,
                    outcome.timeframe.as_str(),
                    outcome.template_id,
                    error
                );
            }
            (None, None) => {}
        }
    }
    println!();
}
