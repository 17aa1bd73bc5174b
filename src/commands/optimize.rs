use crate::commands::backtest::require_bars_from;
use crate::commands::{format_profit_factor, write_json_output};
use crate::config::AppConfig;
use crate::data_context::{HistoricalDataSource, MarketData, SymbolMetadataSource};
use crate::optimizer::{
    format_parameters, OptimizationEngine, OptimizationReport, OptimizerOptions, ParameterGrid,
};
use anyhow::{anyhow, Context, Result};
use log::info;
use std::path::Path;
use std::sync::Arc;

pub fn run(
    config_file: &Path,
    market_data_file: &Path,
    workers: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let config = AppConfig::load(config_file)?;
    let optimization = config.optimization.as_ref().ok_or_else(|| {
        anyhow!(
            "No optimization section configured in {}",
            config_file.display()
        )
    })?;
    info!(
        "Received optimize command for template_id={} on {} {}",
        optimization.template_id, optimization.symbol, optimization.timeframe
    );

    let market_data = MarketData::load_from_file(market_data_file)?;
    let symbol_info = match &optimization.symbol_info {
        Some(info) => info.clone(),
        None => market_data.symbol_info(&optimization.symbol)?,
    };
    let series = market_data
        .fetch_bars(
            &optimization.symbol,
            optimization.timeframe,
            None,
            config.settings.backtest_end,
        )
        .with_context(|| format!("No price history to optimize {}", optimization.symbol))?;
    require_bars_from(&series, config.settings.backtest_start)?;

    let grid = ParameterGrid::from_config(optimization)?;
    let mut options = OptimizerOptions::from_settings(&config.settings);
    if let Some(workers) = workers {
        options.workers = workers.max(1);
    }
    info!(
        "Grid over [{}]: {} combinations on {} bars",
        grid.parameter_names()
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
        grid.len(),
        series.len()
    );

    let engine = OptimizationEngine::new(
        Arc::new(series),
        symbol_info,
        &optimization.template_id,
        config.settings.clone(),
        options,
    );
    let report = engine.run(&grid, &optimization.base_parameters)?;
    print_optimization_report(&report);

    if let Some(path) = output {
        write_json_output(path, &report)?;
        info!("Optimization results written to {}", path.display());
    }
    Ok(())
}

pub fn print_optimization_report(report: &OptimizationReport) {
    println!();
    println!(
        "Optimization of {} on {} {}: {} combinations, {} evaluated, {} failed, {} skipped, {} cached",
        report.template_id,
        report.symbol,
        report.phase,
        report.total_combinations,
        report.results.len(),
        report.failed,
        report.skipped,
        report.cache_hits
    );

    if report.has_profitable() {
        println!(
            "Combinations with profit factor above {:.2}:",
            report.profit_factor_threshold
        );
    } else {
        println!(
            "No combination exceeded profit factor {:.2}. Top {} overall:",
            report.profit_factor_threshold, report.top_n
        );
    }
    for (rank, result) in report.selected().iter().enumerate() {
        println!(
            "{:>3}. PF {:>6} | trades {:>4} | win {:>6.2}% | net {:>9.1} | {}",
            rank + 1,
            format_profit_factor(result.profit_factor),
            result.total_trades,
            result.win_rate,
            result.net_profit,
            format_parameters(&result.parameters)
        );
    }

    if let Some(best) = report.best() {
        println!(
            "Best overall: PF {} with [{}]",
            format_profit_factor(best.profit_factor),
            format_parameters(&best.parameters)
        );
    }
    println!();
}
