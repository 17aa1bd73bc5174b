use crate::cache::ResultCache;
use crate::config::{EngineRuntimeSettings, OptimizationConfig, SymbolConfig};
use crate::engine::{Engine, SimulationSettings};
use crate::error::{EngineError, EngineResult};
use crate::models::{BacktestTask, BacktestTaskResult, BarSeries, OptimizationResult, SymbolInfo};
use crate::optimizer_status::{OptimizerPhase, OptimizerStatus};
use crate::param_utils::parameter_signature;
use crate::risk_manager::RiskManager;
use crate::strategy::create_strategy;
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Candidate values per parameter. Values are deduplicated, so the
/// cartesian product never repeats a combination.
#[derive(Debug, Clone)]
pub struct ParameterGrid {
    axes: BTreeMap<String, Vec<f64>>,
}

impl ParameterGrid {
    pub fn new(axes: BTreeMap<String, Vec<f64>>) -> EngineResult<Self> {
        let mut cleaned = BTreeMap::new();
        for (name, mut values) in axes {
            if values.is_empty() {
                return Err(EngineError::invalid_parameter(&name, "grid axis has no values"));
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::invalid_parameter(
                    &name,
                    "grid values must be finite",
                ));
            }
            values.sort_by(|a, b| a.total_cmp(b));
            values.dedup();
            cleaned.insert(name, values);
        }
        Ok(Self { axes: cleaned })
    }

    pub fn from_config(config: &OptimizationConfig) -> EngineResult<Self> {
        Self::new(config.grid.clone())
    }

    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &String> {
        self.axes.keys()
    }

    /// Every combination layered over `base`.
    pub fn combinations(&self, base: &HashMap<String, f64>) -> Vec<HashMap<String, f64>> {
        let total = self.len();
        if total == 0 {
            return Vec::new();
        }

        let axes: Vec<(&String, &Vec<f64>)> = self.axes.iter().collect();
        let mut cursor = vec![0usize; axes.len()];
        let mut combinations = Vec::with_capacity(total);

        for _ in 0..total {
            let mut parameters = base.clone();
            for (axis, &position) in axes.iter().zip(cursor.iter()) {
                parameters.insert(axis.0.clone(), axis.1[position]);
            }
            combinations.push(parameters);

            for (axis_index, position) in cursor.iter_mut().enumerate().rev() {
                *position += 1;
                if *position < axes[axis_index].1.len() {
                    break;
                }
                *position = 0;
            }
        }

        combinations
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub workers: usize,
    pub time_budget: Option<Duration>,
    pub profit_factor_threshold: f64,
    pub top_n: usize,
    pub show_progress: bool,
}

impl OptimizerOptions {
    pub fn from_settings(settings: &EngineRuntimeSettings) -> Self {
        Self {
            workers: settings.worker_count(),
            time_budget: settings.optimization_time_budget,
            profit_factor_threshold: settings.profit_factor_threshold,
            top_n: settings.optimization_top_n,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationReport {
    pub template_id: String,
    pub symbol: String,
    pub total_combinations: usize,
    /// Sorted by profit factor, best first.
    pub results: Vec<OptimizationResult>,
    pub failed: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub cancelled: bool,
    pub phase: OptimizerPhase,
    pub profit_factor_threshold: f64,
    pub top_n: usize,
}

impl OptimizationReport {
    /// Combinations above the profitability threshold, or the top N when none qualify.
    pub fn selected(&self) -> &[OptimizationResult] {
        let profitable = self
            .results
            .iter()
            .take_while(|r| r.profit_factor > self.profit_factor_threshold)
            .count();
        if profitable > 0 {
            &self.results[..profitable]
        } else {
            &self.results[..self.top_n.min(self.results.len())]
        }
    }

    pub fn has_profitable(&self) -> bool {
        self.results
            .first()
            .map(|r| r.profit_factor > self.profit_factor_threshold)
            .unwrap_or(false)
    }

    pub fn best(&self) -> Option<&OptimizationResult> {
        self.results.first()
    }
}

pub fn sort_results(results: &mut [OptimizationResult]) {
    results.sort_by(|a, b| {
        b.profit_factor
            .total_cmp(&a.profit_factor)
            .then_with(|| b.total_trades.cmp(&a.total_trades))
            .then_with(|| parameter_signature(&a.parameters).cmp(&parameter_signature(&b.parameters)))
    });
}

/// Everything a worker needs to evaluate one combination. Shared read-only.
struct WorkerContext {
    series: Arc<BarSeries>,
    symbol_info: SymbolInfo,
    template_id: String,
    runtime_settings: EngineRuntimeSettings,
    cache: ResultCache,
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

pub struct OptimizationEngine {
    series: Arc<BarSeries>,
    symbol_info: SymbolInfo,
    template_id: String,
    runtime_settings: EngineRuntimeSettings,
    options: OptimizerOptions,
    cache: ResultCache,
    status: OptimizerStatus,
    cancelled: Arc<AtomicBool>,
}

impl OptimizationEngine {
    pub fn new(
        series: Arc<BarSeries>,
        symbol_info: SymbolInfo,
        template_id: &str,
        runtime_settings: EngineRuntimeSettings,
        options: OptimizerOptions,
    ) -> Self {
        Self {
            series,
            symbol_info,
            template_id: template_id.to_string(),
            runtime_settings,
            options,
            cache: ResultCache::new(),
            status: OptimizerStatus::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn status(&self) -> OptimizerStatus {
        self.status.clone()
    }

    /// Setting the flag stops workers from starting further combinations.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn run(
        &self,
        grid: &ParameterGrid,
        base_parameters: &HashMap<String, f64>,
    ) -> Result<OptimizationReport> {
        let variations = grid.combinations(base_parameters);
        let variation_count = variations.len();
        self.status.begin(variation_count);

        let mut report = OptimizationReport {
            template_id: self.template_id.clone(),
            symbol: self.series.symbol().to_string(),
            total_combinations: variation_count,
            results: Vec::new(),
            failed: 0,
            skipped: 0,
            cache_hits: 0,
            cancelled: false,
            phase: OptimizerPhase::Running,
            profit_factor_threshold: self.options.profit_factor_threshold,
            top_n: self.options.top_n,
        };
        if variation_count == 0 {
            report.phase = self.status.finish().phase;
            return Ok(report);
        }

        info!(
            "Running {} {} backtests on {} {}...",
            variation_count,
            self.template_id,
            self.series.symbol(),
            self.series.timeframe()
        );

        let num_workers = variation_count.min(self.options.workers.max(1));
        info!("Using {} worker threads", num_workers);

        let (tx, rx): (Sender<BacktestTask>, Receiver<BacktestTask>) = bounded(variation_count);
        let (result_tx, result_rx): (Sender<BacktestTaskResult>, Receiver<BacktestTaskResult>) =
            bounded(variation_count);

        let context = Arc::new(WorkerContext {
            series: self.series.clone(),
            symbol_info: self.symbol_info.clone(),
            template_id: self.template_id.clone(),
            runtime_settings: self.runtime_settings.clone(),
            cache: self.cache.clone(),
            cancelled: self.cancelled.clone(),
            deadline: self.options.time_budget.map(|budget| Instant::now() + budget),
        });

        let mut handles = Vec::with_capacity(num_workers);
        for _worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let context = context.clone();

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    let result = run_task(&context, &task);
                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for (i, parameters) in variations.into_iter().enumerate() {
            let task = BacktestTask {
                id: format!("{}_{}", self.template_id, i),
                template_id: self.template_id.clone(),
                parameters,
            };
            tx.send(task)?;
        }
        drop(tx);

        let pb = if self.options.show_progress {
            ProgressBar::new(variation_count as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut received = 0;
        while received < variation_count {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(result) => {
                    received += 1;
                    let progress = self.status.record(&result);
                    pb.set_position(received as u64);
                    pb.set_message(progress.message());

                    if let Some(opt_result) = result.result {
                        report.results.push(opt_result);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("Optimizer worker thread panicked");
            }
        }

        let progress = self.status.finish();
        report.failed = progress.failed;
        report.skipped = progress.skipped;
        report.cache_hits = progress.cache_hits;
        report.phase = progress.phase;
        report.cancelled = progress.phase == OptimizerPhase::Cancelled;
        if report.failed > 0 {
            warn!(
                "Optimization completed with {} failed combinations",
                report.failed
            );
        }
        if report.cancelled {
            warn!(
                "Optimization stopped early: {} of {} combinations not evaluated",
                report.skipped, variation_count
            );
            pb.finish_with_message(format!("Optimization cancelled: {}", progress.message()));
        } else {
            pb.finish_with_message(format!("Optimization completed: {}", progress.message()));
        }

        sort_results(&mut report.results);
        Ok(report)
    }
}

fn run_task(context: &WorkerContext, task: &BacktestTask) -> BacktestTaskResult {
    let expired = context
        .deadline
        .map(|deadline| Instant::now() >= deadline)
        .unwrap_or(false);
    if expired {
        context.cancelled.store(true, Ordering::Relaxed);
    }
    if context.cancelled.load(Ordering::Relaxed) {
        return BacktestTaskResult {
            task_id: task.id.clone(),
            result: None,
            error: None,
            cached: false,
        };
    }

    let symbol = context.series.symbol();
    let timeframe = context.series.timeframe();
    if let Some(cached_result) =
        context
            .cache
            .check_cache(&task.template_id, symbol, timeframe, &task.parameters)
    {
        return BacktestTaskResult {
            task_id: task.id.clone(),
            result: Some(cached_result),
            error: None,
            cached: true,
        };
    }

    let start_time = Instant::now();
    match evaluate_combination(context, task) {
        Ok(opt_result) => {
            info!(
                "Worker finished task {} in {:.2}s. PF: {:.3}, Trades: {}, Win rate: {:.1}%, Params: [{}]",
                task.id,
                start_time.elapsed().as_secs_f64(),
                opt_result.profit_factor,
                opt_result.total_trades,
                opt_result.win_rate,
                format_parameters(&task.parameters)
            );
            context
                .cache
                .store_cache(&task.template_id, symbol, timeframe, &opt_result);
            BacktestTaskResult {
                task_id: task.id.clone(),
                result: Some(opt_result),
                error: None,
                cached: false,
            }
        }
        Err(e) => {
            warn!("Worker task {} failed: {}", task.id, e);
            BacktestTaskResult {
                task_id: task.id.clone(),
                result: None,
                error: Some(e.to_string()),
                cached: false,
            }
        }
    }
}

fn evaluate_combination(
    context: &WorkerContext,
    task: &BacktestTask,
) -> EngineResult<OptimizationResult> {
    let series = context.series.as_ref();
    let mut symbol_config = SymbolConfig::new(
        series.symbol(),
        series.timeframe(),
        &context.template_id,
        task.parameters.clone(),
    )?;
    symbol_config.symbol_info = Some(context.symbol_info.clone());

    let strategy = create_strategy(&task.template_id, &task.parameters)?;
    let risk = RiskManager::new(&context.symbol_info, &symbol_config.risk)?;
    let settings =
        SimulationSettings::for_symbol(&context.runtime_settings, &symbol_config, strategy.as_ref());
    let result = Engine::new(settings).backtest(strategy.as_ref(), &risk, series);

    Ok(OptimizationResult {
        parameters: task.parameters.clone(),
        profit_factor: result.performance.profit_factor,
        total_trades: result.performance.total_trades,
        win_rate: result.performance.win_rate,
        net_profit: result.performance.net_profit,
    })
}

pub fn format_parameters(parameters: &HashMap<String, f64>) -> String {
    let mut sorted: Vec<_> = parameters.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .into_iter()
        .map(|(k, v)| {
            let formatted_value = format!("{:.4}", v);
            let trimmed_value = formatted_value.trim_end_matches('0').trim_end_matches('.');
            let cleaned_value = if trimmed_value.is_empty() || trimmed_value == "-0" {
                "0"
            } else {
                trimmed_value
            };
            format!("{}: {}", k, cleaned_value)
        })
        .collect::<Vec<String>>()
        .join(", ")
}
