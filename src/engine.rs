use crate::bar_utils::first_index_at_or_after;
use crate::config::{
    account_balance_for, spread_points_for, EngineRuntimeSettings, PositionSizing, ReentryPolicy,
    SymbolConfig,
};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::risk_manager::RiskManager;
use crate::strategy::Strategy;
use chrono::{DateTime, Utc};
use log::{debug, warn};

/// Per-run simulation options. Built once per symbol and never mutated by the loop.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub reentry: ReentryPolicy,
    /// Simulated ask = close + spread_points * point; bid = close.
    pub spread_points: f64,
    pub close_open_position_at_end: bool,
    /// Bars before this time only serve as indicator history.
    pub start_time: Option<DateTime<Utc>>,
    pub account_balance: f64,
    pub sizing: PositionSizing,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            reentry: ReentryPolicy::NextBar,
            spread_points: 0.0,
            close_open_position_at_end: false,
            start_time: None,
            account_balance: 10_000.0,
            sizing: PositionSizing::Fixed {
                volume: crate::config::DEFAULT_FIXED_VOLUME,
            },
        }
    }
}

impl SimulationSettings {
    pub fn for_symbol(
        runtime: &EngineRuntimeSettings,
        config: &SymbolConfig,
        strategy: &dyn Strategy,
    ) -> Self {
        Self {
            reentry: ReentryPolicy::from_parameters(&config.parameters, strategy.default_reentry()),
            spread_points: spread_points_for(&config.parameters, runtime),
            close_open_position_at_end: runtime.close_open_position_at_end,
            start_time: runtime.backtest_start,
            account_balance: account_balance_for(&config.parameters, runtime),
            sizing: config.sizing,
        }
    }
}

struct BacktestLoopResult {
    start_index: usize,
    trades: Vec<CompletedTrade>,
    open_position: Option<Position>,
}

pub struct Engine {
    settings: SimulationSettings,
}

impl Engine {
    pub fn new(settings: SimulationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    fn resolve_start_index(&self, bars: &[Bar], strategy: &dyn Strategy) -> usize {
        let warm_up_index = strategy.get_min_data_points().saturating_sub(1);
        let requested = self
            .settings
            .start_time
            .map(|start| first_index_at_or_after(bars, start))
            .unwrap_or(0);
        warm_up_index.max(requested)
    }

    pub fn backtest(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskManager,
        series: &BarSeries,
    ) -> BacktestResult {
        if !risk.symbol().eq_ignore_ascii_case(series.symbol()) {
            warn!(
                "Risk manager for {} used with bars of {}",
                risk.symbol(),
                series.symbol()
            );
        }

        let bars = series.bars();
        let loop_result = self.run_backtest_loop(strategy, risk, series.symbol(), bars, |_, _| {});
        let performance = PerformanceCalculator::calculate_performance(&loop_result.trades);

        BacktestResult {
            symbol: series.symbol().to_string(),
            timeframe: series.timeframe(),
            template_id: strategy.get_template_id().to_string(),
            start_time: bars.get(loop_result.start_index).map(|bar| bar.time),
            end_time: if loop_result.start_index < bars.len() {
                bars.last().map(|bar| bar.time)
            } else {
                None
            },
            bars_processed: bars.len().saturating_sub(loop_result.start_index),
            trades: loop_result.trades,
            open_position: loop_result.open_position,
            performance,
        }
    }

    /// One ordered pass over `bars`. Each bar: stop/target first, then the
    /// strategy exit at the close, then a new entry when flat. `observer`
    /// sees the position state after every simulated bar.
    fn run_backtest_loop<F>(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskManager,
        symbol: &str,
        bars: &[Bar],
        mut observer: F,
    ) -> BacktestLoopResult
    where
        F: FnMut(usize, Option<&Position>),
    {
        let start_index = self.resolve_start_index(bars, strategy);
        let point = risk.point();
        let mut trades: Vec<CompletedTrade> = Vec::new();
        let mut position: Option<Position> = None;
        let mut next_trade_id: u64 = 1;

        for index in start_index..bars.len() {
            let bar = &bars[index];
            let history = &bars[..=index];
            let mut closed_this_bar = false;

            if let Some(open) = position.take() {
                if let Some((exit_price, reason)) = stop_or_target_hit(&open, bar) {
                    let trade = open.close(next_trade_id, bar.time, exit_price, reason, point);
                    debug!(
                        "{} #{} {} closed at {} ({}), {:.1} pips",
                        symbol,
                        trade.id,
                        trade.direction.as_str(),
                        exit_price,
                        reason.as_str(),
                        trade.pnl_pips
                    );
                    next_trade_id += 1;
                    trades.push(trade);
                    observer(index, None);
                    continue;
                }

                if strategy.get_exit_signal(history, open.direction) {
                    let reason = strategy.exit_reason();
                    let trade = open.close(next_trade_id, bar.time, bar.close, reason, point);
                    debug!(
                        "{} #{} {} closed at {} ({}), {:.1} pips",
                        symbol,
                        trade.id,
                        trade.direction.as_str(),
                        bar.close,
                        reason.as_str(),
                        trade.pnl_pips
                    );
                    next_trade_id += 1;
                    trades.push(trade);
                    closed_this_bar = true;
                } else {
                    position = Some(open);
                }
            }

            let may_enter = position.is_none()
                && (!closed_this_bar || self.settings.reentry == ReentryPolicy::SameBar);
            if may_enter {
                position = self.try_open_position(strategy, risk, symbol, history);
            }

            observer(index, position.as_ref());
        }

        if let Some(open) = position.take() {
            if self.settings.close_open_position_at_end {
                if let Some(last) = bars.last() {
                    let trade = open.close(
                        next_trade_id,
                        last.time,
                        last.close,
                        ExitReason::EndOfData,
                        point,
                    );
                    trades.push(trade);
                }
            } else {
                position = Some(open);
            }
        }

        BacktestLoopResult {
            start_index,
            trades,
            open_position: position,
        }
    }

    fn try_open_position(
        &self,
        strategy: &dyn Strategy,
        risk: &RiskManager,
        symbol: &str,
        history: &[Bar],
    ) -> Option<Position> {
        let bar = history.last()?;
        let action = strategy.get_entry_signal(history);
        action.direction()?;

        let bid = bar.close;
        let ask = bar.close + self.settings.spread_points * risk.point();
        let levels = risk.calculate_sl_tp(action, ask, bid)?;
        let size = risk.volume_for(
            &self.settings.sizing,
            self.settings.account_balance,
            levels.stop_points,
        )?;

        debug!(
            "{} {} opened at {} (sl {}, tp {}, size {})",
            symbol,
            levels.direction.as_str(),
            levels.entry_price,
            levels.stop_loss,
            levels.take_profit,
            size
        );

        Some(Position {
            symbol: symbol.to_string(),
            direction: levels.direction,
            entry_time: bar.time,
            entry_price: levels.entry_price,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            size,
        })
    }
}

/// Stop is evaluated before target, so a bar spanning both closes at the stop.
pub fn stop_or_target_hit(position: &Position, bar: &Bar) -> Option<(f64, ExitReason)> {
    match position.direction {
        Direction::Long => {
            if bar.low <= position.stop_loss {
                Some((position.stop_loss, ExitReason::StopLoss))
            } else if bar.high >= position.take_profit {
                Some((position.take_profit, ExitReason::TakeProfit))
            } else {
                None
            }
        }
        Direction::Short => {
            if bar.high >= position.stop_loss {
                Some((position.stop_loss, ExitReason::StopLoss))
            } else if bar.low <= position.take_profit {
                Some((position.take_profit, ExitReason::TakeProfit))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::strategy::{create_strategy, Strategy};
    use chrono::{Duration, TimeZone};
    use std::collections::{HashMap, HashSet};

    const POINT: f64 = 0.0001;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    /// Bars with explicit (high, low, close).
    fn generate_bars(rows: &[(f64, f64, f64)]) -> BarSeries {
        let bars = rows
            .iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Bar {
                time: start_time() + Duration::hours(i as i64),
                open: close,
                high,
                low,
                close,
                volume: None,
            })
            .collect();
        BarSeries::from_bars("EURUSD", Timeframe::H1, bars).unwrap()
    }

    fn flat_bars(count: usize, price: f64) -> Vec<(f64, f64, f64)> {
        vec![(price + 0.0001, price - 0.0001, price); count]
    }

    fn random_walk(len: usize, seed: u64) -> BarSeries {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut price = 1.1000;
        let rows: Vec<(f64, f64, f64)> = (0..len)
            .map(|_| {
                price += (rng.f64() - 0.5) * 0.0030;
                let high = price + rng.f64() * 0.0015;
                let low = price - rng.f64() * 0.0015;
                (high, low, price)
            })
            .collect();
        generate_bars(&rows)
    }

    fn risk_manager(stop: f64, ratio: f64) -> RiskManager {
        let info = SymbolInfo::new("EURUSD", POINT, 0);
        RiskManager::new(&info, &RiskConfig::new(stop, ratio).unwrap()).unwrap()
    }

    struct MockStrategy {
        entries: HashMap<usize, SignalAction>,
        exits: HashSet<usize>,
        reentry: ReentryPolicy,
    }

    impl MockStrategy {
        fn new(entries: &[(usize, SignalAction)], exits: &[usize]) -> Self {
            Self {
                entries: entries.iter().copied().collect(),
                exits: exits.iter().copied().collect(),
                reentry: ReentryPolicy::NextBar,
            }
        }
    }

    impl Strategy for MockStrategy {
        fn get_template_id(&self) -> &str {
            "mock_strategy"
        }

        fn get_min_data_points(&self) -> usize {
            1
        }

        fn get_entry_signal(&self, bars: &[Bar]) -> SignalAction {
            self.entries
                .get(&(bars.len() - 1))
                .copied()
                .unwrap_or(SignalAction::Hold)
        }

        fn get_exit_signal(&self, bars: &[Bar], _direction: Direction) -> bool {
            self.exits.contains(&(bars.len() - 1))
        }

        fn default_reentry(&self) -> ReentryPolicy {
            self.reentry
        }
    }

    fn engine_with(reentry: ReentryPolicy) -> Engine {
        Engine::new(SimulationSettings {
            reentry,
            ..SimulationSettings::default()
        })
    }

    #[test]
    fn stop_is_checked_before_target_on_a_wide_bar() {
        let mut rows = flat_bars(3, 1.2000);
        // entry at 1.2000 on bar 1, sl 1.1950, tp 1.2100; bar 2 touches both
        rows[2] = (1.2150, 1.1900, 1.2000);
        let series = generate_bars(&rows);
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy)], &[]);

        let result = engine_with(ReentryPolicy::NextBar).backtest(
            &strategy,
            &risk_manager(50.0, 2.0),
            &series,
        );

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert!((trade.exit_price - 1.1950).abs() < 1e-9);
        assert!((trade.pnl_pips + 50.0).abs() < 1e-6);
    }

    #[test]
    fn target_hit_closes_short_at_target() {
        let mut rows = flat_bars(4, 1.2000);
        rows[3] = (1.2001, 1.1890, 1.1900);
        let series = generate_bars(&rows);
        let strategy = MockStrategy::new(&[(1, SignalAction::Sell)], &[]);

        let result = engine_with(ReentryPolicy::NextBar).backtest(
            &strategy,
            &risk_manager(50.0, 2.0),
            &series,
        );

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.direction, Direction::Short);
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert!((trade.exit_price - 1.1900).abs() < 1e-9);
        assert!((trade.pnl_pips - 100.0).abs() < 1e-6);
        assert_eq!(trade.exit_time, series.bars()[3].time);
    }

    #[test]
    fn stop_exit_blocks_entries_on_the_same_bar() {
        let mut rows = flat_bars(4, 1.2000);
        rows[2] = (1.2001, 1.1940, 1.1960);
        let series = generate_bars(&rows);
        let mut strategy =
            MockStrategy::new(&[(1, SignalAction::Buy), (2, SignalAction::Sell)], &[]);
        strategy.reentry = ReentryPolicy::SameBar;

        let settings = SimulationSettings {
            reentry: ReentryPolicy::SameBar,
            ..SimulationSettings::default()
        };
        let result = Engine::new(settings).backtest(&strategy, &risk_manager(50.0, 2.0), &series);

        assert_eq!(result.trades.len(), 1);
        assert!(result.open_position.is_none());
    }

    #[test]
    fn strategy_exit_closes_at_bar_close() {
        let rows: Vec<(f64, f64, f64)> = (0..5)
            .map(|i| {
                let close = 1.2000 + 0.0005 * i as f64;
                (close + 0.0001, close - 0.0001, close)
            })
            .collect();
        let series = generate_bars(&rows);
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy)], &[3]);

        let result = engine_with(ReentryPolicy::NextBar).backtest(
            &strategy,
            &risk_manager(50.0, 2.0),
            &series,
        );

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::StrategyExit);
        assert!((trade.exit_price - 1.2015).abs() < 1e-9);
        assert!((trade.pnl_pips - 10.0).abs() < 1e-6);
    }

    #[test]
    fn reentry_policy_controls_same_bar_entries() {
        let series = generate_bars(&flat_bars(6, 1.2000));
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy), (3, SignalAction::Sell)], &[3]);
        let risk = risk_manager(50.0, 2.0);

        let same_bar = engine_with(ReentryPolicy::SameBar).backtest(&strategy, &risk, &series);
        assert_eq!(same_bar.trades.len(), 1);
        let reopened = same_bar.open_position.expect("sell should open on the exit bar");
        assert_eq!(reopened.direction, Direction::Short);
        assert_eq!(reopened.entry_time, series.bars()[3].time);

        let next_bar = engine_with(ReentryPolicy::NextBar).backtest(&strategy, &risk, &series);
        assert_eq!(next_bar.trades.len(), 1);
        assert!(next_bar.open_position.is_none());
    }

    #[test]
    fn open_position_at_end_follows_policy() {
        let series = generate_bars(&flat_bars(4, 1.2000));
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy)], &[]);
        let risk = risk_manager(50.0, 2.0);

        let kept = engine_with(ReentryPolicy::NextBar).backtest(&strategy, &risk, &series);
        assert!(kept.trades.is_empty());
        assert!(kept.open_position.is_some());

        let closing = Engine::new(SimulationSettings {
            close_open_position_at_end: true,
            ..SimulationSettings::default()
        });
        let closed = closing.backtest(&strategy, &risk, &series);
        assert_eq!(closed.trades.len(), 1);
        assert_eq!(closed.trades[0].exit_reason, ExitReason::EndOfData);
        assert!(closed.open_position.is_none());
    }

    #[test]
    fn start_time_limits_entries() {
        let series = generate_bars(&flat_bars(10, 1.2000));
        let strategy = MockStrategy::new(&[(2, SignalAction::Buy), (6, SignalAction::Sell)], &[]);

        let engine = Engine::new(SimulationSettings {
            start_time: Some(series.bars()[5].time),
            ..SimulationSettings::default()
        });
        let result = engine.backtest(&strategy, &risk_manager(50.0, 2.0), &series);

        assert_eq!(result.start_time, Some(series.bars()[5].time));
        assert_eq!(result.bars_processed, 5);
        let open = result.open_position.expect("sell after start should open");
        assert_eq!(open.direction, Direction::Short);
        assert_eq!(open.entry_time, series.bars()[6].time);
    }

    #[test]
    fn spread_moves_long_entry_to_ask() {
        let series = generate_bars(&flat_bars(3, 1.2000));
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy)], &[]);
        let engine = Engine::new(SimulationSettings {
            spread_points: 2.0,
            ..SimulationSettings::default()
        });

        let result = engine.backtest(&strategy, &risk_manager(50.0, 2.0), &series);
        let open = result.open_position.unwrap();
        assert!((open.entry_price - 1.2002).abs() < 1e-9);
        assert!((open.stop_loss - 1.1952).abs() < 1e-9);
    }

    #[test]
    fn undersized_risk_volume_suppresses_entry() {
        let series = generate_bars(&flat_bars(3, 1.2000));
        let strategy = MockStrategy::new(&[(1, SignalAction::Buy)], &[]);
        let engine = Engine::new(SimulationSettings {
            account_balance: 10.0,
            sizing: PositionSizing::Risk { risk_percent: 0.5 },
            ..SimulationSettings::default()
        });

        let result = engine.backtest(&strategy, &risk_manager(50.0, 2.0), &series);
        assert!(result.trades.is_empty());
        assert!(result.open_position.is_none());
    }

    #[test]
    fn never_more_than_one_open_position() {
        let series = random_walk(400, 17);
        let mut rng = fastrand::Rng::with_seed(99);
        let entries: Vec<(usize, SignalAction)> = (0..series.len())
            .filter_map(|i| match rng.u8(0..6) {
                0 => Some((i, SignalAction::Buy)),
                1 => Some((i, SignalAction::Sell)),
                _ => None,
            })
            .collect();
        let exits: Vec<usize> = (0..series.len()).filter(|_| rng.u8(0..10) == 0).collect();
        let strategy = MockStrategy::new(&entries, &exits);
        let engine = engine_with(ReentryPolicy::SameBar);
        let risk = risk_manager(20.0, 1.5);

        let mut current_entry: Option<DateTime<Utc>> = None;
        let loop_result = engine.run_backtest_loop(
            &strategy,
            &risk,
            "EURUSD",
            series.bars(),
            |index, position| {
                if let Some(position) = position {
                    if let Some(entry) = current_entry {
                        // still the same position, or a fresh one opened on this bar
                        assert!(position.entry_time == entry || position.entry_time == series.bars()[index].time);
                    }
                    current_entry = Some(position.entry_time);
                } else {
                    current_entry = None;
                }
            },
        );

        assert!(!loop_result.trades.is_empty());
        for pair in loop_result.trades.windows(2) {
            assert!(pair[1].entry_time >= pair[0].exit_time);
            assert_eq!(pair[1].id, pair[0].id + 1);
        }
    }

    #[test]
    fn identical_inputs_produce_identical_ledgers() {
        let series = random_walk(600, 5);
        let mut params = HashMap::new();
        params.insert("fastPeriod".to_string(), 5.0);
        params.insert("slowPeriod".to_string(), 20.0);
        let strategy = create_strategy("ma_crossover", &params).unwrap();
        let risk = risk_manager(30.0, 2.0);
        let engine = engine_with(strategy.default_reentry());

        let first = engine.backtest(strategy.as_ref(), &risk, &series);
        let second = engine.backtest(strategy.as_ref(), &risk, &series);

        assert!(!first.trades.is_empty());
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.open_position, second.open_position);
    }

    #[test]
    fn truncated_history_reproduces_earlier_trades() {
        let series = random_walk(500, 23);
        let strategy = create_strategy("regime_momentum", &HashMap::new()).unwrap();
        let risk = risk_manager(40.0, 1.5);
        let engine = engine_with(ReentryPolicy::NextBar);

        let full = engine.backtest(strategy.as_ref(), &risk, &series);
        let cut = 320;
        let prefix = BarSeries::from_bars("EURUSD", Timeframe::H1, series.bars()[..cut].to_vec())
            .unwrap();
        let partial = engine.backtest(strategy.as_ref(), &risk, &prefix);

        let cutoff = series.bars()[cut - 1].time;
        let full_before_cut: Vec<&CompletedTrade> = full
            .trades
            .iter()
            .filter(|trade| trade.exit_time <= cutoff)
            .collect();
        let partial_refs: Vec<&CompletedTrade> = partial.trades.iter().collect();
        assert_eq!(full_before_cut, partial_refs);
    }
}
