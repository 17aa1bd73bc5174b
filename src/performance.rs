use crate::models::*;
use statrs::statistics::Statistics;

/// Running totals over a trade ledger. Feeding every trade of a ledger in
/// order yields the same summary as `PerformanceCalculator::calculate_performance`.
#[derive(Debug, Clone, Default)]
pub struct PerformanceAccumulator {
    total_trades: usize,
    winning_trades: usize,
    losing_trades: usize,
    gross_profit: f64,
    gross_loss: f64,
    largest_win: f64,
    largest_loss: f64,
    mean: f64,
    m2: f64,
}

impl PerformanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, trade: &CompletedTrade) {
        self.record_pnl(trade.pnl_pips);
    }

    pub fn record_pnl(&mut self, pnl: f64) {
        self.total_trades += 1;
        if pnl > 0.0 {
            self.winning_trades += 1;
            self.gross_profit += pnl;
            self.largest_win = self.largest_win.max(pnl);
        } else {
            self.losing_trades += 1;
            self.gross_loss += pnl.abs();
            self.largest_loss = self.largest_loss.min(pnl);
        }

        // Welford
        let delta = pnl - self.mean;
        self.mean += delta / self.total_trades as f64;
        self.m2 += delta * (pnl - self.mean);
    }

    pub fn total_trades(&self) -> usize {
        self.total_trades
    }

    pub fn summary(&self) -> PerformanceSummary {
        let total = self.total_trades;
        let win_rate = if total > 0 {
            self.winning_trades as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let avg_win = if self.winning_trades > 0 {
            self.gross_profit / self.winning_trades as f64
        } else {
            0.0
        };
        let avg_loss = if self.losing_trades > 0 {
            -self.gross_loss / self.losing_trades as f64
        } else {
            0.0
        };
        let pnl_std_dev = if total > 1 {
            (self.m2 / (total - 1) as f64).sqrt()
        } else {
            0.0
        };

        PerformanceSummary {
            total_trades: total,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            win_rate,
            gross_profit: self.gross_profit,
            gross_loss: self.gross_loss,
            net_profit: self.gross_profit - self.gross_loss,
            profit_factor: profit_factor(self.gross_profit, self.gross_loss, total),
            avg_win,
            avg_loss,
            expectancy: if total > 0 { self.mean } else { 0.0 },
            largest_win: self.largest_win,
            largest_loss: self.largest_loss,
            pnl_std_dev,
        }
    }
}

/// Gross profit over absolute gross loss. Infinite whenever trades exist
/// but nothing was lost, zero for an empty ledger.
pub fn profit_factor(gross_profit: f64, gross_loss: f64, total_trades: usize) -> f64 {
    if total_trades == 0 {
        0.0
    } else if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else {
        f64::INFINITY
    }
}

/// Two decimals, or `inf` for a ledger without losses.
pub fn format_profit_factor(value: f64) -> String {
    if value.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:.2}", value)
    }
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_performance(trades: &[CompletedTrade]) -> PerformanceSummary {
        let mut accumulator = PerformanceAccumulator::new();
        for trade in trades {
            accumulator.record(trade);
        }
        let mut summary = accumulator.summary();

        let trade_pnls: Vec<f64> = trades.iter().map(|t| t.pnl_pips).collect();
        summary.expectancy = Self::average(&trade_pnls);
        summary.pnl_std_dev = Self::std_dev(&trade_pnls);
        summary
    }

    fn average(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mean = values.mean();
        if mean.is_finite() {
            mean
        } else {
            0.0
        }
    }

    fn std_dev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let std_dev = values.std_dev();
        if std_dev.is_finite() {
            std_dev
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn trade(id: u64, pnl: f64) -> CompletedTrade {
        let entry_time = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(id as i64);
        CompletedTrade {
            id,
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            entry_time,
            entry_price: 1.1,
            stop_loss: 1.09,
            take_profit: 1.12,
            size: 0.1,
            exit_time: entry_time + Duration::minutes(30),
            exit_price: 1.1 + pnl * 0.0001,
            exit_reason: if pnl > 0.0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
            pnl_pips: pnl,
        }
    }

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn three_trade_ledger_summary() {
        let trades = vec![trade(1, 10.0), trade(2, -5.0), trade(3, 15.0)];
        let summary = PerformanceCalculator::calculate_performance(&trades);

        assert_eq!(summary.total_trades, 3);
        assert!(approx(summary.win_rate, 66.67, 0.01));
        assert!(approx(summary.profit_factor, 5.0, 1e-12));
        assert!(approx(summary.avg_win, 12.5, 1e-12));
        assert!(approx(summary.avg_loss, -5.0, 1e-12));
        assert!(approx(summary.gross_profit, 25.0, 1e-12));
        assert!(approx(summary.gross_loss, 5.0, 1e-12));
        assert!(approx(summary.net_profit, 20.0, 1e-12));
        assert_eq!(summary.largest_win, 15.0);
        assert_eq!(summary.largest_loss, -5.0);
    }

    #[test]
    fn empty_ledger_is_all_zero() {
        let summary = PerformanceCalculator::calculate_performance(&[]);
        assert_eq!(summary.total_trades, 0);
        assert_eq!(summary.win_rate, 0.0);
        assert_eq!(summary.profit_factor, 0.0);
        assert_eq!(summary.avg_win, 0.0);
        assert_eq!(summary.avg_loss, 0.0);
        assert_eq!(summary.pnl_std_dev, 0.0);
    }

    #[test]
    fn no_losses_gives_infinite_profit_factor() {
        let summary = PerformanceCalculator::calculate_performance(&[trade(1, 4.0), trade(2, 6.0)]);
        assert!(summary.profit_factor.is_infinite());
        assert_eq!(summary.avg_loss, 0.0);
    }

    #[test]
    fn zero_pnl_trade_counts_as_loss() {
        let summary = PerformanceCalculator::calculate_performance(&[trade(1, 0.0), trade(2, 6.0)]);
        assert_eq!(summary.losing_trades, 1);
        assert!(summary.profit_factor.is_infinite());
        assert!(approx(summary.win_rate, 50.0, 1e-12));
    }

    #[test]
    fn breakeven_only_ledger_has_infinite_profit_factor() {
        let summary = PerformanceCalculator::calculate_performance(&[trade(1, 0.0)]);
        assert_eq!(summary.total_trades, 1);
        assert_eq!(summary.winning_trades, 0);
        assert_eq!(summary.gross_loss, 0.0);
        assert!(summary.profit_factor.is_infinite());
        assert_eq!(profit_factor(0.0, 0.0, 0), 0.0);
    }

    #[test]
    fn incremental_matches_full_snapshot() {
        let mut rng = fastrand::Rng::with_seed(3);
        let trades: Vec<CompletedTrade> = (0..50)
            .map(|i| trade(i, (rng.f64() - 0.45) * 80.0))
            .collect();

        let mut accumulator = PerformanceAccumulator::new();
        for t in &trades {
            accumulator.record(t);
        }
        let incremental = accumulator.summary();
        let full = PerformanceCalculator::calculate_performance(&trades);

        assert_eq!(incremental.total_trades, full.total_trades);
        assert_eq!(incremental.winning_trades, full.winning_trades);
        assert!(approx(incremental.profit_factor, full.profit_factor, 1e-9));
        assert!(approx(incremental.expectancy, full.expectancy, 1e-9));
        assert!(approx(incremental.pnl_std_dev, full.pnl_std_dev, 1e-9));
    }
}
