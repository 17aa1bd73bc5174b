use crate::bar_utils::closes;
use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::models::*;
use crate::param_utils::{require_in_range, require_period};
use std::collections::HashMap;

/// Indicator readings at the prior and last closed bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeSnapshot {
    pub adx: f64,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub stoch_k_prev: f64,
    pub stoch_k: f64,
}

pub struct RegimeMomentumStrategy {
    template_id: String,
    fast_ema_period: usize,
    slow_ema_period: usize,
    adx_period: usize,
    adx_threshold: f64,
    stoch_k_period: usize,
    stoch_d_period: usize,
    stoch_slowing: usize,
    stoch_oversold: f64,
    stoch_overbought: f64,
    min_bars: usize,
}

impl RegimeMomentumStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> EngineResult<Self> {
        let fast_ema_period = require_period(parameters, "fastEmaPeriod", 21)?;
        let slow_ema_period = require_period(parameters, "slowEmaPeriod", 50)?;
        if fast_ema_period >= slow_ema_period {
            return Err(EngineError::invalid_parameter(
                "fastEmaPeriod",
                format!(
                    "must be below slowEmaPeriod ({} >= {})",
                    fast_ema_period, slow_ema_period
                ),
            ));
        }
        let adx_period = require_period(parameters, "adxPeriod", 14)?;
        let adx_threshold = require_in_range(parameters, "adxThreshold", 25.0, 0.0, 100.0)?;
        let stoch_k_period = require_period(parameters, "stochKPeriod", 14)?;
        let stoch_d_period = require_period(parameters, "stochDPeriod", 3)?;
        let stoch_slowing = require_period(parameters, "stochSlowing", 3)?;
        let stoch_oversold = require_in_range(parameters, "stochOversold", 20.0, 0.0, 100.0)?;
        let stoch_overbought = require_in_range(parameters, "stochOverbought", 80.0, 0.0, 100.0)?;
        if stoch_oversold >= stoch_overbought {
            return Err(EngineError::invalid_parameter(
                "stochOversold",
                format!(
                    "must be below stochOverbought ({} >= {})",
                    stoch_oversold, stoch_overbought
                ),
            ));
        }

        let min_bars = [
            fast_ema_period,
            slow_ema_period,
            adx_period,
            stoch_k_period,
            stoch_d_period,
            stoch_slowing,
        ]
        .into_iter()
        .max()
        .unwrap_or(slow_ema_period);

        Ok(Self {
            template_id: "regime_momentum".to_string(),
            fast_ema_period,
            slow_ema_period,
            adx_period,
            adx_threshold,
            stoch_k_period,
            stoch_d_period,
            stoch_slowing,
            stoch_oversold,
            stoch_overbought,
            min_bars,
        })
    }

    fn snapshot(&self, bars: &[Bar]) -> Option<RegimeSnapshot> {
        let last = bars.len().checked_sub(1)?;
        let prev = last.checked_sub(1)?;

        let closes = closes(bars);
        let fast = indicators::calculate_ema(&closes, self.fast_ema_period);
        let slow = indicators::calculate_ema(&closes, self.slow_ema_period);
        let adx = indicators::calculate_adx(bars, self.adx_period);
        let stoch = indicators::calculate_stochastic(
            bars,
            self.stoch_k_period,
            self.stoch_d_period,
            self.stoch_slowing,
        );

        // Prior-bar EMA and ADX are required to be warmed up even though only
        // the last values drive the decision.
        fast[prev]?;
        slow[prev]?;
        adx.adx[prev]?;

        Some(RegimeSnapshot {
            adx: adx.adx[last]?,
            fast_ema: fast[last]?,
            slow_ema: slow[last]?,
            stoch_k_prev: stoch.k[prev]?,
            stoch_k: stoch.k[last]?,
        })
    }

    pub fn evaluate_entry(&self, snapshot: &RegimeSnapshot) -> SignalAction {
        let trending = snapshot.adx > self.adx_threshold;
        if !trending {
            return SignalAction::Hold;
        }

        let uptrend = snapshot.fast_ema > snapshot.slow_ema;
        let downtrend = snapshot.fast_ema < snapshot.slow_ema;
        let crossed_up_from_oversold =
            snapshot.stoch_k_prev <= self.stoch_oversold && snapshot.stoch_k > self.stoch_oversold;
        let crossed_down_from_overbought = snapshot.stoch_k_prev >= self.stoch_overbought
            && snapshot.stoch_k < self.stoch_overbought;

        if uptrend && crossed_up_from_oversold {
            SignalAction::Buy
        } else if downtrend && crossed_down_from_overbought {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        }
    }
}

impl super::Strategy for RegimeMomentumStrategy {
    fn get_template_id(&self) -> &str {
        &self.template_id
    }

    fn get_min_data_points(&self) -> usize {
        self.min_bars + 3
    }

    fn get_entry_signal(&self, bars: &[Bar]) -> SignalAction {
        if bars.len() < self.get_min_data_points() {
            return SignalAction::Hold;
        }

        match self.snapshot(bars) {
            Some(snapshot) => self.evaluate_entry(&snapshot),
            None => SignalAction::Hold,
        }
    }

    /// Trend-failure exit: the EMA pair crosses against the held direction.
    fn get_exit_signal(&self, bars: &[Bar], direction: Direction) -> bool {
        if bars.len() < 2 {
            return false;
        }

        let closes = closes(bars);
        let fast = indicators::calculate_ema(&closes, self.fast_ema_period);
        let slow = indicators::calculate_ema(&closes, self.slow_ema_period);
        let last = bars.len() - 1;
        let prev = last - 1;
        let (Some(fast_last), Some(slow_last), Some(fast_prev), Some(slow_prev)) =
            (fast[last], slow[last], fast[prev], slow[prev])
        else {
            return false;
        };

        match direction {
            Direction::Long => fast_prev >= slow_prev && fast_last < slow_last,
            Direction::Short => fast_prev <= slow_prev && fast_last > slow_last,
        }
    }
}
