use crate::bar_utils::closes;
use crate::config::ReentryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::indicators::{calculate_moving_average, MovingAverageKind};
use crate::models::*;
use crate::param_utils::{finite_param, require_period};
use std::collections::HashMap;

pub struct MACrossoverStrategy {
    template_id: String,
    fast_period: usize,
    slow_period: usize,
    ma_kind: MovingAverageKind,
}

impl MACrossoverStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> EngineResult<Self> {
        let fast_period = require_period(parameters, "fastPeriod", 10)?;
        let slow_period = require_period(parameters, "slowPeriod", 30)?;
        if fast_period >= slow_period {
            return Err(EngineError::invalid_parameter(
                "fastPeriod",
                format!(
                    "must be below slowPeriod ({} >= {})",
                    fast_period, slow_period
                ),
            ));
        }
        let ma_kind = finite_param(parameters, "maKind")
            .map(MovingAverageKind::from_param)
            .unwrap_or(MovingAverageKind::Simple);

        Ok(Self {
            template_id: "ma_crossover".to_string(),
            fast_period,
            slow_period,
            ma_kind,
        })
    }
}

impl super::Strategy for MACrossoverStrategy {
    fn get_template_id(&self) -> &str {
        &self.template_id
    }

    fn get_min_data_points(&self) -> usize {
        self.slow_period + 2
    }

    fn get_entry_signal(&self, bars: &[Bar]) -> SignalAction {
        if bars.len() < self.get_min_data_points() {
            return SignalAction::Hold;
        }

        let closes = closes(bars);
        let fast = calculate_moving_average(&closes, self.fast_period, self.ma_kind);
        let slow = calculate_moving_average(&closes, self.slow_period, self.ma_kind);

        let last = bars.len() - 1;
        let prev = last - 1;
        let (Some(fast_last), Some(slow_last), Some(fast_prev), Some(slow_prev)) =
            (fast[last], slow[last], fast[prev], slow[prev])
        else {
            return SignalAction::Hold;
        };

        if fast_prev <= slow_prev && fast_last > slow_last {
            SignalAction::Buy
        } else if fast_prev >= slow_prev && fast_last < slow_last {
            SignalAction::Sell
        } else {
            SignalAction::Hold
        }
    }

    /// Closes on the opposite crossover.
    fn get_exit_signal(&self, bars: &[Bar], direction: Direction) -> bool {
        self.get_entry_signal(bars) == direction.opposite_action()
    }

    fn exit_reason(&self) -> ExitReason {
        ExitReason::OppositeSignal
    }

    fn default_reentry(&self) -> ReentryPolicy {
        ReentryPolicy::SameBar
    }
}
