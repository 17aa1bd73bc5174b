use crate::config::ReentryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::models::*;
use std::collections::HashMap;

/// Signal generator driven by the simulation engine and the live decision step.
///
/// `bars` always ends at the last fully closed bar.
pub trait Strategy {
    fn get_template_id(&self) -> &str;

    /// Minimum number of bars before any entry signal can fire.
    fn get_min_data_points(&self) -> usize;

    fn get_entry_signal(&self, bars: &[Bar]) -> SignalAction;

    /// Whether an open position in `direction` should be closed at this bar's close.
    fn get_exit_signal(&self, _bars: &[Bar], _direction: Direction) -> bool {
        false
    }

    fn exit_reason(&self) -> ExitReason {
        ExitReason::StrategyExit
    }

    fn default_reentry(&self) -> ReentryPolicy {
        ReentryPolicy::NextBar
    }
}

#[path = "strategies/ma_crossover.rs"]
pub mod ma_crossover;

pub use ma_crossover::MACrossoverStrategy;

#[path = "strategies/regime_momentum.rs"]
pub mod regime_momentum;

pub use regime_momentum::RegimeMomentumStrategy;

pub const TEMPLATE_IDS: [&str; 2] = ["ma_crossover", "regime_momentum"];

pub fn create_strategy(
    template_id: &str,
    parameters: &HashMap<String, f64>,
) -> EngineResult<Box<dyn Strategy + Send + Sync>> {
    match template_id {
        "ma_crossover" => Ok(Box::new(MACrossoverStrategy::new(parameters)?)),
        "regime_momentum" => Ok(Box::new(RegimeMomentumStrategy::new(parameters)?)),
        _ => Err(EngineError::UnknownStrategy(template_id.to_string())),
    }
}
