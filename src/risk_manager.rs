use crate::config::{PositionSizing, RiskConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::{Direction, SignalAction, SymbolInfo};
use log::{info, warn};

pub const PRICE_EPSILON: f64 = 1e-9;

const MAX_PRICE_DIGITS: u32 = 12;

/// Entry, stop and target for one prospective position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLevels {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Stop distance actually used, in points.
    pub stop_points: f64,
    /// True when the configured stop was widened to satisfy spread plus broker minimum.
    pub adjusted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolumeOutcome {
    Sized(f64),
    TooSmall { computed: f64, minimum: f64 },
    Invalid,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    symbol: String,
    stop_loss_points: f64,
    reward_risk_ratio: f64,
    point: f64,
    stops_level: f64,
    digits: u32,
    point_value: f64,
    volume_min: f64,
    volume_step: f64,
    volume_max: f64,
}

impl RiskManager {
    pub fn new(info: &SymbolInfo, risk: &RiskConfig) -> EngineResult<Self> {
        let risk = RiskConfig::new(risk.stop_loss_points, risk.reward_risk_ratio)?;

        if !info.point.is_finite() || info.point <= 0.0 {
            return Err(EngineError::invalid_parameter(
                "point",
                format!("must be > 0 for {} (value: {})", info.name, info.point),
            ));
        }
        if info.stops_level < 0 {
            return Err(EngineError::invalid_parameter(
                "stopsLevel",
                format!("must be >= 0 for {} (value: {})", info.name, info.stops_level),
            ));
        }
        if !info.point_value.is_finite() || info.point_value <= 0.0 {
            return Err(EngineError::invalid_parameter(
                "pointValue",
                format!("must be > 0 for {} (value: {})", info.name, info.point_value),
            ));
        }
        if !(info.volume_step > 0.0 && info.volume_min > 0.0 && info.volume_max >= info.volume_min)
        {
            return Err(EngineError::invalid_parameter(
                "volume",
                format!(
                    "invalid volume limits for {} (min {}, step {}, max {})",
                    info.name, info.volume_min, info.volume_step, info.volume_max
                ),
            ));
        }

        let digits = info
            .digits
            .unwrap_or_else(|| decimals_for_increment(info.point));

        Ok(Self {
            symbol: info.name.clone(),
            stop_loss_points: risk.stop_loss_points,
            reward_risk_ratio: risk.reward_risk_ratio,
            point: info.point,
            stops_level: info.stops_level as f64,
            digits,
            point_value: info.point_value,
            volume_min: info.volume_min,
            volume_step: info.volume_step,
            volume_max: info.volume_max,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn point(&self) -> f64 {
        self.point
    }

    pub fn digits(&self) -> u32 {
        self.digits
    }

    /// Stop and target for an entry at the current tick. `None` for HOLD or an
    /// unusable tick.
    pub fn calculate_sl_tp(&self, action: SignalAction, ask: f64, bid: f64) -> Option<StopLevels> {
        let direction = action.direction()?;
        if !ask.is_finite() || !bid.is_finite() || ask <= 0.0 || bid <= 0.0 || ask < bid {
            return None;
        }

        let spread_points = ((ask - bid) / self.point).round();
        let required_points = spread_points + self.stops_level;
        let adjusted = required_points > self.stop_loss_points;
        let stop_points = self.stop_loss_points.max(required_points);
        if adjusted {
            info!(
                "{}: stop widened from {} to {} points (spread {} + stops level {})",
                self.symbol, self.stop_loss_points, stop_points, spread_points, self.stops_level
            );
        }
        let target_points = stop_points * self.reward_risk_ratio;

        let (entry_price, stop_loss, take_profit) = match direction {
            Direction::Long => (
                ask,
                ask - stop_points * self.point,
                ask + target_points * self.point,
            ),
            Direction::Short => (
                bid,
                bid + stop_points * self.point,
                bid - target_points * self.point,
            ),
        };

        Some(StopLevels {
            direction,
            entry_price,
            stop_loss: round_to_digits(stop_loss, self.digits),
            take_profit: round_to_digits(take_profit, self.digits),
            stop_points,
            adjusted,
        })
    }

    /// Volume that loses `risk_percent` of `balance` when stopped out after
    /// `stop_points`, floored to the volume step.
    pub fn calculate_volume(&self, balance: f64, risk_percent: f64, stop_points: f64) -> VolumeOutcome {
        if !balance.is_finite()
            || !risk_percent.is_finite()
            || !stop_points.is_finite()
            || balance <= 0.0
            || risk_percent <= 0.0
            || stop_points <= 0.0
        {
            return VolumeOutcome::Invalid;
        }

        let risk_amount = balance * risk_percent / 100.0;
        let computed = risk_amount / (stop_points * self.point_value);
        let steps = (computed / self.volume_step + PRICE_EPSILON).floor();
        let step_digits = decimals_for_increment(self.volume_step);
        let mut volume = round_to_digits(steps * self.volume_step, step_digits);

        if volume + PRICE_EPSILON < self.volume_min {
            return VolumeOutcome::TooSmall {
                computed,
                minimum: self.volume_min,
            };
        }
        if volume > self.volume_max {
            warn!(
                "{}: sized volume {} capped at broker maximum {}",
                self.symbol, volume, self.volume_max
            );
            volume = self.volume_max;
        }

        VolumeOutcome::Sized(volume)
    }

    /// Size for a new position under the configured sizing mode.
    pub fn volume_for(&self, sizing: &PositionSizing, balance: f64, stop_points: f64) -> Option<f64> {
        match sizing {
            PositionSizing::Fixed { volume } => Some(*volume),
            PositionSizing::Risk { risk_percent } => {
                match self.calculate_volume(balance, *risk_percent, stop_points) {
                    VolumeOutcome::Sized(volume) => Some(volume),
                    VolumeOutcome::TooSmall { computed, minimum } => {
                        warn!(
                            "{}: computed volume {:.4} below minimum {}, entry skipped",
                            self.symbol, computed, minimum
                        );
                        None
                    }
                    VolumeOutcome::Invalid => None,
                }
            }
        }
    }
}

/// Number of decimals needed to express multiples of `increment` exactly
/// (0.00001 and 1e-05 both give 5).
pub fn decimals_for_increment(increment: f64) -> u32 {
    if !increment.is_finite() || increment <= 0.0 {
        return 0;
    }
    let mut scaled = increment;
    for digits in 0..=MAX_PRICE_DIGITS {
        let rounded = scaled.round();
        if rounded >= 1.0 && (scaled - rounded).abs() < 1e-6 * scaled {
            return digits;
        }
        scaled *= 10.0;
    }
    MAX_PRICE_DIGITS
}

pub fn round_to_digits(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}
