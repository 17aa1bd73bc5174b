use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Get a finite parameter value, returns None if not found or not finite
pub fn finite_param(params: &HashMap<String, f64>, key: &str) -> Option<f64> {
    params.get(key).copied().filter(|v| v.is_finite())
}

/// Longest accepted lookback.
pub const MAX_PERIOD: usize = u32::MAX as usize;

/// Read a lookback length. Must be a finite whole number in `1..=MAX_PERIOD`.
pub fn require_period(params: &HashMap<String, f64>, key: &str, default: usize) -> EngineResult<usize> {
    let Some(raw) = params.get(key).copied() else {
        return Ok(default);
    };
    if !raw.is_finite() || raw < 1.0 || raw.fract().abs() > 1e-9 {
        return Err(EngineError::invalid_parameter(
            key,
            format!("must be a whole number >= 1 (value: {})", raw),
        ));
    }
    if raw > MAX_PERIOD as f64 {
        return Err(EngineError::invalid_parameter(
            key,
            format!("must be at most {} (value: {})", MAX_PERIOD, raw),
        ));
    }
    Ok(raw as usize)
}

/// Read a strictly positive finite number.
pub fn require_positive(params: &HashMap<String, f64>, key: &str, default: f64) -> EngineResult<f64> {
    let value = get_param_f64(params, key, default);
    if !value.is_finite() || value <= 0.0 {
        return Err(EngineError::invalid_parameter(
            key,
            format!("must be > 0 (value: {})", value),
        ));
    }
    Ok(value)
}

/// Read a finite number within `[min, max]`.
pub fn require_in_range(
    params: &HashMap<String, f64>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> EngineResult<f64> {
    let value = get_param_f64(params, key, default);
    if !value.is_finite() || value < min || value > max {
        return Err(EngineError::invalid_parameter(
            key,
            format!("must be within [{}, {}] (value: {})", min, max, value),
        ));
    }
    Ok(value)
}

/// Interpret a 0/1 style flag. Absent or non-finite values yield `None`.
pub fn binary_param(params: &HashMap<String, f64>, key: &str) -> Option<bool> {
    finite_param(params, key).map(|v| v >= 0.5)
}

/// Stable textual key for a parameter set, independent of map iteration order.
pub fn parameter_signature(params: &HashMap<String, f64>) -> String {
    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    format!("{:?}", sorted_params)
}
