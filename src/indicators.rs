use crate::models::Bar;

/// Moving-average flavour used by the crossover strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovingAverageKind {
    Simple,
    Exponential,
}

impl MovingAverageKind {
    /// `maKind` parameter encoding: 0 selects SMA, anything else EMA.
    pub fn from_param(value: f64) -> Self {
        if value.is_finite() && value.round() as i64 == 0 {
            MovingAverageKind::Simple
        } else {
            MovingAverageKind::Exponential
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MovingAverageKind::Simple => "sma",
            MovingAverageKind::Exponential => "ema",
        }
    }
}

pub fn calculate_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return sma_values;
    }

    let mut window_sum: f64 = values[..period].iter().sum();
    sma_values[period - 1] = Some(window_sum / period as f64);
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        sma_values[i] = Some(window_sum / period as f64);
    }

    sma_values
}

/// SMA over a partially defined input. A window containing any undefined
/// entry produces an undefined output.
pub fn calculate_sma_defined(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut sma_values = vec![None; values.len()];
    if period == 0 {
        return sma_values;
    }

    let mut window_sum = 0.0f64;
    let mut defined_in_window = 0usize;
    for i in 0..values.len() {
        if let Some(v) = values[i] {
            window_sum += v;
            defined_in_window += 1;
        }
        if i >= period {
            if let Some(dropped) = values[i - period] {
                window_sum -= dropped;
                defined_in_window -= 1;
            }
        }
        if i + 1 >= period && defined_in_window == period {
            sma_values[i] = Some(window_sum / period as f64);
        }
    }

    sma_values
}

/// EMA with smoothing constant `2 / (period + 1)`, seeded by the SMA of the
/// first `period` values.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut ema_values = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return ema_values;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    ema_values[period - 1] = Some(ema);
    for i in period..values.len() {
        ema = (values[i] - ema) * multiplier + ema;
        ema_values[i] = Some(ema);
    }

    ema_values
}

pub fn calculate_moving_average(
    values: &[f64],
    period: usize,
    kind: MovingAverageKind,
) -> Vec<Option<f64>> {
    match kind {
        MovingAverageKind::Simple => calculate_sma(values, period),
        MovingAverageKind::Exponential => calculate_ema(values, period),
    }
}

/// Wilder smoothing (`s = s_prev + (v - s_prev) / period`), seeded with the
/// mean of the first `period` consecutive defined inputs. A gap restarts the seed.
pub fn wilder_smooth(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut smoothed = vec![None; values.len()];
    if period == 0 {
        return smoothed;
    }

    let mut seed_sum = 0.0f64;
    let mut seed_count = 0usize;
    let mut previous: Option<f64> = None;
    for (i, value) in values.iter().enumerate() {
        let Some(v) = *value else {
            seed_sum = 0.0;
            seed_count = 0;
            previous = None;
            continue;
        };

        match previous {
            Some(prev) => {
                let next = prev + (v - prev) / period as f64;
                smoothed[i] = Some(next);
                previous = Some(next);
            }
            None => {
                seed_sum += v;
                seed_count += 1;
                if seed_count == period {
                    let seed = seed_sum / period as f64;
                    smoothed[i] = Some(seed);
                    previous = Some(seed);
                }
            }
        }
    }

    smoothed
}

#[derive(Debug, Clone, Default)]
pub struct AdxSeries {
    pub adx: Vec<Option<f64>>,
    pub plus_di: Vec<Option<f64>>,
    pub minus_di: Vec<Option<f64>>,
}

/// Average Directional Index.
///
/// True range and directional movement exist from index 1, the smoothed
/// directional indicators from index `period`, and ADX itself from index
/// `2 * period - 1`.
pub fn calculate_adx(bars: &[Bar], period: usize) -> AdxSeries {
    let n = bars.len();
    if period == 0 || n == 0 {
        return AdxSeries {
            adx: vec![None; n],
            plus_di: vec![None; n],
            minus_di: vec![None; n],
        };
    }

    let mut true_range = vec![None; n];
    let mut plus_dm = vec![None; n];
    let mut minus_dm = vec![None; n];

    for i in 1..n {
        let bar = &bars[i];
        let prev = &bars[i - 1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());
        true_range[i] = Some(tr);

        let up_move = bar.high - prev.high;
        let down_move = prev.low - bar.low;
        plus_dm[i] = Some(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm[i] = Some(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let atr = wilder_smooth(&true_range, period);
    let smoothed_plus = wilder_smooth(&plus_dm, period);
    let smoothed_minus = wilder_smooth(&minus_dm, period);

    let mut plus_di = vec![None; n];
    let mut minus_di = vec![None; n];
    let mut dx = vec![None; n];
    for i in 0..n {
        let (Some(atr_value), Some(plus), Some(minus)) = (atr[i], smoothed_plus[i], smoothed_minus[i])
        else {
            continue;
        };

        let (pdi, mdi) = if atr_value > 0.0 {
            (plus / atr_value * 100.0, minus / atr_value * 100.0)
        } else {
            (0.0, 0.0)
        };
        plus_di[i] = Some(pdi);
        minus_di[i] = Some(mdi);

        let di_sum = pdi + mdi;
        dx[i] = Some(if di_sum > 0.0 {
            (pdi - mdi).abs() / di_sum * 100.0
        } else {
            0.0
        });
    }

    AdxSeries {
        adx: wilder_smooth(&dx, period),
        plus_di,
        minus_di,
    }
}

#[derive(Debug, Clone, Default)]
pub struct StochasticSeries {
    /// %K after slowing.
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
}

/// Raw %K over `k_period`, undefined for a flat high/low range.
pub fn calculate_raw_stochastic(bars: &[Bar], k_period: usize) -> Vec<Option<f64>> {
    let mut raw = vec![None; bars.len()];
    if k_period == 0 || bars.len() < k_period {
        return raw;
    }

    for i in (k_period - 1)..bars.len() {
        let window = &bars[i + 1 - k_period..=i];
        let highest = window
            .iter()
            .map(|bar| bar.high)
            .fold(f64::NEG_INFINITY, f64::max);
        let lowest = window.iter().map(|bar| bar.low).fold(f64::INFINITY, f64::min);
        let range = highest - lowest;
        if range > 0.0 {
            raw[i] = Some((bars[i].close - lowest) / range * 100.0);
        }
    }

    raw
}

pub fn calculate_stochastic(
    bars: &[Bar],
    k_period: usize,
    d_period: usize,
    slowing: usize,
) -> StochasticSeries {
    let raw = calculate_raw_stochastic(bars, k_period);
    let k = calculate_sma_defined(&raw, slowing);
    let d = calculate_sma_defined(&k, d_period);
    StochasticSeries { k, d }
}
