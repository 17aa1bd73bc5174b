use crate::models::Bar;
use chrono::{DateTime, Utc};
use log::warn;
use std::collections::HashMap;

/// A bar tagged with the symbol it belongs to, as read from flat price files.
#[derive(Debug, Clone)]
pub struct SymbolBar {
    pub symbol: String,
    pub bar: Bar,
}

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|bar| bar.close).collect()
}

/// Index of the first bar stamped at or after `time` (`bars.len()` when none is).
pub fn first_index_at_or_after(bars: &[Bar], time: DateTime<Utc>) -> usize {
    bars.partition_point(|bar| bar.time < time)
}

/// Groups rows by symbol, optionally restricted to a known set, with each
/// group sorted by time. Rows repeating a timestamp keep the first occurrence.
pub fn group_bars_by_symbol(
    rows: Vec<SymbolBar>,
    symbols: Option<&[String]>,
) -> HashMap<String, Vec<Bar>> {
    let mut grouped: HashMap<String, Vec<Bar>> = HashMap::new();

    for row in rows {
        let Some(symbol) = normalize_symbol(&row.symbol) else {
            continue;
        };
        if let Some(list) = symbols {
            if !list.iter().any(|known| known.eq_ignore_ascii_case(&symbol)) {
                continue;
            }
        }
        grouped.entry(symbol).or_default().push(row.bar);
    }

    for (symbol, bars) in grouped.iter_mut() {
        bars.sort_by(|a, b| a.time.cmp(&b.time));
        let before = bars.len();
        bars.dedup_by(|later, earlier| later.time == earlier.time);
        if bars.len() != before {
            warn!(
                "Dropped {} duplicate bar(s) for {}",
                before - bars.len(),
                symbol
            );
        }
    }

    grouped.retain(|_, bars| !bars.is_empty());
    grouped
}

/// Trims whitespace and uppercases a symbol name.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn row(symbol: &str, hours: i64, close: f64) -> SymbolBar {
        let base = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        SymbolBar {
            symbol: symbol.to_string(),
            bar: Bar {
                time: base + Duration::hours(hours),
                open: close,
                high: close,
                low: close,
                close,
                volume: Some(100.0),
            },
        }
    }

    #[test]
    fn group_bars_filters_sorts_and_dedups() {
        let rows = vec![
            row("eurusd", 2, 1.12),
            row("EURUSD", 1, 1.11),
            row("EURUSD", 1, 1.99),
            row("GBPUSD", 0, 1.30),
            row("  ", 0, 1.0),
        ];
        let known = vec!["EURUSD".to_string()];

        let grouped = group_bars_by_symbol(rows, Some(&known));
        assert_eq!(grouped.len(), 1);

        let eurusd = grouped.get("EURUSD").expect("EURUSD missing");
        assert_eq!(eurusd.len(), 2);
        assert!(eurusd[0].time < eurusd[1].time);
        assert_eq!(eurusd[0].close, 1.11);
    }

    #[test]
    fn first_index_at_or_after_handles_bounds() {
        let bars: Vec<Bar> = (0..5).map(|h| row("X", h, 1.0).bar).collect();
        assert_eq!(first_index_at_or_after(&bars, bars[0].time - Duration::hours(3)), 0);
        assert_eq!(first_index_at_or_after(&bars, bars[3].time), 3);
        assert_eq!(first_index_at_or_after(&bars, bars[4].time + Duration::minutes(1)), 5);
    }
}
