use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};
use fxengine::commands::backtest::run_backtests;
use fxengine::commands::{backtest, import_market_data, optimize};
use fxengine::config::AppConfig;
use fxengine::data_context::{HistoricalDataSource, MarketData, SymbolMetadataSource};
use fxengine::models::Timeframe;
use serde_json::Value;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

const BAR_COUNT: usize = 1_500;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "fxengine-{}-{}-{}",
            label,
            std::process::id(),
            fastrand::u64(..)
        ));
        fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Hourly prices alternating between trending legs and choppy ranges.
fn synthetic_csv(symbol: &str, seed: u64, base: f64, point: f64) -> String {
    let mut rng = fastrand::Rng::with_seed(seed);
    let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
    let mut csv = String::from("symbol,time,open,high,low,close,volume\n");
    let mut price = base;

    for i in 0..BAR_COUNT {
        let leg = (i / 150) % 4;
        let drift = match leg {
            0 => 6.0,
            2 => -6.0,
            _ => 0.0,
        } * point;
        let open = price;
        price += drift + (rng.f64() - 0.5) * 30.0 * point;
        let high = open.max(price) + rng.f64() * 10.0 * point;
        let low = open.min(price) - rng.f64() * 10.0 * point;
        let time = start + Duration::hours(i as i64);
        writeln!(
            csv,
            "{},{},{:.5},{:.5},{:.5},{:.5},{}",
            symbol,
            time.format("%Y-%m-%d %H:%M:%S"),
            open,
            high,
            low,
            price,
            100 + rng.u32(0..900)
        )
        .unwrap();
    }
    csv
}

fn write_config(dir: &TempDir) -> PathBuf {
    let config = serde_json::json!({
        "settings": {
            "ACCOUNT_BALANCE": "25000",
            "SIMULATED_SPREAD_POINTS": "2",
            "BACKTEST_START_DATE": "2023-01-10",
            "PROFIT_FACTOR_THRESHOLD": "1.2",
            "OPTIMIZATION_TOP_N": "3",
            "OPTIMIZATION_WORKERS": "2"
        },
        "symbols": [
            {
                "symbol": "EURUSD",
                "timeframe": "H1",
                "strategy": "ma_crossover",
                "parameters": {
                    "fastPeriod": 10,
                    "slowPeriod": 30,
                    "stopLossPoints": 60,
                    "rewardRiskRatio": 2.0,
                    "volume": 0.1
                }
            },
            {
                "symbol": "GBPUSD",
                "timeframe": "h1",
                "strategy": "regime_momentum",
                "parameters": {
                    "fastEmaPeriod": 21,
                    "slowEmaPeriod": 50,
                    "adxPeriod": 14,
                    "adxThreshold": 20,
                    "stopLossPoints": 80,
                    "rewardRiskRatio": 1.8,
                    "riskPercent": 1.0
                }
            },
            {
                "symbol": "USDCHF",
                "timeframe": "H1",
                "strategy": "ma_crossover",
                "parameters": {
                    "stopLossPoints": 60,
                    "rewardRiskRatio": 2.0
                }
            }
        ],
        "optimization": {
            "symbol": "EURUSD",
            "timeframe": "H1",
            "strategy": "regime_momentum",
            "parameters": {
                "fastEmaPeriod": 21,
                "slowEmaPeriod": 50
            },
            "grid": {
                "adxThreshold": [20, 25, 30],
                "stopLossPoints": [60, 80, 100],
                "rewardRiskRatio": [1.5, 1.8, 2.0]
            }
        }
    });
    let path = dir.join("fxengine.json");
    fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

fn build_snapshot(dir: &TempDir) -> Result<PathBuf> {
    let snapshot = dir.join("market-data.bin");
    for (symbol, seed, base, point, stops_level) in [
        ("EURUSD", 7_u64, 1.1000, 0.0001, 10_i64),
        ("GBPUSD", 11_u64, 1.2700, 0.0001, 0_i64),
    ] {
        let csv_path = dir.join(&format!("{}.csv", symbol));
        fs::write(&csv_path, synthetic_csv(symbol, seed, base, point))?;
        import_market_data::run(
            &snapshot,
            &import_market_data::ImportOptions {
                csv_files: vec![csv_path],
                timeframe: Timeframe::H1,
                symbol: Some(symbol.to_string()),
                point: Some(point),
                stops_level: Some(stops_level),
                digits: Some(5),
            },
        )?;
    }
    Ok(snapshot)
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn csv_import_builds_a_queryable_snapshot() -> Result<()> {
    ensure_test_env();
    let dir = TempDir::new("import");
    let snapshot = build_snapshot(&dir)?;

    let market_data = MarketData::load_from_file(&snapshot)?;
    assert_eq!(market_data.symbols(), vec!["EURUSD", "GBPUSD"]);
    assert_eq!(market_data.symbol_info("EURUSD")?.stops_level, 10);

    let series = market_data.fetch_bars("EURUSD", Timeframe::H1, None, None)?;
    assert_eq!(series.len(), BAR_COUNT);
    assert!(series.bars().windows(2).all(|w| w[0].time < w[1].time));

    // re-importing the same file adds nothing
    import_market_data::run(
        &snapshot,
        &import_market_data::ImportOptions {
            csv_files: vec![dir.join("EURUSD.csv")],
            timeframe: Timeframe::H1,
            symbol: None,
            point: None,
            stops_level: None,
            digits: None,
        },
    )?;
    let reloaded = MarketData::load_from_file(&snapshot)?;
    assert_eq!(
        reloaded
            .fetch_bars("EURUSD", Timeframe::H1, None, None)?
            .len(),
        BAR_COUNT
    );
    Ok(())
}

#[test]
fn backtest_command_reports_every_symbol() -> Result<()> {
    ensure_test_env();
    let dir = TempDir::new("backtest");
    let snapshot = build_snapshot(&dir)?;
    let config = write_config(&dir);
    let output = dir.join("reports/backtest.json");

    backtest::run(&config, &snapshot, Some(&output))?;

    let report = read_json(&output);
    let outcomes = report.as_array().expect("array of outcomes");
    assert_eq!(outcomes.len(), 3);

    let eurusd = &outcomes[0];
    assert_eq!(eurusd["symbol"], "EURUSD");
    assert!(eurusd["error"].is_null());
    let trades = eurusd["result"]["trades"].as_array().unwrap();
    assert!(!trades.is_empty());
    let start = eurusd["result"]["startTime"].as_str().unwrap();
    assert!(start >= "2023-01-10");
    for (i, trade) in trades.iter().enumerate() {
        assert_eq!(trade["id"].as_u64(), Some(i as u64 + 1));
        assert!(trade["exitTime"].as_str() >= trade["entryTime"].as_str());
    }

    assert_eq!(outcomes[1]["symbol"], "GBPUSD");
    assert!(outcomes[1]["error"].is_null());

    let usdchf = &outcomes[2];
    assert!(usdchf["result"].is_null());
    assert!(usdchf["error"].as_str().unwrap().contains("USDCHF"));
    Ok(())
}

#[test]
fn backtests_are_deterministic_and_never_overlap_positions() -> Result<()> {
    ensure_test_env();
    let dir = TempDir::new("determinism");
    let snapshot = build_snapshot(&dir)?;
    let config = AppConfig::load(&write_config(&dir))?;
    let market_data = MarketData::load_from_file(&snapshot)?;

    let first = run_backtests(&config.settings, &config.symbols[..2], &market_data);
    let second = run_backtests(&config.settings, &config.symbols[..2], &market_data);

    for (a, b) in first.iter().zip(second.iter()) {
        let a = a.result.as_ref().expect("backtest result");
        let b = b.result.as_ref().expect("backtest result");
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.performance, b.performance);

        for pair in a.trades.windows(2) {
            assert!(pair[1].entry_time >= pair[0].exit_time);
        }
        for trade in &a.trades {
            assert!(trade.stop_loss != trade.take_profit);
        }
    }
    Ok(())
}

#[test]
fn optimize_command_evaluates_the_whole_grid() -> Result<()> {
    ensure_test_env();
    let dir = TempDir::new("optimize");
    let snapshot = build_snapshot(&dir)?;
    let config = write_config(&dir);
    let output = dir.join("optimization.json");

    optimize::run(&config, &snapshot, Some(2), Some(&output))?;

    let report = read_json(&output);
    assert_eq!(report["totalCombinations"], 27);
    assert_eq!(report["failed"], 0);
    assert_eq!(report["phase"], "completed");
    let results = report["results"].as_array().unwrap();
    assert_eq!(results.len(), 27);

    let mut signatures: Vec<String> = results
        .iter()
        .map(|r| {
            let p = &r["parameters"];
            format!(
                "{}/{}/{}",
                p["adxThreshold"], p["stopLossPoints"], p["rewardRiskRatio"]
            )
        })
        .collect();
    signatures.sort();
    signatures.dedup();
    assert_eq!(signatures.len(), 27);
    Ok(())
}
