use crate::config::PositionSizing;
use crate::models::{Bar, Direction, Position, SignalAction, Timeframe};
use crate::risk_manager::RiskManager;
use crate::strategy::Strategy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

/// Current quote for a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub ask: f64,
    pub bid: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Tags orders so positions opened by this engine can be told apart.
    pub identifier: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveAction {
    Open(OrderRequest),
    Close { symbol: String, comment: String },
    Hold,
}

/// Venue that accepts orders and position closes.
pub trait TradeExecutionSink {
    fn place_order(&mut self, order: &OrderRequest) -> Result<()>;
    fn close_position(&mut self, symbol: &str, identifier: u64, comment: &str) -> Result<()>;
}

/// Drops the last bar when it is still forming at `now`.
pub fn closed_bars(bars: &[Bar], timeframe: Timeframe, now: DateTime<Utc>) -> &[Bar] {
    match bars.last() {
        Some(last) => match timeframe.close_time(last.time) {
            Some(close_time) if close_time <= now => bars,
            _ => &bars[..bars.len() - 1],
        },
        None => bars,
    }
}

/// One decision step over fully closed bars. An open position is only ever
/// closed on the strategy's exit signal; stop and target sit with the broker.
#[allow(clippy::too_many_arguments)]
pub fn plan_live_action(
    strategy: &dyn Strategy,
    risk: &RiskManager,
    bars: &[Bar],
    open_position: Option<&Position>,
    tick: Tick,
    sizing: &PositionSizing,
    balance: f64,
    identifier: u64,
) -> LiveAction {
    if bars.len() < strategy.get_min_data_points() {
        return LiveAction::Hold;
    }

    if let Some(position) = open_position {
        if strategy.get_exit_signal(bars, position.direction) {
            return LiveAction::Close {
                symbol: position.symbol.clone(),
                comment: format!("Closed: {}", strategy.exit_reason().as_str()),
            };
        }
        return LiveAction::Hold;
    }

    let action = strategy.get_entry_signal(bars);
    if action == SignalAction::Hold {
        return LiveAction::Hold;
    }
    let Some(levels) = risk.calculate_sl_tp(action, tick.ask, tick.bid) else {
        return LiveAction::Hold;
    };
    let Some(size) = risk.volume_for(sizing, balance, levels.stop_points) else {
        return LiveAction::Hold;
    };

    LiveAction::Open(OrderRequest {
        symbol: risk.symbol().to_string(),
        direction: levels.direction,
        size,
        stop_loss: levels.stop_loss,
        take_profit: levels.take_profit,
        identifier,
    })
}

pub fn execute_live_action<S: TradeExecutionSink + ?Sized>(
    sink: &mut S,
    action: &LiveAction,
    identifier: u64,
) -> Result<()> {
    match action {
        LiveAction::Open(order) => {
            info!(
                "Placing {} {} x{} (sl {}, tp {})",
                order.direction.as_str(),
                order.symbol,
                order.size,
                order.stop_loss,
                order.take_profit
            );
            sink.place_order(order)
        }
        LiveAction::Close { symbol, comment } => {
            info!("Closing {} position: {}", symbol, comment);
            sink.close_position(symbol, identifier, comment)
        }
        LiveAction::Hold => Ok(()),
    }
}
