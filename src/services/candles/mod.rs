//! Candle aggregation: the live 1-minute aggregator task and the on-demand
//! interval aggregation used by the history endpoint.

pub mod aggregator;
pub mod intervals;

pub use aggregator::{initialize_symbol_candle, CandleAggregator};
pub use intervals::{get_candles, CandleInterval};
