//! Upstream market data sources

pub mod fmp;
pub mod yahoo;

pub use fmp::FmpClient;
pub use yahoo::YahooClient;
