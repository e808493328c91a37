//! Walk-forward portfolio simulator
//!
//! Buy-and-hold has its own reference walk. Every other strategy shares the
//! rebalancing walk and only supplies target weights through [`WeightRule`].

use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::calendar::rebalance_flags;
use crate::error::{EngineError, EngineResult};
use crate::series::AlignedSeries;
use crate::strategy::Strategy;
use crate::types::*;

/// Trades smaller than this fraction of portfolio value are not recorded
const MIN_TRADE_FRACTION: f64 = 1e-9;

/// Per-holding adjusted prices on the aligned calendar, carried forward over gaps
#[derive(Debug, Clone)]
pub struct PriceMatrix {
    prices: Vec<Vec<f64>>,
    len: usize,
}

impl PriceMatrix {
    /// Rows follow `holdings` order. Fails if a holding has no price on the first date.
    pub fn from_aligned(aligned: &AlignedSeries, holdings: &[Holding]) -> EngineResult<Self> {
        let len = aligned.len();
        let mut prices = Vec::with_capacity(holdings.len());

        for holding in holdings {
            let points = aligned.points(&holding.symbol).ok_or_else(|| {
                EngineError::InsufficientData(format!("no aligned series for {}", holding.symbol))
            })?;

            let mut row = Vec::with_capacity(len);
            let mut last: Option<f64> = None;
            for p in points {
                last = p.price().or(last);
                match last {
                    Some(price) => row.push(price),
                    None => {
                        return Err(EngineError::InsufficientData(format!(
                            "no price for {} on {}",
                            holding.symbol, p.date
                        )))
                    }
                }
            }
            prices.push(row);
        }

        Ok(Self { prices, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn price(&self, holding: usize, index: usize) -> f64 {
        self.prices[holding][index]
    }

    /// Full price history of one holding
    pub fn row(&self, holding: usize) -> &[f64] {
        &self.prices[holding]
    }
}

/// Target weights for a rebalancing strategy
pub trait WeightRule: Send + Sync {
    /// One weight per holding at date `index`. Weights summing below 1 leave the
    /// remainder in cash; weights summing above 1 are scaled down.
    fn target_weights(
        &self,
        index: usize,
        prices: &PriceMatrix,
        holdings: &[Holding],
    ) -> EngineResult<Vec<f64>>;

    /// First index at which the rule has enough history for its signal.
    /// The walk always rebalances there, whatever the calendar says.
    fn warmup(&self) -> usize {
        0
    }
}

/// Portfolio simulator
pub struct PortfolioSimulator;

impl PortfolioSimulator {
    /// Simulate `holdings` over `aligned` under `strategy`
    pub fn simulate(
        aligned: &AlignedSeries,
        holdings: &[Holding],
        initial_capital: f64,
        strategy: &dyn Strategy,
        frequency: RebalancingFrequency,
    ) -> EngineResult<SimulationResult> {
        if holdings.is_empty() {
            return Err(EngineError::Validation("no holdings to simulate".to_string()));
        }
        if aligned.is_empty() {
            return Err(EngineError::InsufficientData(
                "no common trading dates across holdings".to_string(),
            ));
        }

        info!(
            strategy = %strategy.kind(),
            holdings = holdings.len(),
            bars = aligned.len(),
            capital = initial_capital,
            frequency = %frequency,
            "Starting simulation"
        );

        let result = strategy.simulate(aligned, holdings, initial_capital, frequency)?;

        info!(
            final_value = result.final_value().unwrap_or(initial_capital),
            rebalances = result.rebalance_dates.len(),
            transactions = result.transactions.len(),
            "Simulation complete"
        );

        Ok(result)
    }

    /// Buy at the first date, never trade again
    pub fn buy_and_hold(
        aligned: &AlignedSeries,
        holdings: &[Holding],
        initial_capital: f64,
    ) -> EngineResult<SimulationResult> {
        let dates = aligned.dates();
        let first_date = *dates.first().ok_or_else(|| {
            EngineError::InsufficientData("no common trading dates across holdings".to_string())
        })?;

        let mut transactions = Vec::with_capacity(holdings.len());
        let mut holding_values: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for holding in holdings {
            let points = aligned.points(&holding.symbol).unwrap_or_default();
            let entry_price = points.first().and_then(PricePoint::price).ok_or_else(|| {
                EngineError::InsufficientData(format!(
                    "no price for {} on {}",
                    holding.symbol, first_date
                ))
            })?;

            let invested = initial_capital * holding.allocation;
            let shares = invested / entry_price;
            transactions.push(Transaction {
                date: first_date,
                symbol: holding.symbol.clone(),
                action: TradeAction::Buy,
                shares,
                price: entry_price,
                value: invested,
            });

            let mut series = Vec::with_capacity(dates.len());
            let mut previous = invested;
            for p in points {
                // Missing price: keep the previous value rather than propagating a gap
                let value = p.price().map_or(previous, |price| shares * price);
                series.push(value);
                previous = value;
            }
            holding_values.insert(holding.symbol.clone(), series);
        }

        let values: Vec<f64> = (0..dates.len())
            .map(|i| holding_values.values().map(|s| s[i]).sum())
            .collect();

        let prices = PriceMatrix::from_aligned(aligned, holdings)?;
        Ok(finish(
            dates.to_vec(),
            values,
            holding_values,
            Vec::new(),
            transactions,
            holding_summaries(&prices, holdings, initial_capital),
        ))
    }

    /// Shared walk for strategies that re-derive weights on rebalance dates
    pub fn rebalancing(
        aligned: &AlignedSeries,
        holdings: &[Holding],
        initial_capital: f64,
        frequency: RebalancingFrequency,
        rule: &dyn WeightRule,
    ) -> EngineResult<SimulationResult> {
        let prices = PriceMatrix::from_aligned(aligned, holdings)?;
        if prices.is_empty() {
            return Err(EngineError::InsufficientData(
                "no common trading dates across holdings".to_string(),
            ));
        }

        let dates = aligned.dates();
        let flags = rebalance_flags(dates, frequency);
        let warmup = rule.warmup();

        let mut book = Book {
            shares: vec![0.0; holdings.len()],
            cash: initial_capital,
            transactions: Vec::new(),
        };
        let weights = normalize(rule.target_weights(0, &prices, holdings)?);
        book.trade_to(0, dates[0], initial_capital, &weights, &prices, holdings);

        let mut values = Vec::with_capacity(dates.len());
        let mut per_holding = vec![Vec::with_capacity(dates.len()); holdings.len()];
        let mut rebalance_dates = Vec::new();

        for (t, date) in dates.iter().enumerate() {
            if flags[t] || (t > 0 && t == warmup) {
                let total = book.value(t, &prices);
                let weights = normalize(rule.target_weights(t, &prices, holdings)?);
                book.trade_to(t, *date, total, &weights, &prices, holdings);
                rebalance_dates.push(*date);
                debug!(date = %date, total, "Rebalanced");
            }

            for (h, series) in per_holding.iter_mut().enumerate() {
                series.push(book.shares[h] * prices.price(h, t));
            }
            values.push(book.value(t, &prices));
        }

        let holding_values = holdings
            .iter()
            .zip(per_holding)
            .map(|(h, series)| (h.symbol.clone(), series))
            .collect();

        Ok(finish(
            dates.to_vec(),
            values,
            holding_values,
            rebalance_dates,
            book.transactions,
            holding_summaries(&prices, holdings, initial_capital),
        ))
    }
}

/// Positions and cash during a rebalancing walk
struct Book {
    shares: Vec<f64>,
    cash: f64,
    transactions: Vec<Transaction>,
}

impl Book {
    fn value(&self, t: usize, prices: &PriceMatrix) -> f64 {
        let invested: f64 = self
            .shares
            .iter()
            .enumerate()
            .map(|(h, s)| s * prices.price(h, t))
            .sum();
        invested + self.cash
    }

    /// Move every position to `weights` of `total`, recording the trades
    fn trade_to(
        &mut self,
        t: usize,
        date: NaiveDate,
        total: f64,
        weights: &[f64],
        prices: &PriceMatrix,
        holdings: &[Holding],
    ) {
        let mut invested = 0.0;
        for (h, holding) in holdings.iter().enumerate() {
            let price = prices.price(h, t);
            let target_value = weights[h] * total;
            let target_shares = target_value / price;
            let delta = target_shares - self.shares[h];
            let trade_value = delta.abs() * price;

            if trade_value > total.abs() * MIN_TRADE_FRACTION {
                self.transactions.push(Transaction {
                    date,
                    symbol: holding.symbol.clone(),
                    action: if delta > 0.0 { TradeAction::Buy } else { TradeAction::Sell },
                    shares: delta.abs(),
                    price,
                    value: trade_value,
                });
            }

            self.shares[h] = target_shares;
            invested += target_value;
        }
        self.cash = total - invested;
    }
}

/// Clamp unusable weights to zero and scale down if they sum above 1
fn normalize(mut weights: Vec<f64>) -> Vec<f64> {
    for w in weights.iter_mut() {
        if !w.is_finite() || *w < 0.0 {
            *w = 0.0;
        }
    }
    let sum: f64 = weights.iter().sum();
    if sum > 1.0 {
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
    weights
}

fn finish(
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
    holding_values: BTreeMap<String, Vec<f64>>,
    rebalance_dates: Vec<NaiveDate>,
    transactions: Vec<Transaction>,
    holding_summaries: Vec<HoldingSummary>,
) -> SimulationResult {
    SimulationResult {
        daily_returns: daily_returns(&values),
        drawdowns: drawdown_series(&values),
        dates,
        values,
        holding_values,
        rebalance_dates,
        transactions,
        holding_summaries,
    }
}

/// Buy-and-hold performance of each holding's own price series, as if its
/// allocation had been invested on the first date
fn holding_summaries(
    prices: &PriceMatrix,
    holdings: &[Holding],
    initial_capital: f64,
) -> Vec<HoldingSummary> {
    holdings
        .iter()
        .enumerate()
        .map(|(h, holding)| {
            let row = prices.row(h);
            let initial_value = initial_capital * holding.allocation;
            let (first, last) = (row.first().copied(), row.last().copied());
            let total_return = match (first, last) {
                (Some(f), Some(l)) if f > 0.0 => l / f - 1.0,
                _ => 0.0,
            };
            let max_drawdown = drawdown_series(row).into_iter().fold(0.0, f64::min);

            HoldingSummary {
                symbol: holding.symbol.clone(),
                initial_value,
                final_value: initial_value * (1.0 + total_return),
                total_return,
                max_drawdown,
            }
        })
        .collect()
}

/// Period-over-period returns; len = values - 1
pub fn daily_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Fractional decline from the running peak at each point (always <= 0)
pub fn drawdown_series(values: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    values
        .iter()
        .map(|&v| {
            peak = peak.max(v);
            if peak > 0.0 {
                ((v - peak) / peak).min(0.0)
            } else {
                0.0
            }
        })
        .collect()
}
