//! Price series utilities: strict multi-symbol alignment, single-series
//! forward-fill, and upstream data cleaning.
//!
//! `align_series` and `fill_missing_data` are deliberately separate: backtests
//! only ever use the strict intersection, forward-fill is for single-series analytics.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::types::PricePoint;

/// Day-over-day close move above which a bar is flagged as suspicious
pub const EXTREME_MOVE_THRESHOLD: f64 = 0.5;

/// Several symbols reduced to the dates present in all of them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedSeries {
    dates: Vec<NaiveDate>,
    series: BTreeMap<String, Vec<PricePoint>>,
}

impl AlignedSeries {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn points(&self, symbol: &str) -> Option<&[PricePoint]> {
        self.series.get(symbol).map(Vec::as_slice)
    }

    /// Adjusted price of `symbol` at `index`, if usable
    pub fn price(&self, symbol: &str, index: usize) -> Option<f64> {
        self.series.get(symbol)?.get(index)?.price()
    }
}

/// Join per-symbol series on the strict intersection of their dates, ascending.
/// A date missing from any one symbol is dropped for all of them.
pub fn align_series(series_by_symbol: &BTreeMap<String, Vec<PricePoint>>) -> AlignedSeries {
    if series_by_symbol.is_empty() {
        return AlignedSeries::default();
    }

    let indexed: BTreeMap<&str, BTreeMap<NaiveDate, &PricePoint>> = series_by_symbol
        .iter()
        .map(|(symbol, points)| {
            let by_date = points.iter().map(|p| (p.date, p)).collect();
            (symbol.as_str(), by_date)
        })
        .collect();

    let mut common: Option<BTreeSet<NaiveDate>> = None;
    for by_date in indexed.values() {
        let dates: BTreeSet<NaiveDate> = by_date.keys().copied().collect();
        common = Some(match common {
            None => dates,
            Some(acc) => acc.intersection(&dates).copied().collect(),
        });
    }
    let dates: Vec<NaiveDate> = common.unwrap_or_default().into_iter().collect();

    let series = indexed
        .iter()
        .map(|(symbol, by_date)| {
            let points = dates
                .iter()
                .filter_map(|d| by_date.get(d).map(|p| (*p).clone()))
                .collect();
            (symbol.to_string(), points)
        })
        .collect();

    debug!(
        symbols = series_by_symbol.len(),
        common_dates = dates.len(),
        "Aligned price series"
    );

    AlignedSeries { dates, series }
}

/// Forward-fill missing price fields of a single series (then back-fill any
/// leading gap). Input order is preserved; points are expected ascending.
pub fn fill_missing_data(points: &[PricePoint]) -> Vec<PricePoint> {
    let mut filled: Vec<PricePoint> = points.to_vec();

    type Field = fn(&mut PricePoint) -> &mut Option<f64>;
    let fields: [Field; 6] = [
        |p| &mut p.open,
        |p| &mut p.high,
        |p| &mut p.low,
        |p| &mut p.close,
        |p| &mut p.adj_close,
        |p| &mut p.volume,
    ];

    for field in fields {
        let mut last: Option<f64> = None;
        for p in filled.iter_mut() {
            let slot = field(p);
            match *slot {
                Some(v) if v.is_finite() => last = Some(v),
                _ => *slot = last,
            }
        }

        let first_known = filled.iter_mut().find_map(|p| *field(p));
        if let Some(v) = first_known {
            for p in filled.iter_mut() {
                let slot = field(p);
                if slot.is_some() {
                    break;
                }
                *slot = Some(v);
            }
        }
    }

    filled
}

/// Validate and clean raw upstream bars for one symbol:
/// drop bars without a usable close, sort ascending, keep the last bar per date.
/// OHLC inconsistencies and extreme moves are only warned about.
pub fn clean_price_points(symbol: &str, mut points: Vec<PricePoint>) -> Vec<PricePoint> {
    let raw = points.len();
    points.retain(|p| p.close.is_some_and(|c| c.is_finite() && c > 0.0));
    points.sort_by_key(|p| p.date);

    let mut cleaned: Vec<PricePoint> = Vec::with_capacity(points.len());
    for p in points {
        match cleaned.last_mut() {
            Some(last) if last.date == p.date => *last = p,
            _ => cleaned.push(p),
        }
    }

    let inconsistent = cleaned.iter().filter(|p| !ohlc_consistent(p)).count();
    if inconsistent > 0 {
        warn!(symbol, bars = inconsistent, "OHLC values inconsistent");
    }

    let extreme = cleaned
        .windows(2)
        .filter(|w| match (w[0].close, w[1].close) {
            (Some(a), Some(b)) => ((b - a) / a).abs() > EXTREME_MOVE_THRESHOLD,
            _ => false,
        })
        .count();
    if extreme > 0 {
        warn!(symbol, moves = extreme, "Potential price outliers");
    }

    if cleaned.len() < raw {
        debug!(symbol, raw, kept = cleaned.len(), "Dropped unusable bars");
    }

    cleaned
}

/// high >= max(open, close) and low <= min(open, close), where present
fn ohlc_consistent(p: &PricePoint) -> bool {
    let body = [p.open, p.close].into_iter().flatten();
    let (hi, lo) = body.fold((f64::MIN, f64::MAX), |(hi, lo), v| (hi.max(v), lo.min(v)));
    p.high.map_or(true, |h| h >= hi) && p.low.map_or(true, |l| l <= lo)
}

/// Adjusted prices of a series in order (missing prices skipped)
pub fn close_prices(points: &[PricePoint]) -> Vec<f64> {
    points.iter().filter_map(PricePoint::price).collect()
}

/// Prices of a single series on another calendar: each date takes the latest
/// bar at or before it. `None` if the series has no bar at or before the first date.
pub fn project_onto_dates(dates: &[NaiveDate], points: &[PricePoint]) -> Option<Vec<f64>> {
    let by_date: BTreeMap<NaiveDate, f64> = points
        .iter()
        .filter_map(|p| p.price().map(|price| (p.date, price)))
        .collect();

    dates
        .iter()
        .map(|d| by_date.range(..=*d).next_back().map(|(_, price)| *price))
        .collect()
}
