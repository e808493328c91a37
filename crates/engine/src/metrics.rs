//! Performance and risk metrics over a portfolio value series
//!
//! All functions are pure. Returns are simple period returns; annualization
//! assumes 252 trading periods per year.

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::simulator::{daily_returns, drawdown_series};
use crate::types::{BenchmarkComparison, PerformanceMetrics, SimulationResult};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

/// A benchmark price (or value) series projected onto the simulation dates
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkSeries<'a> {
    pub symbol: &'a str,
    pub values: &'a [f64],
}

/// Reduce a simulation to its metrics record.
///
/// Beta, alpha and the benchmark comparison are only computed when the
/// benchmark covers every return.
pub fn compute_metrics(
    result: &SimulationResult,
    initial_capital: f64,
    risk_free_rate: f64,
    benchmark: Option<BenchmarkSeries<'_>>,
) -> EngineResult<PerformanceMetrics> {
    let values = &result.values;
    if values.len() < 2 || values.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::InsufficientData(format!(
            "need at least 2 valid portfolio values, got {}",
            values.len()
        )));
    }
    if initial_capital <= 0.0 {
        return Err(EngineError::Validation("initial capital must be positive".to_string()));
    }

    let returns = daily_returns(values);
    let last = values[values.len() - 1];

    let total_return = (last - initial_capital) / initial_capital;
    let annualized_return = annualized_return(total_return, returns.len());
    let volatility = volatility(&returns);
    let sharpe_ratio = (volatility > 0.0).then(|| (annualized_return - risk_free_rate) / volatility);

    let max_drawdown = drawdown_series(values).into_iter().fold(0.0, f64::min);
    let max_drawdown_duration = max_drawdown_duration(values);
    let calmar_ratio = (max_drawdown < 0.0).then(|| annualized_return / max_drawdown.abs());

    let sortino_ratio = downside_deviation(&returns)
        .filter(|dd| *dd > 0.0)
        .map(|dd| (annualized_return - risk_free_rate) / dd);

    let (var_95, cvar_95) = value_at_risk(&returns);

    let wins = returns.iter().filter(|r| **r > 0.0).count();
    let win_rate = wins as f64 / returns.len() as f64;

    let (beta, alpha, comparison) = match benchmark {
        Some(series) if series.values.len() >= values.len() => {
            let bench_values = &series.values[..values.len()];
            let bench = daily_returns(bench_values);
            let (beta, alpha) = match beta_alpha(&returns, &bench, risk_free_rate) {
                Some((b, a)) => (Some(b), Some(a)),
                None => (None, None),
            };
            let comparison = compare_to_benchmark(
                series.symbol,
                bench_values,
                &returns,
                annualized_return,
                beta,
                risk_free_rate,
            );
            (beta, alpha, comparison)
        }
        Some(series) => {
            debug!(
                benchmark = series.symbol,
                benchmark_values = series.values.len(),
                values = values.len(),
                "Benchmark too short, skipping comparison"
            );
            (None, None, None)
        }
        None => (None, None, None),
    };

    Ok(PerformanceMetrics {
        total_return,
        annualized_return,
        volatility,
        sharpe_ratio,
        max_drawdown,
        max_drawdown_duration,
        calmar_ratio,
        sortino_ratio,
        var_95,
        cvar_95,
        win_rate,
        profit_factor: Some(profit_factor(&returns)),
        beta,
        alpha,
        benchmark: comparison,
    })
}

/// Benchmark statistics and relative measures. `bench_values` must already be
/// aligned with the portfolio values; `None` when it holds fewer than 3 values
/// or does not start positive.
pub fn compare_to_benchmark(
    symbol: &str,
    bench_values: &[f64],
    returns: &[f64],
    portfolio_annualized: f64,
    beta: Option<f64>,
    risk_free_rate: f64,
) -> Option<BenchmarkComparison> {
    let first = *bench_values.first()?;
    let last = *bench_values.last()?;
    if bench_values.len() < 3 || first <= 0.0 || bench_values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let bench = daily_returns(bench_values);
    let n = bench.len().min(returns.len());
    let (bench, returns) = (&bench[..n], &returns[..n]);

    let benchmark_total_return = last / first - 1.0;
    let benchmark_annualized_return = annualized_return(benchmark_total_return, n);
    let benchmark_volatility = volatility(bench);
    let benchmark_sharpe_ratio = (benchmark_volatility > 0.0)
        .then(|| (benchmark_annualized_return - risk_free_rate) / benchmark_volatility);

    let excess: Vec<f64> = returns.iter().zip(bench).map(|(p, b)| p - b).collect();
    let tracking_error = volatility(&excess);
    let information_ratio =
        (tracking_error > 0.0).then(|| mean(&excess) * TRADING_DAYS_PER_YEAR / tracking_error);

    let treynor_ratio = beta
        .filter(|b| *b != 0.0)
        .map(|b| (portfolio_annualized - risk_free_rate) / b);

    Some(BenchmarkComparison {
        benchmark_symbol: symbol.to_string(),
        benchmark_total_return,
        benchmark_annualized_return,
        benchmark_volatility,
        benchmark_sharpe_ratio,
        correlation: correlation(returns, bench),
        tracking_error,
        information_ratio,
        treynor_ratio,
        up_capture: capture_ratio(returns, bench, |b| b > 0.0),
        down_capture: capture_ratio(returns, bench, |b| b < 0.0),
    })
}

/// Pearson correlation; `None` when either side does not move
pub fn correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let (ma, mb) = (mean(a), mean(b));
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    if va <= 0.0 || vb <= 0.0 {
        return None;
    }
    Some(cov / (va.sqrt() * vb.sqrt()))
}

/// Mean portfolio return over mean benchmark return, on the periods the
/// benchmark selects
fn capture_ratio(returns: &[f64], bench: &[f64], select: impl Fn(f64) -> bool) -> Option<f64> {
    let (p, b): (Vec<f64>, Vec<f64>) = returns
        .iter()
        .zip(bench)
        .filter(|(_, b)| select(**b))
        .map(|(p, b)| (*p, *b))
        .unzip();
    let mb = mean(&b);
    (!b.is_empty() && mb != 0.0).then(|| mean(&p) / mb)
}

/// (1 + total)^(252 / periods) - 1. A total loss of 100% or more annualizes to -1.
pub fn annualized_return(total_return: f64, periods: usize) -> f64 {
    if periods == 0 {
        return 0.0;
    }
    let growth = 1.0 + total_return;
    if growth <= 0.0 {
        return -1.0;
    }
    growth.powf(TRADING_DAYS_PER_YEAR / periods as f64) - 1.0
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Annualized population standard deviation of returns
pub fn volatility(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let m = mean(returns);
    let variance = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// sqrt(mean(r^2 for r < 0) * 252); `None` when there are no negative returns
pub fn downside_deviation(returns: &[f64]) -> Option<f64> {
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.is_empty() {
        return None;
    }
    let mean_sq = downside.iter().map(|r| r * r).sum::<f64>() / downside.len() as f64;
    Some((mean_sq * TRADING_DAYS_PER_YEAR).sqrt())
}

/// Longest run of consecutive periods spent below the running peak
pub fn max_drawdown_duration(values: &[f64]) -> usize {
    let mut peak = f64::NEG_INFINITY;
    let mut current = 0;
    let mut longest = 0;
    for &v in values {
        if v >= peak {
            peak = v;
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

/// Historical 95% VaR and CVaR of a return series.
/// VaR is the return at index floor(0.05 n) of the ascending sort; CVaR is the
/// mean of the returns strictly below that index (VaR itself if there are none).
pub fn value_at_risk(returns: &[f64]) -> (f64, f64) {
    let mut sorted = returns.to_vec();
    sorted.sort_by(f64::total_cmp);

    let index = (0.05 * sorted.len() as f64).floor() as usize;
    let Some(&var) = sorted.get(index) else {
        return (0.0, 0.0);
    };
    let cvar = if index > 0 { mean(&sorted[..index]) } else { var };
    (var, cvar)
}

/// Sum of gains over absolute sum of losses. +inf with gains and no losses, 0 with neither.
pub fn profit_factor(returns: &[f64]) -> f64 {
    let gains: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let losses: f64 = returns.iter().filter(|r| **r < 0.0).sum::<f64>().abs();
    if losses > 0.0 {
        gains / losses
    } else if gains > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Beta (sample covariance / sample variance of excess returns) and Jensen's
/// alpha, both on excess returns over the daily risk-free rate. `None` when
/// there are fewer than 2 returns or the benchmark does not move.
pub fn beta_alpha(returns: &[f64], benchmark: &[f64], risk_free_rate: f64) -> Option<(f64, f64)> {
    let n = returns.len().min(benchmark.len());
    if n < 2 {
        return None;
    }
    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = returns[..n].iter().map(|r| r - daily_rf).collect();
    let excess_bench: Vec<f64> = benchmark[..n].iter().map(|r| r - daily_rf).collect();

    let (mp, mb) = (mean(&excess), mean(&excess_bench));
    let covariance = excess
        .iter()
        .zip(&excess_bench)
        .map(|(p, b)| (p - mp) * (b - mb))
        .sum::<f64>()
        / (n - 1) as f64;
    let variance = excess_bench.iter().map(|b| (b - mb).powi(2)).sum::<f64>() / (n - 1) as f64;
    if variance <= 0.0 {
        return None;
    }

    let beta = covariance / variance;
    let alpha = mp * TRADING_DAYS_PER_YEAR - beta * mb * TRADING_DAYS_PER_YEAR;
    Some((beta, alpha))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_result(values: &[f64]) -> SimulationResult {
        SimulationResult {
            values: values.to_vec(),
            daily_returns: daily_returns(values),
            drawdowns: drawdown_series(values),
            ..Default::default()
        }
    }

    #[test]
    fn test_two_symbol_scenario_total_return() {
        let m = compute_metrics(&make_result(&[10000.0, 10000.0, 11000.0]), 10000.0, 0.02, None).unwrap();
        assert!((m.total_return - 0.10).abs() < 1e-12);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.calmar_ratio, None);
        assert_eq!(m.win_rate, 0.5);
        assert_eq!(m.profit_factor, Some(f64::INFINITY));
        assert_eq!(m.sortino_ratio, None);
        assert_eq!(m.beta, None);
    }

    #[test]
    fn test_flat_series() {
        let m = compute_metrics(&make_result(&[500.0; 30]), 500.0, 0.02, None).unwrap();
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.annualized_return, 0.0);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.max_drawdown_duration, 0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.profit_factor, Some(0.0));
    }

    #[test]
    fn test_single_value_is_insufficient() {
        let err = compute_metrics(&make_result(&[100.0]), 100.0, 0.02, None).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientData(_)));
    }

    #[test]
    fn test_drawdown_duration_longest_run() {
        // below peak: idx 2,3 (run 2), idx 5,6,7 (run 3)
        let values = [100.0, 110.0, 105.0, 108.0, 111.0, 100.0, 101.0, 110.0, 112.0];
        assert_eq!(max_drawdown_duration(&values), 3);
    }

    #[test]
    fn test_var_cvar_index() {
        // 40 returns: index floor(2.0) = 2
        let mut returns: Vec<f64> = (0..40).map(|i| i as f64 / 1000.0).collect();
        returns[10] = -0.05;
        returns[20] = -0.03;
        let (var, cvar) = value_at_risk(&returns);
        assert_eq!(var, 0.0);
        assert!((cvar - (-0.04)).abs() < 1e-12);

        // Fewer than 20 returns: index 0, CVaR equals VaR
        let (var, cvar) = value_at_risk(&[0.01, -0.02, 0.03]);
        assert_eq!(var, -0.02);
        assert_eq!(cvar, -0.02);
    }

    #[test]
    fn test_beta_alpha_against_scaled_benchmark() {
        let bench = [0.01, -0.02, 0.015, 0.005, -0.01];
        let port: Vec<f64> = bench.iter().map(|b| 2.0 * b).collect();
        let (beta, _alpha) = beta_alpha(&port, &bench, 0.0).unwrap();
        assert!((beta - 2.0).abs() < 1e-9);

        // Flat benchmark has no variance
        assert_eq!(beta_alpha(&port, &[0.0; 5], 0.0), None);
    }

    #[test]
    fn test_benchmark_enables_beta_alpha() {
        let values = [100.0, 101.0, 99.0, 102.0, 103.0];
        let benchmark = [50.0, 50.4, 49.9, 50.8, 51.0];
        let series = BenchmarkSeries { symbol: "SPY", values: &benchmark };
        let m = compute_metrics(&make_result(&values), 100.0, 0.02, Some(series)).unwrap();
        assert!(m.beta.is_some() && m.alpha.is_some());
        assert_eq!(m.benchmark.as_ref().map(|b| b.benchmark_symbol.as_str()), Some("SPY"));

        let short = BenchmarkSeries { symbol: "SPY", values: &benchmark[..3] };
        let short = compute_metrics(&make_result(&values), 100.0, 0.02, Some(short)).unwrap();
        assert_eq!(short.beta, None);
        assert_eq!(short.benchmark, None);
    }

    #[test]
    fn test_benchmark_comparison_against_leveraged_portfolio() {
        // Portfolio moves exactly twice the benchmark each day
        let bench_returns = [0.01, -0.02, 0.015, 0.005, -0.01, 0.02];
        let mut bench = vec![100.0];
        let mut values = vec![1000.0];
        for r in bench_returns {
            bench.push(bench.last().unwrap() * (1.0 + r));
            values.push(values.last().unwrap() * (1.0 + 2.0 * r));
        }
        let series = BenchmarkSeries { symbol: "SPY", values: &bench };
        let m = compute_metrics(&make_result(&values), 1000.0, 0.0, Some(series)).unwrap();
        let c = m.benchmark.unwrap();

        let expected_total = bench[bench.len() - 1] / 100.0 - 1.0;
        assert!((c.benchmark_total_return - expected_total).abs() < 1e-12);
        assert!((c.correlation.unwrap() - 1.0).abs() < 1e-9);
        // Excess return equals the benchmark return, so TE equals benchmark vol
        assert!((c.tracking_error - c.benchmark_volatility).abs() < 1e-12);
        assert!((c.up_capture.unwrap() - 2.0).abs() < 1e-9);
        assert!((c.down_capture.unwrap() - 2.0).abs() < 1e-9);
        let beta = m.beta.unwrap();
        assert!((c.treynor_ratio.unwrap() - m.annualized_return / beta).abs() < 1e-9);
        assert!(c.information_ratio.unwrap() > 0.0);
    }

    #[test]
    fn test_benchmark_comparison_degenerate_cases() {
        let values = [100.0, 101.0, 102.0, 103.0];

        // Flat benchmark: no correlation, no captures, no beta for Treynor
        let flat = [40.0; 4];
        let series = BenchmarkSeries { symbol: "CASH", values: &flat };
        let c = compute_metrics(&make_result(&values), 100.0, 0.02, Some(series))
            .unwrap()
            .benchmark
            .unwrap();
        assert_eq!(c.benchmark_total_return, 0.0);
        assert_eq!(c.benchmark_volatility, 0.0);
        assert_eq!(c.benchmark_sharpe_ratio, None);
        assert_eq!(c.correlation, None);
        assert_eq!(c.treynor_ratio, None);
        assert_eq!(c.up_capture, None);
        assert_eq!(c.down_capture, None);

        // Only one return: too short to compare
        assert!(compare_to_benchmark("SPY", &[10.0, 11.0], &[0.1], 0.1, None, 0.02).is_none());
        // Non-positive starting price
        assert!(compare_to_benchmark("SPY", &[0.0, 1.0, 2.0], &[0.1, 0.1], 0.1, None, 0.02).is_none());
    }

    #[test]
    fn test_flat_prices_through_simulator() {
        use crate::series::align_series;
        use crate::simulator::PortfolioSimulator;
        use crate::strategy::BuyAndHold;
        use crate::types::{Holding, PricePoint, RebalancingFrequency};
        use chrono::NaiveDate;
        use std::collections::BTreeMap;

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let points: Vec<PricePoint> = (0..20u64)
            .map(|i| PricePoint::from_close("FLAT", start + chrono::Days::new(i), 25.0))
            .collect();
        let aligned = align_series(&BTreeMap::from([("FLAT".to_string(), points)]));
        let holdings = vec![Holding::new("FLAT", 1.0)];

        let result = PortfolioSimulator::simulate(
            &aligned,
            &holdings,
            10_000.0,
            &BuyAndHold,
            RebalancingFrequency::Never,
        )
        .unwrap();
        let m = compute_metrics(&result, 10_000.0, 0.02, None).unwrap();

        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.sharpe_ratio, None);
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.max_drawdown_duration, 0);
        assert_eq!(m.sortino_ratio, None);
    }

    proptest! {
        #[test]
        fn prop_var_not_below_cvar(returns in proptest::collection::vec(-0.2f64..0.2, 1..300)) {
            let (var, cvar) = value_at_risk(&returns);
            prop_assert!(var >= cvar - 1e-15);
        }

        #[test]
        fn prop_metrics_well_formed(values in proptest::collection::vec(10.0f64..1000.0, 2..120)) {
            let m = compute_metrics(&make_result(&values), values[0], 0.02, None).unwrap();
            prop_assert!(m.max_drawdown <= 0.0);
            prop_assert!(m.volatility >= 0.0);
            prop_assert!((0.0..=1.0).contains(&m.win_rate));
            prop_assert!(m.max_drawdown_duration < values.len());
        }
    }
}
