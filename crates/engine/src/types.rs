//! Types for the backtest engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

pub type JobId = i64;

/// Free-form strategy parameters (name -> value), as submitted by the caller
pub type StrategyParams = BTreeMap<String, serde_json::Value>;

/// A single daily price bar for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
    #[serde(default)]
    pub dividend: f64,
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,
}

fn default_split_ratio() -> f64 {
    1.0
}

impl PricePoint {
    /// A bar with only a close (used by tests and sparse upstream payloads)
    pub fn from_close(symbol: &str, date: NaiveDate, close: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            date,
            open: None,
            high: None,
            low: None,
            close: Some(close),
            adj_close: None,
            volume: None,
            dividend: 0.0,
            split_ratio: 1.0,
        }
    }

    /// Adjusted close, falling back to the raw close. Non-positive or non-finite
    /// prices are treated as missing.
    pub fn price(&self) -> Option<f64> {
        self.adj_close
            .filter(|p| p.is_finite() && *p > 0.0)
            .or_else(|| self.close.filter(|p| p.is_finite() && *p > 0.0))
    }
}

/// One line of a portfolio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    /// Fraction of capital, in (0, 1]
    pub allocation: f64,
}

impl Holding {
    pub fn new(symbol: &str, allocation: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            allocation,
        }
    }
}

/// How often a rebalancing strategy re-derives its target weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalancingFrequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Annually,
    #[serde(rename = "none")]
    Never,
}

impl RebalancingFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Annually => "annually",
            Self::Never => "none",
        }
    }
}

impl fmt::Display for RebalancingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RebalancingFrequency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "annually" | "yearly" => Ok(Self::Annually),
            "none" | "never" => Ok(Self::Never),
            other => Err(EngineError::Validation(format!(
                "unknown rebalancing frequency '{other}'"
            ))),
        }
    }
}

/// Lifecycle of a backtest job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BacktestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// pending -> running -> completed | failed. A pending job may also fail
    /// directly (e.g. it could not be started).
    pub fn can_transition_to(&self, next: BacktestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for BacktestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BacktestStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// Available allocation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    BuyAndHold,
    EqualWeight,
    Momentum,
    MeanReversion,
    RiskParity,
    RelativeStrength,
    TacticalAllocation,
    Rotation,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 8] = [
        Self::BuyAndHold,
        Self::EqualWeight,
        Self::Momentum,
        Self::MeanReversion,
        Self::RiskParity,
        Self::RelativeStrength,
        Self::TacticalAllocation,
        Self::Rotation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyAndHold => "buy_and_hold",
            Self::EqualWeight => "equal_weight",
            Self::Momentum => "momentum",
            Self::MeanReversion => "mean_reversion",
            Self::RiskParity => "risk_parity",
            Self::RelativeStrength => "relative_strength",
            Self::TacticalAllocation => "tactical_allocation",
            Self::Rotation => "rotation",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| EngineError::UnknownStrategy(s.to_string()))
    }
}

/// Side of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

/// A purchase or sale recorded by the simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub symbol: String,
    pub action: TradeAction,
    pub shares: f64,
    pub price: f64,
    pub value: f64,
}

/// Standalone performance of one holding over the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingSummary {
    pub symbol: String,
    pub initial_value: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
}

/// Output of a portfolio simulation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimulationResult {
    pub dates: Vec<NaiveDate>,
    /// Portfolio value at each date
    pub values: Vec<f64>,
    /// Value of each holding at each date, keyed by symbol
    pub holding_values: BTreeMap<String, Vec<f64>>,
    /// len = dates - 1
    pub daily_returns: Vec<f64>,
    /// Same length as `dates`, each <= 0
    pub drawdowns: Vec<f64>,
    pub rebalance_dates: Vec<NaiveDate>,
    pub transactions: Vec<Transaction>,
    pub holding_summaries: Vec<HoldingSummary>,
}

impl SimulationResult {
    pub fn final_value(&self) -> Option<f64> {
        self.values.last().copied()
    }
}

/// Risk/return statistics derived from a value series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub calmar_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub var_95: f64,
    pub cvar_95: f64,
    pub win_rate: f64,
    /// May be +inf when there were gains and no losses
    #[serde(with = "float_or_inf")]
    pub profit_factor: Option<f64>,
    pub beta: Option<f64>,
    pub alpha: Option<f64>,
    /// Present only when a benchmark symbol was requested and resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkComparison>,
}

/// Side-by-side statistics of the portfolio against its benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub benchmark_symbol: String,
    pub benchmark_total_return: f64,
    pub benchmark_annualized_return: f64,
    pub benchmark_volatility: f64,
    pub benchmark_sharpe_ratio: Option<f64>,
    pub correlation: Option<f64>,
    /// Annualized std of the daily excess returns
    pub tracking_error: f64,
    pub information_ratio: Option<f64>,
    pub treynor_ratio: Option<f64>,
    pub up_capture: Option<f64>,
    pub down_capture: Option<f64>,
}

/// JSON has no infinity: infinite values travel as the strings "inf" / "-inf"
pub mod float_or_inf {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<f64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) if v.is_infinite() => s.serialize_str(if *v > 0.0 { "inf" } else { "-inf" }),
            Some(v) => s.serialize_f64(*v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            None => Ok(None),
            Some(Repr::Num(v)) => Ok(Some(v)),
            Some(Repr::Text(t)) => t
                .parse::<f64>()
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// A request to run a backtest, as submitted by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestRequest {
    pub user_id: String,
    #[serde(default)]
    pub portfolio_id: String,
    pub holdings: Vec<Holding>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub strategy_params: StrategyParams,
    #[serde(default)]
    pub rebalancing_frequency: RebalancingFrequency,
    #[serde(default)]
    pub benchmark_symbol: Option<String>,
}

fn default_strategy() -> String {
    StrategyKind::BuyAndHold.as_str().to_string()
}

/// A persisted backtest job with its current state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestJob {
    pub id: JobId,
    pub user_id: String,
    pub portfolio_id: String,
    pub strategy: StrategyKind,
    pub strategy_params: StrategyParams,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub benchmark_symbol: Option<String>,
    pub rebalancing_frequency: RebalancingFrequency,
    pub holdings: Vec<Holding>,
    pub status: BacktestStatus,
    pub progress: u8,
    pub error_message: Option<String>,
    pub results: Option<SimulationResult>,
    pub metrics: Option<PerformanceMetrics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(profit_factor: Option<f64>) -> PerformanceMetrics {
        PerformanceMetrics {
            total_return: 0.1,
            annualized_return: 0.2,
            volatility: 0.0,
            sharpe_ratio: None,
            max_drawdown: 0.0,
            max_drawdown_duration: 0,
            calmar_ratio: None,
            sortino_ratio: None,
            var_95: 0.0,
            cvar_95: 0.0,
            win_rate: 1.0,
            profit_factor,
            beta: None,
            alpha: None,
            benchmark: None,
        }
    }

    #[test]
    fn test_infinite_profit_factor_survives_json() {
        let m = metrics(Some(f64::INFINITY));
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["profit_factor"], "inf");

        let back: PerformanceMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back.profit_factor, Some(f64::INFINITY));

        let none: PerformanceMetrics = serde_json::from_value(serde_json::to_value(metrics(None)).unwrap()).unwrap();
        assert_eq!(none.profit_factor, None);
        assert_eq!(none.benchmark, None);
    }

    #[test]
    fn test_status_transitions() {
        use BacktestStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("none".parse::<RebalancingFrequency>().unwrap(), RebalancingFrequency::Never);
        assert_eq!(
            serde_json::to_string(&RebalancingFrequency::Never).unwrap(),
            "\"none\""
        );
        assert_eq!("risk_parity".parse::<StrategyKind>().unwrap(), StrategyKind::RiskParity);
        assert_eq!(
            "tactical_allocation".parse::<StrategyKind>().unwrap(),
            StrategyKind::TacticalAllocation
        );
        assert_eq!(StrategyKind::Rotation.to_string(), "rotation");
        assert!(matches!(
            "martingale".parse::<StrategyKind>(),
            Err(EngineError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_price_prefers_adjusted_close() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut p = PricePoint::from_close("VTI", date, 100.0);
        assert_eq!(p.price(), Some(100.0));
        p.adj_close = Some(98.5);
        assert_eq!(p.price(), Some(98.5));
        p.adj_close = Some(f64::NAN);
        assert_eq!(p.price(), Some(100.0));
    }
}
