//! Allocation strategies
//!
//! A strategy is built once per job from its kind and parameters, then held
//! as a trait object for the whole simulation.

use serde::Serialize;
use serde_json::json;
use ta::indicators::{SimpleMovingAverage, StandardDeviation};
use ta::Next;

use crate::error::{EngineError, EngineResult};
use crate::series::AlignedSeries;
use crate::simulator::{PortfolioSimulator, PriceMatrix, WeightRule};
use crate::types::*;

/// A simulation strategy
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn simulate(
        &self,
        aligned: &AlignedSeries,
        holdings: &[Holding],
        initial_capital: f64,
        frequency: RebalancingFrequency,
    ) -> EngineResult<SimulationResult>;
}

/// Construct a strategy, validating its parameters
pub fn build_strategy(kind: StrategyKind, params: &StrategyParams) -> EngineResult<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match kind {
        StrategyKind::BuyAndHold => Box::new(BuyAndHold),
        StrategyKind::EqualWeight => Box::new(EqualWeight),
        StrategyKind::Momentum => Box::new(Momentum::from_params(params)?),
        StrategyKind::MeanReversion => Box::new(MeanReversion::from_params(params)?),
        StrategyKind::RiskParity => Box::new(RiskParity::from_params(params)?),
        StrategyKind::RelativeStrength => Box::new(RelativeStrength::from_params(params)?),
        StrategyKind::TacticalAllocation => Box::new(TacticalAllocation::from_params(params)?),
        StrategyKind::Rotation => Box::new(Rotation::from_params(params)?),
    };
    Ok(strategy)
}

// ===== Parameter helpers =====

fn param_usize(params: &StrategyParams, name: &str, default: usize, min: usize) -> EngineResult<usize> {
    let value = match params.get(name) {
        None | Some(serde_json::Value::Null) => return Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            EngineError::Validation(format!("{name} must be a non-negative integer, got {v}"))
        })? as usize,
    };
    if value < min {
        return Err(EngineError::Validation(format!("{name} must be at least {min}, got {value}")));
    }
    Ok(value)
}

fn param_f64(params: &StrategyParams, name: &str, default: f64) -> EngineResult<f64> {
    let value = match params.get(name) {
        None | Some(serde_json::Value::Null) => return Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| EngineError::Validation(format!("{name} must be a number, got {v}")))?,
    };
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::Validation(format!("{name} must be >= 0, got {value}")));
    }
    Ok(value)
}

fn param_bool(params: &StrategyParams, name: &str, default: bool) -> EngineResult<bool> {
    match params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| EngineError::Validation(format!("{name} must be a boolean, got {v}"))),
    }
}

fn param_fraction(params: &StrategyParams, name: &str, default: f64) -> EngineResult<f64> {
    let value = param_f64(params, name, default)?;
    if value > 1.0 {
        return Err(EngineError::Validation(format!("{name} must be within [0, 1], got {value}")));
    }
    Ok(value)
}

fn param_str<'a>(params: &'a StrategyParams, name: &str, default: &'a str) -> EngineResult<&'a str> {
    match params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v
            .as_str()
            .ok_or_else(|| EngineError::Validation(format!("{name} must be a string, got {v}"))),
    }
}

fn allocations(holdings: &[Holding]) -> Vec<f64> {
    holdings.iter().map(|h| h.allocation).collect()
}

fn equal_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Implements [`Strategy`] for a [`WeightRule`] via the shared rebalancing walk
macro_rules! rebalancing_strategy {
    ($ty:ty, $kind:expr) => {
        impl Strategy for $ty {
            fn kind(&self) -> StrategyKind {
                $kind
            }

            fn simulate(
                &self,
                aligned: &AlignedSeries,
                holdings: &[Holding],
                initial_capital: f64,
                frequency: RebalancingFrequency,
            ) -> EngineResult<SimulationResult> {
                PortfolioSimulator::rebalancing(aligned, holdings, initial_capital, frequency, self)
            }
        }
    };
}

// ===== Buy and hold =====

/// Buy once at the target allocations, never rebalance
#[derive(Debug, Clone, Copy, Default)]
pub struct BuyAndHold;

impl Strategy for BuyAndHold {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BuyAndHold
    }

    fn simulate(
        &self,
        aligned: &AlignedSeries,
        holdings: &[Holding],
        initial_capital: f64,
        _frequency: RebalancingFrequency,
    ) -> EngineResult<SimulationResult> {
        PortfolioSimulator::buy_and_hold(aligned, holdings, initial_capital)
    }
}

// ===== Equal weight =====

/// 1/N of the portfolio in every holding, restored at each rebalance
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualWeight;

impl WeightRule for EqualWeight {
    fn target_weights(&self, _index: usize, _prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        Ok(equal_weights(holdings.len()))
    }
}

rebalancing_strategy!(EqualWeight, StrategyKind::EqualWeight);

// ===== Momentum =====

/// Keep the top-N holdings by trailing compound return
#[derive(Debug, Clone)]
pub struct Momentum {
    pub lookback_period: usize,
    pub top_n: usize,
    pub positive_returns_only: bool,
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            lookback_period: 60,
            top_n: 3,
            positive_returns_only: false,
        }
    }
}

impl Momentum {
    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        let d = Self::default();
        Ok(Self {
            lookback_period: param_usize(params, "lookback_period", d.lookback_period, 1)?,
            top_n: param_usize(params, "top_n", d.top_n, 1)?,
            positive_returns_only: param_bool(params, "positive_returns_only", d.positive_returns_only)?,
        })
    }
}

impl WeightRule for Momentum {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        if index < self.lookback_period {
            return Ok(allocations(holdings));
        }

        let start = index - self.lookback_period;
        let mut scored: Vec<(usize, f64)> = (0..holdings.len())
            .map(|h| (h, prices.price(h, index) / prices.price(h, start) - 1.0))
            .collect();
        // Stable: ties keep holding order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let selected: Vec<usize> = scored
            .into_iter()
            .take(self.top_n)
            .filter(|(_, score)| !self.positive_returns_only || *score > 0.0)
            .map(|(h, _)| h)
            .collect();

        let mut weights = vec![0.0; holdings.len()];
        let total: f64 = selected.iter().map(|&h| holdings[h].allocation).sum();
        if total > 0.0 {
            for &h in &selected {
                weights[h] = holdings[h].allocation / total;
            }
        }
        Ok(weights)
    }

    fn warmup(&self) -> usize {
        self.lookback_period
    }
}

rebalancing_strategy!(Momentum, StrategyKind::Momentum);

// ===== Mean reversion =====

/// Overweight holdings trading well below their moving average
#[derive(Debug, Clone)]
pub struct MeanReversion {
    pub ma_period: usize,
    pub deviation_threshold: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            ma_period: 50,
            deviation_threshold: 0.1,
        }
    }
}

impl MeanReversion {
    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        let d = Self::default();
        Ok(Self {
            ma_period: param_usize(params, "ma_period", d.ma_period, 1)?,
            deviation_threshold: param_f64(params, "deviation_threshold", d.deviation_threshold)?,
        })
    }
}

impl WeightRule for MeanReversion {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        if index + 1 < self.ma_period {
            return Ok(allocations(holdings));
        }

        let window = index + 1 - self.ma_period..=index;
        let mut deviations = Vec::with_capacity(holdings.len());
        for h in 0..holdings.len() {
            let mut sma = SimpleMovingAverage::new(self.ma_period)
                .map_err(|e| EngineError::Validation(format!("ma_period: {e:?}")))?;
            let mut mean = 0.0;
            for &p in &prices.row(h)[window.clone()] {
                mean = sma.next(p);
            }
            let deviation = (prices.price(h, index) - mean) / mean;
            deviations.push(if deviation < -self.deviation_threshold { deviation.abs() } else { 0.0 });
        }

        let total: f64 = deviations.iter().sum();
        if total > 0.0 {
            Ok(deviations.into_iter().map(|d| d / total).collect())
        } else {
            Ok(equal_weights(holdings.len()))
        }
    }

    fn warmup(&self) -> usize {
        self.ma_period - 1
    }
}

rebalancing_strategy!(MeanReversion, StrategyKind::MeanReversion);

// ===== Risk parity =====

/// Weights proportional to inverse trailing volatility
#[derive(Debug, Clone)]
pub struct RiskParity {
    pub volatility_window: usize,
}

impl Default for RiskParity {
    fn default() -> Self {
        Self { volatility_window: 60 }
    }
}

impl RiskParity {
    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        Ok(Self {
            volatility_window: param_usize(params, "volatility_window", Self::default().volatility_window, 2)?,
        })
    }
}

impl WeightRule for RiskParity {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        if index < self.volatility_window {
            return Ok(equal_weights(holdings.len()));
        }

        let mut inverse = Vec::with_capacity(holdings.len());
        for h in 0..holdings.len() {
            let mut sd = StandardDeviation::new(self.volatility_window)
                .map_err(|e| EngineError::Validation(format!("volatility_window: {e:?}")))?;
            let row = prices.row(h);
            let mut sigma = 0.0;
            for t in index + 1 - self.volatility_window..=index {
                sigma = sd.next(row[t] / row[t - 1] - 1.0);
            }
            inverse.push(if sigma > 0.0 { 1.0 / sigma } else { 0.0 });
        }

        let total: f64 = inverse.iter().sum();
        if total > 0.0 {
            Ok(inverse.into_iter().map(|w| w / total).collect())
        } else {
            Ok(equal_weights(holdings.len()))
        }
    }

    fn warmup(&self) -> usize {
        self.volatility_window
    }
}

rebalancing_strategy!(RiskParity, StrategyKind::RiskParity);

// ===== Relative strength =====

/// Keep the top-N holdings by trailing return relative to the cross-holding average
#[derive(Debug, Clone)]
pub struct RelativeStrength {
    pub lookback_period: usize,
    pub top_n: usize,
    /// Drop holdings whose own trailing return is not positive
    pub positive_returns_only: bool,
}

impl Default for RelativeStrength {
    fn default() -> Self {
        Self {
            lookback_period: 126,
            top_n: 2,
            positive_returns_only: false,
        }
    }
}

impl RelativeStrength {
    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        let d = Self::default();
        Ok(Self {
            lookback_period: param_usize(params, "lookback_period", d.lookback_period, 1)?,
            top_n: param_usize(params, "top_n", d.top_n, 1)?,
            positive_returns_only: param_bool(params, "positive_returns_only", d.positive_returns_only)?,
        })
    }
}

impl WeightRule for RelativeStrength {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        if index < self.lookback_period || holdings.is_empty() {
            return Ok(equal_weights(holdings.len()));
        }

        // Sum of daily returns over the window ending at `index`
        let trailing: Vec<f64> = (0..holdings.len())
            .map(|h| {
                let row = prices.row(h);
                (index + 1 - self.lookback_period..=index)
                    .map(|t| row[t] / row[t - 1] - 1.0)
                    .sum()
            })
            .collect();
        let average = trailing.iter().sum::<f64>() / trailing.len() as f64;

        let mut scored: Vec<(usize, f64)> = trailing
            .iter()
            .enumerate()
            .filter(|(_, r)| !self.positive_returns_only || **r > 0.0)
            .map(|(h, r)| (h, r - average))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(self.top_n);

        let mut weights = vec![0.0; holdings.len()];
        for &(h, _) in &scored {
            weights[h] = 1.0 / scored.len() as f64;
        }
        Ok(weights)
    }

    fn warmup(&self) -> usize {
        self.lookback_period
    }
}

rebalancing_strategy!(RelativeStrength, StrategyKind::RelativeStrength);

// ===== Tactical allocation =====

/// Switch between growth and defensive sleeves on a market trend signal.
///
/// The first holding is the market proxy. The first half of the holdings
/// (rounded down) is the growth sleeve, the rest is defensive. While the
/// market trades above its moving average the growth sleeve gets
/// `risk_on_allocation`; below it the sleeves swap.
#[derive(Debug, Clone)]
pub struct TacticalAllocation {
    pub ma_period: usize,
    pub risk_on_allocation: f64,
    pub risk_off_allocation: f64,
}

impl Default for TacticalAllocation {
    fn default() -> Self {
        Self {
            ma_period: 200,
            risk_on_allocation: 0.8,
            risk_off_allocation: 0.2,
        }
    }
}

impl TacticalAllocation {
    pub const INDICATOR: &'static str = "moving_average";

    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        let d = Self::default();
        let indicator = param_str(params, "indicator", Self::INDICATOR)?;
        if indicator != Self::INDICATOR {
            return Err(EngineError::Validation(format!(
                "unsupported indicator '{indicator}', only '{}' is available",
                Self::INDICATOR
            )));
        }
        let rule = Self {
            ma_period: param_usize(params, "ma_period", d.ma_period, 1)?,
            risk_on_allocation: param_fraction(params, "risk_on_allocation", d.risk_on_allocation)?,
            risk_off_allocation: param_fraction(params, "risk_off_allocation", d.risk_off_allocation)?,
        };
        if (rule.risk_on_allocation + rule.risk_off_allocation - 1.0).abs() > 0.01 {
            return Err(EngineError::Validation(format!(
                "risk_on_allocation + risk_off_allocation must sum to 1, got {}",
                rule.risk_on_allocation + rule.risk_off_allocation
            )));
        }
        Ok(rule)
    }

    fn market_above_average(&self, index: usize, prices: &PriceMatrix) -> EngineResult<bool> {
        let mut sma = SimpleMovingAverage::new(self.ma_period)
            .map_err(|e| EngineError::Validation(format!("ma_period: {e:?}")))?;
        let mut mean = 0.0;
        for &p in &prices.row(0)[index + 1 - self.ma_period..=index] {
            mean = sma.next(p);
        }
        Ok(prices.price(0, index) > mean)
    }
}

impl WeightRule for TacticalAllocation {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        if index + 1 < self.ma_period || holdings.is_empty() {
            return Ok(equal_weights(holdings.len()));
        }

        let n_growth = holdings.len() / 2;
        let n_defensive = holdings.len() - n_growth;
        let (growth, defensive) = if self.market_above_average(index, prices)? {
            (self.risk_on_allocation, self.risk_off_allocation)
        } else {
            (self.risk_off_allocation, self.risk_on_allocation)
        };

        Ok((0..holdings.len())
            .map(|h| {
                if h < n_growth {
                    growth / n_growth as f64
                } else {
                    defensive / n_defensive as f64
                }
            })
            .collect())
    }

    fn warmup(&self) -> usize {
        self.ma_period - 1
    }
}

rebalancing_strategy!(TacticalAllocation, StrategyKind::TacticalAllocation);

// ===== Rotation =====

/// Ranking used by [`Rotation`] to pick its sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationModel {
    /// Strongest trailing return
    MomentumBased,
    /// Strongest return relative to the cross-holding average
    RelativeStrength,
    /// Weakest trailing return
    MeanReversion,
}

impl RotationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MomentumBased => "momentum_based",
            Self::RelativeStrength => "relative_strength",
            Self::MeanReversion => "mean_reversion",
        }
    }
}

impl std::str::FromStr for RotationModel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "momentum_based" => Ok(Self::MomentumBased),
            "relative_strength" => Ok(Self::RelativeStrength),
            "mean_reversion" => Ok(Self::MeanReversion),
            other => Err(EngineError::Validation(format!(
                "unknown rotation_model '{other}', expected momentum_based, relative_strength or mean_reversion"
            ))),
        }
    }
}

/// Hold the `number_of_sectors` holdings the model ranks best
#[derive(Debug, Clone)]
pub struct Rotation {
    pub rotation_model: RotationModel,
    pub number_of_sectors: usize,
    pub lookback_period: usize,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            rotation_model: RotationModel::MomentumBased,
            number_of_sectors: 3,
            lookback_period: 90,
        }
    }
}

impl Rotation {
    pub fn from_params(params: &StrategyParams) -> EngineResult<Self> {
        let d = Self::default();
        Ok(Self {
            rotation_model: param_str(params, "rotation_model", d.rotation_model.as_str())?.parse()?,
            number_of_sectors: param_usize(params, "number_of_sectors", d.number_of_sectors, 1)?,
            lookback_period: param_usize(params, "lookback_period", d.lookback_period, 1)?,
        })
    }

    fn laggards(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> Vec<f64> {
        let start = index - self.lookback_period;
        let mut scored: Vec<(usize, f64)> = (0..holdings.len())
            .map(|h| (h, prices.price(h, index) / prices.price(h, start) - 1.0))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(self.number_of_sectors);

        let mut weights = vec![0.0; holdings.len()];
        for &(h, _) in &scored {
            weights[h] = 1.0 / scored.len() as f64;
        }
        weights
    }
}

impl WeightRule for Rotation {
    fn target_weights(&self, index: usize, prices: &PriceMatrix, holdings: &[Holding]) -> EngineResult<Vec<f64>> {
        match self.rotation_model {
            RotationModel::MomentumBased => Momentum {
                lookback_period: self.lookback_period,
                top_n: self.number_of_sectors,
                positive_returns_only: false,
            }
            .target_weights(index, prices, holdings),
            RotationModel::RelativeStrength => RelativeStrength {
                lookback_period: self.lookback_period,
                top_n: self.number_of_sectors,
                positive_returns_only: false,
            }
            .target_weights(index, prices, holdings),
            RotationModel::MeanReversion if index < self.lookback_period || holdings.is_empty() => {
                Ok(equal_weights(holdings.len()))
            }
            RotationModel::MeanReversion => Ok(self.laggards(index, prices, holdings)),
        }
    }

    fn warmup(&self) -> usize {
        self.lookback_period
    }
}

rebalancing_strategy!(Rotation, StrategyKind::Rotation);

// ===== Catalog =====

/// A catalogue entry describing a strategy and its parameter defaults
#[derive(Debug, Clone, Serialize)]
pub struct StrategyCatalogEntry {
    pub id: StrategyKind,
    pub name: &'static str,
    pub description: &'static str,
    pub uses_rebalancing: bool,
    pub default_params: serde_json::Value,
}

/// Returns every available strategy with its defaults
pub fn strategy_catalog() -> Vec<StrategyCatalogEntry> {
    let momentum = Momentum::default();
    let mean_reversion = MeanReversion::default();
    let risk_parity = RiskParity::default();
    let relative_strength = RelativeStrength::default();
    let tactical = TacticalAllocation::default();
    let rotation = Rotation::default();

    vec![
        StrategyCatalogEntry {
            id: StrategyKind::BuyAndHold,
            name: "Buy and Hold",
            description: "Buy at the target allocations on the first day and hold to the end.",
            uses_rebalancing: false,
            default_params: json!({}),
        },
        StrategyCatalogEntry {
            id: StrategyKind::EqualWeight,
            name: "Equal Weight",
            description: "Hold 1/N of the portfolio in every holding, restored at each rebalance.",
            uses_rebalancing: true,
            default_params: json!({}),
        },
        StrategyCatalogEntry {
            id: StrategyKind::Momentum,
            name: "Momentum",
            description: "At each rebalance keep the top-N holdings by trailing return, weighted by their target allocations.",
            uses_rebalancing: true,
            default_params: json!({
                "lookback_period": momentum.lookback_period,
                "top_n": momentum.top_n,
                "positive_returns_only": momentum.positive_returns_only,
            }),
        },
        StrategyCatalogEntry {
            id: StrategyKind::MeanReversion,
            name: "Mean Reversion",
            description: "Overweight holdings trading more than the threshold below their moving average.",
            uses_rebalancing: true,
            default_params: json!({
                "ma_period": mean_reversion.ma_period,
                "deviation_threshold": mean_reversion.deviation_threshold,
            }),
        },
        StrategyCatalogEntry {
            id: StrategyKind::RiskParity,
            name: "Risk Parity",
            description: "Weight holdings by inverse trailing volatility so each contributes similar risk.",
            uses_rebalancing: true,
            default_params: json!({ "volatility_window": risk_parity.volatility_window }),
        },
        StrategyCatalogEntry {
            id: StrategyKind::RelativeStrength,
            name: "Relative Strength",
            description: "Equal-weight the top-N holdings by trailing return above the average of all holdings.",
            uses_rebalancing: true,
            default_params: json!({
                "lookback_period": relative_strength.lookback_period,
                "top_n": relative_strength.top_n,
                "positive_returns_only": relative_strength.positive_returns_only,
            }),
        },
        StrategyCatalogEntry {
            id: StrategyKind::TacticalAllocation,
            name: "Tactical Allocation",
            description: "Tilt between growth and defensive holdings depending on whether the first holding trades above its moving average.",
            uses_rebalancing: true,
            default_params: json!({
                "indicator": TacticalAllocation::INDICATOR,
                "ma_period": tactical.ma_period,
                "risk_on_allocation": tactical.risk_on_allocation,
                "risk_off_allocation": tactical.risk_off_allocation,
            }),
        },
        StrategyCatalogEntry {
            id: StrategyKind::Rotation,
            name: "Sector Rotation",
            description: "Rotate into the N holdings ranked best by the chosen rotation model.",
            uses_rebalancing: true,
            default_params: json!({
                "rotation_model": rotation.rotation_model.as_str(),
                "number_of_sectors": rotation.number_of_sectors,
                "lookback_period": rotation.lookback_period,
            }),
        },
    ]
}
