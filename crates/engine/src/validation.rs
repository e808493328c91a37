//! Synchronous request validation. A request that fails here never becomes a job.

use chrono::Utc;
use std::collections::HashSet;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::orchestrator::OrchestratorConfig;
use crate::store::JobSpec;
use crate::strategy::build_strategy;
use crate::types::{BacktestRequest, Holding, StrategyKind};

/// Allocations must sum to 1 within this tolerance
pub const ALLOCATION_TOLERANCE: f64 = 1e-3;

const MAX_SYMBOL_LEN: usize = 10;

/// Upper-cased symbol if it is 1-10 chars of A-Z, 0-9, '.', '-'
pub fn normalize_symbol(symbol: &str) -> EngineResult<String> {
    let s = symbol.trim().to_ascii_uppercase();
    let valid = !s.is_empty()
        && s.len() <= MAX_SYMBOL_LEN
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if valid {
        Ok(s)
    } else {
        Err(EngineError::Validation(format!("invalid symbol '{symbol}'")))
    }
}

/// Unique, well-formed symbols with allocations in (0, 1] summing to 1
pub fn validate_holdings(holdings: &[Holding], max_holdings: usize) -> EngineResult<Vec<Holding>> {
    if holdings.is_empty() {
        return Err(EngineError::Validation("at least one holding is required".to_string()));
    }
    if holdings.len() > max_holdings {
        return Err(EngineError::Validation(format!(
            "too many holdings: {} (max {max_holdings})",
            holdings.len()
        )));
    }

    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(holdings.len());
    for h in holdings {
        let symbol = normalize_symbol(&h.symbol)?;
        if !seen.insert(symbol.clone()) {
            return Err(EngineError::Validation(format!("duplicate symbol {symbol}")));
        }
        if !h.allocation.is_finite() || h.allocation <= 0.0 || h.allocation > 1.0 {
            return Err(EngineError::Validation(format!(
                "allocation for {symbol} must be in (0, 1], got {}",
                h.allocation
            )));
        }
        normalized.push(Holding {
            symbol,
            allocation: h.allocation,
        });
    }

    let total: f64 = normalized.iter().map(|h| h.allocation).sum();
    if (total - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err(EngineError::Validation(format!(
            "allocations must sum to 1.0 (got {total:.4})"
        )));
    }

    Ok(normalized)
}

/// Check a request and turn it into a storable job spec
pub fn validate_request(request: &BacktestRequest, config: &OrchestratorConfig) -> EngineResult<JobSpec> {
    if request.user_id.trim().is_empty() {
        return Err(EngineError::Validation("user_id is required".to_string()));
    }

    if request.start_date >= request.end_date {
        return Err(EngineError::Validation(format!(
            "start date {} must be before end date {}",
            request.start_date, request.end_date
        )));
    }
    let today = Utc::now().date_naive();
    if request.end_date > today {
        return Err(EngineError::Validation(format!(
            "end date {} is in the future",
            request.end_date
        )));
    }

    let capital = request.initial_capital;
    if !capital.is_finite() || capital < config.min_capital || capital > config.max_capital {
        return Err(EngineError::Validation(format!(
            "initial capital must be between {} and {}, got {capital}",
            config.min_capital, config.max_capital
        )));
    }

    let holdings = validate_holdings(&request.holdings, config.max_holdings)?;

    let strategy = StrategyKind::from_str(&request.strategy)?;
    // Parameters are checked now so a bad value fails the request, not the job
    build_strategy(strategy, &request.strategy_params)?;

    let benchmark_symbol = match request.benchmark_symbol.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(normalize_symbol(s)?),
    };

    Ok(JobSpec {
        user_id: request.user_id.trim().to_string(),
        portfolio_id: request.portfolio_id.clone(),
        strategy,
        strategy_params: request.strategy_params.clone(),
        start_date: request.start_date,
        end_date: request.end_date,
        initial_capital: capital,
        benchmark_symbol,
        rebalancing_frequency: request.rebalancing_frequency,
        holdings,
    })
}
