//! Rebalance schedule over an aligned trading calendar

use chrono::{Datelike, NaiveDate};

use crate::types::RebalancingFrequency;

/// Calendar bucket a date falls into for a given frequency
fn period_key(date: NaiveDate, frequency: RebalancingFrequency) -> Option<(i32, u32)> {
    match frequency {
        RebalancingFrequency::Daily => Some((date.year(), date.ordinal())),
        RebalancingFrequency::Weekly => {
            let week = date.iso_week();
            Some((week.year(), week.week()))
        }
        RebalancingFrequency::Monthly => Some((date.year(), date.month())),
        RebalancingFrequency::Quarterly => Some((date.year(), (date.month() - 1) / 3)),
        RebalancingFrequency::Annually => Some((date.year(), 0)),
        RebalancingFrequency::Never => None,
    }
}

/// One flag per date: true where a new period starts. Index 0 is the initial
/// purchase and is never flagged.
pub fn rebalance_flags(dates: &[NaiveDate], frequency: RebalancingFrequency) -> Vec<bool> {
    let mut flags = vec![false; dates.len()];
    for i in 1..dates.len() {
        flags[i] = match (
            period_key(dates[i - 1], frequency),
            period_key(dates[i], frequency),
        ) {
            (Some(prev), Some(cur)) => prev != cur,
            _ => false,
        };
    }
    flags
}

/// The dates on which a rebalance happens
pub fn rebalance_dates(dates: &[NaiveDate], frequency: RebalancingFrequency) -> Vec<NaiveDate> {
    rebalance_flags(dates, frequency)
        .into_iter()
        .zip(dates)
        .filter_map(|(flag, d)| flag.then_some(*d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Weekdays between two dates, inclusive
    fn trading_days(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        from.iter_days()
            .take_while(|d| *d <= to)
            .filter(|d| d.weekday().num_days_from_monday() < 5)
            .collect()
    }

    #[test]
    fn test_monthly_picks_first_trading_day() {
        let days = trading_days(ymd(2024, 1, 2), ymd(2024, 4, 30));
        let got = rebalance_dates(&days, RebalancingFrequency::Monthly);
        assert_eq!(got, vec![ymd(2024, 2, 1), ymd(2024, 3, 1), ymd(2024, 4, 1)]);
    }

    #[test]
    fn test_weekly_uses_iso_weeks() {
        // 2024-12-30 is in ISO week 1 of 2025 together with 2025-01-02
        let days = vec![ymd(2024, 12, 27), ymd(2024, 12, 30), ymd(2025, 1, 2), ymd(2025, 1, 6)];
        let got = rebalance_dates(&days, RebalancingFrequency::Weekly);
        assert_eq!(got, vec![ymd(2024, 12, 30), ymd(2025, 1, 6)]);
    }

    #[test]
    fn test_quarterly_and_annual() {
        let days = trading_days(ymd(2023, 11, 1), ymd(2024, 7, 31));
        assert_eq!(
            rebalance_dates(&days, RebalancingFrequency::Quarterly),
            vec![ymd(2024, 1, 1), ymd(2024, 4, 1), ymd(2024, 7, 1)]
        );
        assert_eq!(
            rebalance_dates(&days, RebalancingFrequency::Annually),
            vec![ymd(2024, 1, 1)]
        );
    }

    #[test]
    fn test_daily_and_never() {
        let days = trading_days(ymd(2024, 1, 2), ymd(2024, 1, 8));
        let daily = rebalance_flags(&days, RebalancingFrequency::Daily);
        assert!(!daily[0]);
        assert!(daily[1..].iter().all(|f| *f));
        assert!(rebalance_dates(&days, RebalancingFrequency::Never).is_empty());
        assert!(rebalance_flags(&[], RebalancingFrequency::Daily).is_empty());
    }
}
