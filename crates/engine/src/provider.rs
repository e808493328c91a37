//! Historical price series providers
//!
//! `PriceSeriesProvider` is the only thing the orchestrator knows about market
//! data. Concrete upstream sources live in `api`; this module composes them.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::series::clean_price_points;
use crate::types::PricePoint;

/// Supplies daily bars for a symbol over an inclusive date range.
///
/// An empty vector means "no data". `Err` is reserved for transport-level
/// faults, which callers treat as no data.
#[async_trait]
pub trait PriceSeriesProvider: Send + Sync {
    /// Provider name (for logs)
    fn name(&self) -> &str;

    /// Bars ascending by date
    async fn get_historical_series(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<PricePoint>>;
}

// ===== Fallback chain =====

/// Tries each source in order; a source that errors or has no data falls
/// through to the next. Output is cleaned.
pub struct FallbackProvider {
    sources: Vec<Arc<dyn PriceSeriesProvider>>,
}

impl FallbackProvider {
    pub fn new(sources: Vec<Arc<dyn PriceSeriesProvider>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PriceSeriesProvider for FallbackProvider {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn get_historical_series(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<PricePoint>> {
        let mut last_error = None;
        let mut any_answered = false;

        for source in &self.sources {
            match source.get_historical_series(symbol, from, to).await {
                Ok(points) => {
                    any_answered = true;
                    let cleaned = clean_price_points(symbol, points);
                    if !cleaned.is_empty() {
                        info!(symbol, source = source.name(), bars = cleaned.len(), "Fetched price series");
                        return Ok(cleaned);
                    }
                    debug!(symbol, source = source.name(), "No data from source");
                }
                Err(e) => {
                    warn!(symbol, source = source.name(), error = %e, "Price source failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_answered => Err(e),
            _ => Ok(Vec::new()),
        }
    }
}

// ===== Freshness cache =====

type CacheKey = (String, NaiveDate, NaiveDate);

struct CacheEntry {
    fetched_at: Instant,
    points: Vec<PricePoint>,
}

/// Caches non-empty series per (symbol, from, to) for `max_age`.
/// Concurrent misses on the same key wait on one upstream fetch.
/// Idle slots that are empty or expired are swept on every lookup, so the
/// map only holds fresh series and in-flight fetches.
pub struct CachedProvider {
    inner: Arc<dyn PriceSeriesProvider>,
    max_age: Duration,
    slots: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<Option<CacheEntry>>>>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn PriceSeriesProvider>, max_age: Duration) -> Self {
        Self {
            inner,
            max_age,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: CacheKey) -> Arc<tokio::sync::Mutex<Option<CacheEntry>>> {
        let max_age = self.max_age;
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|k, slot| *k == key || !is_stale(slot, max_age));
        if slots.len() < before {
            debug!(evicted = before - slots.len(), "Swept stale price cache slots");
        }
        slots.entry(key).or_default().clone()
    }

    /// Number of slots currently held
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached series
    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }
}

/// Unreferenced, unlocked, and holding nothing fresh
fn is_stale(slot: &Arc<tokio::sync::Mutex<Option<CacheEntry>>>, max_age: Duration) -> bool {
    if Arc::strong_count(slot) > 1 {
        return false;
    }
    match slot.try_lock() {
        Ok(entry) => entry.as_ref().map_or(true, |e| e.fetched_at.elapsed() >= max_age),
        Err(_) => false,
    }
}

#[async_trait]
impl PriceSeriesProvider for CachedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_historical_series(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> anyhow::Result<Vec<PricePoint>> {
        let slot = self.slot((symbol.to_string(), from, to));
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < self.max_age {
                debug!(symbol, bars = cached.points.len(), "Price cache hit");
                return Ok(cached.points.clone());
            }
        }

        let points = self.inner.get_historical_series(symbol, from, to).await?;
        if points.is_empty() {
            *entry = None;
        } else {
            *entry = Some(CacheEntry {
                fetched_at: Instant::now(),
                points: points.clone(),
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    /// Scripted source: counts calls, optionally fails or returns nothing
    struct FakeSource {
        name: &'static str,
        fail: bool,
        points: Vec<PricePoint>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl FakeSource {
        fn new(name: &'static str, points: Vec<PricePoint>) -> Self {
            Self {
                name,
                fail: false,
                points,
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl PriceSeriesProvider for FakeSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn get_historical_series(
            &self,
            _symbol: &str,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> anyhow::Result<Vec<PricePoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                anyhow::bail!("{} unreachable", self.name);
            }
            Ok(self.points.clone())
        }
    }

    fn bars() -> Vec<PricePoint> {
        vec![
            PricePoint::from_close("VTI", day(3), 101.0),
            PricePoint::from_close("VTI", day(2), 100.0),
        ]
    }

    #[tokio::test]
    async fn test_fallback_skips_failed_and_empty_sources() {
        let failing = Arc::new(FakeSource { fail: true, ..FakeSource::new("fmp", bars()) });
        let empty = Arc::new(FakeSource::new("empty", Vec::new()));
        let good = Arc::new(FakeSource::new("yahoo", bars()));
        let provider = FallbackProvider::new(vec![failing.clone(), empty.clone(), good.clone()]);

        let points = provider.get_historical_series("VTI", day(1), day(31)).await.unwrap();
        // Cleaned: ascending
        assert_eq!(points.iter().map(|p| p.date).collect::<Vec<_>>(), vec![day(2), day(3)]);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(empty.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_error_only_when_every_source_fails() {
        let a = Arc::new(FakeSource { fail: true, ..FakeSource::new("a", Vec::new()) });
        let b = Arc::new(FakeSource { fail: true, ..FakeSource::new("b", Vec::new()) });
        assert!(FallbackProvider::new(vec![a, b])
            .get_historical_series("X", day(1), day(2))
            .await
            .is_err());

        let a = Arc::new(FakeSource { fail: true, ..FakeSource::new("a", Vec::new()) });
        let empty = Arc::new(FakeSource::new("empty", Vec::new()));
        let points = FallbackProvider::new(vec![a, empty])
            .get_historical_series("X", day(1), day(2))
            .await
            .unwrap();
        assert!(points.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_fresh_entries_and_expires() {
        let source = Arc::new(FakeSource::new("src", bars()));
        let cache = CachedProvider::new(source.clone(), Duration::from_secs(60 * 60));

        cache.get_historical_series("VTI", day(1), day(31)).await.unwrap();
        cache.get_historical_series("VTI", day(1), day(31)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Different range is a different key
        cache.get_historical_series("VTI", day(2), day(31)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(61 * 60)).await;
        cache.get_historical_series("VTI", day(1), day(31)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_concurrent_misses_share_one_fetch() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_secs(1),
            ..FakeSource::new("slow", bars())
        });
        let cache = Arc::new(CachedProvider::new(source.clone(), Duration::from_secs(60)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_historical_series("VTI", day(1), day(31)).await })
            })
            .collect();
        for task in futures_util::future::join_all(tasks).await {
            assert_eq!(task.unwrap().unwrap().len(), 2);
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_does_not_keep_empty_results() {
        let source = Arc::new(FakeSource::new("src", Vec::new()));
        let cache = CachedProvider::new(source.clone(), Duration::from_secs(60));
        cache.get_historical_series("X", day(1), day(2)).await.unwrap();
        cache.get_historical_series("X", day(1), day(2)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        // The empty slot is swept by the next lookup of another key
        cache.get_historical_series("Y", day(1), day(2)).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_evicts_expired_slots() {
        let source = Arc::new(FakeSource::new("src", bars()));
        let cache = CachedProvider::new(source.clone(), Duration::from_secs(60));

        for d in 1..=10 {
            cache.get_historical_series("VTI", day(d), day(31)).await.unwrap();
        }
        assert_eq!(cache.len(), 10);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.get_historical_series("VTI", day(11), day(31)).await.unwrap();
        assert_eq!(cache.len(), 1);

        // Fresh entries survive a sweep
        cache.get_historical_series("VTI", day(12), day(31)).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.get_historical_series("VTI", day(11), day(31)).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 12);
    }
}
