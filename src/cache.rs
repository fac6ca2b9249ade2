//! Hourly quotation cache
//!
//! Bounded map from a UTC hour to the quotations stored for that hour. Misses
//! are loaded from the tick store concurrently, one load per hour. Eviction is
//! FIFO by insertion order.
//!
//! The bucket for the current wall-clock hour is always reloaded because
//! ingestion is still writing into it. When the wall-clock hour changes between
//! two requests the whole cache is dropped and rebuilt on demand.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    calendar::{ceil_to_hour, one_hour, truncate_to_hour},
    clock::Clock,
    error::{Result, TickHubError},
    models::Quotation,
    storage::QuotationSource,
};

const MICROS_PER_HOUR: i64 = 3_600_000_000;

/// All quotations for one UTC hour. An empty hour is an empty bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HourBucket {
    pub hour: DateTime<Utc>,
    pub quotations: Vec<Quotation>,
}

#[derive(Debug, Default)]
struct CacheState {
    buckets: HashMap<DateTime<Utc>, Vec<Quotation>>,
    insertion_order: VecDeque<DateTime<Utc>>,
    current_hour: Option<DateTime<Utc>>,
}

impl CacheState {
    fn clear(&mut self) {
        self.buckets.clear();
        self.insertion_order.clear();
    }

    /// Insert a freshly loaded bucket. `in_flight` are the hours of the request
    /// being served; they are never chosen for eviction.
    fn insert(
        &mut self,
        hour: DateTime<Utc>,
        quotations: Vec<Quotation>,
        max_hours: usize,
        in_flight: &[DateTime<Utc>],
    ) -> Result<()> {
        if self.buckets.contains_key(&hour) {
            if Some(hour) == self.current_hour {
                self.buckets.insert(hour, quotations);
                return Ok(());
            }
            return Err(TickHubError::ConcurrencyViolation(format!(
                "bucket {hour} loaded twice"
            )));
        }

        while self.buckets.len() >= max_hours {
            self.evict_oldest(in_flight)?;
        }

        self.buckets.insert(hour, quotations);
        self.insertion_order.push_back(hour);
        Ok(())
    }

    fn evict_oldest(&mut self, in_flight: &[DateTime<Utc>]) -> Result<()> {
        let position = self
            .insertion_order
            .iter()
            .position(|hour| !in_flight.contains(hour))
            .ok_or_else(|| {
                TickHubError::ConcurrencyViolation("every cached hour is in flight".into())
            })?;

        if let Some(evicted) = self.insertion_order.remove(position) {
            self.buckets.remove(&evicted);
            debug!(hour = %evicted, "Evicted hour bucket");
        }
        Ok(())
    }
}

pub struct HourlyQuotationCache {
    source: Arc<dyn QuotationSource>,
    clock: Arc<dyn Clock>,
    max_hours: usize,
    state: Mutex<CacheState>,
    /// Serializes requests so a bucket is never loaded twice by racing callers.
    request_gate: tokio::sync::Mutex<()>,
    loads: AtomicU64,
}

impl HourlyQuotationCache {
    pub fn new(source: Arc<dyn QuotationSource>, clock: Arc<dyn Clock>, max_hours: usize) -> Self {
        Self {
            source,
            clock,
            max_hours,
            state: Mutex::new(CacheState::default()),
            request_gate: tokio::sync::Mutex::new(()),
            loads: AtomicU64::new(0),
        }
    }

    pub fn max_hours(&self) -> usize {
        self.max_hours
    }

    /// Number of hour buckets currently held.
    pub fn len(&self) -> usize {
        self.state.lock().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hour: DateTime<Utc>) -> bool {
        self.state.lock().buckets.contains_key(&hour)
    }

    /// Store loads issued since construction.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// One bucket per hour between `start` and `end`, in hour order.
    pub async fn get_historical_data(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<HourBucket>> {
        let hours = self.validate_range(start, end)?;

        let _gate = self.request_gate.lock().await;
        let now_hour = truncate_to_hour(self.clock.now());

        let missing: Vec<DateTime<Utc>> = {
            let mut state = self.state.lock();
            if state.current_hour != Some(now_hour) {
                if state.current_hour.is_some() {
                    info!(
                        hour = %now_hour,
                        dropped = state.buckets.len(),
                        "🕐 Hour rolled over, invalidating quotation cache"
                    );
                }
                state.clear();
                state.current_hour = Some(now_hour);
            }
            hours
                .iter()
                .filter(|hour| **hour == now_hour || !state.buckets.contains_key(*hour))
                .copied()
                .collect()
        };

        if !missing.is_empty() {
            debug!(requested = hours.len(), loading = missing.len(), "Loading hour buckets");
            let loads = missing.iter().map(|&hour| self.load_hour(hour, &hours));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TickHubError::Cancelled),
                loaded = try_join_all(loads) => { loaded?; }
            }
        }

        let state = self.state.lock();
        hours
            .iter()
            .map(|hour| {
                state
                    .buckets
                    .get(hour)
                    .map(|quotations| HourBucket {
                        hour: *hour,
                        quotations: quotations.clone(),
                    })
                    .ok_or_else(|| {
                        TickHubError::ConcurrencyViolation(format!(
                            "bucket {hour} missing after load"
                        ))
                    })
            })
            .collect()
    }

    /// Hour keys covered by `[start, end)`, with `end` rounded up to the next full hour.
    fn validate_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>> {
        if start > end {
            return Err(TickHubError::Range(format!("start {start} is after end {end}")));
        }

        let span_micros = (end - start)
            .num_microseconds()
            .ok_or_else(|| TickHubError::Range("range overflows".into()))?;
        let span_hours = (span_micros + MICROS_PER_HOUR - 1) / MICROS_PER_HOUR;
        if span_hours > self.max_hours as i64 {
            return Err(TickHubError::Range(format!(
                "{span_hours} hours requested, cache holds at most {}",
                self.max_hours
            )));
        }

        let first = truncate_to_hour(start);
        let stop = ceil_to_hour(end).max(first + one_hour());
        let mut hours = Vec::new();
        let mut hour = first;
        while hour < stop {
            hours.push(hour);
            hour += one_hour();
        }

        // A short but misaligned span can still straddle one hour too many
        if hours.len() > self.max_hours {
            return Err(TickHubError::Range(format!(
                "range touches {} hours, cache holds at most {}",
                hours.len(),
                self.max_hours
            )));
        }
        Ok(hours)
    }

    async fn load_hour(&self, hour: DateTime<Utc>, in_flight: &[DateTime<Utc>]) -> Result<()> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let quotations = self.source.quotations_for_hour(hour).await?;

        let mut grouped: BTreeMap<DateTime<Utc>, Vec<Quotation>> = BTreeMap::new();
        grouped.insert(hour, Vec::new());
        for q in quotations {
            grouped
                .entry(truncate_to_hour(q.timestamp_utc))
                .or_default()
                .push(q);
        }

        let mut state = self.state.lock();
        for (key, bucket) in grouped {
            state.insert(key, bucket, self.max_hours, in_flight)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::AtomicUsize;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct FakeSource {
        hours: HashMap<DateTime<Utc>, Vec<Quotation>>,
        calls: Mutex<Vec<DateTime<Utc>>>,
        total: AtomicUsize,
    }

    impl FakeSource {
        fn with_ticks(ticks: &[&str]) -> Self {
            let mut hours: HashMap<DateTime<Utc>, Vec<Quotation>> = HashMap::new();
            for (i, t) in ticks.iter().enumerate() {
                let at = ts(t);
                hours
                    .entry(truncate_to_hour(at))
                    .or_default()
                    .push(Quotation::new(i as i64, "EURUSD", at, 1.2, 1.1));
            }
            Self {
                hours,
                ..Default::default()
            }
        }

        fn calls_for(&self, hour: DateTime<Utc>) -> usize {
            self.calls.lock().iter().filter(|h| **h == hour).count()
        }
    }

    #[async_trait]
    impl QuotationSource for FakeSource {
        async fn quotations_for_hour(&self, hour_utc: DateTime<Utc>) -> Result<Vec<Quotation>> {
            self.calls.lock().push(hour_utc);
            self.total.fetch_add(1, Ordering::Relaxed);
            Ok(self.hours.get(&hour_utc).cloned().unwrap_or_default())
        }
    }

    fn cache_with(
        source: Arc<FakeSource>,
        now: &str,
        max_hours: usize,
    ) -> (HourlyQuotationCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(ts(now)));
        (
            HourlyQuotationCache::new(source, clock.clone(), max_hours),
            clock,
        )
    }

    #[tokio::test]
    async fn test_range_errors() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source.clone(), "2024-02-01T00:30:00Z", 4);
        let cancel = CancellationToken::new();

        let start = ts("2024-01-10T00:00:00Z");
        assert!(matches!(
            cache
                .get_historical_data(start, start - Duration::seconds(1), &cancel)
                .await,
            Err(TickHubError::Range(_))
        ));
        assert!(matches!(
            cache
                .get_historical_data(start, start + Duration::hours(5), &cancel)
                .await,
            Err(TickHubError::Range(_))
        ));
        assert_eq!(source.total.load(Ordering::Relaxed), 0);

        let ok = cache
            .get_historical_data(start, start + Duration::hours(4), &cancel)
            .await
            .unwrap();
        assert_eq!(ok.len(), 4);
    }

    #[tokio::test]
    async fn test_misaligned_range_counts_touched_hours() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source.clone(), "2024-02-01T00:30:00Z", 3);
        let cancel = CancellationToken::new();

        // 2h40m, but hours 00 through 03 are all touched
        let err = cache
            .get_historical_data(ts("2024-01-10T00:30:00Z"), ts("2024-01-10T03:10:00Z"), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("touches 4 hours"));
        assert_eq!(source.total.load(Ordering::Relaxed), 0);

        let ok = cache
            .get_historical_data(ts("2024-01-10T00:30:00Z"), ts("2024-01-10T02:10:00Z"), &cancel)
            .await
            .unwrap();
        assert_eq!(ok.len(), 3);
    }

    #[tokio::test]
    async fn test_one_bucket_per_hour_in_order() {
        let source = Arc::new(FakeSource::with_ticks(&[
            "2024-01-10T00:00:01Z",
            "2024-01-10T00:59:59Z",
            "2024-01-10T02:15:00Z",
        ]));
        let (cache, _) = cache_with(source, "2024-02-01T00:30:00Z", 24);

        let buckets = cache
            .get_historical_data(
                ts("2024-01-10T00:00:00Z"),
                ts("2024-01-10T03:00:00Z"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let hours: Vec<_> = buckets.iter().map(|b| b.hour).collect();
        assert_eq!(
            hours,
            vec![
                ts("2024-01-10T00:00:00Z"),
                ts("2024-01-10T01:00:00Z"),
                ts("2024-01-10T02:00:00Z"),
            ]
        );
        assert_eq!(buckets[0].quotations.len(), 2);
        assert!(buckets[0].quotations[0].timestamp_utc < buckets[0].quotations[1].timestamp_utc);
        assert!(buckets[1].quotations.is_empty());
        assert_eq!(buckets[2].quotations.len(), 1);
    }

    #[tokio::test]
    async fn test_cached_hours_are_not_reloaded_but_current_hour_is() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source.clone(), "2024-01-10T05:20:00Z", 24);
        let cancel = CancellationToken::new();
        let past = ts("2024-01-10T03:00:00Z");
        let current = ts("2024-01-10T05:00:00Z");

        for _ in 0..3 {
            cache.get_historical_data(past, past, &cancel).await.unwrap();
            cache
                .get_historical_data(current, current, &cancel)
                .await
                .unwrap();
        }

        assert_eq!(source.calls_for(past), 1);
        assert_eq!(source.calls_for(current), 3);
        // Overwriting the current hour must not grow the cache
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_hour_rollover_invalidates_everything() {
        let source = Arc::new(FakeSource::default());
        let (cache, clock) = cache_with(source.clone(), "2024-01-10T05:20:00Z", 24);
        let cancel = CancellationToken::new();
        let past = ts("2024-01-10T01:00:00Z");

        cache
            .get_historical_data(past, past + Duration::hours(2), &cancel)
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        clock.advance(Duration::minutes(45));
        cache
            .get_historical_data(past, past + Duration::hours(2), &cancel)
            .await
            .unwrap();
        assert_eq!(source.calls_for(past), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_fifo_eviction_keeps_cache_bounded() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source.clone(), "2024-02-01T00:30:00Z", 3);
        let cancel = CancellationToken::new();
        let h = |n: i64| ts("2024-01-10T00:00:00Z") + Duration::hours(n);

        cache
            .get_historical_data(h(0), h(2), &cancel)
            .await
            .unwrap();
        cache
            .get_historical_data(h(2), h(4), &cancel)
            .await
            .unwrap();

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(h(0)));
        assert!(cache.contains(h(1)));
        assert!(cache.contains(h(3)));

        // h(0) was evicted, so it is loaded again
        cache.get_historical_data(h(0), h(0), &cancel).await.unwrap();
        assert_eq!(source.calls_for(h(0)), 2);
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_full_width_request_replaces_older_hours() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source.clone(), "2024-02-01T00:30:00Z", 3);
        let cancel = CancellationToken::new();
        let h = |n: i64| ts("2024-01-10T00:00:00Z") + Duration::hours(n);

        cache.get_historical_data(h(0), h(3), &cancel).await.unwrap();
        // Overlaps one cached hour; the other two are evicted to make room
        let buckets = cache.get_historical_data(h(2), h(5), &cancel).await.unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(cache.len(), 3);
        assert_eq!(source.calls_for(h(2)), 1);
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let source = Arc::new(FakeSource::default());
        let (cache, _) = cache_with(source, "2024-02-01T00:30:00Z", 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = ts("2024-01-10T00:00:00Z");
        assert!(matches!(
            cache.get_historical_data(start, start, &cancel).await,
            Err(TickHubError::Cancelled)
        ));
    }
}
