//! Sliding-window log counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{HivequotaError, Result};
use crate::store::{Arg, AtomicStore, Routine};

/// Outcome of one sliding-window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the attempt fits in the window
    pub allowed: bool,
    /// Attempts in the trailing window, this one included
    pub attempts: u64,
}

/// Bounds the number of attempts per key within a trailing window.
///
/// Every attempt is recorded before the window is counted, so denied attempts
/// occupy a slot too: the limit reads "at most `max_count` attempts per
/// period".
pub struct SlidingWindow {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindow {
    /// Create a counter over the given store. The store must already have
    /// [`Routine::SlidingWindow`] registered.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record an attempt for `key` and report whether it is allowed.
    pub async fn allowed(&self, key: &str, period: Duration, max_count: u64) -> Result<bool> {
        Ok(self.evaluate(key, period, max_count).await?.allowed)
    }

    /// Record an attempt for `key` and report the verdict with the window size.
    pub async fn evaluate(&self, key: &str, period: Duration, max_count: u64) -> Result<WindowOutcome> {
        let period_nanos = period_nanos(period)?;

        let now = self.clock.now_nanos();
        let cutoff = now.saturating_sub(period_nanos);
        let ttl_ms = ttl_millis(period);
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        trace!(
            key = %key,
            period_ms = period.as_millis() as u64,
            max_count = max_count,
            "Evaluating sliding window"
        );

        let args = [
            Arg::Int(now),
            Arg::Text(member),
            Arg::Int(cutoff),
            Arg::Int(ttl_ms),
        ];
        let attempts = self
            .store
            .execute(Routine::SlidingWindow, key, &args)
            .await?
            .into_int(Routine::SlidingWindow)?;
        let attempts = u64::try_from(attempts).map_err(|_| {
            HivequotaError::StoreUnavailable(format!(
                "routine {} reported a negative window size: {}",
                Routine::SlidingWindow,
                attempts
            ))
        })?;

        let allowed = attempts <= max_count;
        if !allowed {
            debug!(
                key = %key,
                attempts = attempts,
                max_count = max_count,
                "Sliding window limit exceeded"
            );
        }

        Ok(WindowOutcome { allowed, attempts })
    }
}

/// Validate a window period and convert it to nanoseconds.
pub(crate) fn period_nanos(period: Duration) -> Result<i64> {
    if period.is_zero() {
        return Err(HivequotaError::Config("period must be positive".into()));
    }
    i64::try_from(period.as_nanos())
        .map_err(|_| HivequotaError::Config(format!("period {:?} is too long", period)))
}

/// The period rounded up to whole milliseconds.
fn ttl_millis(period: Duration) -> i64 {
    let millis = period.as_nanos().div_ceil(1_000_000);
    i64::try_from(millis).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::clock::{ManualClock, NANOS_PER_SEC};
    use crate::store::{MemoryStore, Reply};

    const START: i64 = 1_700_000_000 * NANOS_PER_SEC;

    async fn setup() -> (SlidingWindow, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        store.register(Routine::SlidingWindow).await.unwrap();
        (SlidingWindow::new(store.clone(), clock.clone()), clock, store)
    }

    #[tokio::test]
    async fn test_max_count_attempts_allowed_then_denied() {
        let (window, _clock, _store) = setup().await;
        let period = Duration::from_secs(60);

        for i in 1..=10 {
            assert!(window.allowed("k", period, 10).await.unwrap(), "attempt {} should pass", i);
        }
        assert!(!window.allowed("k", period, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (window, clock, _store) = setup().await;
        let period = Duration::from_secs(5);

        for _ in 0..3 {
            assert!(window.allowed("k", period, 3).await.unwrap());
        }
        assert!(!window.allowed("k", period, 3).await.unwrap());

        clock.advance(Duration::from_secs(6));
        let outcome = window.evaluate("k", period, 3).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_entry_on_the_boundary_still_counts() {
        let (window, clock, _store) = setup().await;
        let period = Duration::from_secs(5);

        window.allowed("k", period, 1).await.unwrap();
        clock.advance(period);
        let outcome = window.evaluate("k", period, 1).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(!outcome.allowed);
    }

    #[tokio::test]
    async fn test_denied_attempts_occupy_the_window() {
        let (window, clock, _store) = setup().await;
        let period = Duration::from_secs(10);

        assert!(window.allowed("k", period, 1).await.unwrap());
        clock.advance(Duration::from_secs(6));
        assert!(!window.allowed("k", period, 1).await.unwrap());

        // The first attempt aged out but the denied one has not.
        clock.advance(Duration::from_secs(6));
        assert!(!window.allowed("k", period, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_max_count_always_denies() {
        let (window, clock, _store) = setup().await;
        for _ in 0..5 {
            assert!(!window.allowed("k", Duration::from_secs(1), 0).await.unwrap());
            clock.advance(Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_zero_period_is_rejected_before_the_store() {
        let (window, _clock, store) = setup().await;
        let result = window.allowed("k", Duration::ZERO, 5).await;
        assert!(matches!(result, Err(HivequotaError::Config(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_key_expires() {
        let (window, clock, store) = setup().await;
        window.allowed("k", Duration::from_secs(5), 3).await.unwrap();
        assert_eq!(store.len(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.purge_expired(), 0);

        clock.advance(Duration::from_nanos(1));
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (window, _clock, _store) = setup().await;
        let period = Duration::from_secs(60);
        assert!(window.allowed("a", period, 1).await.unwrap());
        assert!(window.allowed("b", period, 1).await.unwrap());
        assert!(!window.allowed("a", period, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_is_not_a_denial() {
        let (window, _clock, store) = setup().await;
        store.set_available(false);
        let err = window.allowed("k", Duration::from_secs(1), 1).await.unwrap_err();
        assert!(err.is_undecidable());
    }

    /// A store whose window routine reports a fixed count.
    struct FixedCountStore(i64);

    #[async_trait]
    impl AtomicStore for FixedCountStore {
        async fn register(&self, _routine: Routine) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _routine: Routine, _key: &str, _args: &[Arg]) -> Result<Reply> {
            Ok(Reply::Int(self.0))
        }

        fn backend_name(&self) -> &'static str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_negative_count_is_a_store_fault() {
        let clock = Arc::new(ManualClock::new(START));
        let window = SlidingWindow::new(Arc::new(FixedCountStore(-1)), clock);

        let err = window.allowed("k", Duration::from_secs(1), 1).await.unwrap_err();
        assert!(matches!(err, HivequotaError::StoreUnavailable(_)));
        assert!(err.is_undecidable());
    }

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_secs(5)), 5_000);
        assert_eq!(ttl_millis(Duration::from_micros(1_500)), 2);
    }
}
