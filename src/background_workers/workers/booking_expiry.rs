//! Booking expiry worker.
//!
//! Periodically moves pending bookings whose start date has passed to the
//! `expired` status. Runs once as soon as it starts, then on every interval
//! tick or manual trigger, one cycle at a time.

use crate::background_workers::{panic_message, Worker, WorkerError};
use crate::booking_store::{BookingId, BookingStore};
use crate::metrics;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const BOOKING_CHECKER_NAME: &str = "BookingChecker";

/// Maximum number of undrained results kept by the checker.
pub const RESULT_BUFFER_CAPACITY: usize = 10;

/// Default upper bound for a single store call.
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a single cycle failed. Never fatal to the run loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("store error: {0}")]
    Store(String),

    #[error("store call exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("cycle cancelled")]
    Cancelled,

    #[error("store call panicked: {0}")]
    Panicked(String),
}

impl CycleError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CycleError::Store(_) => "failed",
            CycleError::DeadlineExceeded(_) => "timeout",
            CycleError::Cancelled => "cancelled",
            CycleError::Panicked(_) => "panic",
        }
    }
}

/// Outcome of one check cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub expired_count: usize,
    pub expired_ids: Vec<BookingId>,
    pub error: Option<CycleError>,
    /// When the cycle started.
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    fn success(expired_ids: Vec<BookingId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            expired_count: expired_ids.len(),
            expired_ids,
            error: None,
            timestamp,
        }
    }

    fn failure(error: CycleError, timestamp: DateTime<Utc>) -> Self {
        Self {
            expired_count: 0,
            expired_ids: Vec::new(),
            error: Some(error),
            timestamp,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Read side of a checker's result buffer.
///
/// Cloning the stream does not duplicate results: every clone drains the
/// same buffer.
#[derive(Clone)]
pub struct ResultStream {
    receiver: Arc<Mutex<mpsc::Receiver<CheckResult>>>,
}

impl ResultStream {
    /// Wait for the next result.
    pub async fn recv(&self) -> Option<CheckResult> {
        self.receiver.lock().await.recv().await
    }

    /// Take the oldest buffered result, if any. Returns `None` while another
    /// consumer is waiting in [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<CheckResult> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Take every buffered result, oldest first. Returns an empty `Vec`
    /// while another consumer is waiting in [`recv`](Self::recv).
    pub fn drain(&self) -> Vec<CheckResult> {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return Vec::new();
        };
        let mut results = Vec::new();
        while let Ok(result) = receiver.try_recv() {
            results.push(result);
        }
        results
    }
}

/// Periodic worker that expires stale pending bookings.
pub struct BookingExpiryChecker {
    store: Arc<dyn BookingStore>,
    interval: Duration,
    cycle_timeout: Duration,

    /// Single-slot trigger. A full slot means a check is already pending.
    trigger_tx: mpsc::Sender<()>,
    /// Held by the run loop for as long as it runs.
    trigger_rx: Mutex<mpsc::Receiver<()>>,

    results_tx: mpsc::Sender<CheckResult>,
    results: ResultStream,

    /// Held for the whole duration of a store call, including one that
    /// outlived its cycle deadline, so store calls never overlap.
    store_in_flight: Arc<Mutex<()>>,
}

impl BookingExpiryChecker {
    /// Create a checker running every `interval`. A zero interval is rejected.
    pub fn new(store: Arc<dyn BookingStore>, interval: Duration) -> Result<Self, WorkerError> {
        if interval.is_zero() {
            return Err(WorkerError::InvalidInterval);
        }

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (results_tx, results_rx) = mpsc::channel(RESULT_BUFFER_CAPACITY);

        Ok(Self {
            store,
            interval,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            trigger_tx,
            trigger_rx: Mutex::new(trigger_rx),
            results_tx,
            results: ResultStream {
                receiver: Arc::new(Mutex::new(results_rx)),
            },
            store_in_flight: Arc::new(Mutex::new(())),
        })
    }

    /// Override the per-cycle store deadline. A zero deadline is rejected.
    pub fn with_cycle_timeout(mut self, cycle_timeout: Duration) -> Result<Self, WorkerError> {
        if cycle_timeout.is_zero() {
            return Err(WorkerError::InvalidCycleTimeout);
        }
        self.cycle_timeout = cycle_timeout;
        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cycle_timeout(&self) -> Duration {
        self.cycle_timeout
    }

    /// Request an out-of-band check. Never blocks; coalesces with a check
    /// that is already pending.
    pub fn trigger_check(&self) {
        if self.trigger_tx.try_send(()).is_err() {
            debug!("[{}] Check already pending, trigger coalesced", self.name());
        }
    }

    /// Stream of cycle results, for monitoring.
    pub fn results(&self) -> ResultStream {
        self.results.clone()
    }

    async fn check_expired_bookings(&self, cancel: &CancellationToken) {
        let timestamp = Utc::now();
        let started = Instant::now();

        let abandon = CancellationToken::new();
        let mut call = tokio::spawn(Self::expire_in_store(
            Arc::clone(&self.store),
            Arc::clone(&self.store_in_flight),
            timestamp.date_naive(),
            self.cycle_timeout,
            abandon.clone(),
        ));

        let (outcome, abandoned) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (Err(CycleError::Cancelled), true),
            joined = tokio::time::timeout(self.cycle_timeout, &mut call) => match joined {
                Ok(Ok(outcome)) => (outcome, false),
                Ok(Err(e)) => (Err(join_error_to_cycle_error(e)), false),
                Err(_) => (Err(CycleError::DeadlineExceeded(self.cycle_timeout)), true),
            },
        };

        if abandoned {
            // A call still queued behind the in-flight guard never starts; a
            // running one is interrupted, and if it commits anyway its ids are
            // published once it returns.
            abandon.cancel();
            self.store.interrupt();
            self.report_late_outcome(call, timestamp);
        }

        let result = match outcome {
            Ok(expired_ids) => {
                if expired_ids.is_empty() {
                    info!("[{}] No expired bookings found", self.name());
                } else {
                    info!(
                        "[{}] Marked {} bookings as expired: {:?}",
                        self.name(),
                        expired_ids.len(),
                        expired_ids
                    );
                    metrics::record_bookings_expired(expired_ids.len());
                }
                CheckResult::success(expired_ids, timestamp)
            }
            Err(CycleError::Cancelled) => {
                info!("[{}] Check interrupted by cancellation", self.name());
                CheckResult::failure(CycleError::Cancelled, timestamp)
            }
            Err(e) => {
                error!("[{}] Error checking expired bookings: {}", self.name(), e);
                CheckResult::failure(e, timestamp)
            }
        };

        let status = result.error.as_ref().map_or("success", CycleError::as_label);
        metrics::record_worker_cycle(self.name(), status, started.elapsed());

        publish(&self.results_tx, result);
    }

    /// Run the blocking store call off the async runtime, unless the cycle
    /// gave up on it while it was waiting for the previous call to finish.
    async fn expire_in_store(
        store: Arc<dyn BookingStore>,
        store_in_flight: Arc<Mutex<()>>,
        today: NaiveDate,
        timeout: Duration,
        abandon: CancellationToken,
    ) -> Result<Vec<BookingId>, CycleError> {
        let in_flight = store_in_flight.lock_owned().await;
        if abandon.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let joined = tokio::task::spawn_blocking(move || {
            let _in_flight = in_flight;
            store.expire_stale_pending_bookings(today, timeout)
        })
        .await;

        match joined {
            Ok(Ok(expired_ids)) => Ok(expired_ids),
            Ok(Err(e)) => Err(CycleError::Store(format!("{:#}", e))),
            Err(e) => Err(join_error_to_cycle_error(e)),
        }
    }

    /// Wait for an abandoned store call in the background. Bookings it
    /// expired despite the interrupt are logged, counted and published as a
    /// separate result carrying the abandoned cycle's timestamp.
    fn report_late_outcome(
        &self,
        call: JoinHandle<Result<Vec<BookingId>, CycleError>>,
        timestamp: DateTime<Utc>,
    ) {
        let results_tx = self.results_tx.clone();
        tokio::spawn(async move {
            match call.await {
                Ok(Ok(expired_ids)) if !expired_ids.is_empty() => {
                    warn!(
                        "[{}] Abandoned check still marked {} bookings as expired: {:?}",
                        BOOKING_CHECKER_NAME,
                        expired_ids.len(),
                        expired_ids
                    );
                    metrics::record_bookings_expired(expired_ids.len());
                    publish(&results_tx, CheckResult::success(expired_ids, timestamp));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!("[{}] Abandoned check ended: {}", BOOKING_CHECKER_NAME, e),
                Err(e) => debug!(
                    "[{}] Abandoned check ended: {}",
                    BOOKING_CHECKER_NAME,
                    join_error_to_cycle_error(e)
                ),
            }
        });
    }
}

/// Hand a result to the buffer without blocking. When the buffer is full
/// the new result is dropped and the older ones are kept.
fn publish(results_tx: &mpsc::Sender<CheckResult>, result: CheckResult) {
    if results_tx.try_send(result).is_err() {
        debug!(
            "[{}] Result buffer full, discarding newest result",
            BOOKING_CHECKER_NAME
        );
        metrics::record_worker_result_dropped(BOOKING_CHECKER_NAME);
    }
}

fn join_error_to_cycle_error(e: JoinError) -> CycleError {
    if e.is_panic() {
        CycleError::Panicked(panic_message(&*e.into_panic()))
    } else {
        CycleError::Store(e.to_string())
    }
}

#[async_trait]
impl Worker for BookingExpiryChecker {
    fn name(&self) -> &str {
        BOOKING_CHECKER_NAME
    }

    async fn start(&self, cancel: CancellationToken) {
        let Ok(mut trigger_rx) = self.trigger_rx.try_lock() else {
            warn!("[{}] Already running, ignoring second start", self.name());
            return;
        };

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the immediate check below replaces it
        ticker.tick().await;

        self.check_expired_bookings(&cancel).await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[{}] Cancellation received, stopping", self.name());
                    return;
                }
                _ = ticker.tick() => {
                    self.check_expired_bookings(&cancel).await;
                }
                Some(()) = trigger_rx.recv() => {
                    info!("[{}] Manual trigger received", self.name());
                    self.check_expired_bookings(&cancel).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking_store::{Booking, BookingStatus, MockBookingStore, NewBooking};
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const LONG_INTERVAL: Duration = Duration::from_secs(3600);

    /// Store stub that counts calls, returns `[call_number]` as the expired
    /// ids and records any overlapping call. An interruptible stub gives up
    /// on a running call when interrupted; the default one ignores interrupts
    /// and always commits.
    struct CountingStore {
        calls: AtomicUsize,
        in_call: AtomicBool,
        overlapped: AtomicBool,
        interrupts: AtomicUsize,
        interrupt_pending: AtomicBool,
        honors_interrupt: bool,
        delay: Duration,
    }

    impl CountingStore {
        fn new(delay: Duration) -> Arc<Self> {
            Self::build(delay, false)
        }

        fn interruptible(delay: Duration) -> Arc<Self> {
            Self::build(delay, true)
        }

        fn build(delay: Duration, honors_interrupt: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_call: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                interrupts: AtomicUsize::new(0),
                interrupt_pending: AtomicBool::new(false),
                honors_interrupt,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn interrupts(&self) -> usize {
            self.interrupts.load(Ordering::SeqCst)
        }

        fn is_in_call(&self) -> bool {
            self.in_call.load(Ordering::SeqCst)
        }
    }

    impl BookingStore for CountingStore {
        fn expire_stale_pending_bookings(
            &self,
            _today: NaiveDate,
            _timeout: Duration,
        ) -> Result<Vec<BookingId>> {
            self.interrupt_pending.store(false, Ordering::SeqCst);
            if self.in_call.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

            let started = Instant::now();
            while started.elapsed() < self.delay {
                if self.honors_interrupt && self.interrupt_pending.swap(false, Ordering::SeqCst) {
                    self.in_call.store(false, Ordering::SeqCst);
                    return Err(anyhow!("interrupted"));
                }
                std::thread::sleep(Duration::from_millis(5).min(self.delay));
            }

            self.in_call.store(false, Ordering::SeqCst);
            Ok(vec![call as BookingId])
        }

        fn insert_booking(&self, _booking: NewBooking) -> Result<BookingId> {
            unimplemented!()
        }

        fn get_booking(&self, _id: BookingId) -> Result<Option<Booking>> {
            unimplemented!()
        }

        fn count_bookings_with_status(&self, _status: BookingStatus) -> Result<usize> {
            unimplemented!()
        }

        fn interrupt(&self) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
            if self.in_call.load(Ordering::SeqCst) {
                self.interrupt_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn spawn_checker(
        checker: Arc<BookingExpiryChecker>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { checker.start(token).await });
        (cancel, handle)
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let store = CountingStore::new(Duration::ZERO);
        let result = BookingExpiryChecker::new(store, Duration::ZERO);
        assert!(matches!(result, Err(WorkerError::InvalidInterval)));
    }

    #[test]
    fn test_checker_metadata() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = BookingExpiryChecker::new(store, Duration::from_secs(60))
            .unwrap()
            .with_cycle_timeout(Duration::from_secs(5))
            .unwrap();

        assert_eq!(checker.name(), "BookingChecker");
        assert_eq!(checker.interval(), Duration::from_secs(60));
        assert_eq!(checker.cycle_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_first_cycle_runs_immediately() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        let results = checker.results();

        let (cancel, handle) = spawn_checker(checker);

        let first = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .expect("first cycle should not wait for the interval")
            .unwrap();
        assert!(first.is_success());
        assert_eq!(first.expired_ids, vec![1]);
        assert_eq!(store.calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_interval_ticks_run_cycles() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), Duration::from_millis(50)).unwrap(),
        );

        let (cancel, handle) = spawn_checker(checker);
        wait_until(|| store.calls() >= 3).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_triggers_before_start_coalesce() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        checker.trigger_check();
        checker.trigger_check();

        let (cancel, handle) = spawn_checker(checker);
        wait_until(|| store.calls() >= 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Immediate cycle plus exactly one triggered cycle
        assert_eq!(store.calls(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_triggers_during_cycle_coalesce() {
        let store = CountingStore::new(Duration::from_millis(200));
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());

        let (cancel, handle) = spawn_checker(checker.clone());
        wait_until(|| store.calls() == 1).await;
        checker.trigger_check();
        checker.trigger_check();
        checker.trigger_check();

        wait_until(|| store.calls() == 2).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.calls(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_drops_newest_results() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        let results = checker.results();

        let (cancel, handle) = spawn_checker(checker.clone());
        wait_until(|| store.calls() == 1).await;
        for expected in 2..=12 {
            checker.trigger_check();
            wait_until(|| store.calls() == expected).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let drained = results.drain();
        assert_eq!(drained.len(), RESULT_BUFFER_CAPACITY);
        let cycles: Vec<BookingId> = drained.iter().map(|r| r.expired_ids[0]).collect();
        assert_eq!(cycles, (1..=10).collect::<Vec<BookingId>>());
        assert!(results.try_recv().is_none());

        // Space is available again once drained
        checker.trigger_check();
        let next = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.expired_ids, vec![13]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cycles_never_overlap_under_bursts() {
        let store = CountingStore::new(Duration::from_millis(15));
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), Duration::from_millis(5)).unwrap(),
        );
        let (cancel, handle) = spawn_checker(checker.clone());

        let mut triggerers = Vec::new();
        for _ in 0..4 {
            let checker = checker.clone();
            triggerers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    checker.trigger_check();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }));
        }
        for triggerer in triggerers {
            triggerer.await.unwrap();
        }

        cancel.cancel();
        handle.await.unwrap();

        assert!(store.calls() > 1);
        assert!(!store.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_does_not_overlap_store_calls() {
        let store = CountingStore::new(Duration::from_millis(60));
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), Duration::from_millis(10))
                .unwrap()
                .with_cycle_timeout(Duration::from_millis(20))
                .unwrap(),
        );
        let results = checker.results();

        let (cancel, handle) = spawn_checker(checker);
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        handle.await.unwrap();

        let drained = results.drain();
        assert!(drained
            .iter()
            .any(|r| r.error == Some(CycleError::DeadlineExceeded(Duration::from_millis(20)))));
        assert!(!store.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_store_error_is_recorded_and_loop_continues() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut mock = MockBookingStore::new();
        let counter = calls.clone();
        mock.expect_expire_stale_pending_bookings()
            .returning(move |_, _| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("database is locked"))
                } else {
                    Ok(vec![7])
                }
            });

        let checker = Arc::new(BookingExpiryChecker::new(Arc::new(mock), LONG_INTERVAL).unwrap());
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker.clone());

        let failed = results.recv().await.unwrap();
        assert_eq!(failed.expired_count, 0);
        assert!(matches!(
            failed.error,
            Some(CycleError::Store(ref msg)) if msg.contains("database is locked")
        ));

        checker.trigger_check();
        let recovered = results.recv().await.unwrap();
        assert!(recovered.is_success());
        assert_eq!(recovered.expired_count, 1);
        assert_eq!(recovered.expired_ids, vec![7]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_panic_is_recorded() {
        let mut mock = MockBookingStore::new();
        mock.expect_expire_stale_pending_bookings()
            .returning(|_, _| panic!("driver bug"));

        let checker = Arc::new(BookingExpiryChecker::new(Arc::new(mock), LONG_INTERVAL).unwrap());
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker);

        let result = results.recv().await.unwrap();
        assert_eq!(
            result.error,
            Some(CycleError::Panicked("driver bug".to_string()))
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_loop_promptly() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        let (cancel, handle) = spawn_checker(checker);
        wait_until(|| store.calls() == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("checker should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_slow_cycle() {
        let store = CountingStore::new(Duration::from_millis(500));
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker);
        wait_until(|| store.calls() == 1).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("cancellation should not wait for the store call")
            .unwrap();

        let result = results.try_recv().unwrap();
        assert_eq!(result.error, Some(CycleError::Cancelled));
        assert_eq!(store.interrupts(), 1);
    }

    #[tokio::test]
    async fn test_second_start_returns_immediately() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = Arc::new(BookingExpiryChecker::new(store.clone(), LONG_INTERVAL).unwrap());
        let (cancel, handle) = spawn_checker(checker.clone());
        wait_until(|| store.calls() == 1).await;

        tokio::time::timeout(
            Duration::from_millis(200),
            checker.start(CancellationToken::new()),
        )
        .await
        .expect("second start should not run a loop");
        assert_eq!(store.calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_zero_cycle_timeout_is_rejected() {
        let store = CountingStore::new(Duration::ZERO);
        let result = BookingExpiryChecker::new(store, LONG_INTERVAL)
            .unwrap()
            .with_cycle_timeout(Duration::ZERO);
        assert!(matches!(result, Err(WorkerError::InvalidCycleTimeout)));
    }

    #[tokio::test]
    async fn test_timed_out_call_that_commits_is_reported_late() {
        let store = CountingStore::new(Duration::from_millis(200));
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), LONG_INTERVAL)
                .unwrap()
                .with_cycle_timeout(Duration::from_millis(50))
                .unwrap(),
        );
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker);

        let timed_out = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            timed_out.error,
            Some(CycleError::DeadlineExceeded(Duration::from_millis(50)))
        );
        assert_eq!(timed_out.expired_count, 0);
        assert_eq!(store.interrupts(), 1);

        // The store ignored the interrupt and committed, so the ids still surface
        let late = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .expect("committed ids should be published")
            .unwrap();
        assert!(late.is_success());
        assert_eq!(late.expired_count, 1);
        assert_eq!(late.expired_ids, vec![1]);
        assert_eq!(late.timestamp, timed_out.timestamp);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_interrupts_running_store_call() {
        let store = CountingStore::interruptible(Duration::from_secs(5));
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), LONG_INTERVAL)
                .unwrap()
                .with_cycle_timeout(Duration::from_millis(50))
                .unwrap(),
        );
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker);

        let timed_out = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            timed_out.error,
            Some(CycleError::DeadlineExceeded(Duration::from_millis(50)))
        );

        wait_until(|| !store.is_in_call()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.interrupts(), 1);
        assert!(results.try_recv().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_queued_behind_abandoned_call_never_starts() {
        let store = CountingStore::new(Duration::from_millis(150));
        let checker = Arc::new(
            BookingExpiryChecker::new(store.clone(), LONG_INTERVAL)
                .unwrap()
                .with_cycle_timeout(Duration::from_millis(20))
                .unwrap(),
        );
        let results = checker.results();
        let (cancel, handle) = spawn_checker(checker.clone());

        let first = results.recv().await.unwrap();
        assert!(matches!(first.error, Some(CycleError::DeadlineExceeded(_))));
        checker.trigger_check();
        let second = results.recv().await.unwrap();
        assert!(matches!(second.error, Some(CycleError::DeadlineExceeded(_))));

        let late = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late.expired_ids, vec![1]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.calls(), 1);
        assert!(!store.overlapped.load(Ordering::SeqCst));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_is_empty_while_another_consumer_waits() {
        let store = CountingStore::new(Duration::ZERO);
        let checker = BookingExpiryChecker::new(store, LONG_INTERVAL).unwrap();
        let results = checker.results();

        let waiting = results.clone();
        let waiter = tokio::spawn(async move { waiting.recv().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(results.drain().is_empty());
        assert!(results.try_recv().is_none());

        publish(&checker.results_tx, CheckResult::success(vec![5], Utc::now()));
        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.expired_ids, vec![5]);
    }
}
