use dashmap::DashMap;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::auth::ClientIdentity;
use crate::metrics::{SWEEP_EVICTIONS, TRACKED_CLIENTS};

// Longest window or sweep period accepted from config
pub const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

// Admissions that read the clock just after the sweep did land slightly ahead
const SWEEP_CLOCK_SKEW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSettings {
    pub max_per_window: NonZeroU32,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_per_window: NonZeroU32::new(60).unwrap_or(NonZeroU32::MIN),
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    // retry_after: time until the oldest counted request leaves the window
    Rejected { retry_after: Duration },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SweepError {
    #[error("record holds a timestamp {ahead:?} past the sweep time")]
    FutureTimestamp { ahead: Duration },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub retained: usize,
    pub evicted: usize,
    pub faulted: usize,
}

pub struct WindowLog {
    records: DashMap<ClientIdentity, VecDeque<Instant>>,
    max_per_window: usize,
    window: Duration,
}

impl WindowLog {
    pub fn new(max_per_window: NonZeroU32, window: Duration) -> Self {
        Self {
            records: DashMap::new(),
            max_per_window: max_per_window.get() as usize,
            window,
        }
    }

    pub fn admit(&self, client: &ClientIdentity, now: Instant) -> Admission {
        let window = self.window;
        let mut entry = self.records.entry(client.clone()).or_default();
        let record = entry.value_mut();

        record.retain(|&ts| is_active(ts, now, window));

        if record.len() >= self.max_per_window {
            // window - age instead of oldest + window, which can overflow Instant
            let retry_after = record
                .front()
                .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or_default();
            return Admission::Rejected { retry_after };
        }

        // Keep the record sorted even if callers hand in out-of-order instants
        let at = record.partition_point(|&ts| ts <= now);
        record.insert(at, now);
        Admission::Admitted
    }

    // Compacts every record and drops the empty ones. A faulty record is
    // logged and kept, the pass goes on with the other clients.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let window = self.window;
        let mut report = SweepReport::default();

        self.records.retain(|client, record| match compact(record, now, window) {
            Ok(true) => {
                report.retained += 1;
                true
            }
            Ok(false) => {
                report.evicted += 1;
                false
            }
            Err(err) => {
                tracing::warn!(client = %client, error = %err, "Skipping rate record during sweep");
                report.faulted += 1;
                true
            }
        });

        report
    }

    pub fn tracked_clients(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn record_len(&self, client: &ClientIdentity) -> usize {
        self.records.get(client).map_or(0, |record| record.len())
    }
}

// A timestamp counts while strictly less than one window old
fn is_active(ts: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(ts) < window
}

// Ok(false) means the record is empty and can go
fn compact(
    record: &mut VecDeque<Instant>,
    now: Instant,
    window: Duration,
) -> Result<bool, SweepError> {
    if let Some(&newest) = record.back() {
        let ahead = newest.saturating_duration_since(now);
        if ahead > SWEEP_CLOCK_SKEW {
            return Err(SweepError::FutureTimestamp { ahead });
        }
    }

    let before = record.len();
    record.retain(|&ts| is_active(ts, now, window));
    if record.len() < before {
        record.shrink_to_fit();
    }
    Ok(!record.is_empty())
}

// Owns the log and its sweep task; the task stops on shutdown or drop
pub struct RateLimiter {
    log: Arc<WindowLog>,
    settings: LimiterSettings,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl RateLimiter {
    // Spawns the sweep, so it needs a tokio runtime
    pub fn start(settings: LimiterSettings) -> Self {
        let log = Arc::new(WindowLog::new(settings.max_per_window, settings.window));
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&log), settings.sweep_interval));

        tracing::info!(
            max_per_window = settings.max_per_window.get(),
            window = ?settings.window,
            sweep_interval = ?settings.sweep_interval,
            "Rate limiter started"
        );

        Self {
            log,
            settings,
            sweeper: Mutex::new(Some(sweeper)),
            running: AtomicBool::new(true),
        }
    }

    pub fn admit(&self, client: &ClientIdentity, now: Instant) -> Admission {
        debug_assert!(self.is_running(), "admission on a stopped rate limiter");
        self.log.admit(client, now)
    }

    pub fn check(&self, client: &ClientIdentity) -> Admission {
        self.admit(client, Instant::now())
    }

    pub fn settings(&self) -> LimiterSettings {
        self.settings
    }

    pub fn tracked_clients(&self) -> usize {
        self.log.tracked_clients()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // Idempotent
    pub fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.abort();
            self.running.store(false, Ordering::Release);
            tracing::info!("Rate limiter stopped");
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sweep_loop(log: Arc<WindowLog>, period: Duration) {
    let Some(start) = Instant::now().checked_add(period) else {
        tracing::error!(period = ?period, "Sweep period out of range, sweep disabled");
        return;
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let report = log.sweep(Instant::now());
        SWEEP_EVICTIONS.inc_by(report.evicted as f64);
        TRACKED_CLIENTS.set(log.tracked_clients() as f64);

        tracing::debug!(
            retained = report.retained,
            evicted = report.evicted,
            faulted = report.faulted,
            "Rate limit sweep finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn client(id: &str) -> ClientIdentity {
        ClientIdentity::new(id)
    }

    fn window_log(max_per_window: u32, window: Duration) -> WindowLog {
        WindowLog::new(NonZeroU32::new(max_per_window).unwrap(), window)
    }

    #[test]
    fn third_request_within_window_is_rejected() {
        let log = window_log(2, secs(60));
        let a = client("a");
        let t0 = Instant::now();

        assert_eq!(log.admit(&a, t0), Admission::Admitted);
        assert_eq!(log.admit(&a, t0 + secs(1)), Admission::Admitted);
        assert_eq!(
            log.admit(&a, t0 + secs(2)),
            Admission::Rejected {
                retry_after: secs(58)
            }
        );
    }

    #[test]
    fn retry_after_is_honoured() {
        let log = window_log(2, secs(60));
        let a = client("a");
        let t0 = Instant::now();
        log.admit(&a, t0);
        log.admit(&a, t0 + secs(1));

        let now = t0 + secs(2);
        let Admission::Rejected { retry_after } = log.admit(&a, now) else {
            panic!("expected a rejection");
        };
        assert_eq!(log.admit(&a, now + retry_after), Admission::Admitted);
    }

    #[test]
    fn retry_after_covers_sub_millisecond_remainder() {
        let log = window_log(2, secs(60));
        let a = client("a");
        let t0 = Instant::now();
        log.admit(&a, t0);
        log.admit(&a, t0 + secs(1));

        let now = t0 + secs(2) + Duration::from_micros(500);
        let Admission::Rejected { retry_after } = log.admit(&a, now) else {
            panic!("expected a rejection");
        };
        assert_eq!(retry_after, Duration::from_micros(57_999_500));
        assert_eq!(log.admit(&a, now + retry_after), Admission::Admitted);
    }

    #[test]
    fn huge_window_does_not_overflow() {
        let log = window_log(1, Duration::from_secs(u64::MAX));
        let a = client("a");
        let t0 = Instant::now();

        assert_eq!(log.admit(&a, t0), Admission::Admitted);
        assert_eq!(
            log.admit(&a, t0 + secs(1)),
            Admission::Rejected {
                retry_after: Duration::from_secs(u64::MAX - 1)
            }
        );
        assert_eq!(log.sweep(t0 + secs(2)).retained, 1);
    }

    #[test]
    fn timestamp_exactly_one_window_old_is_expired() {
        let log = window_log(1, secs(60));
        let a = client("a");
        let t0 = Instant::now();

        assert_eq!(log.admit(&a, t0), Admission::Admitted);
        assert!(matches!(
            log.admit(&a, t0 + Duration::from_millis(59_999)),
            Admission::Rejected { .. }
        ));
        assert_eq!(log.admit(&a, t0 + secs(60)), Admission::Admitted);
    }

    #[test]
    fn rejections_do_not_consume_budget() {
        let log = window_log(3, secs(60));
        let a = client("a");
        let t0 = Instant::now();
        for i in 0..3 {
            assert_eq!(log.admit(&a, t0 + secs(i)), Admission::Admitted);
        }

        for i in 3..20 {
            assert_eq!(
                log.admit(&a, t0 + secs(i)),
                Admission::Rejected {
                    retry_after: secs(60 - i)
                }
            );
        }
        assert_eq!(log.record_len(&a), 3);
    }

    #[test]
    fn clients_are_limited_independently() {
        let log = window_log(1, secs(60));
        let t0 = Instant::now();

        assert_eq!(log.admit(&client("a"), t0), Admission::Admitted);
        assert_eq!(log.admit(&client("b"), t0), Admission::Admitted);
        assert!(matches!(
            log.admit(&client("a"), t0),
            Admission::Rejected { .. }
        ));
        assert_eq!(log.tracked_clients(), 2);
    }

    #[test]
    fn sweep_removes_idle_client() {
        let log = window_log(5, secs(60));
        let b = client("b");
        let t0 = Instant::now();
        log.admit(&b, t0);

        let report = log.sweep(t0 + Duration::from_millis(60_500));
        assert_eq!(
            report,
            SweepReport {
                retained: 0,
                evicted: 1,
                faulted: 0
            }
        );
        assert_eq!(log.tracked_clients(), 0);
    }

    #[test]
    fn sweep_compacts_active_client() {
        let log = window_log(5, secs(60));
        let a = client("a");
        let t0 = Instant::now();
        log.admit(&a, t0);
        log.admit(&a, t0 + secs(30));

        let report = log.sweep(t0 + secs(61));
        assert_eq!(report.retained, 1);
        assert_eq!(log.record_len(&a), 1);
    }

    #[test]
    fn sweep_skips_faulty_record_and_continues() {
        let log = window_log(5, secs(60));
        let t0 = Instant::now();
        log.admit(&client("ahead"), t0 + secs(120));
        log.admit(&client("idle"), t0);

        let report = log.sweep(t0 + secs(61));
        assert_eq!(
            report,
            SweepReport {
                retained: 0,
                evicted: 1,
                faulted: 1
            }
        );
        assert_eq!(log.record_len(&client("ahead")), 1);
        assert_eq!(log.record_len(&client("idle")), 0);
    }

    #[test]
    fn sweep_tolerates_small_clock_skew() {
        let log = window_log(5, secs(60));
        let t0 = Instant::now();
        log.admit(&client("old"), t0);
        log.admit(&client("old"), t0 + secs(61) + Duration::from_millis(1));

        let report = log.sweep(t0 + secs(61));
        assert_eq!(
            report,
            SweepReport {
                retained: 1,
                evicted: 0,
                faulted: 0
            }
        );
        assert_eq!(log.record_len(&client("old")), 1);
    }

    #[test]
    fn out_of_order_admissions_keep_record_sorted() {
        let log = window_log(2, secs(60));
        let a = client("a");
        let t0 = Instant::now();
        log.admit(&a, t0 + secs(10));
        log.admit(&a, t0 + secs(5));

        assert_eq!(
            log.admit(&a, t0 + secs(20)),
            Admission::Rejected {
                retry_after: secs(45)
            }
        );
    }

    #[test]
    fn idle_clients_do_not_accumulate() {
        let log = window_log(1, secs(60));
        let t0 = Instant::now();
        for i in 0..500 {
            log.admit(&client(&format!("client-{i}")), t0);
        }
        log.admit(&client("recent"), t0 + secs(50));
        assert_eq!(log.tracked_clients(), 501);

        log.sweep(t0 + secs(60));
        assert_eq!(log.tracked_clients(), 1);
    }

    #[test]
    fn concurrent_admissions_for_last_slot() {
        for _ in 0..50 {
            let log = window_log(2, secs(60));
            let a = client("a");
            let now = Instant::now();
            assert_eq!(log.admit(&a, now), Admission::Admitted);

            let barrier = Barrier::new(2);
            let (log_ref, a_ref, barrier_ref) = (&log, &a, &barrier);
            let outcomes: Vec<Admission> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        s.spawn(move || {
                            barrier_ref.wait();
                            log_ref.admit(a_ref, now)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let admitted = outcomes
                .iter()
                .filter(|o| **o == Admission::Admitted)
                .count();
            assert_eq!(admitted, 1, "outcomes: {outcomes:?}");
            assert_eq!(log.record_len(&a), 2);
        }
    }

    #[test]
    fn sweep_racing_admission_keeps_new_timestamp() {
        for _ in 0..200 {
            let log = window_log(2, secs(60));
            let a = client("a");
            let t0 = Instant::now();
            log.admit(&a, t0);
            let now = t0 + secs(61);

            let barrier = Barrier::new(2);
            let (log_ref, a_ref, barrier_ref) = (&log, &a, &barrier);
            let admission = std::thread::scope(|s| {
                let sweeper = s.spawn(move || {
                    barrier_ref.wait();
                    log_ref.sweep(now)
                });
                let admit = s.spawn(move || {
                    barrier_ref.wait();
                    log_ref.admit(a_ref, now)
                });
                sweeper.join().unwrap();
                admit.join().unwrap()
            });

            assert_eq!(admission, Admission::Admitted);
            assert_eq!(log.record_len(&a), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_evicts_idle_clients() {
        let limiter = RateLimiter::start(LimiterSettings::default());
        let b = client("b");

        assert_eq!(limiter.check(&b), Admission::Admitted);
        assert_eq!(limiter.tracked_clients(), 1);

        tokio::time::sleep(Duration::from_millis(60_500)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        limiter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_sweep_and_is_idempotent() {
        let limiter = RateLimiter::start(LimiterSettings::default());
        assert!(limiter.is_running());
        limiter.check(&client("a"));

        limiter.shutdown();
        limiter.shutdown();
        assert!(!limiter.is_running());

        tokio::time::sleep(secs(180)).await;
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
