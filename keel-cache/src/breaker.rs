//! Circuit breaker guarding the redis tier.
//!
//! Classic three-state machine: CLOSED admits everything and tracks
//! outcomes in a sliding window; once the window holds at least
//! `minimum_calls` outcomes and the failure rate reaches the threshold,
//! the breaker OPENs and short-circuits for `wait_in_open`. It then
//! admits `half_open_permits` probe calls; one probe failure reopens,
//! all probes succeeding closes and clears the window.
//!
//! Admission is lock-free so guarded calls are never serialized through
//! the breaker: `try_acquire` reads an atomic state word and deadline,
//! flips OPEN to HALF_OPEN with a compare-exchange, and draws probe
//! permits from an atomic budget. Only outcome recording takes a lock,
//! and only long enough to update the ring buffer.

use crate::config::BreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Snapshot of breaker counters for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    /// Outcomes recorded over the breaker's lifetime.
    pub recorded_calls: u64,
    /// Calls rejected without reaching the backend.
    pub rejected_calls: u64,
    /// Outcomes currently in the sliding window.
    pub window_calls: u32,
    /// Failure percentage over the current window, in `[0, 100]`.
    pub failure_rate: f64,
    /// State transitions over the breaker's lifetime.
    pub transitions: u64,
}

/// Sliding window of recent call outcomes. `true` slots are failures.
struct Window {
    slots: Box<[bool]>,
    filled: usize,
    head: usize,
    failures: usize,
}

impl Window {
    fn new(size: usize) -> Self {
        Window {
            slots: vec![false; size.max(1)].into_boxed_slice(),
            filled: 0,
            head: 0,
            failures: 0,
        }
    }

    fn record(&mut self, failure: bool) {
        if self.filled == self.slots.len() {
            if self.slots[self.head] {
                self.failures -= 1;
            }
        } else {
            self.filled += 1;
        }
        self.slots[self.head] = failure;
        if failure {
            self.failures += 1;
        }
        self.head = (self.head + 1) % self.slots.len();
    }

    fn clear(&mut self) {
        self.slots.fill(false);
        self.filled = 0;
        self.head = 0;
        self.failures = 0;
    }

    fn failure_rate(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.failures as f64 * 100.0 / self.filled as f64
    }
}

/// Sliding-window circuit breaker.
///
/// The config is assumed to have passed
/// [`BreakerConfig::validate`](crate::config::BreakerConfig::validate).
pub struct CircuitBreaker {
    config: BreakerConfig,
    started: Instant,
    state: AtomicU8,
    /// Millisecond deadline (relative to `started`) at which an open
    /// breaker starts probing.
    open_until_millis: AtomicU64,
    /// Probe permits handed out in the current half-open round.
    trials_started: AtomicU32,
    trials_succeeded: AtomicU32,
    recorded: AtomicU64,
    rejected: AtomicU64,
    transitions: AtomicU64,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let window = Window::new(config.sliding_window_size as usize);
        CircuitBreaker {
            config,
            started: Instant::now(),
            state: AtomicU8::new(STATE_CLOSED),
            open_until_millis: AtomicU64::new(0),
            trials_started: AtomicU32::new(0),
            trials_succeeded: AtomicU32::new(0),
            recorded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            window: Mutex::new(window),
        }
    }

    /// Ask to make a guarded call. `None` means the call must not
    /// proceed; the caller short-circuits to its fallback or error.
    ///
    /// The returned permit must be settled with
    /// [`succeed`](CallPermit::succeed) or [`fail`](CallPermit::fail)
    /// once the call's outcome is known.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => {
                if self.now_millis() < self.open_until_millis.load(Ordering::Acquire) {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                // Wait elapsed. One caller wins the flip to half-open;
                // the trial counters were zeroed when the breaker
                // opened, so every waiter can go straight to the budget.
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    debug!(state = %CircuitState::HalfOpen, "circuit breaker probing");
                }
                self.acquire_trial()
            }
            STATE_HALF_OPEN => self.acquire_trial(),
            _ => Some(CallPermit {
                breaker: self,
                half_open: false,
                settled: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let (window_calls, failure_rate) = {
            let window = self.window.lock();
            (window.filled as u32, window.failure_rate())
        };
        BreakerMetrics {
            state: self.state(),
            recorded_calls: self.recorded.load(Ordering::Relaxed),
            rejected_calls: self.rejected.load(Ordering::Relaxed),
            window_calls,
            failure_rate,
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    fn acquire_trial(&self) -> Option<CallPermit<'_>> {
        let budget = self.config.half_open_permits;
        let admitted = self
            .trials_started
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |started| {
                (started < budget).then_some(started + 1)
            })
            .is_ok();
        if admitted {
            Some(CallPermit {
                breaker: self,
                half_open: true,
                settled: false,
            })
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn on_success(&self, half_open: bool) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if half_open {
            let succeeded = self.trials_succeeded.fetch_add(1, Ordering::AcqRel) + 1;
            if succeeded >= self.config.half_open_permits
                && self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.window.lock().clear();
                self.transitions.fetch_add(1, Ordering::Relaxed);
                info!("circuit breaker closed");
            }
            return;
        }
        self.record_closed(false);
    }

    fn on_failure(&self, half_open: bool) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if half_open {
            self.trip(STATE_HALF_OPEN);
            warn!(
                wait = ?self.config.wait_in_open,
                "probe failed; circuit breaker reopened"
            );
            return;
        }
        self.record_closed(true);
    }

    /// The trip predicate runs on every outcome: a success that evicts
    /// an older success from a full window can push the rate over the
    /// threshold just as a fresh failure can.
    fn record_closed(&self, failure: bool) {
        let mut window = self.window.lock();
        window.record(failure);
        let total = window.filled as u32;
        let failure_rate = window.failure_rate();
        if total >= self.config.minimum_calls && failure_rate >= self.config.failure_rate_threshold
        {
            self.trip(STATE_CLOSED);
            warn!(
                failure_rate,
                window_calls = total,
                wait = ?self.config.wait_in_open,
                "circuit breaker opened"
            );
        }
    }

    /// Move `from` to OPEN. The trial counters are zeroed here, before
    /// the state flip, so the next half-open round starts with a full
    /// budget no matter which caller flips it.
    fn trip(&self, from: u8) {
        let deadline = self
            .now_millis()
            .saturating_add(self.config.wait_in_open.as_millis() as u64);
        self.open_until_millis.store(deadline, Ordering::Release);
        self.trials_started.store(0, Ordering::Release);
        self.trials_succeeded.store(0, Ordering::Release);
        if self
            .state
            .compare_exchange(from, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Permission to make one guarded call.
#[must_use = "settle the permit with succeed() or fail() once the call resolves"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.half_open);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.half_open);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.half_open {
            return;
        }
        // A probe abandoned mid-flight hands its trial slot back
        // without recording an outcome.
        let _ = self
            .breaker
            .trials_started
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            sliding_window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 50.0,
            wait_in_open: Duration::from_secs(30),
            half_open_permits: 3,
        }
    }

    fn fail_once(breaker: &CircuitBreaker) {
        breaker.try_acquire().expect("breaker should admit").fail();
    }

    fn succeed_once(breaker: &CircuitBreaker) {
        breaker
            .try_acquire()
            .expect("breaker should admit")
            .succeed();
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = CircuitBreaker::new(test_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_opens_once_minimum_calls_fail() {
        let breaker = CircuitBreaker::new(test_config());

        // Four failures are below minimum_calls; still closed.
        for _ in 0..4 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        // The fifth reaches the minimum at 100% failure rate.
        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_ten_failures_open_and_short_circuit() {
        let breaker = CircuitBreaker::new(test_config());
        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..10 {
            match breaker.try_acquire() {
                Some(permit) => {
                    permit.fail();
                    admitted += 1;
                }
                None => rejected += 1,
            }
        }
        // Opens at the fifth failure; the rest short-circuit.
        assert_eq!(admitted, 5);
        assert_eq!(rejected, 5);
        assert_eq!(breaker.state(), CircuitState::Open);

        let metrics = breaker.metrics();
        assert_eq!(metrics.recorded_calls, 5);
        assert_eq!(metrics.rejected_calls, 5);
        assert_eq!(metrics.failure_rate, 100.0);
    }

    #[tokio::test]
    async fn test_stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..7 {
            succeed_once(&breaker);
        }
        for _ in 0..3 {
            fail_once(&breaker);
        }
        // 3 failures in 10 outcomes is 30%, under the 50% threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().window_calls, 10);
    }

    #[tokio::test]
    async fn test_window_slides_old_outcomes_out() {
        let mut config = test_config();
        config.sliding_window_size = 5;
        config.minimum_calls = 5;
        let breaker = CircuitBreaker::new(config);

        // Two early failures stay under the 50% threshold, then a run
        // of successes pushes them out of the five-slot window.
        for _ in 0..2 {
            fail_once(&breaker);
        }
        for _ in 0..7 {
            succeed_once(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failure_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_the_permit_budget() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(30)).await;

        let mut probes = Vec::new();
        for _ in 0..3 {
            probes.push(breaker.try_acquire().expect("probe within budget"));
        }
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Budget exhausted while the probes are in flight.
        assert!(breaker.try_acquire().is_none());

        // One failing probe reopens immediately.
        probes.pop().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_probes_succeeding_closes_and_clears() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..3 {
            succeed_once(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        let metrics = breaker.metrics();
        assert_eq!(metrics.window_calls, 0);
        assert_eq!(metrics.failure_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_waits_a_full_round_before_probing_again() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        fail_once(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_returns_its_slot() {
        let mut config = test_config();
        config.half_open_permits = 1;
        let breaker = CircuitBreaker::new(config);
        for _ in 0..5 {
            fail_once(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe = breaker.try_acquire().expect("single probe");
        assert!(breaker.try_acquire().is_none());
        drop(probe);

        // The dropped probe freed the budget without settling.
        let retry = breaker.try_acquire().expect("slot returned");
        retry.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_counts_over_a_full_lifecycle() {
        let breaker = CircuitBreaker::new(test_config());
        for _ in 0..5 {
            fail_once(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..3 {
            succeed_once(&breaker);
        }

        // closed -> open -> half-open -> closed.
        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.transitions, 3);
        assert_eq!(metrics.recorded_calls, 8);
    }
}
