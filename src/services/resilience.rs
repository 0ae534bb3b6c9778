//! Retry policy and circuit breaker for the background-removal provider.
//!
//! Both are timer-free: callers pass `Instant`s in and do their own sleeping,
//! so the composition can be tested without a clock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::bg_removal::BgRemovalError;

/// Bounded exponential backoff, applied to retryable failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8_000),
        }
    }
}

impl RetryPolicy {
    /// Whether a failure on 1-based `attempt` earns another try.
    pub fn should_retry(&self, error: &BgRemovalError, attempt: u32) -> bool {
        error.is_retryable() && attempt <= self.max_retries
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base... capped.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing; calls are short-circuited.
    Open,
    /// Cool-down elapsed; a single probe is allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn event_name(self) -> &'static str {
        match self {
            CircuitState::Closed => "worker.bg_remove_breaker.close",
            CircuitState::Open => "worker.bg_remove_breaker.open",
            CircuitState::HalfOpen => "worker.bg_remove_breaker.halfOpen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Percentage of failed calls in the window that opens the circuit.
    pub error_threshold_percent: u32,
    /// Minimum calls in the window before the error rate is evaluated.
    pub volume_threshold: u32,
    pub rolling_window: Duration,
    /// Cool-down before a probe is allowed.
    pub reset_timeout: Duration,
    /// Upper bound on one guarded call, enforced by the caller. A call cut
    /// off here is recorded as a failure.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percent: 50,
            volume_threshold: 5,
            rolling_window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(35),
        }
    }
}

/// Result of asking the breaker for permission to call.
#[derive(Debug)]
pub enum Admission<'a> {
    Allowed(CallPermit<'a>),
    /// Allowed as the half-open probe. `transitioned` is set once, with the transition.
    Probe {
        permit: CallPermit<'a>,
        transitioned: bool,
    },
    Rejected,
}

impl<'a> Admission<'a> {
    pub fn into_permit(self) -> Option<CallPermit<'a>> {
        match self {
            Admission::Allowed(permit) | Admission::Probe { permit, .. } => Some(permit),
            Admission::Rejected => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected)
    }
}

/// Right to report one call outcome. Stamped with the breaker generation it
/// was issued in; an outcome from an earlier generation is ignored. Dropping
/// an unrecorded probe permit frees the probe slot.
#[derive(Debug)]
#[must_use = "record the call outcome or drop the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    recorded: bool,
}

impl CallPermit<'_> {
    /// Record the outcome of the call. Returns the new state if it changed.
    pub fn record(mut self, success: bool, now: Instant) -> Option<CircuitState> {
        self.recorded = true;
        self.breaker.settle(self.generation, success, now)
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            self.breaker.release_probe(self.generation);
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Bumped on every state change.
    generation: u64,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation += 1;
    }
}

/// Error-rate circuit breaker over a rolling window of outcomes.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.config.call_timeout
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to make one call at `now`.
    pub fn try_acquire(&self, now: Instant) -> Admission<'_> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed(self.permit(inner.generation, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.config.reset_timeout);
                if cooled {
                    inner.transition(CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Admission::Probe {
                        permit: self.permit(inner.generation, true),
                        transitioned: true,
                    }
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe {
                        permit: self.permit(inner.generation, true),
                        transitioned: false,
                    }
                }
            }
        }
    }

    fn permit(&self, generation: u64, probe: bool) -> CallPermit<'_> {
        CallPermit {
            breaker: self,
            generation,
            probe,
            recorded: false,
        }
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn settle(&self, generation: u64, success: bool, now: Instant) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        // Admitted under a state that has since changed.
        if inner.generation != generation {
            return None;
        }
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.outcomes.clear();
                if success {
                    inner.transition(CircuitState::Closed);
                    inner.opened_at = None;
                    Some(CircuitState::Closed)
                } else {
                    inner.transition(CircuitState::Open);
                    inner.opened_at = Some(now);
                    Some(CircuitState::Open)
                }
            }
            CircuitState::Closed => {
                inner.outcomes.push_back((now, success));
                let window = self.config.rolling_window;
                while let Some(&(at, _)) = inner.outcomes.front() {
                    if now.duration_since(at) > window {
                        inner.outcomes.pop_front();
                    } else {
                        break;
                    }
                }

                let total = inner.outcomes.len() as u32;
                if total < self.config.volume_threshold {
                    return None;
                }
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                if failures * 100 >= self.config.error_threshold_percent * total {
                    inner.transition(CircuitState::Open);
                    inner.opened_at = Some(now);
                    inner.outcomes.clear();
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            // No permit is issued while open.
            CircuitState::Open => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            error_threshold_percent: 50,
            volume_threshold: 4,
            rolling_window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(35),
        })
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(350));
        assert_eq!(policy.next_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_should_retry_only_retryable_within_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let transient = BgRemovalError::RetryableStatus { status: 503 };
        let rejected = BgRemovalError::NonRetryable { status: 400 };

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&rejected, 1));
        assert!(policy.should_retry(&BgRemovalError::RetryableStatus { status: 429 }, 1));
    }

    /// One admitted call that completes immediately.
    fn call(b: &CircuitBreaker, success: bool, now: Instant) -> Option<CircuitState> {
        b.try_acquire(now)
            .into_permit()
            .expect("call should be admitted")
            .record(success, now)
    }

    fn trip(b: &CircuitBreaker, now: Instant) {
        for _ in 0..4 {
            call(b, false, now);
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_breaker_stays_closed_below_volume() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(call(&b, false, now), None);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_breaker_opens_on_error_rate() {
        let b = breaker();
        let now = Instant::now();
        call(&b, true, now);
        call(&b, true, now);
        call(&b, false, now);
        assert_eq!(call(&b, false, now), Some(CircuitState::Open));
        assert!(b.try_acquire(now).is_rejected());
    }

    #[test]
    fn test_old_outcomes_leave_the_window() {
        let b = breaker();
        let start = Instant::now();
        for _ in 0..3 {
            call(&b, false, start);
        }
        let later = start + Duration::from_secs(11);
        assert_eq!(call(&b, false, later), None);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_then_close() {
        let b = breaker();
        let now = Instant::now();
        trip(&b, now);
        let after = now + Duration::from_secs(31);
        let Admission::Probe { permit, transitioned } = b.try_acquire(after) else {
            panic!("expected the half-open call");
        };
        assert!(transitioned);
        // Only one probe at a time.
        assert!(b.try_acquire(after).is_rejected());
        assert_eq!(permit.record(true, after), Some(CircuitState::Closed));
        assert!(matches!(b.try_acquire(after), Admission::Allowed(_)));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let b = breaker();
        let now = Instant::now();
        trip(&b, now);
        let after = now + Duration::from_secs(31);
        assert_eq!(call(&b, false, after), Some(CircuitState::Open));
        assert!(b.try_acquire(after + Duration::from_secs(1)).is_rejected());
    }

    #[test]
    fn test_late_outcome_from_closed_state_is_ignored_while_half_open() {
        let b = breaker();
        let now = Instant::now();
        let slow = b.try_acquire(now).into_permit().unwrap();
        trip(&b, now);

        let after = now + Duration::from_secs(31);
        let trial = b.try_acquire(after).into_permit().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // The call admitted before the circuit opened finishes now.
        assert_eq!(slow.record(true, after), None);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.try_acquire(after).is_rejected());

        assert_eq!(trial.record(false, after), Some(CircuitState::Open));
    }

    #[test]
    fn test_late_outcome_does_not_reopen_closed_circuit() {
        let b = breaker();
        let now = Instant::now();
        let slow = b.try_acquire(now).into_permit().unwrap();
        trip(&b, now);
        let after = now + Duration::from_secs(31);
        assert_eq!(call(&b, true, after), Some(CircuitState::Closed));

        assert_eq!(slow.record(false, after), None);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_abandoned_half_open_call_frees_the_slot() {
        let b = breaker();
        let now = Instant::now();
        trip(&b, now);
        let after = now + Duration::from_secs(31);

        let abandoned = b.try_acquire(after);
        assert!(matches!(abandoned, Admission::Probe { transitioned: true, .. }));
        drop(abandoned);
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let Admission::Probe { permit, transitioned } = b.try_acquire(after) else {
            panic!("expected the half-open slot to be free again");
        };
        assert!(!transitioned);
        assert_eq!(permit.record(true, after), Some(CircuitState::Closed));
    }
}
