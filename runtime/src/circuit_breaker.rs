//! Circuit breaker guarding the storage backend against retry storms.
//!
//! The breaker counts *connection* failures inside a rolling window; the
//! transaction executor classifies errors first, so serialization conflicts
//! and constraint violations never count. Once the count reaches
//! the threshold the breaker opens and every call fails fast, without
//! touching storage, until the open period elapses. The first call after
//! that runs as a trial: success closes the breaker and resets the window,
//! another connection failure reopens it for a fresh period.
//!
//! # States
//!
//! - **Closed**: normal operation, failures are counted.
//! - **Open**: calls are rejected immediately until `opened_until`.
//! - **HalfOpen**: the post-cooldown trial is in flight.
//!
//! One instance is shared (via `Arc`) by every request task; all state
//! lives behind a mutex so concurrent outcome reports are safe.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tablehold_core::Clock;

const DEFAULT_FAILURE_THRESHOLD: usize = 5;
const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(20);

const ENV_THRESHOLD: &str = "DB_BREAKER_THRESHOLD";
const ENV_WINDOW_SECONDS: &str = "DB_BREAKER_WINDOW_SECONDS";
const ENV_OPEN_SECONDS: &str = "DB_BREAKER_OPEN_SECONDS";

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Connection failures within the window before opening
    pub failure_threshold: usize,
    /// Rolling window over which failures are counted
    pub failure_window: Duration,
    /// How long the breaker stays open before allowing a trial
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            open_duration: DEFAULT_OPEN_DURATION,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            failure_window: None,
            open_duration: None,
        }
    }

    /// Read a configuration from the environment with defaults.
    ///
    /// Variables: `DB_BREAKER_THRESHOLD`, `DB_BREAKER_WINDOW_SECONDS`,
    /// `DB_BREAKER_OPEN_SECONDS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_usize(ENV_THRESHOLD)
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            failure_window: env_seconds(ENV_WINDOW_SECONDS).unwrap_or(DEFAULT_FAILURE_WINDOW),
            open_duration: env_seconds(ENV_OPEN_SECONDS).unwrap_or(DEFAULT_OPEN_DURATION),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    failure_window: Option<Duration>,
    open_duration: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the rolling failure window.
    #[must_use]
    pub const fn failure_window(mut self, window: Duration) -> Self {
        self.failure_window = Some(window);
        self
    }

    /// Set the open (fast-fail) duration.
    #[must_use]
    pub const fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            failure_window: self.failure_window.unwrap_or(DEFAULT_FAILURE_WINDOW),
            open_duration: self.open_duration.unwrap_or(DEFAULT_OPEN_DURATION),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Normal operation
    Closed,
    /// Fast-failing until the open period elapses
    Open,
    /// Post-cooldown trial in flight
    HalfOpen,
}

impl State {
    const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_timestamps: VecDeque<DateTime<Utc>>,
    opened_until: Option<DateTime<Utc>>,
}

/// Fail-fast guard for the storage backend.
///
/// Construct once, wrap in `Arc`, and hand to every caller that reports
/// transaction outcomes.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    total_opens: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_timestamps: VecDeque::new(),
                opened_until: None,
            }),
            total_opens: AtomicU64::new(0),
        }
    }

    /// Current state, for health surfaces and tests.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Total number of CLOSED→OPEN (and trial→OPEN) transitions.
    pub fn total_opens(&self) -> u64 {
        self.total_opens.load(Ordering::Relaxed)
    }

    /// Whether a call may proceed right now.
    ///
    /// While open, returns `false` until the open period elapses; the first
    /// call after that is admitted as the trial (state becomes `HalfOpen`).
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let due = inner.opened_until.is_none_or(|until| now >= until);
                if due {
                    tracing::info!("circuit breaker transitioning OPEN -> HALF_OPEN (trial)");
                    inner.state = State::HalfOpen;
                    metrics::gauge!("circuit_breaker_state").set(State::HalfOpen.as_gauge());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful transaction.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state == State::HalfOpen {
            tracing::info!("circuit breaker transitioning HALF_OPEN -> CLOSED");
        }
        inner.state = State::Closed;
        inner.failure_timestamps.clear();
        inner.opened_until = None;
        metrics::gauge!("circuit_breaker_state").set(State::Closed.as_gauge());
    }

    /// Report a classified connection failure.
    ///
    /// Returns `true` when the breaker is open after recording the failure
    /// (whether it just opened or already was); the caller fails fast with
    /// a database-unavailable error in that case.
    pub fn on_connection_failure(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            State::Open => true,
            State::HalfOpen => {
                tracing::warn!("circuit breaker trial failed, transitioning HALF_OPEN -> OPEN");
                self.open(&mut inner, now);
                true
            }
            State::Closed => {
                self.prune(&mut inner, now);
                inner.failure_timestamps.push_back(now);
                if inner.failure_timestamps.len() >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.failure_timestamps.len(),
                        threshold = self.config.failure_threshold,
                        "circuit breaker transitioning CLOSED -> OPEN"
                    );
                    self.open(&mut inner, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = State::Open;
        inner.opened_until = Some(now + to_chrono(self.config.open_duration));
        inner.failure_timestamps.clear();
        self.total_opens.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("circuit_breaker_opened_total").increment(1);
        metrics::gauge!("circuit_breaker_state").set(State::Open.as_gauge());
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let cutoff = now - to_chrono(self.config.failure_window);
        while inner
            .failure_timestamps
            .front()
            .is_some_and(|ts| *ts < cutoff)
        {
            inner.failure_timestamps.pop_front();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another task panicked mid-update;
        // the breaker state itself is always valid.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_seconds(name: &str) -> Option<Duration> {
    let secs: u64 = std::env::var(name).ok()?.parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use tablehold_core::ManualClock;

    fn breaker(threshold: usize) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .failure_window(Duration::from_secs(30))
            .open_duration(Duration::from_secs(20))
            .build();
        (clock.clone(), CircuitBreaker::new(config, clock))
    }

    #[test]
    fn stays_closed_below_threshold() {
        let (_clock, breaker) = breaker(2);
        assert!(!breaker.on_connection_failure());
        assert_eq!(breaker.state(), State::Closed);
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let (_clock, breaker) = breaker(2);
        assert!(!breaker.on_connection_failure());
        assert!(breaker.on_connection_failure());
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.is_call_permitted());
        assert_eq!(breaker.total_opens(), 1);
    }

    #[test]
    fn admits_trial_after_open_duration() {
        let (clock, breaker) = breaker(2);
        breaker.on_connection_failure();
        breaker.on_connection_failure();
        assert!(!breaker.is_call_permitted());

        clock.advance(ChronoDuration::seconds(21));
        assert!(breaker.is_call_permitted());
        assert_eq!(breaker.state(), State::HalfOpen);
    }

    #[test]
    fn trial_success_closes() {
        let (clock, breaker) = breaker(2);
        breaker.on_connection_failure();
        breaker.on_connection_failure();
        clock.advance(ChronoDuration::seconds(21));
        assert!(breaker.is_call_permitted());

        breaker.on_success();
        assert_eq!(breaker.state(), State::Closed);
        // Window reset: one failure is again below threshold.
        assert!(!breaker.on_connection_failure());
    }

    #[test]
    fn trial_failure_reopens_for_a_fresh_period() {
        let (clock, breaker) = breaker(2);
        breaker.on_connection_failure();
        breaker.on_connection_failure();
        clock.advance(ChronoDuration::seconds(21));
        assert!(breaker.is_call_permitted());

        assert!(breaker.on_connection_failure());
        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.is_call_permitted());
        assert_eq!(breaker.total_opens(), 2);

        clock.advance(ChronoDuration::seconds(21));
        assert!(breaker.is_call_permitted());
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let (clock, breaker) = breaker(2);
        assert!(!breaker.on_connection_failure());
        clock.advance(ChronoDuration::seconds(31));
        // The first failure has aged out of the window.
        assert!(!breaker.on_connection_failure());
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn success_in_closed_state_clears_the_window() {
        let (_clock, breaker) = breaker(2);
        breaker.on_connection_failure();
        breaker.on_success();
        assert!(!breaker.on_connection_failure());
        assert_eq!(breaker.state(), State::Closed);
    }
}
