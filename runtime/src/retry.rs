//! Retry policy with exponential backoff and jitter.
//!
//! One [`RetryPolicy`] drives both the transaction executor (backoff between
//! transient-failure retries) and the outbox worker (scheduling the next
//! delivery attempt). The delay for attempt `n` (1-based) is
//!
//! ```text
//! delay = min(max_backoff, base_backoff * 2^(n-1)) + uniform(-jitter, +jitter)
//! ```
//!
//! clamped to `[0, max_backoff]`. With `jitter = 0` the sequence is exact,
//! which is what the tests rely on.
//!
//! # Example
//!
//! ```rust
//! use tablehold_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .base_backoff(Duration::from_millis(10))
//!     .max_backoff(Duration::from_millis(80))
//!     .jitter(Duration::ZERO)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
//! assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(80));
//! ```

use rand::Rng;
use std::time::Duration;

// Guards the exponent so `1 << shift` cannot overflow.
const BACKOFF_SHIFT_GUARD: u32 = 20;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(15);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Retry policy configuration.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `base_backoff`: 500ms
/// - `max_backoff`: 15 seconds
/// - `jitter`: 100ms
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Delay for the first retry
    pub base_backoff: Duration,
    /// Cap for the exponential backoff
    pub max_backoff: Duration,
    /// Uniform jitter applied in `[-jitter, +jitter]`
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            base_backoff: None,
            max_backoff: None,
            jitter: None,
        }
    }

    /// Read a policy from the environment with defaults.
    ///
    /// Looks up `{prefix}_MAX_RETRIES`, `{prefix}_BASE_BACKOFF_MS`,
    /// `{prefix}_MAX_BACKOFF_MS`, and `{prefix}_JITTER_MS`; unparseable or
    /// missing variables fall back to the defaults. The transaction
    /// executor uses prefix `DB_TX`, the outbox worker `OUTBOX_SEND`.
    #[must_use]
    pub fn from_env(prefix: &str) -> Self {
        Self {
            max_retries: env_u32(&format!("{prefix}_MAX_RETRIES")).unwrap_or(DEFAULT_MAX_RETRIES),
            base_backoff: env_millis(&format!("{prefix}_BASE_BACKOFF_MS"))
                .unwrap_or(DEFAULT_BASE_BACKOFF),
            max_backoff: env_millis(&format!("{prefix}_MAX_BACKOFF_MS"))
                .unwrap_or(DEFAULT_MAX_BACKOFF),
            jitter: env_millis(&format!("{prefix}_JITTER_MS")).unwrap_or(DEFAULT_JITTER),
        }
    }

    /// Delay before the given attempt (1-based).
    ///
    /// Attempt 1 waits `base_backoff`, attempt 2 twice that, and so on up
    /// to `max_backoff`. Jitter is drawn uniformly from
    /// `[-jitter, +jitter]` and the result is clamped to
    /// `[0, max_backoff]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // millis fit u64 for sane configs
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let shift = (attempt - 1).min(BACKOFF_SHIFT_GUARD);
        let base_ms = self.base_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let capped = base_ms.saturating_mul(1_u64 << shift).min(max_ms);

        let jitter_ms = self.jitter.as_millis() as i64;
        let offset = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-jitter_ms..=jitter_ms)
        };

        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let delayed = (capped as i64 + offset).clamp(0, max_ms as i64) as u64;
        Duration::from_millis(delayed)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    base_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    jitter: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of retries after the initial attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the delay for the first retry.
    #[must_use]
    pub const fn base_backoff(mut self, delay: Duration) -> Self {
        self.base_backoff = Some(delay);
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = Some(delay);
        self
    }

    /// Set the jitter half-width.
    #[must_use]
    pub const fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_backoff: self.base_backoff.unwrap_or(DEFAULT_BASE_BACKOFF),
            max_backoff: self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
            jitter: self.jitter.unwrap_or(DEFAULT_JITTER),
        }
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_millis(name: &str) -> Option<Duration> {
    let ms: u64 = std::env::var(name).ok()?.parse().ok()?;
    Some(Duration::from_millis(ms))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::builder()
            .base_backoff(Duration::from_millis(base_ms))
            .max_backoff(Duration::from_millis(max_ms))
            .jitter(Duration::ZERO)
            .build()
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = no_jitter(200, 10_000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1600));
    }

    #[test]
    fn backoff_caps_at_max() {
        let policy = no_jitter(200, 10_000);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(10_000));
    }

    #[test]
    fn short_cap_applies_from_the_capped_attempt() {
        let policy = no_jitter(10, 80);
        let delays: Vec<_> = (1..=4).map(|a| policy.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80),
            ]
        );
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = no_jitter(200, 10_000);
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(1000))
            .jitter(Duration::from_millis(50))
            .build();

        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = no_jitter(500, 15_000);
        assert_eq!(
            policy.delay_for_attempt(u32::MAX),
            Duration::from_millis(15_000)
        );
    }
}
