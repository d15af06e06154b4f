use derive_more::Constructor;
#[cfg(test)]
use mockall::automock;
use rand::{rng, Rng};
use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Jitter applied to exponential delays, in percent.
const JITTER_PERCENT: u32 = 15;

/// Sequence of delays between reconnection attempts of a single node pool or the control
/// connection.
pub trait ReconnectionSchedule {
    /// Delay before the next attempt. `None` stops reconnecting.
    fn next_delay(&mut self) -> Option<Duration>;
}

impl<F: FnMut() -> Option<Duration>> ReconnectionSchedule for F {
    #[inline]
    fn next_delay(&mut self) -> Option<Duration> {
        self()
    }
}

/// Source of reconnection schedules. Every reconnection run starts from a new schedule, so a
/// successful reconnection resets the delays.
#[cfg_attr(test, automock)]
pub trait ReconnectionPolicy {
    fn new_node_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync>;
}

/// Waits the same delay before every attempt.
#[derive(Copy, Clone, Constructor, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl Default for ConstantReconnectionPolicy {
    fn default() -> Self {
        ConstantReconnectionPolicy::new(DEFAULT_BASE_DELAY)
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_node_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync> {
        let delay = self.delay;
        Box::new(move || Some(delay))
    }
}

/// Gives up immediately. A node which lost all connections stays down until the cluster
/// reports it up again.
#[derive(Default, Copy, Clone, Debug, PartialEq, Ord, PartialOrd, Eq, Hash)]
pub struct NeverReconnectionPolicy;

impl ReconnectionPolicy for NeverReconnectionPolicy {
    fn new_node_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync> {
        Box::new(|| None)
    }
}

/// Doubles the delay after every attempt, starting from `base_delay`, until `max_delay` or
/// `max_attempts` doublings are reached. Each delay is randomized by up to 15% either way, but
/// never leaves the `[base_delay, max_delay]` range.
#[derive(Copy, Clone, Constructor, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        ExponentialReconnectionPolicy::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
            doublings_until(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY),
        )
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_node_schedule(&self) -> Box<dyn ReconnectionSchedule + Send + Sync> {
        Box::new(ExponentialReconnectionSchedule {
            policy: *self,
            attempt: 0,
        })
    }
}

/// Number of doublings of `base` needed to reach `max`.
fn doublings_until(base: Duration, max: Duration) -> usize {
    let mut delay = base;
    let mut doublings = 0;

    while delay < max && !delay.is_zero() {
        delay = delay.saturating_mul(2);
        doublings += 1;
    }

    doublings
}

struct ExponentialReconnectionSchedule {
    policy: ExponentialReconnectionPolicy,
    attempt: usize,
}

impl ReconnectionSchedule for ExponentialReconnectionSchedule {
    fn next_delay(&mut self) -> Option<Duration> {
        let ExponentialReconnectionPolicy {
            base_delay,
            max_delay,
            max_attempts,
        } = self.policy;

        if self.attempt >= max_attempts {
            return Some(max_delay);
        }

        self.attempt += 1;

        let factor = u32::try_from(self.attempt)
            .ok()
            .and_then(|attempt| 1u32.checked_shl(attempt))
            .unwrap_or(u32::MAX);
        let delay = base_delay.saturating_mul(factor).min(max_delay);
        let jitter = rng().random_range(100 - JITTER_PERCENT..=100 + JITTER_PERCENT);

        Some(
            (delay / 100)
                .saturating_mul(jitter)
                .clamp(base_delay, max_delay),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_not_overflow_on_late_attempts() {
        let mut schedule = ExponentialReconnectionSchedule {
            policy: ExponentialReconnectionPolicy::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
                usize::MAX,
            ),
            attempt: usize::MAX - 1,
        };

        let delay = schedule.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(850) && delay <= Duration::from_secs(1));
        assert_eq!(schedule.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn should_grow_exponential_delay_within_bounds() {
        let base_delay = Duration::from_millis(100);
        let max_delay = Duration::from_secs(1);
        let mut schedule =
            ExponentialReconnectionPolicy::new(base_delay, max_delay, 10).new_node_schedule();

        let delays: Vec<_> = (0..12).filter_map(|_| schedule.next_delay()).collect();
        assert_eq!(delays.len(), 12);
        assert!(delays
            .iter()
            .all(|delay| *delay >= base_delay && *delay <= max_delay));
        assert_eq!(delays[11], max_delay);
    }

    #[test]
    fn should_count_doublings_to_max_delay() {
        assert_eq!(doublings_until(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY), 6);
        assert_eq!(doublings_until(Duration::ZERO, DEFAULT_MAX_DELAY), 0);
    }

    #[test]
    fn should_schedule_constant_delay_forever() {
        let mut schedule =
            ConstantReconnectionPolicy::new(Duration::from_millis(10)).new_node_schedule();

        for _ in 0..5 {
            assert_eq!(schedule.next_delay(), Some(Duration::from_millis(10)));
        }

        assert_eq!(NeverReconnectionPolicy.new_node_schedule().next_delay(), None);
    }
}
