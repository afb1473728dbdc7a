//! Temperature escalation and attempt budget

use crate::error::ConfigError;

/// Highest temperature sent to a generator; providers accept `[0.0, 2.0)`.
pub const MAX_TEMPERATURE: f64 = 1.99;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_TEMPERATURE: f64 = 0.4;
pub const DEFAULT_TEMPERATURE_INCREMENT: f64 = 0.1;

/// Linear escalation: attempt `n` runs at `initial + increment * (n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: f64,
    increment: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(initial: f64, increment: f64, max_attempts: u32) -> Result<Self, ConfigError> {
        if !initial.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&initial) {
            return Err(ConfigError::Temperature(initial));
        }
        if !increment.is_finite() || increment < 0.0 {
            return Err(ConfigError::Increment(increment));
        }
        if max_attempts == 0 {
            return Err(ConfigError::MaxAttempts);
        }
        Ok(Self {
            initial,
            increment,
            max_attempts,
        })
    }

    pub fn initial(&self) -> f64 {
        self.initial
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Temperature for the 1-based attempt number, clamped to the valid range.
    pub fn next_temperature(&self, attempt: u32) -> f64 {
        let steps = attempt.saturating_sub(1) as f64;
        let raw = self.initial + self.increment * steps;
        // 0.4 + 0.1 * 2 is 0.6000000000000001 in binary floating point
        let rounded = (raw * 10_000.0).round() / 10_000.0;
        rounded.clamp(0.0, MAX_TEMPERATURE)
    }

    /// Whether another attempt may start after `attempts_used` attempts.
    pub fn should_continue(&self, attempts_used: u32) -> bool {
        attempts_used < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_TEMPERATURE,
            increment: DEFAULT_TEMPERATURE_INCREMENT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_escalation() {
        let policy = RetryPolicy::new(0.4, 0.1, 5).unwrap();
        assert_eq!(policy.next_temperature(1), 0.4);
        assert_eq!(policy.next_temperature(2), 0.5);
        assert_eq!(policy.next_temperature(3), 0.6);
        assert_eq!(policy.next_temperature(4), 0.7);
    }

    #[test]
    fn test_attempt_zero_uses_initial() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_temperature(0), policy.initial());
    }

    #[test]
    fn test_temperature_is_clamped() {
        let policy = RetryPolicy::new(1.5, 0.5, 10).unwrap();
        assert_eq!(policy.next_temperature(2), MAX_TEMPERATURE);
        assert_eq!(policy.next_temperature(10), MAX_TEMPERATURE);
    }

    #[test]
    fn test_should_continue_respects_budget() {
        let policy = RetryPolicy::new(0.4, 0.1, 3).unwrap();
        assert!(policy.should_continue(0));
        assert!(policy.should_continue(2));
        assert!(!policy.should_continue(3));
        assert!(!policy.should_continue(4));
    }

    #[test]
    fn test_invalid_configuration_fails_at_construction() {
        assert_eq!(
            RetryPolicy::new(-0.1, 0.1, 3),
            Err(ConfigError::Temperature(-0.1))
        );
        assert_eq!(
            RetryPolicy::new(2.0, 0.1, 3),
            Err(ConfigError::Temperature(2.0))
        );
        assert_eq!(
            RetryPolicy::new(0.4, -0.1, 3),
            Err(ConfigError::Increment(-0.1))
        );
        assert_eq!(RetryPolicy::new(0.4, 0.1, 0), Err(ConfigError::MaxAttempts));
        assert!(RetryPolicy::new(f64::NAN, 0.1, 3).is_err());
        assert!(RetryPolicy::new(0.4, f64::INFINITY, 3).is_err());
    }

    #[test]
    fn test_zero_increment_is_allowed() {
        let policy = RetryPolicy::new(0.7, 0.0, 3).unwrap();
        assert_eq!(policy.next_temperature(1), 0.7);
        assert_eq!(policy.next_temperature(3), 0.7);
    }

    #[test]
    fn test_temperatures_never_decrease() {
        let policy = RetryPolicy::new(0.2, 0.15, 20).unwrap();
        let temps: Vec<f64> = (1..=20).map(|n| policy.next_temperature(n)).collect();
        assert!(temps.windows(2).all(|w| w[0] <= w[1]));
    }
}
