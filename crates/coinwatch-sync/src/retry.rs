use std::time::Duration;

/// Bounded retry with a wait that grows linearly with each consumed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempt budget handed to a fresh run.
    pub attempts: u32,
    /// Base wait; the n-th retry waits `timeout * n`.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            timeout: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, timeout: Duration) -> Self {
        Self { attempts, timeout }
    }

    /// Wait before retrying with `remaining` attempts left, or `None` once the budget is spent.
    pub fn wait_for(&self, remaining: u32) -> Option<Duration> {
        if remaining == 0 {
            return None;
        }
        if remaining > self.attempts {
            return Some(self.timeout);
        }
        let consumed = (self.attempts - remaining).saturating_add(1);
        Some(self.timeout.saturating_mul(consumed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_grow_linearly_then_give_up() {
        let policy = RetryPolicy::default();
        let waits: Vec<_> = (0..=4).rev().map(|n| policy.wait_for(n)).collect();
        assert_eq!(
            waits,
            vec![
                Some(Duration::from_secs(20)),
                Some(Duration::from_secs(40)),
                Some(Duration::from_secs(60)),
                Some(Duration::from_secs(80)),
                None,
            ]
        );
    }

    #[test]
    fn over_budget_attempts_use_the_base_wait() {
        let policy = RetryPolicy::new(2, Duration::from_secs(5));
        assert_eq!(policy.wait_for(7), Some(Duration::from_secs(5)));
    }

    #[test]
    fn huge_budgets_do_not_overflow() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(20));
        assert_eq!(policy.wait_for(u32::MAX), Some(Duration::from_secs(20)));
        assert_eq!(policy.wait_for(1), Some(Duration::from_secs(20 * u64::from(u32::MAX))));
    }
}
