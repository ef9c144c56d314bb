use std::time::{Duration, Instant};

/// Time left in a [`TimeoutBudget`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// No deadline was set
    Unbounded,
    /// The deadline has been reached
    Expired,
    Left(Duration),
}

/// An optional deadline shared by every blocking step of one operation
#[derive(Debug, Clone, Copy)]
pub struct TimeoutBudget {
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl TimeoutBudget {
    /// A timeout too large to represent as an instant has no deadline
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            timeout,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// The duration originally granted, for error reporting
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn remaining(&self) -> Remaining {
        match self.deadline {
            None => Remaining::Unbounded,
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Remaining::Left(left),
                _ => Remaining::Expired,
            },
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Remaining::Expired
    }

    /// Remaining time in whole milliseconds for native waits.
    ///
    /// `None` means wait forever. Partial milliseconds round up so a wait
    /// never returns just before the deadline and spins.
    pub fn remaining_millis(&self) -> Option<u64> {
        match self.remaining() {
            Remaining::Unbounded => None,
            Remaining::Expired => Some(0),
            Remaining::Left(left) => Some(left.as_micros().div_ceil(1000) as u64),
        }
    }

    /// What is left as a timeout for a nested wait; `None` means unbounded
    pub fn remaining_timeout(&self) -> Option<Duration> {
        match self.remaining() {
            Remaining::Unbounded => None,
            Remaining::Expired => Some(Duration::ZERO),
            Remaining::Left(left) => Some(left),
        }
    }

    /// Remaining time capped by `slice`, for loops that must wake up periodically
    pub fn remaining_capped(&self, slice: Duration) -> Duration {
        match self.remaining() {
            Remaining::Unbounded => slice,
            Remaining::Expired => Duration::ZERO,
            Remaining::Left(left) => left.min(slice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_budget() {
        let budget = TimeoutBudget::unbounded();
        assert_eq!(budget.remaining(), Remaining::Unbounded);
        assert_eq!(budget.remaining_millis(), None);
        assert!(!budget.is_expired());
        assert_eq!(
            budget.remaining_capped(Duration::from_millis(50)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_zero_budget_is_expired_immediately() {
        let budget = TimeoutBudget::new(Some(Duration::ZERO));
        assert_eq!(budget.remaining(), Remaining::Expired);
        assert_eq!(budget.remaining_millis(), Some(0));
        assert_eq!(budget.remaining_timeout(), Some(Duration::ZERO));
        assert_eq!(budget.timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_budget_counts_down() {
        let budget = TimeoutBudget::new(Some(Duration::from_secs(60)));
        match budget.remaining() {
            Remaining::Left(left) => assert!(left <= Duration::from_secs(60)),
            other => panic!("unexpected {other:?}"),
        }
        let millis = budget.remaining_millis().unwrap();
        assert!(millis > 59_000 && millis <= 60_000);
        assert_eq!(
            budget.remaining_capped(Duration::from_millis(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_budget_expires() {
        let budget = TimeoutBudget::new(Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(budget.is_expired());
        assert_eq!(budget.remaining_capped(Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_huge_timeout_is_unbounded() {
        let budget = TimeoutBudget::new(Some(Duration::MAX));
        assert_eq!(budget.remaining(), Remaining::Unbounded);
        assert_eq!(budget.remaining_timeout(), None);
        assert_eq!(budget.timeout(), Some(Duration::MAX));
    }
}
