//! Wall-clock budget for one communication cycle.

use tracing::warn;

pub const DEFAULT_COMM_BUDGET_MS: u64 = 150_000;

#[derive(Debug, Clone, Copy)]
pub struct CommBudget {
    limit_ms: u64,
    started_at: Option<u64>,
}

impl CommBudget {
    pub fn new(limit_ms: u64) -> Self {
        Self {
            limit_ms,
            started_at: None,
        }
    }

    pub fn start(&mut self, now_ms: u64) {
        self.started_at = Some(now_ms);
    }

    /// Full budget until [`CommBudget::start`] is called
    pub fn remaining(&self, now_ms: u64) -> u64 {
        match self.started_at {
            Some(start) => self.limit_ms.saturating_sub(now_ms.saturating_sub(start)),
            None => self.limit_ms,
        }
    }

    /// `false` (and a log line naming `tag`) once the budget is spent
    pub fn ensure(&self, now_ms: u64, tag: &str) -> bool {
        if self.remaining(now_ms) > 0 {
            return true;
        }
        warn!("Communication budget exhausted at {}", tag);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unstarted_budget_is_full() {
        let budget = CommBudget::new(1000);
        assert_eq!(budget.remaining(999_999), 1000);
        assert!(budget.ensure(999_999, "idle"));
    }

    #[test]
    fn test_budget_runs_out() {
        let mut budget = CommBudget::new(1000);
        budget.start(500);
        assert_eq!(budget.remaining(1200), 300);
        assert!(budget.ensure(1499, "send"));
        assert!(!budget.ensure(1500, "send"));
        assert_eq!(budget.remaining(10_000), 0);
    }
}
