//! Bounded polling of hardware status.
//!
//! The probe talks to targets that may be unpowered, held in reset or wedged. Every loop that
//! waits for the hardware to acknowledge something is therefore bounded by an attempt budget,
//! and running out of budget is reported as a [`Timeout`] instead of spinning forever.

use serde::{Deserialize, Serialize};

/// A poll did not observe the expected condition within its budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Timed out waiting for {operation} after {attempts} attempts")]
pub struct Timeout {
    /// What was being waited for.
    pub operation: &'static str,
    /// How many times the condition was checked.
    pub attempts: u32,
}

/// Attempt budgets for the polling loops of the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollBudgets {
    /// Checks of CTRL/STAT while waiting for the debug and system power-up acknowledge.
    pub power_up: u32,
    /// Checks of the restart status after a resume request.
    pub resume: u32,
    /// Checks of the start core while waiting for it to hit the start breakpoint.
    pub start_breakpoint: u32,
    /// Checks of the FPGA sequencer status register.
    pub sequencer_status: u32,
}

impl Default for PollBudgets {
    fn default() -> Self {
        Self {
            power_up: 1_000,
            resume: 1_000,
            start_breakpoint: 10_000_000,
            sequencer_status: 100_000,
        }
    }
}

/// Calls `check` until it yields a value, at most `budget` times.
///
/// `check` returns `Ok(Some(_))` once the awaited condition holds and `Ok(None)` while it does
/// not. Errors from `check` end the poll immediately.
pub fn poll_until<T, E>(
    operation: &'static str,
    budget: u32,
    mut check: impl FnMut() -> Result<Option<T>, E>,
) -> Result<T, E>
where
    E: From<Timeout>,
{
    for attempt in 0..budget {
        if let Some(value) = check()? {
            if attempt > 0 {
                tracing::trace!(operation, attempt, "poll succeeded");
            }
            return Ok(value);
        }
    }

    tracing::warn!(operation, budget, "poll budget exhausted");

    Err(Timeout {
        operation,
        attempts: budget,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Timeout(Timeout),
        Link,
    }

    impl From<Timeout> for TestError {
        fn from(t: Timeout) -> Self {
            TestError::Timeout(t)
        }
    }

    #[test]
    fn returns_first_ready_value() {
        let mut calls = 0;
        let result: Result<u32, TestError> = poll_until("ready", 10, || {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        });

        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausted_budget_is_a_timeout() {
        let mut calls = 0;
        let result: Result<(), TestError> = poll_until("never", 5, || {
            calls += 1;
            Ok(None)
        });

        assert_eq!(
            result,
            Err(TestError::Timeout(Timeout {
                operation: "never",
                attempts: 5
            }))
        );
        assert_eq!(calls, 5);
    }

    #[test]
    fn check_errors_end_the_poll() {
        let mut calls = 0;
        let result: Result<(), TestError> = poll_until("broken", 5, || {
            calls += 1;
            Err(TestError::Link)
        });

        assert_eq!(result, Err(TestError::Link));
        assert_eq!(calls, 1);
    }
}
