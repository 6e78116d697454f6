//! Exit code policy
//!
//! Maps a run aggregate to the process exit code.

use serde::Serialize;

/// Combined counters for one run plus the derived exit code
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAggregate {
    pub success: u32,
    pub failed: u32,
    pub error: bool,
    pub disconnected: bool,
    pub exit_code: i32,
}

impl RunAggregate {
    pub fn executed(&self) -> u32 {
        self.success + self.failed
    }
}

/// Pass/fail flags that decide the exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitCodePolicy {
    pub fail_on_empty_test_suite: bool,
    pub fail_on_failing_test_suite: bool,
}

impl ExitCodePolicy {
    pub fn new(fail_on_empty_test_suite: bool, fail_on_failing_test_suite: bool) -> Self {
        Self {
            fail_on_empty_test_suite,
            fail_on_failing_test_suite,
        }
    }

    /// First matching rule wins. An infrastructure disconnect beats an
    /// accepted empty suite, and an infrastructure error beats ignoring
    /// failing tests.
    pub fn exit_code(&self, aggregate: &RunAggregate, single_run_not_captured: bool) -> i32 {
        if aggregate.disconnected || single_run_not_captured {
            1
        } else if aggregate.executed() == 0 && !self.fail_on_empty_test_suite {
            0
        } else if aggregate.error {
            1
        } else if !self.fail_on_failing_test_suite {
            0
        } else if aggregate.failed > 0 {
            1
        } else {
            0
        }
    }
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(success: u32, failed: u32, error: bool, disconnected: bool) -> RunAggregate {
        RunAggregate {
            success,
            failed,
            error,
            disconnected,
            exit_code: 0,
        }
    }

    #[test]
    fn test_disconnect_always_fails() {
        for empty in [true, false] {
            for failing in [true, false] {
                let policy = ExitCodePolicy::new(empty, failing);
                assert_eq!(policy.exit_code(&aggregate(0, 0, false, true), false), 1);
                assert_eq!(policy.exit_code(&aggregate(5, 0, false, true), false), 1);
            }
        }
    }

    #[test]
    fn test_not_captured_fails() {
        let policy = ExitCodePolicy::new(false, false);
        assert_eq!(policy.exit_code(&aggregate(0, 0, false, false), true), 1);
    }

    #[test]
    fn test_empty_suite_allowed() {
        let policy = ExitCodePolicy::new(false, true);
        assert_eq!(policy.exit_code(&aggregate(0, 0, false, false), false), 0);
        // Empty-suite acceptance is checked before the error flag
        assert_eq!(policy.exit_code(&aggregate(0, 0, true, false), false), 0);
    }

    #[test]
    fn test_strict_empty_suite_falls_through_to_error_flag() {
        // An empty suite only fails when the worker reported it as an error
        let policy = ExitCodePolicy::new(true, true);
        assert_eq!(policy.exit_code(&aggregate(0, 0, false, false), false), 0);
        assert_eq!(policy.exit_code(&aggregate(0, 0, true, false), false), 1);
    }

    #[test]
    fn test_error_beats_ignored_failures() {
        let policy = ExitCodePolicy::new(true, false);
        assert_eq!(policy.exit_code(&aggregate(5, 0, true, false), false), 1);
    }

    #[test]
    fn test_failing_suite_flag() {
        let lenient = ExitCodePolicy::new(true, false);
        let strict = ExitCodePolicy::new(true, true);
        assert_eq!(lenient.exit_code(&aggregate(5, 2, false, false), false), 0);
        assert_eq!(strict.exit_code(&aggregate(5, 2, false, false), false), 1);
    }

    #[test]
    fn test_all_passing() {
        let policy = ExitCodePolicy::default();
        assert_eq!(policy.exit_code(&aggregate(5, 0, false, false), false), 0);
    }
}
