//! Test cases, per-test results and suite aggregation.

use crate::protocol::TestId;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Name of the synthetic breakdown entry reported when nothing failed
pub const ALL_TESTS_NAME: &str = "All Tests";

/// Message of the synthetic breakdown entry reported when nothing failed
pub const ALL_TESTS_PASSED: &str = "All Tests Passed";

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// A test declared by a marker in the host page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Correlation id
    pub id: TestId,
    /// URL that loads this test on its own
    pub url: String,
    /// Display name
    pub name: String,
    /// Whether the test is skipped
    pub skip: bool,
    /// Unescaped source injected into the isolated context
    pub source: String,
}

impl TestCase {
    /// Create a test case
    #[must_use]
    pub fn new(id: impl Into<TestId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: String::new(),
            name: name.into(),
            skip: false,
            source: String::new(),
        }
    }

    /// Set the standalone URL
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the injected source
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Mark as skipped
    #[must_use]
    pub const fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }
}

/// Outcome of a single test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    /// Test passed
    Pass,
    /// Test failed
    Fail,
    /// Test was not run
    Skipped,
}

impl Outcome {
    /// Everything except `Fail` counts as a pass
    #[must_use]
    pub const fn is_pass(self) -> bool {
        !matches!(self, Self::Fail)
    }
}

impl From<bool> for Outcome {
    fn from(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of running a single test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Outcome
    pub result: Outcome,
    /// Failure message, empty unless failed
    pub message: String,
    /// Time from launch to resolution
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
}

impl TestResult {
    /// Create a passing test result
    #[must_use]
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Outcome::Pass,
            message: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Create a failing test result
    #[must_use]
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Outcome::Fail,
            message: message.into(),
            duration: Duration::ZERO,
        }
    }

    /// Create a skipped test result
    #[must_use]
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Outcome::Skipped,
            message: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Set duration
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Collapse to the boolean form used in a suite breakdown
    #[must_use]
    pub fn normalize(&self) -> BreakdownEntry {
        BreakdownEntry {
            name: self.name.clone(),
            result: self.result.is_pass(),
            message: self.message.clone(),
            duration: self.duration,
        }
    }
}

/// One entry of a suite breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakdownEntry {
    /// Test name
    pub name: String,
    /// Whether it passed
    pub result: bool,
    /// Message
    pub message: String,
    /// Duration
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
}

impl BreakdownEntry {
    /// The synthetic entry standing in for a fully passing suite
    #[must_use]
    pub fn all_passed(duration: Duration) -> Self {
        Self {
            name: ALL_TESTS_NAME.to_string(),
            result: true,
            message: ALL_TESTS_PASSED.to_string(),
            duration,
        }
    }
}

/// Aggregate result of a suite run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteResult {
    /// Tests that did not fail (skips included)
    pub passed: usize,
    /// Tests that failed
    pub failed: usize,
    /// `passed + failed`
    pub total: usize,
    /// Wall clock since scheduling began
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
    /// Failing tests, or a single synthetic success entry
    pub tests: Vec<BreakdownEntry>,
}

impl SuiteResult {
    /// Summary of a single test run outside a suite
    #[must_use]
    pub fn single(name: &str, result: bool, message: &str, duration: Duration) -> Self {
        Self {
            passed: usize::from(result),
            failed: usize::from(!result),
            total: 1,
            duration,
            tests: vec![BreakdownEntry {
                name: name.to_string(),
                result,
                message: message.to_string(),
                duration,
            }],
        }
    }

    /// Check if no test failed
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Serialize for downstream consumers
    pub fn to_json(&self) -> crate::result::HarnessResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for SuiteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} passed, {} failed, {} total in {}ms",
            self.passed,
            self.failed,
            self.total,
            self.duration.as_millis()
        )?;
        for entry in self.tests.iter().filter(|t| !t.result) {
            writeln!(f, "  FAIL {}: {}", entry.name, entry.message)?;
        }
        Ok(())
    }
}

/// Accumulates results until the expected count is reached
#[derive(Debug)]
pub struct ResultBuilder {
    created: Instant,
    expected: usize,
    passed: usize,
    failed: usize,
    tests: Vec<TestResult>,
}

impl ResultBuilder {
    /// Start accumulating for `expected` tests; the suite clock starts now
    #[must_use]
    pub fn new(expected: usize) -> Self {
        Self {
            created: Instant::now(),
            expected,
            passed: 0,
            failed: 0,
            tests: Vec::new(),
        }
    }

    /// Add a result; returns the suite result once every test has reported
    pub fn report(&mut self, result: TestResult) -> Option<SuiteResult> {
        if result.result.is_pass() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.tests.push(result);

        if self.is_complete() {
            Some(self.finish())
        } else {
            None
        }
    }

    /// Whether every expected test has reported
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.passed + self.failed == self.expected
    }

    /// Number of results recorded so far
    #[must_use]
    pub fn reported(&self) -> usize {
        self.tests.len()
    }

    /// Build the suite result from what has been recorded
    #[must_use]
    pub fn finish(&self) -> SuiteResult {
        let duration = self.created.elapsed();
        SuiteResult {
            passed: self.passed,
            failed: self.failed,
            total: self.passed + self.failed,
            duration,
            tests: self.breakdown(duration),
        }
    }

    fn breakdown(&self, duration: Duration) -> Vec<BreakdownEntry> {
        let failures: Vec<BreakdownEntry> = self
            .tests
            .iter()
            .filter(|t| t.result == Outcome::Fail)
            .map(TestResult::normalize)
            .collect();

        if failures.is_empty() {
            vec![BreakdownEntry::all_passed(duration)]
        } else {
            failures
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counts_skip_as_pass() {
        assert!(Outcome::Pass.is_pass());
        assert!(Outcome::Skipped.is_pass());
        assert!(!Outcome::Fail.is_pass());
        assert_eq!(Outcome::from(false), Outcome::Fail);
    }

    #[test]
    fn test_builder_completes_on_last_report() {
        let mut builder = ResultBuilder::new(2);
        assert!(builder.report(TestResult::pass("a")).is_none());
        let suite = builder.report(TestResult::skipped("b")).unwrap();
        assert_eq!(suite.passed, 2);
        assert_eq!(suite.failed, 0);
        assert_eq!(suite.total, 2);
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].name, ALL_TESTS_NAME);
        assert_eq!(suite.tests[0].message, ALL_TESTS_PASSED);
        assert!(suite.tests[0].result);
    }

    #[test]
    fn test_breakdown_only_failures() {
        let mut builder = ResultBuilder::new(3);
        builder.report(TestResult::pass("a"));
        builder.report(TestResult::skipped("s"));
        let suite = builder
            .report(TestResult::fail("b", "expected 1 got 2"))
            .unwrap();
        assert_eq!(suite.failed, 1);
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].name, "b");
        assert!(!suite.tests[0].result);
        assert_eq!(suite.tests[0].message, "expected 1 got 2");
        assert!(!suite.all_passed());
    }

    #[test]
    fn test_empty_suite() {
        let builder = ResultBuilder::new(0);
        assert!(builder.is_complete());
        let suite = builder.finish();
        assert_eq!(suite.total, 0);
        assert_eq!(suite.tests.len(), 1);
        assert!(suite.tests[0].result);
    }

    #[test]
    fn test_single_summary() {
        let suite = SuiteResult::single("nav", false, "boom", Duration::from_millis(12));
        assert_eq!((suite.passed, suite.failed, suite.total), (0, 1, 1));
        assert_eq!(suite.tests[0].message, "boom");
    }

    #[test]
    fn test_json_durations_are_millis() {
        let suite = SuiteResult::single("nav", true, "Passed", Duration::from_millis(1500));
        let value: serde_json::Value = serde_json::from_str(&suite.to_json().unwrap()).unwrap();
        assert_eq!(value["duration"], 1500);
        assert_eq!(value["tests"][0]["duration"], 1500);
        assert_eq!(value["tests"][0]["result"], true);
    }

    #[test]
    fn test_display_lists_failures() {
        let mut builder = ResultBuilder::new(1);
        let suite = builder.report(TestResult::fail("nav", "Timeout")).unwrap();
        let text = suite.to_string();
        assert!(text.contains("0 passed, 1 failed, 1 total"));
        assert!(text.contains("FAIL nav: Timeout"));
    }
}
