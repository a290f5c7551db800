//! Coordinator: runs every declared test of a host page with bounded
//! concurrency and aggregates the outcomes.
//!
//! The coordinator keeps a sliding window of at most `concurrency` launched
//! tests. Whenever one settles (by report or by timeout) the next queued test
//! is launched right away. Skipped tests are settled without a context and
//! never take a slot.
//!
//! A test settles exactly once: either its completion message arrives, or
//! its load timeout elapses first and it fails with `Timeout`. A message
//! that shows up after the timeout is dropped.

use crate::config::HarnessConfig;
use crate::context::{ContextLaunch, ContextLauncher, TaskLauncher, TestCatalog};
use crate::harness::{Outcome, ResultBuilder, SuiteResult, TestCase, TestResult};
use crate::messages::{MessageRegistry, Subscription};
use crate::page::{HostPage, MarkerStatus};
use crate::protocol::ParentPort;
use crate::result::HarnessResult;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Failure message when a launched test never reports
pub const TIMEOUT: &str = "Timeout";

/// A launched test that resolved one way or the other
struct Settled {
    test: TestCase,
    result: TestResult,
    timed_out: bool,
}

async fn await_completion(
    test: TestCase,
    subscription: Subscription,
    launched: Instant,
    deadline: Instant,
) -> Settled {
    let (result, timed_out) = match timeout_at(deadline, subscription).await {
        Ok(Ok(message)) if message.result => (TestResult::pass(&test.name), false),
        Ok(Ok(message)) => (TestResult::fail(&test.name, message.message), false),
        Ok(Err(_)) | Err(_) => (TestResult::fail(&test.name, TIMEOUT), true),
    };
    Settled {
        result: result.with_duration(launched.elapsed()),
        test,
        timed_out,
    }
}

/// Schedules the tests of one host page
#[derive(Debug)]
pub struct Coordinator<L: ContextLauncher> {
    page: HostPage,
    launcher: L,
    config: HarnessConfig,
    peak_in_flight: usize,
}

impl Coordinator<TaskLauncher> {
    /// Coordinator that runs catalog programs as tokio tasks
    #[must_use]
    pub fn for_catalog(page: HostPage, catalog: TestCatalog, config: HarnessConfig) -> Self {
        let launcher = TaskLauncher::new(catalog)
            .with_test_timeout(config.test_timeout())
            .with_isolation(config.isolation);
        Self::new(page, launcher).with_config(config)
    }
}

impl<L: ContextLauncher> Coordinator<L> {
    /// Create a coordinator with default configuration
    #[must_use]
    pub fn new(page: HostPage, launcher: L) -> Self {
        Self {
            page,
            launcher,
            config: HarnessConfig::default(),
            peak_in_flight: 0,
        }
    }

    /// Replace the configuration
    #[must_use]
    pub const fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Host page
    #[must_use]
    pub const fn page(&self) -> &HostPage {
        &self.page
    }

    /// Context launcher
    #[must_use]
    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Most tests in flight at once during the last run
    #[must_use]
    pub const fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Run the suite and hand the result to `on_complete`
    pub async fn start(&mut self, on_complete: impl FnOnce(SuiteResult)) -> HarnessResult<()> {
        self.start_with_failures(on_complete, |_, _| {}).await
    }

    /// Like [`start`](Self::start), also calling `on_failure` with each
    /// failing result and the test's standalone URL
    pub async fn start_with_failures(
        &mut self,
        on_complete: impl FnOnce(SuiteResult),
        on_failure: impl FnMut(&TestResult, &str),
    ) -> HarnessResult<()> {
        let suite = self.run_with(on_failure).await?;
        on_complete(suite);
        Ok(())
    }

    /// Run the suite
    pub async fn run(&mut self) -> HarnessResult<SuiteResult> {
        self.run_with(|_, _| {}).await
    }

    /// Run the suite, calling `on_failure` for each failing test.
    ///
    /// Test failures are part of the returned result. An `Err` means the
    /// completion protocol was violated (or the configuration is invalid)
    /// and the run was abandoned: tests still in flight are dropped without
    /// a result, their markers stay `running`, and neither callback fires
    /// for them. Messages their contexts send afterwards go nowhere.
    pub async fn run_with(
        &mut self,
        mut on_failure: impl FnMut(&TestResult, &str),
    ) -> HarnessResult<SuiteResult> {
        self.config.validate()?;
        let run_id = Uuid::new_v4();
        self.execute(&mut on_failure)
            .instrument(info_span!("suite", %run_id))
            .await
    }

    async fn execute(
        &mut self,
        on_failure: &mut impl FnMut(&TestResult, &str),
    ) -> HarnessResult<SuiteResult> {
        let tests = self.page.discover()?;
        let mut results = ResultBuilder::new(tests.len());
        self.peak_in_flight = 0;
        info!(
            tests = tests.len(),
            concurrency = self.config.concurrency,
            "suite started"
        );

        if results.is_complete() {
            return Ok(self.finish(&results));
        }

        let (port, mut inbox) = ParentPort::channel();
        let mut registry = MessageRegistry::new();
        let mut queue: VecDeque<TestCase> = tests.into();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.config.concurrency {
                let Some(test) = queue.pop_front() else {
                    break;
                };
                if test.skip {
                    let result = TestResult::skipped(&test.name);
                    self.settle(&test, &result, on_failure);
                    if results.report(result).is_some() {
                        return Ok(self.finish(&results));
                    }
                    continue;
                }

                let subscription = registry.subscribe(test.id.clone()).map_err(|violation| {
                    error!(%violation, "protocol violation");
                    violation
                })?;
                self.page.mark(&test.id, MarkerStatus::Running);

                let launched = Instant::now();
                let deadline = launched + self.config.load_timeout();
                if let Err(e) = self
                    .launcher
                    .launch(ContextLaunch::from(&test), port.clone())
                {
                    warn!(test_id = %test.id, error = %e, "context failed to load");
                }
                debug!(test_id = %test.id, "launched");
                in_flight.push(await_completion(test, subscription, launched, deadline));
                self.peak_in_flight = self.peak_in_flight.max(in_flight.len());
            }

            if in_flight.is_empty() {
                return Ok(self.finish(&results));
            }

            tokio::select! {
                biased;
                Some(payload) = inbox.recv() => {
                    if let Err(violation) = registry.dispatch(&payload) {
                        error!(%violation, "protocol violation");
                        return Err(violation.into());
                    }
                }
                Some(settled) = in_flight.next() => {
                    if settled.timed_out {
                        registry.retire(&settled.test.id);
                        warn!(test_id = %settled.test.id, "no completion before load timeout");
                    }
                    self.settle(&settled.test, &settled.result, on_failure);
                    if results.report(settled.result).is_some() {
                        return Ok(self.finish(&results));
                    }
                }
            }
        }
    }

    fn settle(
        &self,
        test: &TestCase,
        result: &TestResult,
        on_failure: &mut impl FnMut(&TestResult, &str),
    ) {
        self.page.mark(&test.id, MarkerStatus::from(result.result));
        if result.result == Outcome::Fail {
            if !result.message.is_empty() {
                self.page.append_error(&test.id, &result.message);
            }
            on_failure(result, &test.url);
        }
        info!(
            test_id = %test.id,
            outcome = %result.result,
            duration_ms = result.duration.as_millis() as u64,
            "test settled"
        );
    }

    fn finish(&self, results: &ResultBuilder) -> SuiteResult {
        let suite = results.finish();
        info!(
            passed = suite.passed,
            failed = suite.failed,
            total = suite.total,
            duration_ms = suite.duration.as_millis() as u64,
            peak_in_flight = self.peak_in_flight,
            "suite complete"
        );
        suite
    }
}
