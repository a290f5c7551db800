//! Worker runtime: runs one test inside an isolated context.
//!
//! The runtime wires the test's setup and logic against the context's
//! document, latches the first completion, and reports on the following
//! scheduler turn so that errors raised right after completion still count.
//!
//! ## Completion rules
//!
//! - The first signal latches `(result, message)` and schedules the report.
//! - Any later signal before the report forces a failure. Its message is
//!   `'done' called multiple times` when the later signal was a success,
//!   otherwise its own message.
//! - After the report, signals are ignored.

use crate::context::IsolatedContext;
use crate::dom::Doc;
use crate::harness::SuiteResult;
use crate::protocol::{ParentPort, TestId, WireMessage};
use crate::result::HarnessResult;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::{poll_fn, Future};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::task::Poll;
use std::thread;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Time a test has to complete once its worker starts
pub const WORKER_TIMEOUT: Duration = Duration::from_millis(500);

/// Message carried by a passing completion
pub const PASSED: &str = "Passed";

/// Message of a worker-side timeout
pub const TEST_TIMEOUT: &str = "Test Timeout";

/// Message when a test signals success after already completing
pub const MULTIPLE_DONE: &str = "'done' called multiple times";

/// Outcome latched by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Whether the test passed
    pub result: bool,
    /// Message sent with the result
    pub message: String,
}

impl Completion {
    /// Create a completion record
    #[must_use]
    pub fn new(result: bool, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
        }
    }
}

/// Lifecycle of a worker's completion record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerState {
    /// Created, user code not started
    #[default]
    Pending,
    /// User code running, nothing latched
    Running,
    /// Outcome latched, report not yet sent
    Latched(Completion),
    /// Report sent (terminal)
    Reported(Completion),
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Latched(_) => write!(f, "Latched"),
            Self::Reported(_) => write!(f, "Reported"),
        }
    }
}

/// Effect of a completion signal on the latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// First signal; the report is now scheduled
    FirstLatch,
    /// Replaced an existing record with a failure
    Overwritten,
    /// Arrived after the report; no effect
    Ignored,
}

/// The single-resolution completion record of one test execution
#[derive(Debug, Default)]
pub struct CompletionLatch {
    state: WorkerState,
}

impl CompletionLatch {
    /// Create an unset latch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Mark user code as started
    pub fn start(&mut self) {
        if self.state == WorkerState::Pending {
            self.state = WorkerState::Running;
        }
    }

    /// Apply a completion signal
    pub fn signal(&mut self, result: bool, message: &str) -> Signal {
        match &mut self.state {
            WorkerState::Reported(_) => return Signal::Ignored,
            WorkerState::Latched(record) => {
                record.result = false;
                record.message = if result {
                    MULTIPLE_DONE.to_string()
                } else {
                    message.to_string()
                };
                return Signal::Overwritten;
            }
            WorkerState::Pending | WorkerState::Running => {}
        }
        self.state = WorkerState::Latched(Completion::new(result, message));
        Signal::FirstLatch
    }

    /// Move `Latched` to `Reported`, returning the record to send
    pub fn take_report(&mut self) -> Option<Completion> {
        let WorkerState::Latched(record) = &self.state else {
            return None;
        };
        let record = record.clone();
        self.state = WorkerState::Reported(record.clone());
        Some(record)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test code panicked".to_string()
    }
}

/// User-code polls in progress on spawned test work
#[derive(Debug, Default)]
struct Activity {
    busy: AtomicUsize,
    idle: Notify,
}

struct Busy<'a>(&'a Activity);

impl Activity {
    fn enter(&self) -> Busy<'_> {
        self.busy.fetch_add(1, Ordering::SeqCst);
        Busy(self)
    }

    /// Resolve once no spawned work is mid-poll
    async fn quiesce(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.busy.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        if self.0.busy.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

thread_local! {
    static PANIC_SINK: RefCell<Option<Done>> = const { RefCell::new(None) };
}

/// Install (once) a panic hook that fails the test owning the current
/// thread, falling back to the previous hook everywhere else.
fn route_panics_to_contexts() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let sink = PANIC_SINK
                .try_with(|sink| sink.try_borrow().ok().and_then(|done| (*done).clone()))
                .ok()
                .flatten();
            match sink {
                Some(done) => done.uncaught_error(panic_message(info.payload())),
                None => previous(info),
            }
        }));
    });
}

/// Completion handle passed to test logic.
///
/// Cloneable so that callbacks and spawned tasks can complete the test
/// later. All clones share the context's latch.
#[derive(Clone, Default)]
pub struct Done {
    latch: Arc<Mutex<CompletionLatch>>,
    latched: Arc<Notify>,
    activity: Arc<Activity>,
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done").field("state", &self.state()).finish()
    }
}

impl Done {
    /// Create a handle over a fresh latch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CompletionLatch> {
        self.latch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal success
    pub fn pass(&self) {
        self.signal(true, PASSED);
    }

    /// Signal failure with a message
    pub fn fail(&self, message: impl Into<String>) {
        self.signal(false, &message.into());
    }

    /// Report an uncaught error; same latch rule as a failing completion
    pub fn uncaught_error(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(%message, "uncaught error in test code");
        self.signal(false, &message);
    }

    /// Apply a raw completion signal
    pub fn signal(&self, result: bool, message: &str) -> Signal {
        let signal = self.lock().signal(result, message);
        match signal {
            Signal::FirstLatch => self.latched.notify_one(),
            Signal::Overwritten => debug!(result, message, "completion overwritten"),
            Signal::Ignored => debug!(result, message, "completion after report ignored"),
        }
        signal
    }

    /// Current latch state
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.lock().state().clone()
    }

    /// Run async test work; an `Err` or panic counts as an uncaught error.
    ///
    /// The report never goes out while a poll of this work is still
    /// running, so code after a completion call in the same poll can still
    /// overwrite the outcome.
    pub fn spawn<F>(&self, work: F)
    where
        F: Future<Output = HarnessResult<()>> + Send + 'static,
    {
        let done = self.clone();
        let mut work = Box::pin(work);
        tokio::spawn(poll_fn(move |cx| {
            let _busy = done.activity.enter();
            match catch_unwind(AssertUnwindSafe(|| work.as_mut().poll(cx))) {
                Ok(Poll::Pending) => return Poll::Pending,
                Ok(Poll::Ready(Ok(()))) => {}
                Ok(Poll::Ready(Err(e))) => done.uncaught_error(e.to_string()),
                Err(payload) => done.uncaught_error(panic_message(payload.as_ref())),
            }
            Poll::Ready(())
        }));
    }

    fn start(&self) {
        self.lock().start();
    }

    async fn first_latch(&self) {
        self.latched.notified().await;
    }

    async fn quiesce(&self) {
        self.activity.quiesce().await;
    }

    fn take_report(&self) -> Option<Completion> {
        self.lock().take_report()
    }
}

/// Setup hook: prepares the document before the logic runs
pub type SetupFn = dyn Fn(&Doc) -> HarnessResult<()> + Send + Sync;

/// Test logic: receives the completion handle and the document
pub type LogicFn = dyn Fn(Done, Doc) -> HarnessResult<()> + Send + Sync;

/// The user code of one test
#[derive(Clone)]
pub struct TestProgram {
    setup: Option<Arc<SetupFn>>,
    logic: Arc<LogicFn>,
}

impl fmt::Debug for TestProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestProgram")
            .field("has_setup", &self.setup.is_some())
            .finish_non_exhaustive()
    }
}

impl TestProgram {
    /// Create a program from its logic
    #[must_use]
    pub fn new(logic: impl Fn(Done, Doc) -> HarnessResult<()> + Send + Sync + 'static) -> Self {
        Self {
            setup: None,
            logic: Arc::new(logic),
        }
    }

    /// Add a setup hook
    #[must_use]
    pub fn with_setup(
        mut self,
        setup: impl Fn(&Doc) -> HarnessResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    fn invoke(&self, done: &Done, doc: &Doc) -> HarnessResult<()> {
        if let Some(setup) = &self.setup {
            setup(doc)?;
        }
        (self.logic)(done.clone(), doc.clone())
    }
}

/// Runs a [`TestProgram`] inside an [`IsolatedContext`]
#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    name: String,
    id: Option<TestId>,
    timeout: Duration,
    program: TestProgram,
}

impl WorkerRuntime {
    /// Create a runtime for a named test
    #[must_use]
    pub fn new(name: impl Into<String>, program: TestProgram) -> Self {
        Self {
            name: name.into(),
            id: None,
            timeout: WORKER_TIMEOUT,
            program,
        }
    }

    /// Set the test id; without one it is read from the context location
    #[must_use]
    pub fn with_id(mut self, id: TestId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the execution timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute the test on the current runtime and report its outcome to
    /// `parent` exactly once
    pub async fn run(self, context: &IsolatedContext, parent: &ParentPort) -> Completion {
        self.execute(context, parent, Done::new()).await
    }

    /// Execute the test on a dedicated thread with its own single-threaded
    /// runtime.
    ///
    /// Every task the test starts, including plain `tokio::spawn`, lives on
    /// that runtime, and a panic in any of them fails the test with the
    /// panic text. Timers follow the wall clock of the new runtime.
    pub fn spawn_isolated(
        self,
        context: IsolatedContext,
        parent: ParentPort,
    ) -> HarnessResult<thread::JoinHandle<Completion>> {
        route_panics_to_contexts();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let handle = thread::Builder::new()
            .name(format!("domtest-{}", self.name))
            .spawn(move || {
                let done = Done::new();
                PANIC_SINK.with(|sink| *sink.borrow_mut() = Some(done.clone()));
                let completion = runtime.block_on(self.execute(&context, &parent, done));
                PANIC_SINK.with(|sink| *sink.borrow_mut() = None);
                completion
            })?;
        Ok(handle)
    }

    async fn execute(
        self,
        context: &IsolatedContext,
        parent: &ParentPort,
        done: Done,
    ) -> Completion {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let id = self
            .id
            .clone()
            .or_else(|| TestId::from_location(context.location()));
        let doc = context.doc().clone();

        done.start();
        debug!(test = %self.name, "worker running");

        match catch_unwind(AssertUnwindSafe(|| self.program.invoke(&done, &doc))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => done.uncaught_error(e.to_string()),
            Err(payload) => done.uncaught_error(panic_message(payload.as_ref())),
        }

        tokio::select! {
            biased;
            () = done.first_latch() => {}
            () = tokio::time::sleep_until(deadline) => {
                done.signal(false, TEST_TIMEOUT);
            }
        }

        // Report once the latching code has returned, on the next turn, so
        // errors raised right after the first completion still overwrite it.
        done.quiesce().await;
        tokio::task::yield_now().await;
        let completion = done
            .take_report()
            .unwrap_or_else(|| Completion::new(false, TEST_TIMEOUT));

        self.report(&completion, id, context, parent, started);
        completion
    }

    fn report(
        &self,
        completion: &Completion,
        id: Option<TestId>,
        context: &IsolatedContext,
        parent: &ParentPort,
        started: Instant,
    ) {
        let duration = started.elapsed();
        context.doc().with_mut(|doc| {
            let body = doc.body();
            if completion.result {
                doc.add_class(body, "success");
            } else {
                let panel = doc.create_element("div");
                doc.add_class(panel, "failure");
                doc.set_text(panel, &completion.message);
                doc.prepend_child(body, panel);
            }
        });

        context.store_results(SuiteResult::single(
            &self.name,
            completion.result,
            &completion.message,
            duration,
        ));

        match WireMessage::new(completion.result, id.clone(), completion.message.clone()).encode() {
            Ok(payload) => {
                if !parent.post_message(payload) {
                    debug!(test = %self.name, "parent gone, report dropped");
                }
            }
            Err(e) => error!(test = %self.name, error = %e, "failed to encode report"),
        }

        info!(
            test = %self.name,
            test_id = id.as_ref().map_or("", TestId::as_str),
            outcome = if completion.result { "pass" } else { "fail" },
            duration_ms = duration.as_millis() as u64,
            "worker reported"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dom::Document;
    use crate::result::HarnessError;

    // =========================================================================
    // Latch
    // =========================================================================

    #[test]
    fn test_latch_first_signal_wins_slot() {
        let mut latch = CompletionLatch::new();
        latch.start();
        assert_eq!(latch.state(), &WorkerState::Running);
        assert_eq!(latch.signal(true, "ok"), Signal::FirstLatch);
        assert_eq!(
            latch.state(),
            &WorkerState::Latched(Completion::new(true, "ok"))
        );
    }

    #[test]
    fn test_second_success_forces_failure() {
        let mut latch = CompletionLatch::new();
        latch.signal(true, "ok");
        assert_eq!(latch.signal(true, "ok"), Signal::Overwritten);
        assert_eq!(
            latch.take_report(),
            Some(Completion::new(false, MULTIPLE_DONE))
        );
    }

    #[test]
    fn test_second_failure_keeps_its_message() {
        let mut latch = CompletionLatch::new();
        latch.signal(true, "ok");
        latch.signal(false, "boom");
        assert_eq!(latch.take_report(), Some(Completion::new(false, "boom")));
    }

    #[test]
    fn test_reported_is_terminal() {
        let mut latch = CompletionLatch::new();
        assert!(latch.take_report().is_none());
        latch.signal(false, "x");
        assert!(latch.take_report().is_some());
        assert_eq!(latch.signal(true, "late"), Signal::Ignored);
        assert!(latch.take_report().is_none());
        assert_eq!(latch.state().to_string(), "Reported");
    }

    // =========================================================================
    // Runtime
    // =========================================================================

    fn context() -> IsolatedContext {
        IsolatedContext::new(
            "tests/nav.html?nav",
            Document::parse(r#"<button id="go">Go</button>"#).unwrap(),
        )
    }

    async fn run(program: TestProgram) -> (Completion, WireMessage, IsolatedContext) {
        let context = context();
        let (port, mut inbox) = ParentPort::channel();
        let completion = WorkerRuntime::new("nav", program)
            .run(&context, &port)
            .await;
        let message = WireMessage::decode(&inbox.recv().await.unwrap()).unwrap();
        assert!(inbox.try_recv().is_none());
        (completion, message, context)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_reports_passed() {
        let (completion, message, context) = run(TestProgram::new(|done, doc| {
            doc.by_id("go")?.click()?;
            done.pass();
            Ok(())
        }))
        .await;

        assert_eq!(completion, Completion::new(true, PASSED));
        assert!(message.result);
        assert_eq!(message.message, PASSED);
        assert_eq!(message.id, Some(TestId::from("nav")));
        assert!(context.doc().body().has_class("success").unwrap());

        let summary = context.test_results().unwrap();
        assert_eq!((summary.passed, summary.failed, summary.total), (1, 0, 1));
        assert_eq!(summary.tests[0].name, "nav");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_done_overrides() {
        let (completion, ..) = run(TestProgram::new(|done, _| {
            done.pass();
            Err(HarnessError::assertion("late assertion"))
        }))
        .await;
        assert_eq!(completion, Completion::new(false, "late assertion"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_done() {
        let (completion, message, context) = run(TestProgram::new(|done, _| {
            done.pass();
            done.pass();
            Ok(())
        }))
        .await;
        assert_eq!(completion, Completion::new(false, MULTIPLE_DONE));
        assert!(!message.result);

        let panel = context.doc().query("div.failure").unwrap().one().unwrap();
        assert_eq!(panel.text(), MULTIPLE_DONE);
        let first = context
            .doc()
            .with(|d| d.children(d.body()).first().copied());
        assert_eq!(first, Some(panel.node()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_exactly_500ms() {
        let start = Instant::now();
        let (completion, ..) = run(TestProgram::new(|_, _| Ok(()))).await;
        assert_eq!(completion, Completion::new(false, TEST_TIMEOUT));
        assert_eq!(start.elapsed(), WORKER_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_work_completes_later() {
        let start = Instant::now();
        let (completion, ..) = run(TestProgram::new(|done, _| {
            let later = done.clone();
            done.spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                later.pass();
                Ok(())
            });
            Ok(())
        }))
        .await;
        assert_eq!(completion, Completion::new(true, PASSED));
        assert_eq!(start.elapsed(), Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_panic_is_uncaught_error() {
        let (completion, ..) = run(TestProgram::new(|done, _| {
            done.spawn(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let ready: Option<u32> = None;
                assert!(ready.is_some(), "kaboom");
                Ok(())
            });
            Ok(())
        }))
        .await;
        assert_eq!(completion, Completion::new(false, "kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_error_fails_before_logic() {
        let (completion, ..) = run(TestProgram::new(|done, _| {
            done.pass();
            Ok(())
        })
        .with_setup(|doc| doc.by_id("missing").map(|_| ())))
        .await;
        assert_eq!(
            completion,
            Completion::new(false, "Could not find element with id missing")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_id_wins_over_location() {
        let context = context();
        let (port, mut inbox) = ParentPort::channel();
        WorkerRuntime::new("nav", TestProgram::new(|done, _| {
            done.fail("nope");
            Ok(())
        }))
        .with_id(TestId::from(9_u64))
        .run(&context, &port)
        .await;
        let message = WireMessage::decode(&inbox.recv().await.unwrap()).unwrap();
        assert_eq!(message.id, Some(TestId::from("9")));
        assert_eq!(message.message, "nope");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_error_after_spawned_done_overrides_on_multi_thread() {
        for _ in 0..10 {
            let (completion, ..) = run(TestProgram::new(|done, _| {
                let later = done.clone();
                done.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    later.pass();
                    // Synchronous cleanup still running on this worker thread.
                    std::thread::sleep(Duration::from_millis(20));
                    Err(HarnessError::assertion("cleanup failed"))
                });
                Ok(())
            }))
            .await;
            assert_eq!(completion, Completion::new(false, "cleanup failed"));
        }
    }

    // =========================================================================
    // Dedicated thread
    // =========================================================================

    #[tokio::test]
    async fn test_isolated_stray_task_panic_fails_test() {
        let context = context();
        let (port, mut inbox) = ParentPort::channel();
        let program = TestProgram::new(|_, _| {
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let ready: Option<u32> = None;
                assert!(ready.is_some(), "kaboom");
            });
            Ok(())
        });

        WorkerRuntime::new("nav", program)
            .spawn_isolated(context.clone(), port)
            .unwrap();

        let message = WireMessage::decode(&inbox.recv().await.unwrap()).unwrap();
        assert!(!message.result);
        assert_eq!(message.message, "kaboom");
        assert_eq!(message.id, Some(TestId::from("nav")));
        let panel = context.doc().query("div.failure").unwrap().one().unwrap();
        assert_eq!(panel.text(), "kaboom");
    }

    #[test]
    fn test_isolated_join_returns_completion() {
        let (port, _inbox) = ParentPort::channel();
        let handle = WorkerRuntime::new("nav", TestProgram::new(|done, doc| {
            doc.by_id("go")?.click()?;
            done.pass();
            Ok(())
        }))
        .spawn_isolated(context(), port)
        .unwrap();
        assert_eq!(handle.join().unwrap(), Completion::new(true, PASSED));
    }
}
