//! Isolated execution contexts and the launcher seam used by the coordinator.
//!
//! Every test runs in its own [`IsolatedContext`]: a private document built
//! from the test's source plus a slot for the single-test summary. Contexts
//! share no memory with the coordinator; a launched worker only holds a
//! [`ParentPort`] to post its completion message.

use crate::config::Isolation;
use crate::dom::{Doc, Document};
use crate::harness::{SuiteResult, TestCase};
use crate::protocol::{ParentPort, TestId};
use crate::result::{HarnessError, HarnessResult};
use crate::worker::{TestProgram, WorkerRuntime, WORKER_TIMEOUT};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Everything needed to create a context for one test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextLaunch {
    /// Test id
    pub id: TestId,
    /// Display name
    pub name: String,
    /// Standalone URL, used as the context location
    pub url: String,
    /// Markup the context document is built from
    pub source: String,
}

impl From<&TestCase> for ContextLaunch {
    fn from(test: &TestCase) -> Self {
        Self {
            id: test.id.clone(),
            name: test.name.clone(),
            url: test.url.clone(),
            source: test.source.clone(),
        }
    }
}

/// Creates isolated contexts on behalf of the coordinator.
///
/// A launcher must return promptly; the test itself runs asynchronously and
/// reports through `parent`. An `Err` means the context never came up and
/// the coordinator will time the test out.
pub trait ContextLauncher: Send {
    /// Create a context for `launch` and start its worker
    fn launch(&mut self, launch: ContextLaunch, parent: ParentPort) -> HarnessResult<()>;
}

/// The document and summary slot of a single test execution
#[derive(Debug, Clone)]
pub struct IsolatedContext {
    location: String,
    doc: Doc,
    results: Arc<Mutex<Option<SuiteResult>>>,
}

impl IsolatedContext {
    /// Create a context at `location` over `document`
    #[must_use]
    pub fn new(location: impl Into<String>, document: Document) -> Self {
        Self {
            location: location.into(),
            doc: Doc::new(document),
            results: Arc::new(Mutex::new(None)),
        }
    }

    /// Create a context by parsing `markup`
    pub fn from_markup(location: impl Into<String>, markup: &str) -> HarnessResult<Self> {
        Ok(Self::new(location, Document::parse(markup)?))
    }

    /// Location the context was loaded from
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The context's document
    #[must_use]
    pub const fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Summary stored by the worker once it reported
    #[must_use]
    pub fn test_results(&self) -> Option<SuiteResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn store_results(&self, results: SuiteResult) {
        *self.results.lock().unwrap_or_else(PoisonError::into_inner) = Some(results);
    }
}

/// Test programs keyed by test id
#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    programs: HashMap<TestId, TestProgram>,
}

impl TestCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program
    #[must_use]
    pub fn with_test(mut self, id: impl Into<TestId>, program: TestProgram) -> Self {
        self.insert(id, program);
        self
    }

    /// Register a program, replacing any previous one for the id
    pub fn insert(&mut self, id: impl Into<TestId>, program: TestProgram) {
        self.programs.insert(id.into(), program);
    }

    /// Look up a program
    #[must_use]
    pub fn get(&self, id: &TestId) -> Option<&TestProgram> {
        self.programs.get(id)
    }

    /// Number of registered programs
    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Launches each test's [`WorkerRuntime`], on its own thread or as a task
/// on the current runtime depending on [`Isolation`]
#[derive(Debug)]
pub struct TaskLauncher {
    catalog: TestCatalog,
    test_timeout: Duration,
    isolation: Isolation,
    contexts: HashMap<TestId, IsolatedContext>,
}

impl TaskLauncher {
    /// Create a launcher over a catalog
    #[must_use]
    pub fn new(catalog: TestCatalog) -> Self {
        Self {
            catalog,
            test_timeout: WORKER_TIMEOUT,
            isolation: Isolation::default(),
            contexts: HashMap::new(),
        }
    }

    /// Set the worker-side timeout
    #[must_use]
    pub const fn with_test_timeout(mut self, timeout: Duration) -> Self {
        self.test_timeout = timeout;
        self
    }

    /// Set where workers run
    #[must_use]
    pub const fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Context created for a test, if it was launched
    #[must_use]
    pub fn context(&self, id: &TestId) -> Option<&IsolatedContext> {
        self.contexts.get(id)
    }

    /// Number of contexts created so far
    #[must_use]
    pub fn launched(&self) -> usize {
        self.contexts.len()
    }
}

impl ContextLauncher for TaskLauncher {
    fn launch(&mut self, launch: ContextLaunch, parent: ParentPort) -> HarnessResult<()> {
        let program = self
            .catalog
            .get(&launch.id)
            .cloned()
            .ok_or_else(|| HarnessError::launch(launch.id.clone(), "no program registered"))?;
        let context = IsolatedContext::from_markup(launch.url.as_str(), &launch.source)
            .map_err(|e| HarnessError::launch(launch.id.clone(), e.to_string()))?;

        let runtime = WorkerRuntime::new(launch.name, program)
            .with_id(launch.id.clone())
            .with_timeout(self.test_timeout);
        match self.isolation {
            Isolation::Thread => {
                runtime
                    .spawn_isolated(context.clone(), parent)
                    .map_err(|e| HarnessError::launch(launch.id.clone(), e.to_string()))?;
            }
            Isolation::Task => {
                let worker_context = context.clone();
                tokio::spawn(async move {
                    runtime.run(&worker_context, &parent).await;
                });
            }
        }

        debug!(test_id = %launch.id, "context launched");
        self.contexts.insert(launch.id, context);
        Ok(())
    }
}
