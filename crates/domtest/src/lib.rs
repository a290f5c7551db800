//! domtest: bounded-concurrency DOM test harness
//!
//! Tests are declared as markers in a host page. The coordinator launches
//! each one in an isolated context, at most `concurrency` at a time, and
//! collects the single completion message every context posts back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  HostPage ──discover──► Coordinator ──launch──► IsolatedContext   │
//! │                            ▲    │                    │            │
//! │                            │    └─subscribe─► Registry            │
//! │                            │                   ▲     │            │
//! │                            └──── settle ◄──────┘     ▼            │
//! │                                         ParentPort ◄─ Worker      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only JSON text of the shape `{result, id, message}` crosses from a
//! context back to the coordinator.
//!
//! # Example
//!
//! ```no_run
//! use domtest::{Coordinator, HarnessConfig, HostPage, TestCase, TestCatalog, TestProgram};
//!
//! # async fn demo() -> domtest::HarnessResult<()> {
//! let page = HostPage::builder()
//!     .test(&TestCase::new("greeting", "Greeting").with_source(r#"<p id="msg">hi</p>"#))
//!     .build();
//! let catalog = TestCatalog::new().with_test(
//!     "greeting",
//!     TestProgram::new(|done, doc| {
//!         assert_eq!(doc.by_id("msg")?.text(), "hi");
//!         done.pass();
//!         Ok(())
//!     }),
//! );
//!
//! let mut coordinator = Coordinator::for_catalog(page, catalog, HarnessConfig::default());
//! let suite = coordinator.run().await?;
//! println!("{suite}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod dom;
pub mod harness;
pub mod logging;
pub mod messages;
pub mod page;
pub mod protocol;
pub mod result;
pub mod scheduler;
pub mod worker;

pub use config::{HarnessConfig, Isolation};
pub use context::{ContextLaunch, ContextLauncher, IsolatedContext, TaskLauncher, TestCatalog};
pub use dom::{Doc, Document, DomEvent, Elem, EventKind, KeyModifiers, QueryResult};
pub use harness::{
    BreakdownEntry, Outcome, ResultBuilder, SuiteResult, TestCase, TestResult, ALL_TESTS_NAME,
    ALL_TESTS_PASSED,
};
pub use logging::{init_json_logging, init_logging};
pub use messages::{Delivery, MessageRegistry, Subscription};
pub use page::{escape, unescape, HostPage, HostPageBuilder, MarkerStatus};
pub use protocol::{Inbox, ParentPort, TestId, WireMessage};
pub use result::{HarnessError, HarnessResult, ProtocolViolation};
pub use scheduler::{Coordinator, TIMEOUT};
pub use worker::{
    Completion, CompletionLatch, Done, Signal, TestProgram, WorkerRuntime, WorkerState,
    MULTIPLE_DONE, PASSED, TEST_TIMEOUT, WORKER_TIMEOUT,
};
