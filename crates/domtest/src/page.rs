//! Host page: declared test-case markers and their status reports.
//!
//! A marker is any element carrying `test-case="<id>"`; its text content is
//! the escaped source of the test. Status is shown on the element matching
//! `[test-report="<id>"]`.

use crate::dom::{Doc, Document, NodeId};
use crate::harness::{Outcome, TestCase};
use crate::protocol::TestId;
use crate::result::HarnessResult;
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Attribute declaring a test-case marker
pub const TEST_CASE_ATTR: &str = "test-case";
/// Attribute holding the standalone URL
pub const TEST_URL_ATTR: &str = "test-url";
/// Attribute holding the display name
pub const TEST_NAME_ATTR: &str = "test-name";
/// Attribute marking a test as skipped
pub const TEST_SKIP_ATTR: &str = "test-skip";
/// Attribute locating a test's status report element
pub const TEST_REPORT_ATTR: &str = "test-report";

fn entity_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"&(amp|lt|gt|quot|#x27|#x60|#x3D);").ok())
        .as_ref()
}

/// Decode the entities used to embed test sources in a host page
#[must_use]
pub fn unescape(text: &str) -> String {
    let Some(pattern) = entity_pattern() else {
        return text.to_string();
    };
    pattern
        .replace_all(text, |caps: &Captures<'_>| match &caps[1] {
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            "#x27" => "'",
            "#x60" => "`",
            _ => "=",
        })
        .into_owned()
}

/// Encode a test source for embedding; inverse of [`unescape`]
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            c => out.push(c),
        }
    }
    out
}

/// Status shown on a test's report element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    /// Not yet started
    Pending,
    /// Context launched
    Running,
    /// Passed
    Success,
    /// Failed
    Failure,
    /// Skipped
    Skipped,
}

impl MarkerStatus {
    const CLASSES: [&'static str; 4] = ["running", "success", "failure", "skipped"];

    /// Class applied to the report element, `None` while pending
    #[must_use]
    pub const fn class_name(self) -> Option<&'static str> {
        match self {
            Self::Pending => None,
            Self::Running => Some("running"),
            Self::Success => Some("success"),
            Self::Failure => Some("failure"),
            Self::Skipped => Some("skipped"),
        }
    }
}

impl From<Outcome> for MarkerStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Pass => Self::Success,
            Outcome::Fail => Self::Failure,
            Outcome::Skipped => Self::Skipped,
        }
    }
}

/// The page hosting a suite
#[derive(Debug, Clone)]
pub struct HostPage {
    doc: Doc,
}

impl HostPage {
    /// Parse host page markup
    pub fn parse(markup: &str) -> HarnessResult<Self> {
        Ok(Self::from_document(Document::parse(markup)?))
    }

    /// Wrap an existing document
    #[must_use]
    pub fn from_document(document: Document) -> Self {
        Self {
            doc: Doc::new(document),
        }
    }

    /// Start building a page in code
    #[must_use]
    pub fn builder() -> HostPageBuilder {
        HostPageBuilder::new()
    }

    /// The page's document
    #[must_use]
    pub const fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Collect the declared tests in document order.
    ///
    /// A repeated id is dropped with a warning; the first marker wins.
    pub fn discover(&self) -> HarnessResult<Vec<TestCase>> {
        self.doc.with(|doc| {
            let mut seen = HashSet::new();
            let mut tests = Vec::new();
            for node in doc.query_all(&format!("[{TEST_CASE_ATTR}]"))? {
                let id = doc.attribute(node, TEST_CASE_ATTR).unwrap_or_default();
                if !seen.insert(id.to_string()) {
                    warn!(test_id = id, "duplicate test-case marker ignored");
                    continue;
                }
                let name = doc.attribute(node, TEST_NAME_ATTR).unwrap_or(id);
                let mut test = TestCase::new(id, name)
                    .with_url(doc.attribute(node, TEST_URL_ATTR).unwrap_or_default())
                    .with_source(unescape(doc.text_content(node).trim()));
                if doc.has_attribute(node, TEST_SKIP_ATTR) {
                    test = test.skipped();
                }
                tests.push(test);
            }
            debug!(count = tests.len(), "discovered tests");
            Ok(tests)
        })
    }

    fn find(doc: &Document, attr: &str, id: &TestId) -> Option<NodeId> {
        doc.query_all(&format!("[{attr}]"))
            .ok()?
            .into_iter()
            .find(|n| doc.attribute(*n, attr) == Some(id.as_str()))
    }

    /// Move a test's report element to `status`
    pub fn mark(&self, id: &TestId, status: MarkerStatus) {
        self.doc.with_mut(|doc| {
            let Some(report) = Self::find(doc, TEST_REPORT_ATTR, id) else {
                debug!(test_id = %id, "no report element");
                return;
            };
            for class in MarkerStatus::CLASSES {
                doc.remove_class(report, class);
            }
            if let Some(class) = status.class_name() {
                doc.add_class(report, class);
            }
        });
    }

    /// Current status of a test's report element
    #[must_use]
    pub fn status(&self, id: &TestId) -> Option<MarkerStatus> {
        self.doc.with(|doc| {
            let report = Self::find(doc, TEST_REPORT_ATTR, id)?;
            let status = [
                MarkerStatus::Running,
                MarkerStatus::Success,
                MarkerStatus::Failure,
                MarkerStatus::Skipped,
            ]
            .into_iter()
            .find(|s| s.class_name().is_some_and(|c| doc.has_class(report, c)))
            .unwrap_or(MarkerStatus::Pending);
            Some(status)
        })
    }

    /// Add a visible `div.error` note next to the test's marker
    pub fn append_error(&self, id: &TestId, message: &str) {
        self.doc.with_mut(|doc| {
            let Some(marker) = Self::find(doc, TEST_CASE_ATTR, id) else {
                return;
            };
            let parent = doc.parent(marker).unwrap_or_else(|| doc.body());
            let note = doc.create_element("div");
            doc.add_class(note, "error");
            doc.set_text(note, message);
            doc.append_child(parent, note);
        });
    }
}

/// Builds a host page from test declarations
#[derive(Debug, Default)]
pub struct HostPageBuilder {
    document: Document,
}

impl HostPageBuilder {
    /// Create an empty page
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a test with a report element
    #[must_use]
    pub fn test(mut self, test: &TestCase) -> Self {
        let doc = &mut self.document;
        let section = doc.create_element("section");
        let body = doc.body();
        doc.append_child(body, section);

        let report = doc.create_element("h2");
        doc.set_attribute(report, TEST_REPORT_ATTR, test.id.as_str());
        doc.set_text(report, &test.name);
        doc.append_child(section, report);

        let marker = doc.create_element("script");
        doc.set_attribute(marker, TEST_CASE_ATTR, test.id.as_str());
        doc.set_attribute(marker, TEST_NAME_ATTR, &test.name);
        doc.set_attribute(marker, TEST_URL_ATTR, &test.url);
        if test.skip {
            doc.set_attribute(marker, TEST_SKIP_ATTR, "");
        }
        doc.set_text(marker, &escape(&test.source));
        doc.append_child(section, marker);
        self
    }

    /// Finish the page
    #[must_use]
    pub fn build(self) -> HostPage {
        HostPage::from_document(self.document)
    }
}
