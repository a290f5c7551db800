//! Wire protocol between isolated contexts and the coordinator.
//!
//! A context reports its outcome as JSON text of the shape
//! `{ "result": bool, "id": string|number, "message": string }` posted to its
//! parent. Nothing else crosses the boundary.

use crate::result::{HarnessResult, ProtocolViolation};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Identifier correlating a launched test with its completion message.
///
/// Numeric ids on the wire are normalized to their decimal text so that
/// `7` and `"7"` address the same subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    /// Create an id from text
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive an id from a context location: everything after the first `?`.
    ///
    /// Returns `None` when there is no query or it is empty.
    #[must_use]
    pub fn from_location(location: &str) -> Option<Self> {
        let (_, query) = location.split_once('?')?;
        let query = query.split('#').next().unwrap_or_default();
        if query.is_empty() {
            None
        } else {
            Some(Self::new(query))
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for TestId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl<'de> Deserialize<'de> for TestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => Self(text),
            RawId::Number(number) => Self(number.to_string()),
        })
    }
}

fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Completion message posted from a context to its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Whether the test passed
    #[serde(default)]
    pub result: bool,
    /// Test id (absent ids are a protocol violation on receipt)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TestId>,
    /// Failure text, or `Passed`
    #[serde(default, deserialize_with = "nullable_string")]
    pub message: String,
}

impl WireMessage {
    /// Create a message
    #[must_use]
    pub fn new(result: bool, id: Option<TestId>, message: impl Into<String>) -> Self {
        Self {
            result,
            id,
            message: message.into(),
        }
    }

    /// Serialize to wire text
    pub fn encode(&self) -> HarnessResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text
    pub fn decode(payload: &str) -> Result<Self, ProtocolViolation> {
        serde_json::from_str(payload).map_err(|e| ProtocolViolation::Malformed {
            reason: e.to_string(),
            payload: payload.to_string(),
        })
    }
}

/// Sending half of the boundary, handed to every isolated context.
#[derive(Debug, Clone)]
pub struct ParentPort {
    tx: mpsc::UnboundedSender<String>,
}

/// Receiving half of the boundary, owned by the coordinator.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl ParentPort {
    /// Create a connected port/inbox pair
    #[must_use]
    pub fn channel() -> (Self, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Inbox { rx })
    }

    /// Post raw text to the parent.
    ///
    /// Returns `false` when the parent has gone away; an abandoned context
    /// has nobody to tell.
    pub fn post_message(&self, payload: String) -> bool {
        self.tx.send(payload).is_ok()
    }
}

impl Inbox {
    /// Wait for the next message
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}
