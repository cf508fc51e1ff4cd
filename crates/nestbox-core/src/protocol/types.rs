//! Wire types for the execution protocol.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current version of the [`ExecutionInput`] schema.
pub const PROTOCOL_VERSION: u32 = 1;

/// Line that opens an output block on the agent's stdout.
pub const OUTPUT_START_MARKER: &str = "---NESTBOX_OUTPUT_START---";

/// Line that closes an output block on the agent's stdout.
pub const OUTPUT_END_MARKER: &str = "---NESTBOX_OUTPUT_END---";

/// Reserved zero-byte file in the continuation directory that asks the agent
/// to finish its run.
pub const CLOSE_MARKER: &str = "_close";

/// Credentials handed to the agent through the input document only.
///
/// `Debug` prints key names, never values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl FromIterator<(String, String)> for Secrets {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Structured document written once to the agent's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecutionInput {
    pub version: u32,
    pub prompt: String,
    pub session_id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub is_scheduled_task: bool,
    pub assistant_name: String,
    #[serde(default, skip_serializing_if = "Secrets::is_empty")]
    pub secrets: Secrets,
}

impl ExecutionInput {
    /// Strictly parse an input document.
    ///
    /// Unknown fields, a foreign schema version or empty identifiers are
    /// rejected.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let input: Self = serde_json::from_slice(bytes)?;
        if input.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported version {} (expected {PROTOCOL_VERSION})",
                input.version
            )));
        }
        if input.session_id.trim().is_empty() {
            return Err(Error::Protocol("sessionId must not be empty".into()));
        }
        if input.group_folder.trim().is_empty() {
            return Err(Error::Protocol("groupFolder must not be empty".into()));
        }
        Ok(input)
    }

    /// Serialize for delivery on stdin.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Copy of this input with secrets removed, for the mounted-file fallback.
    #[must_use]
    pub fn without_secrets(&self) -> Self {
        Self {
            secrets: Secrets::new(),
            ..self.clone()
        }
    }
}

/// Follow-up message dropped into the continuation directory of a live
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationMessage {
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// One reply chunk extracted from an agent's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBlock {
    /// Zero-based emission order within one execution.
    pub sequence: u64,
    pub text: String,
}
