//! Identifier of the business object an event refers to.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;

/// Maximum length of a data id (matches the `dataId varchar(32)` column).
pub const MAX_ID_LEN: usize = 32;

/// Identifier of the data object an event targets.
///
/// Non-empty, at most [`MAX_ID_LEN`] bytes, no whitespace. The queue's dedup
/// index and the persistence table are both keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataId(String);

impl DataId {
    pub fn new(value: impl Into<String>) -> Result<Self, ProcessorError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ProcessorError::invalid_id("DataId: empty"));
        }
        if value.len() > MAX_ID_LEN {
            return Err(ProcessorError::invalid_id(format!(
                "DataId: '{value}' exceeds {MAX_ID_LEN} bytes"
            )));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(ProcessorError::invalid_id(format!(
                "DataId: '{value}' contains whitespace"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable 32-bit hash used as the `dataIdHash` pre-filter column.
    ///
    /// Deterministic across processes and platforms; rows written by one run
    /// must be found by the next.
    pub fn hash_code(&self) -> i32 {
        self.0
            .bytes()
            .fold(0i32, |h, b| h.wrapping_mul(31).wrapping_add(i32::from(b)))
    }
}

impl core::fmt::Display for DataId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DataId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DataId {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DataId {
    type Error = ProcessorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DataId> for String {
    fn from(value: DataId) -> Self {
        value.0
    }
}
