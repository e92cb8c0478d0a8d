//! Event kind and priority, with their single-character storage codes.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;

/// What happened to the data object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    /// Storage code (`eventType char(1)`).
    pub fn code(self) -> char {
        match self {
            EventKind::Create => 'C',
            EventKind::Update => 'U',
            EventKind::Delete => 'D',
        }
    }

    pub fn from_code(code: char) -> Result<Self, ProcessorError> {
        match code {
            'C' => Ok(EventKind::Create),
            'U' => Ok(EventKind::Update),
            'D' => Ok(EventKind::Delete),
            other => Err(ProcessorError::validation(format!(
                "unknown event type code '{other}'"
            ))),
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, EventKind::Delete)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Processing priority. Ordered: `Low < Normal < High`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// All priorities, highest first (dequeue order).
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Storage code (`eventPriority char(1)`).
    pub fn code(self) -> char {
        match self {
            Priority::Low => '0',
            Priority::Normal => '4',
            Priority::High => '8',
        }
    }

    pub fn from_code(code: char) -> Result<Self, ProcessorError> {
        match code {
            '0' => Ok(Priority::Low),
            '4' => Ok(Priority::Normal),
            '8' => Ok(Priority::High),
            other => Err(ProcessorError::validation(format!(
                "unknown priority code '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(Priority::Low),
            "normal" | "4" => Ok(Priority::Normal),
            "high" | "8" => Ok(Priority::High),
            other => Err(ProcessorError::validation(format!(
                "unknown priority '{other}' (expected high, normal or low)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::Low.max(Priority::High), Priority::High);
    }

    #[test]
    fn codes_round_trip() {
        for p in Priority::DESCENDING {
            assert_eq!(Priority::from_code(p.code()).unwrap(), p);
        }
        for k in [EventKind::Create, EventKind::Update, EventKind::Delete] {
            assert_eq!(EventKind::from_code(k.code()).unwrap(), k);
        }
        assert!(EventKind::from_code('X').is_err());
        assert!(Priority::from_code('5').is_err());
    }

    #[test]
    fn parses_priority_names() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
