//! Opaque event parameter flags.

use serde::{Deserialize, Serialize};

/// Opaque bit-flags carried by an event (`eventParams bigint`).
///
/// The processor never interprets them; it only merges them when events for
/// the same data object are aggregated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventParams(u64);

impl EventParams {
    pub const NONE: EventParams = EventParams(0);

    pub const fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: EventParams) -> bool {
        self.0 & other.0 == other.0
    }

    /// Storage representation (the column is a signed bigint).
    pub const fn to_storage(self) -> i64 {
        self.0 as i64
    }

    pub const fn from_storage(value: i64) -> Self {
        Self(value as u64)
    }
}

impl core::ops::BitOr for EventParams {
    type Output = EventParams;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventParams(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for EventParams {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<u64> for EventParams {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for EventParams {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
