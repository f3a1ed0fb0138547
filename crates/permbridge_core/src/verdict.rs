//! Permission verdicts returned by the guest.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    /// The subject has the permission
    Has,
    /// The subject does not have the permission
    HasNot,
}

impl Verdict {
    /// Interpret the raw value returned by a permission export
    ///
    /// # Errors
    ///
    /// Returns `UnexpectedResult` for anything other than `0` or `1`
    pub fn from_raw(function: &str, raw: i32) -> BridgeResult<Self> {
        match raw {
            1 => Ok(Self::Has),
            0 => Ok(Self::HasNot),
            other => Err(BridgeError::UnexpectedResult {
                function: function.to_string(),
                value: i64::from(other),
            }),
        }
    }

    /// Check if the permission was granted
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Has)
    }

    /// Word used in the result sentence
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Has => "has",
            Self::HasNot => "has not",
        }
    }

    /// Render the human-readable result sentence
    #[must_use]
    pub fn sentence(self, subject_id: impl fmt::Display, permission: &str) -> String {
        format!("user {} {} {}", subject_id, self.as_str(), permission)
    }
}

impl From<bool> for Verdict {
    fn from(granted: bool) -> Self {
        if granted { Self::Has } else { Self::HasNot }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
