//! Instance lifecycle.
//!
//! States only move forward, one step at a time. A failure at any step
//! leaves the state where it was, and the caller discards the instance.

use permbridge_core::{BindingStage, BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an instance is in its setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing fetched yet
    Unloaded,
    /// Module and dataset are being fetched and compiled
    Loading,
    /// Module instantiated, exports not yet captured
    Instantiated,
    /// Memory, allocator, and exports captured; checks may run
    Ready,
}

impl LifecycleState {
    /// The state that follows this one
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Unloaded => Some(Self::Loading),
            Self::Loading => Some(Self::Instantiated),
            Self::Instantiated => Some(Self::Ready),
            Self::Ready => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Instantiated => "instantiated",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Lifecycle {
    /// Start in the unloaded state
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Unloaded,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Check if checks may run
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == LifecycleState::Ready
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns a binding failure unless `next` directly follows the current
    /// state
    pub fn advance(&mut self, next: LifecycleState) -> BridgeResult<()> {
        if self.state.next() != Some(next) {
            return Err(BridgeError::binding(
                BindingStage::Transition,
                format!("cannot move from {} to {}", self.state, next),
            ));
        }
        tracing::debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_sequence() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Unloaded);
        lifecycle.advance(LifecycleState::Loading).unwrap();
        lifecycle.advance(LifecycleState::Instantiated).unwrap();
        assert!(!lifecycle.is_ready());
        lifecycle.advance(LifecycleState::Ready).unwrap();
        assert!(lifecycle.is_ready());
    }

    #[test]
    fn test_cannot_skip() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle.advance(LifecycleState::Ready).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BindingFailure { stage: BindingStage::Transition, .. }
        ));
        assert_eq!(lifecycle.state(), LifecycleState::Unloaded);
    }

    #[test]
    fn test_cannot_go_back() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Loading).unwrap();
        assert!(lifecycle.advance(LifecycleState::Unloaded).is_err());
        assert!(lifecycle.advance(LifecycleState::Loading).is_err());
    }

    #[test]
    fn test_ready_is_terminal() {
        assert_eq!(LifecycleState::Ready.next(), None);
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&LifecycleState::Instantiated).unwrap();
        assert_eq!(json, "\"instantiated\"");
    }
}
