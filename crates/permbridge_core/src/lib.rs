//! PERMBRIDGE Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything the host needs to describe the guest boundary lives here:
//! pointers and descriptors, the error taxonomy, ABI names and limits,
//! and the key/value dataset the guest looks values up in.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dataset;
pub mod error;
pub mod pointer;
pub mod verdict;

// Re-exports
pub use config::{AbiNames, BridgeConfig, KeyFraming};
pub use dataset::{Dataset, JsonDataset, NULL_LITERAL};
pub use error::{BindingStage, BridgeError, BridgeResult};
pub use pointer::{DESCRIPTOR_SIZE, GuestPtr, StringDescriptor};
pub use verdict::Verdict;
