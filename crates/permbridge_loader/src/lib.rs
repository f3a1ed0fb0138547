//! PERMBRIDGE Loader
//!
//! Fetches a guest module and its permission dataset, drives the instance
//! through its lifecycle, and hands back a checker that can be shared
//! across threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checker;
pub mod loader;
pub mod source;

pub use checker::PermissionChecker;
pub use loader::{Loader, load_checker};
pub use source::{Location, LocationError, SourceFetcher};
