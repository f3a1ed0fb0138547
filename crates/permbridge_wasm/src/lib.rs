//! PERMBRIDGE WASM Bridge
//!
//! Host side of the guest boundary: a linear memory view, an allocator
//! bridge that leases guest buffers, a string codec for both descriptor
//! conventions, the lookup import, the permission export, and the
//! instance lifecycle that wires them together.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod codec;
pub mod compile;
pub mod exports;
pub mod imports;
pub mod instance;
pub mod lifecycle;
pub mod memory;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use alloc::{AllocatorBridge, Lease, LeaseLedger, ReleaseAbi};
pub use codec::StringCodec;
pub use compile::{CompileError, CompiledModule, WasmCompiler};
pub use exports::ExportTable;
pub use imports::{HostState, register_imports};
pub use instance::GuestInstance;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use memory::{LinearMemory, MemoryLimit};
