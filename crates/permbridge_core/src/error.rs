//! Error taxonomy for the host/guest boundary.

use std::fmt;

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Lifecycle stage at which binding failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingStage {
    /// Fetching the module binary
    FetchModule,
    /// Fetching the dataset
    FetchDataset,
    /// Parsing the dataset into a key/value mapping
    ParseDataset,
    /// Validating and compiling the module binary
    Compile,
    /// Binding the import table into the linker
    Link,
    /// Instantiating the module
    Instantiate,
    /// Capturing memory, allocator, and export handles
    Capture,
    /// Moving between lifecycle states
    Transition,
}

impl fmt::Display for BindingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchModule => "fetch module",
            Self::FetchDataset => "fetch dataset",
            Self::ParseDataset => "parse dataset",
            Self::Compile => "compile",
            Self::Link => "link",
            Self::Instantiate => "instantiate",
            Self::Capture => "capture",
            Self::Transition => "transition",
        };
        f.write_str(name)
    }
}

/// Errors raised while marshaling data across the guest boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Guest memory exhausted or the allocator call failed
    #[error("Allocation failure: {requested} bytes requested: {reason}")]
    AllocationFailure {
        /// Bytes requested from the guest allocator
        requested: u32,
        /// What went wrong
        reason: String,
    },

    /// A descriptor points outside the current memory bound
    #[error("Malformed descriptor at 0x{pointer:X}: {reason}")]
    MalformedDescriptor {
        /// Guest pointer the descriptor was read from
        pointer: u32,
        /// What went wrong
        reason: String,
    },

    /// Bytes in guest memory are not valid UTF-8
    #[error("Invalid encoding at 0x{pointer:X}: {reason}")]
    InvalidEncoding {
        /// Guest pointer of the byte run
        pointer: u32,
        /// Decoder message
        reason: String,
    },

    /// An export returned a value outside its documented domain
    #[error("Unexpected result from {function}: {value}")]
    UnexpectedResult {
        /// Export name
        function: String,
        /// Raw value returned by the guest
        value: i64,
    },

    /// Fetching, compiling, or instantiating the module failed
    #[error("Binding failure during {stage}: {reason}")]
    BindingFailure {
        /// Lifecycle stage that failed
        stage: BindingStage,
        /// What went wrong
        reason: String,
    },

    /// The guest trapped without a bridge error behind it
    #[error("Guest trapped in {function}: {reason}")]
    Trap {
        /// Export that was executing
        function: String,
        /// Trap message
        reason: String,
    },

    /// A previous call panicked while holding the instance
    #[error("Guest instance lock poisoned")]
    Poisoned,
}

impl BridgeError {
    /// Create a binding failure for a stage
    #[must_use]
    pub fn binding(stage: BindingStage, reason: impl Into<String>) -> Self {
        Self::BindingFailure {
            stage,
            reason: reason.into(),
        }
    }

    /// Create an allocation failure
    #[must_use]
    pub fn allocation(requested: u32, reason: impl Into<String>) -> Self {
        Self::AllocationFailure {
            requested,
            reason: reason.into(),
        }
    }

    /// Create a malformed descriptor error
    #[must_use]
    pub fn malformed(pointer: u32, reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            pointer,
            reason: reason.into(),
        }
    }

    /// Short name of the error kind, for structured logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllocationFailure { .. } => "allocation_failure",
            Self::MalformedDescriptor { .. } => "malformed_descriptor",
            Self::InvalidEncoding { .. } => "invalid_encoding",
            Self::UnexpectedResult { .. } => "unexpected_result",
            Self::BindingFailure { .. } => "binding_failure",
            Self::Trap { .. } => "trap",
            Self::Poisoned => "poisoned",
        }
    }

    /// Check if this error aborts the lifecycle
    #[must_use]
    pub fn is_binding(&self) -> bool {
        matches!(self, Self::BindingFailure { .. })
    }
}
