//! Host functions the guest imports.
//!
//! The guest may call back into the host at any point while one of its
//! exports runs. Each lookup is independent: it decodes the key, reads the
//! dataset, and hands a fresh buffer to the guest.

use crate::alloc::LeaseLedger;
use crate::codec::StringCodec;
use permbridge_core::{
    AbiNames, BindingStage, BridgeError, BridgeResult, Dataset, GuestPtr, KeyFraming,
};
use std::sync::Arc;
use wasmtime::{AsContextMut, Caller, Linker, StoreLimits};

/// Per-instance state stored alongside the guest
pub struct HostState {
    dataset: Arc<dyn Dataset>,
    key_framing: KeyFraming,
    codec: Option<StringCodec>,
    pub(crate) ledger: LeaseLedger,
    pub(crate) limits: StoreLimits,
    lookups: u64,
}

impl HostState {
    /// Create host state for a new instance
    #[must_use]
    pub fn new(dataset: Arc<dyn Dataset>, key_framing: KeyFraming, limits: StoreLimits) -> Self {
        Self {
            dataset,
            key_framing,
            codec: None,
            ledger: LeaseLedger::new(),
            limits,
            lookups: 0,
        }
    }

    /// Make the codec available to imports once exports are captured
    pub fn bind(&mut self, codec: StringCodec) {
        self.codec = Some(codec);
    }

    /// Get the bound codec
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the guest calls an import before the
    /// instance reached the ready state, e.g. from its start function
    pub fn codec(&self) -> BridgeResult<&StringCodec> {
        self.codec.as_ref().ok_or_else(|| {
            BridgeError::binding(
                BindingStage::Capture,
                "guest called an import before the instance was ready",
            )
        })
    }

    /// Get the lease ledger
    #[must_use]
    pub fn ledger(&self) -> &LeaseLedger {
        &self.ledger
    }

    /// Get the dataset
    #[must_use]
    pub fn dataset(&self) -> &Arc<dyn Dataset> {
        &self.dataset
    }

    /// Number of lookups the guest has made
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.lookups
    }
}

/// Bind the import table into a linker
///
/// # Errors
///
/// Returns a binding failure if the name is already defined
pub fn register_imports(linker: &mut Linker<HostState>, abi: &AbiNames) -> BridgeResult<()> {
    linker
        .func_wrap(
            &abi.import_module,
            &abi.import_lookup,
            |mut caller: Caller<'_, HostState>, key_ptr: u32| -> wasmtime::Result<u32> {
                lookup(&mut caller, GuestPtr::new(key_ptr))
                    .map(GuestPtr::offset)
                    .map_err(wasmtime::Error::new)
            },
        )
        .map_err(|e| {
            BridgeError::binding(
                BindingStage::Link,
                format!("import '{}.{}': {}", abi.import_module, abi.import_lookup, e),
            )
        })?;
    Ok(())
}

/// Serve one guest lookup
///
/// Decodes the key at `key_ptr`, reads its value from the dataset (`null`
/// when absent), and returns a NUL-terminated copy in guest memory. The
/// returned buffer belongs to the guest from here on.
///
/// # Errors
///
/// Returns the codec error if the key cannot be decoded or the value cannot
/// be placed in guest memory
pub fn lookup(
    mut store: impl AsContextMut<Data = HostState>,
    key_ptr: GuestPtr,
) -> BridgeResult<GuestPtr> {
    let (codec, framing) = {
        let state = store.as_context().data();
        (state.codec()?.clone(), state.key_framing)
    };

    let key = match framing {
        KeyFraming::NullTerminated => codec.decode_terminated(&mut store, key_ptr)?,
        KeyFraming::LengthPrefixed => codec.decode_from_guest(&mut store, key_ptr)?,
    };

    let value = {
        let mut ctx = store.as_context_mut();
        let state = ctx.data_mut();
        state.lookups += 1;
        state.dataset.lookup_text(&key).to_owned()
    };

    let ptr = codec.encode_for_guest(&mut store, &value)?;
    codec.allocator().transfer(&mut store, ptr);

    tracing::debug!(key = %key, value_bytes = value.len(), pointer = %ptr, "served guest lookup");
    Ok(ptr)
}
