//! Typed handles to the guest's permission export.

use crate::imports::HostState;
use permbridge_core::{AbiNames, BindingStage, BridgeError, BridgeResult, GuestPtr, Verdict};
use wasmtime::{AsContextMut, Instance, TypedFunc};

/// Export handles captured after instantiation
#[derive(Clone)]
pub struct ExportTable {
    check_permission: TypedFunc<(i32, i32, u32), i32>,
    name: String,
}

impl ExportTable {
    /// Capture the permission export from an instance
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the export is missing or mistyped
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
        abi: &AbiNames,
    ) -> BridgeResult<Self> {
        let check_permission = instance
            .get_typed_func::<(i32, i32, u32), i32>(&mut store, &abi.check_permission)
            .map_err(|e| {
                BridgeError::binding(
                    BindingStage::Capture,
                    format!("export '{}': {}", abi.check_permission, e),
                )
            })?;
        Ok(Self {
            check_permission,
            name: abi.check_permission.clone(),
        })
    }

    /// Name of the permission export
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the permission export
    ///
    /// `permission` must point at a NUL-terminated string already in guest
    /// memory. The guest may call the lookup import any number of times
    /// before it returns.
    ///
    /// # Errors
    ///
    /// Returns the bridge error raised inside a lookup, `Trap` if the guest
    /// trapped on its own, or `UnexpectedResult` for a value other than 0 or 1
    pub fn check_permission(
        &self,
        mut store: impl AsContextMut<Data = HostState>,
        subject_id: i32,
        resource_id: i32,
        permission: GuestPtr,
    ) -> BridgeResult<Verdict> {
        let raw = self
            .check_permission
            .call(&mut store, (subject_id, resource_id, permission.offset()))
            .map_err(|e| from_trap(&self.name, e))?;
        Verdict::from_raw(&self.name, raw)
    }
}

/// Recover the bridge error carried by a trap, if any
pub(crate) fn from_trap(function: &str, err: wasmtime::Error) -> BridgeError {
    if let Some(bridge) = err.downcast_ref::<BridgeError>() {
        return bridge.clone();
    }
    BridgeError::Trap {
        function: function.to_string(),
        reason: err.to_string(),
    }
}
