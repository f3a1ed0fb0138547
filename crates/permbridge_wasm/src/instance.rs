//! A live guest instance.
//!
//! Owns the store and every handle captured from it. Each handle is only
//! meaningful for this store, which is why they travel together and why an
//! instance is driven by one caller at a time.

use crate::alloc::{AllocatorBridge, LeaseLedger};
use crate::codec::StringCodec;
use crate::compile::{CompiledModule, WasmCompiler};
use crate::exports::ExportTable;
use crate::imports::{HostState, register_imports};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::memory::{LinearMemory, MemoryLimit};
use permbridge_core::{BindingStage, BridgeConfig, BridgeError, BridgeResult, Dataset, GuestPtr, Verdict};
use std::collections::BTreeSet;
use std::sync::Arc;
use wasmtime::{Instance, Linker, Store};

/// Guest module instantiated and bound to the bridge
pub struct GuestInstance {
    store: Store<HostState>,
    instance: Instance,
    codec: StringCodec,
    exports: ExportTable,
    config: BridgeConfig,
    lifecycle: Lifecycle,
}

impl GuestInstance {
    /// Instantiate a compiled module and capture its exports
    ///
    /// `lifecycle` must be in the loading state; it ends in the ready state.
    ///
    /// # Errors
    ///
    /// Returns a binding failure at the stage that failed
    pub fn instantiate(
        compiler: &WasmCompiler,
        compiled: &CompiledModule,
        dataset: Arc<dyn Dataset>,
        mut lifecycle: Lifecycle,
    ) -> BridgeResult<Self> {
        let config = compiler.config().clone();
        let limits = MemoryLimit::new(config.max_memory_bytes).store_limits();

        let mut store = Store::new(
            compiler.engine(),
            HostState::new(dataset, config.key_framing, limits),
        );
        store.limiter(|state| &mut state.limits);
        refuel(&mut store, &config)?;

        let mut linker = Linker::new(compiler.engine());
        register_imports(&mut linker, &config.abi)?;

        let instance = linker
            .instantiate(&mut store, &compiled.module)
            .map_err(|e| match e.downcast_ref::<BridgeError>() {
                Some(bridge) => bridge.clone(),
                None => BridgeError::binding(BindingStage::Instantiate, format!("{e:#}")),
            })?;
        lifecycle.advance(LifecycleState::Instantiated)?;

        let memory = instance
            .get_memory(&mut store, &config.abi.memory)
            .map(LinearMemory::new)
            .ok_or_else(|| {
                BridgeError::binding(
                    BindingStage::Capture,
                    format!("export '{}' is not a memory", config.abi.memory),
                )
            })?;
        let allocator = AllocatorBridge::from_instance(
            &mut store,
            &instance,
            memory,
            &config.abi,
            compiled.release_abi,
        )?;
        let exports = ExportTable::from_instance(&mut store, &instance, &config.abi)?;

        let codec = StringCodec::new(allocator).with_max_string_bytes(config.max_string_bytes);
        store.data_mut().bind(codec.clone());
        lifecycle.advance(LifecycleState::Ready)?;

        tracing::info!(
            module_bytes = compiled.size,
            memory_bytes = memory.size(&store),
            release_abi = ?compiled.release_abi,
            "guest instance ready"
        );

        Ok(Self {
            store,
            instance,
            codec,
            exports,
            config,
            lifecycle,
        })
    }

    /// Compile and instantiate a module from its bytes in one step
    ///
    /// # Errors
    ///
    /// Returns a binding failure at the stage that failed
    pub fn from_bytes(
        wasm_bytes: &[u8],
        dataset: Arc<dyn Dataset>,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Loading)?;
        let compiler = WasmCompiler::new(config)?;
        let compiled = compiler.compile(wasm_bytes)?;
        Self::instantiate(&compiler, &compiled, dataset, lifecycle)
    }

    /// Ask the guest whether a subject holds a permission on a resource
    ///
    /// The permission string is placed in guest memory for the duration of
    /// the call and released afterwards whatever the outcome. Leases the
    /// call leaves behind are reclaimed; leases held before the call are not
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns the encode error, any bridge error raised by a lookup during
    /// the call, `Trap` if the guest trapped, or `UnexpectedResult`
    pub fn check_permission(
        &mut self,
        subject_id: i32,
        resource_id: i32,
        permission: &str,
    ) -> BridgeResult<Verdict> {
        if !self.lifecycle.is_ready() {
            return Err(BridgeError::binding(
                BindingStage::Transition,
                format!("instance is {}, not ready", self.lifecycle.state()),
            ));
        }
        refuel(&mut self.store, &self.config)?;
        let held: BTreeSet<GuestPtr> = self.ledger().leases().map(|l| l.ptr).collect();

        let Self {
            store,
            codec,
            exports,
            ..
        } = &mut *self;
        let result = codec.with_guest_string(store, permission, |store, ptr| {
            exports.check_permission(store, subject_id, resource_id, ptr)
        });

        if self.ledger().outstanding() > held.len() {
            let reclaimed = self.release_leases(|ptr| !held.contains(&ptr));
            tracing::debug!(reclaimed, "reclaimed leases left by check");
        }

        match &result {
            Ok(verdict) => tracing::debug!(
                subject_id,
                resource_id,
                permission,
                verdict = %verdict,
                lookups = self.store.data().lookups(),
                "permission checked"
            ),
            Err(e) => tracing::warn!(
                subject_id,
                resource_id,
                permission,
                error = %e,
                "permission check failed"
            ),
        }
        result
    }

    /// Release every host lease still outstanding
    ///
    /// Runs with fresh fuel, so buffers left behind by a call that ran out
    /// of fuel are still returned. This includes leases obtained directly
    /// through [`GuestInstance::codec`]. Returns the number released.
    pub fn reclaim_leases(&mut self) -> usize {
        self.release_leases(|_| true)
    }

    fn release_leases(&mut self, select: impl Fn(GuestPtr) -> bool) -> usize {
        if let Err(e) = refuel(&mut self.store, &self.config) {
            tracing::warn!(error = %e, "cannot refuel to reclaim leases");
            return 0;
        }
        let leaked: Vec<_> = self
            .ledger()
            .leases()
            .map(|l| l.ptr)
            .filter(|&ptr| select(ptr))
            .collect();
        let mut reclaimed = 0;
        for ptr in leaked {
            match self.codec.allocator().release(&mut self.store, ptr) {
                Ok(()) => reclaimed += 1,
                Err(e) => tracing::warn!(pointer = %ptr, error = %e, "lease could not be reclaimed"),
            }
        }
        reclaimed
    }

    /// Get the string codec bound to this instance
    #[must_use]
    pub fn codec(&self) -> &StringCodec {
        &self.codec
    }

    /// Get the captured exports
    #[must_use]
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Get the store
    #[must_use]
    pub fn store(&self) -> &Store<HostState> {
        &self.store
    }

    /// Get the store mutably
    pub fn store_mut(&mut self) -> &mut Store<HostState> {
        &mut self.store
    }

    /// Get the wasmtime instance
    #[must_use]
    pub fn wasm_instance(&self) -> &Instance {
        &self.instance
    }

    /// Get the lease ledger
    #[must_use]
    pub fn ledger(&self) -> &LeaseLedger {
        self.store.data().ledger()
    }

    /// Number of lookups served so far
    #[must_use]
    pub fn lookups(&self) -> u64 {
        self.store.data().lookups()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Current guest memory size in bytes
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        self.codec.memory().size(&self.store)
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

/// Reset the fuel budget when metering is enabled
fn refuel(store: &mut Store<HostState>, config: &BridgeConfig) -> BridgeResult<()> {
    if let Some(fuel) = config.max_fuel {
        store
            .set_fuel(fuel)
            .map_err(|e| BridgeError::binding(BindingStage::Instantiate, format!("fuel: {e}")))?;
    }
    Ok(())
}
