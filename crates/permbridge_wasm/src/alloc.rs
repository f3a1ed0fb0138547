//! Allocator bridge and lease ledger.
//!
//! Every guest-bound buffer the host writes is obtained from the guest's
//! own allocator, so the guest stays the single authority over its memory
//! layout. The ledger records each host-owned allocation until it is
//! released, which makes leaks visible instead of silent.

use crate::imports::HostState;
use crate::memory::LinearMemory;
use permbridge_core::{AbiNames, BindingStage, BridgeError, BridgeResult, GuestPtr};
use std::collections::BTreeMap;
use wasmtime::{AsContextMut, Instance, TypedFunc};

/// Shape of the guest's release export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAbi {
    /// `free(ptr)`
    Pointer,
    /// `free(ptr, len)`
    Sized,
}

#[derive(Clone)]
enum ReleaseFn {
    Pointer(TypedFunc<u32, ()>),
    Sized(TypedFunc<(u32, u32), ()>),
}

/// A host-owned guest allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// Start of the region
    pub ptr: GuestPtr,
    /// Region size in bytes
    pub size: u32,
}

impl Lease {
    /// Exclusive end of the region
    #[must_use]
    pub fn end(&self) -> u64 {
        self.ptr.end(self.size)
    }

    /// Check if a range overlaps this lease
    #[must_use]
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end() && end > u64::from(self.ptr.offset())
    }
}

/// Ledger of outstanding host leases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseLedger {
    leases: BTreeMap<u32, Lease>,
    outstanding_bytes: u64,
    allocated: u64,
    released: u64,
    transferred: u64,
}

impl LeaseLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new lease
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the region overlaps a live lease, which
    /// means the guest allocator handed out memory it had already reserved
    pub fn record(&mut self, lease: Lease) -> BridgeResult<()> {
        let start = u64::from(lease.ptr.offset());
        let end = lease.end();

        let before = self.leases.range(..=lease.ptr.offset()).next_back();
        let after = self.leases.range(lease.ptr.offset()..).next();
        for existing in before.into_iter().chain(after).map(|(_, l)| l) {
            if existing.overlaps(start, end) || existing.ptr == lease.ptr {
                return Err(BridgeError::allocation(
                    lease.size,
                    format!(
                        "guest returned {} which overlaps live lease at {} ({} bytes)",
                        lease.ptr, existing.ptr, existing.size
                    ),
                ));
            }
        }

        self.outstanding_bytes += u64::from(lease.size);
        self.allocated += 1;
        self.leases.insert(lease.ptr.offset(), lease);
        Ok(())
    }

    /// Find the live lease starting at `ptr`
    #[must_use]
    pub fn get(&self, ptr: GuestPtr) -> Option<&Lease> {
        self.leases.get(&ptr.offset())
    }

    /// Remove a lease after the guest released it
    pub fn remove(&mut self, ptr: GuestPtr) -> Option<Lease> {
        let lease = self.leases.remove(&ptr.offset())?;
        self.outstanding_bytes -= u64::from(lease.size);
        self.released += 1;
        Some(lease)
    }

    /// Hand a lease over to the guest, which becomes responsible for it
    pub fn transfer(&mut self, ptr: GuestPtr) -> Option<Lease> {
        let lease = self.leases.remove(&ptr.offset())?;
        self.outstanding_bytes -= u64::from(lease.size);
        self.transferred += 1;
        Some(lease)
    }

    /// Number of live host leases
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.leases.len()
    }

    /// Bytes held by live host leases
    #[must_use]
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    /// Total allocations made through the bridge
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Allocations released by the host
    #[must_use]
    pub fn released(&self) -> u64 {
        self.released
    }

    /// Allocations whose ownership moved to the guest
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Iterate over live leases in address order
    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values()
    }
}

/// Bridge to the guest's allocation and release exports
#[derive(Clone)]
pub struct AllocatorBridge {
    memory: LinearMemory,
    allocate: TypedFunc<u32, u32>,
    release: ReleaseFn,
}

impl AllocatorBridge {
    /// Capture the allocator exports from an instance
    ///
    /// # Errors
    ///
    /// Returns a binding failure if an export is missing or mistyped
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
        memory: LinearMemory,
        abi: &AbiNames,
        release_abi: ReleaseAbi,
    ) -> BridgeResult<Self> {
        let allocate = instance
            .get_typed_func::<u32, u32>(&mut store, &abi.allocate)
            .map_err(|e| capture_error(&abi.allocate, &e))?;

        let release = match release_abi {
            ReleaseAbi::Pointer => ReleaseFn::Pointer(
                instance
                    .get_typed_func::<u32, ()>(&mut store, &abi.release)
                    .map_err(|e| capture_error(&abi.release, &e))?,
            ),
            ReleaseAbi::Sized => ReleaseFn::Sized(
                instance
                    .get_typed_func::<(u32, u32), ()>(&mut store, &abi.release)
                    .map_err(|e| capture_error(&abi.release, &e))?,
            ),
        };

        Ok(Self {
            memory,
            allocate,
            release,
        })
    }

    /// Shape of the captured release export
    #[must_use]
    pub fn release_abi(&self) -> ReleaseAbi {
        match self.release {
            ReleaseFn::Pointer(_) => ReleaseAbi::Pointer,
            ReleaseFn::Sized(_) => ReleaseAbi::Sized,
        }
    }

    /// Reserve `size` bytes in guest memory
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the guest allocator traps, returns the
    /// null offset, or returns a region that does not fit in memory
    pub fn request(
        &self,
        mut store: impl AsContextMut<Data = HostState>,
        size: u32,
    ) -> BridgeResult<GuestPtr> {
        let raw = self
            .allocate
            .call(&mut store, size)
            .map_err(|e| BridgeError::allocation(size, format!("allocator trapped: {e}")))?;
        let ptr = GuestPtr::new(raw);

        if ptr.is_null() {
            return Err(BridgeError::allocation(size, "guest allocator returned null"));
        }
        if !self.memory.contains(&store, ptr, size) {
            return Err(BridgeError::allocation(
                size,
                format!(
                    "region at {} exceeds memory bound {}",
                    ptr,
                    self.memory.size(&store)
                ),
            ));
        }

        store
            .as_context_mut()
            .data_mut()
            .ledger
            .record(Lease { ptr, size })?;
        tracing::trace!(pointer = %ptr, size, "leased guest buffer");
        Ok(ptr)
    }

    /// Hand a leased buffer back to the guest allocator
    ///
    /// The lease stays on the ledger if the release call fails, so the leak
    /// remains visible.
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if `ptr` is not a live host lease, or
    /// `AllocationFailure` if the release export traps
    pub fn release(&self, mut store: impl AsContextMut<Data = HostState>, ptr: GuestPtr) -> BridgeResult<()> {
        let lease = store
            .as_context_mut()
            .data()
            .ledger
            .get(ptr)
            .copied()
            .ok_or_else(|| BridgeError::malformed(ptr.offset(), "pointer is not a live host lease"))?;

        let outcome = match &self.release {
            ReleaseFn::Pointer(free) => free.call(&mut store, ptr.offset()),
            ReleaseFn::Sized(free) => free.call(&mut store, (ptr.offset(), lease.size)),
        };
        outcome.map_err(|e| BridgeError::allocation(lease.size, format!("release trapped: {e}")))?;

        store.as_context_mut().data_mut().ledger.remove(ptr);
        tracing::trace!(pointer = %ptr, size = lease.size, "released guest buffer");
        Ok(())
    }

    /// Pass ownership of a leased buffer to the guest
    pub fn transfer(&self, mut store: impl AsContextMut<Data = HostState>, ptr: GuestPtr) {
        if store.as_context_mut().data_mut().ledger.transfer(ptr).is_none() {
            tracing::warn!(pointer = %ptr, "transferred pointer was not a live host lease");
        }
    }

    /// Get the memory view this bridge checks regions against
    #[must_use]
    pub fn memory(&self) -> LinearMemory {
        self.memory
    }
}

fn capture_error(name: &str, err: &wasmtime::Error) -> BridgeError {
    BridgeError::binding(BindingStage::Capture, format!("export '{name}': {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::GuestInstance;
    use crate::testing::{GuestBuilder, GuestCounters};
    use permbridge_core::{BridgeConfig, JsonDataset};
    use std::sync::Arc;

    fn lease(ptr: u32, size: u32) -> Lease {
        Lease {
            ptr: GuestPtr::new(ptr),
            size,
        }
    }

    fn instance(builder: GuestBuilder) -> GuestInstance {
        GuestInstance::from_bytes(
            &builder.build(),
            Arc::new(JsonDataset::new()),
            BridgeConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_lease_overlaps() {
        let l = lease(1000, 100);
        assert!(l.overlaps(900, 1001));
        assert!(l.overlaps(1050, 1150));
        assert!(!l.overlaps(800, 1000));
        assert!(!l.overlaps(1100, 1200));
    }

    #[test]
    fn test_ledger_record_and_remove() {
        let mut ledger = LeaseLedger::new();
        ledger.record(lease(1024, 16)).unwrap();
        ledger.record(lease(1040, 8)).unwrap();
        assert_eq!(ledger.outstanding(), 2);
        assert_eq!(ledger.outstanding_bytes(), 24);

        assert_eq!(ledger.remove(GuestPtr::new(1024)), Some(lease(1024, 16)));
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(ledger.outstanding_bytes(), 8);
        assert_eq!(ledger.allocated(), 2);
        assert_eq!(ledger.released(), 1);
    }

    #[test]
    fn test_ledger_rejects_overlap() {
        let mut ledger = LeaseLedger::new();
        ledger.record(lease(1024, 16)).unwrap();
        assert!(ledger.record(lease(1032, 16)).is_err());
        assert!(ledger.record(lease(1016, 9)).is_err());
        assert!(ledger.record(lease(1016, 8)).is_ok());
    }

    #[test]
    fn test_ledger_transfer() {
        let mut ledger = LeaseLedger::new();
        ledger.record(lease(2048, 5)).unwrap();
        assert!(ledger.transfer(GuestPtr::new(2048)).is_some());
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.transferred(), 1);
        assert_eq!(ledger.released(), 0);
        assert!(ledger.transfer(GuestPtr::new(2048)).is_none());
    }

    #[test]
    fn test_request_and_release() {
        let mut guest = instance(GuestBuilder::new());
        let allocator = guest.codec().allocator().clone();

        let ptr = allocator.request(guest.store_mut(), 32).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(guest.ledger().outstanding(), 1);

        allocator.release(guest.store_mut(), ptr).unwrap();
        assert_eq!(guest.ledger().outstanding(), 0);
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn test_release_unknown_pointer() {
        let mut guest = instance(GuestBuilder::new());
        let allocator = guest.codec().allocator().clone();
        let err = allocator.release(guest.store_mut(), GuestPtr::new(4096)).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedDescriptor { pointer: 4096, .. }));
        assert_eq!(guest.guest_frees(), 0);
    }

    #[test]
    fn test_request_null_is_allocation_failure() {
        let mut guest = instance(GuestBuilder::new().exhausted_allocator());
        let allocator = guest.codec().allocator().clone();
        let err = allocator.request(guest.store_mut(), 8).unwrap_err();
        assert!(matches!(err, BridgeError::AllocationFailure { requested: 8, .. }));
        assert_eq!(guest.ledger().outstanding(), 0);
    }

    #[test]
    fn test_sized_release_passes_length() {
        let mut guest = instance(GuestBuilder::new().sized_free());
        let allocator = guest.codec().allocator().clone();
        assert_eq!(allocator.release_abi(), ReleaseAbi::Sized);

        let ptr = allocator.request(guest.store_mut(), 24).unwrap();
        allocator.release(guest.store_mut(), ptr).unwrap();
        assert_eq!(guest.guest_freed_bytes(), 24);
    }
}
