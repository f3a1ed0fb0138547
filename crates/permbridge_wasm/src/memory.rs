//! Linear memory view and memory limits.
//!
//! The view never caches a slice of guest memory. Every access goes back
//! to the store, so a `memory.grow` inside any guest call cannot leave the
//! host holding a stale buffer.

use permbridge_core::{BridgeError, BridgeResult, DESCRIPTOR_SIZE, GuestPtr, StringDescriptor};
use serde::{Deserialize, Serialize};
use wasmtime::{AsContext, AsContextMut, Memory, StoreLimits, StoreLimitsBuilder};

/// Memory limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum memory in bytes
    pub max_bytes: u64,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Build store limits that cap guest memory growth
    ///
    /// Growth past the cap makes `memory.grow` return -1 instead of trapping,
    /// so guest allocators can report exhaustion the normal way.
    #[must_use]
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimitsBuilder::new()
            .memory_size(usize::try_from(self.max_bytes).unwrap_or(usize::MAX))
            .trap_on_grow_failure(false)
            .build()
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(permbridge_core::config::DEFAULT_MAX_MEMORY_BYTES)
    }
}

/// Host view of a guest's linear memory
#[derive(Debug, Clone, Copy)]
pub struct LinearMemory {
    memory: Memory,
}

impl LinearMemory {
    /// Wrap an exported memory
    #[must_use]
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// Current memory bound in bytes
    #[must_use]
    pub fn size(&self, store: impl AsContext) -> u64 {
        self.memory.data_size(&store) as u64
    }

    /// Check if `len` bytes at `ptr` lie inside the current bound
    #[must_use]
    pub fn contains(&self, store: impl AsContext, ptr: GuestPtr, len: u32) -> bool {
        ptr.end(len) <= self.size(store)
    }

    /// Copy `len` bytes out of guest memory
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if the range runs past the memory bound
    pub fn read(&self, store: impl AsContext, ptr: GuestPtr, len: u32) -> BridgeResult<Vec<u8>> {
        let data = self.memory.data(&store);
        let start = ptr.offset() as usize;
        let end = ptr.end(len);
        if end > data.len() as u64 {
            return Err(BridgeError::malformed(
                ptr.offset(),
                format!(
                    "{} bytes at {} exceed memory bound {}",
                    len,
                    ptr,
                    data.len()
                ),
            ));
        }
        Ok(data[start..end as usize].to_vec())
    }

    /// Read a little-endian `u32`
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if the word runs past the memory bound
    pub fn read_u32(&self, store: impl AsContext, ptr: GuestPtr) -> BridgeResult<u32> {
        let bytes = self.read(store, ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a length-prefixed descriptor pair
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if the pair runs past the memory bound
    pub fn read_descriptor(&self, store: impl AsContext, ptr: GuestPtr) -> BridgeResult<StringDescriptor> {
        let bytes = self.read(store, ptr, DESCRIPTOR_SIZE)?;
        let mut words = [0u8; DESCRIPTOR_SIZE as usize];
        words.copy_from_slice(&bytes);
        Ok(StringDescriptor::from_le_bytes(words))
    }

    /// Length of the NUL-terminated run starting at `ptr`
    ///
    /// Scans at most `limit` bytes when set, and never past the memory bound.
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if no terminator is found in range
    pub fn terminated_len(
        &self,
        store: impl AsContext,
        ptr: GuestPtr,
        limit: Option<u32>,
    ) -> BridgeResult<u32> {
        let data = self.memory.data(&store);
        let start = ptr.offset() as usize;
        if start >= data.len() {
            return Err(BridgeError::malformed(
                ptr.offset(),
                format!("pointer past memory bound {}", data.len()),
            ));
        }

        let mut window = &data[start..];
        if let Some(limit) = limit {
            let cap = (limit as usize).saturating_add(1).min(window.len());
            window = &window[..cap];
        }

        match window.iter().position(|b| *b == 0) {
            Some(len) => u32::try_from(len)
                .map_err(|_| BridgeError::malformed(ptr.offset(), "string longer than 4GB")),
            None => Err(BridgeError::malformed(
                ptr.offset(),
                format!("no terminator within {} bytes", window.len()),
            )),
        }
    }

    /// Copy bytes into guest memory
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the range runs past the memory bound;
    /// nothing is written in that case
    pub fn write(&self, mut store: impl AsContextMut, ptr: GuestPtr, bytes: &[u8]) -> BridgeResult<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| BridgeError::allocation(u32::MAX, "buffer larger than 4GB"))?;
        let data = self.memory.data_mut(&mut store);
        let start = ptr.offset() as usize;
        let end = ptr.end(len);
        if end > data.len() as u64 {
            return Err(BridgeError::allocation(
                len,
                format!("region at {} exceeds memory bound {}", ptr, data.len()),
            ));
        }
        data[start..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Get the underlying wasmtime memory
    #[must_use]
    pub fn inner(&self) -> Memory {
        self.memory
    }
}
