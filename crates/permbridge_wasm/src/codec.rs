//! String codec for both descriptor conventions.
//!
//! Host-to-guest strings are NUL-terminated: the guest parser finds the end
//! itself. Guest-to-host strings arrive as a `(data offset, byte length)`
//! pair, so the host never has to scan memory the guest controls.

use crate::alloc::AllocatorBridge;
use crate::imports::HostState;
use crate::memory::LinearMemory;
use permbridge_core::{BridgeError, BridgeResult, DESCRIPTOR_SIZE, GuestPtr, StringDescriptor};
use wasmtime::{AsContext, AsContextMut};

/// Encodes and decodes strings in guest memory
#[derive(Clone)]
pub struct StringCodec {
    memory: LinearMemory,
    allocator: AllocatorBridge,
    max_string_bytes: Option<u32>,
}

impl StringCodec {
    /// Create a codec over a memory view and allocator
    #[must_use]
    pub fn new(allocator: AllocatorBridge) -> Self {
        Self {
            memory: allocator.memory(),
            allocator,
            max_string_bytes: None,
        }
    }

    /// Cap the scan length for NUL-terminated reads
    #[must_use]
    pub fn with_max_string_bytes(mut self, limit: Option<u32>) -> Self {
        self.max_string_bytes = limit;
        self
    }

    /// Get the allocator bridge
    #[must_use]
    pub fn allocator(&self) -> &AllocatorBridge {
        &self.allocator
    }

    /// Get the memory view
    #[must_use]
    pub fn memory(&self) -> LinearMemory {
        self.memory
    }

    /// Write `value` plus a NUL terminator into a fresh guest buffer
    ///
    /// The buffer is a host lease until released or transferred.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the guest cannot provide the buffer;
    /// nothing is written in that case
    pub fn encode_for_guest(
        &self,
        mut store: impl AsContextMut<Data = HostState>,
        value: &str,
    ) -> BridgeResult<GuestPtr> {
        let size = value
            .len()
            .checked_add(1)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| BridgeError::allocation(u32::MAX, "string larger than 4GB"))?;

        let ptr = self.allocator.request(&mut store, size)?;

        let mut bytes = Vec::with_capacity(size as usize);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        if let Err(e) = self.memory.write(&mut store, ptr, &bytes) {
            self.release_quietly(&mut store, ptr);
            return Err(e);
        }

        tracing::debug!(pointer = %ptr, bytes = size, "encoded string for guest");
        Ok(ptr)
    }

    /// Write `value` without a terminator and describe it
    ///
    /// At least one byte is reserved so empty strings still get a real
    /// offset from the allocator.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the guest cannot provide the buffer
    pub fn encode_bytes(
        &self,
        mut store: impl AsContextMut<Data = HostState>,
        value: &str,
    ) -> BridgeResult<StringDescriptor> {
        let len = u32::try_from(value.len())
            .map_err(|_| BridgeError::allocation(u32::MAX, "string larger than 4GB"))?;
        let ptr = self.allocator.request(&mut store, len.max(1))?;
        if let Err(e) = self.memory.write(&mut store, ptr, value.as_bytes()) {
            self.release_quietly(&mut store, ptr);
            return Err(e);
        }
        Ok(StringDescriptor::new(ptr, len))
    }

    /// Store a descriptor pair in a fresh guest buffer and return its address
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailure` if the guest cannot provide the buffer
    pub fn write_length_prefixed_pair(
        &self,
        mut store: impl AsContextMut<Data = HostState>,
        descriptor: StringDescriptor,
    ) -> BridgeResult<GuestPtr> {
        let ptr = self.allocator.request(&mut store, DESCRIPTOR_SIZE)?;
        if let Err(e) = self.memory.write(&mut store, ptr, &descriptor.to_le_bytes()) {
            self.release_quietly(&mut store, ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Decode the string described by the pair stored at `pointer`
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if the pair or its byte run lies past
    /// the memory bound, `InvalidEncoding` if the bytes are not UTF-8
    pub fn decode_from_guest(&self, store: impl AsContext, pointer: GuestPtr) -> BridgeResult<String> {
        let descriptor = self.memory.read_descriptor(&store, pointer)?;
        let size = self.memory.size(&store);
        if !descriptor.fits_within(size) {
            return Err(BridgeError::malformed(
                pointer.offset(),
                format!(
                    "descriptor {}+{} runs past memory bound {}",
                    descriptor.data, descriptor.len, size
                ),
            ));
        }

        let bytes = self.memory.read(&store, descriptor.data, descriptor.len)?;
        utf8(descriptor.data, bytes)
    }

    /// Decode the NUL-terminated string at `pointer`
    ///
    /// # Errors
    ///
    /// Returns `MalformedDescriptor` if no terminator lies within the memory
    /// bound or scan limit, `InvalidEncoding` if the bytes are not UTF-8
    pub fn decode_terminated(&self, store: impl AsContext, pointer: GuestPtr) -> BridgeResult<String> {
        let len = self
            .memory
            .terminated_len(&store, pointer, self.max_string_bytes)?;
        let bytes = self.memory.read(&store, pointer, len)?;
        utf8(pointer, bytes)
    }

    /// Encode `value`, run `f` with its pointer, then always release it
    ///
    /// A failed release is logged as a leak and never replaces the result
    /// of `f`.
    ///
    /// # Errors
    ///
    /// Returns the encode error or whatever `f` returns
    pub fn with_guest_string<S, R>(
        &self,
        store: &mut S,
        value: &str,
        f: impl FnOnce(&mut S, GuestPtr) -> BridgeResult<R>,
    ) -> BridgeResult<R>
    where
        S: AsContextMut<Data = HostState>,
    {
        let ptr = self.encode_for_guest(&mut *store, value)?;
        let result = f(store, ptr);
        self.release_quietly(&mut *store, ptr);
        result
    }

    fn release_quietly(&self, store: impl AsContextMut<Data = HostState>, ptr: GuestPtr) {
        if let Err(e) = self.allocator.release(store, ptr) {
            tracing::warn!(pointer = %ptr, error = %e, "failed to release guest buffer, leaking it");
        }
    }
}

fn utf8(pointer: GuestPtr, bytes: Vec<u8>) -> BridgeResult<String> {
    String::from_utf8(bytes).map_err(|e| BridgeError::InvalidEncoding {
        pointer: pointer.offset(),
        reason: e.utf8_error().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::GuestInstance;
    use crate::testing::{GuestBuilder, GuestCounters};
    use permbridge_core::{BridgeConfig, JsonDataset};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn instance() -> GuestInstance {
        instance_with(GuestBuilder::new(), BridgeConfig::default())
    }

    fn instance_with(builder: GuestBuilder, config: BridgeConfig) -> GuestInstance {
        GuestInstance::from_bytes(&builder.build(), Arc::new(JsonDataset::new()), config).unwrap()
    }

    fn round_trip(guest: &mut GuestInstance, value: &str) -> String {
        let codec = guest.codec().clone();
        let desc = codec.encode_bytes(guest.store_mut(), value).unwrap();
        let pair = codec.write_length_prefixed_pair(guest.store_mut(), desc).unwrap();
        let decoded = codec.decode_from_guest(guest.store_mut(), pair).unwrap();
        codec.allocator().release(guest.store_mut(), pair).unwrap();
        codec.allocator().release(guest.store_mut(), desc.data).unwrap();
        decoded
    }

    #[test]
    fn test_encode_for_guest_is_terminated() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let ptr = codec.encode_for_guest(guest.store_mut(), "edit").unwrap();

        let bytes = codec.memory().read(guest.store_mut(), ptr, 5).unwrap();
        assert_eq!(bytes, b"edit\0");
        assert_eq!(codec.decode_terminated(guest.store_mut(), ptr).unwrap(), "edit");
        assert_eq!(guest.ledger().outstanding_bytes(), 5);
    }

    #[test]
    fn test_encode_empty_string() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let ptr = codec.encode_for_guest(guest.store_mut(), "").unwrap();
        assert_eq!(codec.decode_terminated(guest.store_mut(), ptr).unwrap(), "");
    }

    #[test]
    fn test_encode_exhausted_allocator() {
        let mut guest = instance_with(GuestBuilder::new().exhausted_allocator(), BridgeConfig::default());
        let codec = guest.codec().clone();
        let err = codec.encode_for_guest(guest.store_mut(), "edit").unwrap_err();
        assert!(matches!(err, BridgeError::AllocationFailure { requested: 5, .. }));
        assert_eq!(guest.ledger().outstanding(), 0);
    }

    #[test]
    fn test_encode_past_memory_cap() {
        let config = BridgeConfig::default().with_max_memory_bytes(65536);
        let mut guest = instance_with(GuestBuilder::new(), config);
        let codec = guest.codec().clone();
        let big = "x".repeat(100_000);
        let err = codec.encode_for_guest(guest.store_mut(), &big).unwrap_err();
        assert!(matches!(err, BridgeError::AllocationFailure { .. }));
    }

    #[test]
    fn test_encode_grows_memory() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let before = codec.memory().size(guest.store_mut());

        let big = "y".repeat(200_000);
        let ptr = codec.encode_for_guest(guest.store_mut(), &big).unwrap();
        assert!(codec.memory().size(guest.store_mut()) > before);
        assert_eq!(codec.decode_terminated(guest.store_mut(), ptr).unwrap(), big);
    }

    #[test]
    fn test_round_trip_non_ascii() {
        let mut guest = instance();
        assert_eq!(round_trip(&mut guest, "héllo wörld ✓ 🦀"), "héllo wörld ✓ 🦀");
        assert_eq!(round_trip(&mut guest, ""), "");
        assert_eq!(guest.ledger().outstanding(), 0);
    }

    #[test]
    fn test_decode_length_past_bound() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let size = codec.memory().size(guest.store_mut()) as u32;
        let bogus = StringDescriptor::new(GuestPtr::new(size - 4), 16);
        let pair = codec.write_length_prefixed_pair(guest.store_mut(), bogus).unwrap();

        let err = codec.decode_from_guest(guest.store_mut(), pair).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_decode_pair_past_bound() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let size = codec.memory().size(guest.store_mut()) as u32;
        let err = codec
            .decode_from_guest(guest.store_mut(), GuestPtr::new(size - 4))
            .unwrap_err();
        assert!(matches!(err, BridgeError::MalformedDescriptor { .. }));
    }

    #[test]
    fn test_decode_length_overflowing_u32() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let bogus = StringDescriptor::new(GuestPtr::new(u32::MAX - 2), u32::MAX);
        let pair = codec.write_length_prefixed_pair(guest.store_mut(), bogus).unwrap();
        assert!(matches!(
            codec.decode_from_guest(guest.store_mut(), pair),
            Err(BridgeError::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let data = codec.allocator().request(guest.store_mut(), 2).unwrap();
        codec.memory().write(guest.store_mut(), data, &[0xC3, 0x28]).unwrap();
        let pair = codec
            .write_length_prefixed_pair(guest.store_mut(), StringDescriptor::new(data, 2))
            .unwrap();

        let err = codec.decode_from_guest(guest.store_mut(), pair).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEncoding { .. }));
    }

    #[test]
    fn test_decode_terminated_scan_limit() {
        let config = BridgeConfig::default().with_max_string_bytes(3);
        let mut guest = instance_with(GuestBuilder::new(), config);
        let codec = guest.codec().clone();
        let ptr = codec.encode_for_guest(guest.store_mut(), "edit").unwrap();
        assert!(matches!(
            codec.decode_terminated(guest.store_mut(), ptr),
            Err(BridgeError::MalformedDescriptor { .. })
        ));
    }

    #[test]
    fn test_with_guest_string_releases_on_success() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let seen = codec
            .with_guest_string(guest.store_mut(), "view", |store, ptr| {
                codec.decode_terminated(&mut *store, ptr)
            })
            .unwrap();
        assert_eq!(seen, "view");
        assert_eq!(guest.ledger().outstanding(), 0);
        assert_eq!(guest.guest_frees(), 1);
    }

    #[test]
    fn test_with_guest_string_releases_on_error() {
        let mut guest = instance();
        let codec = guest.codec().clone();
        let result: BridgeResult<()> = codec.with_guest_string(guest.store_mut(), "view", |_, ptr| {
            Err(BridgeError::malformed(ptr.offset(), "forced"))
        });
        assert!(result.is_err());
        assert_eq!(guest.ledger().outstanding(), 0);
        assert_eq!(guest.guest_frees(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_pair_round_trip(value in any::<String>()) {
            let mut guest = instance();
            prop_assert_eq!(round_trip(&mut guest, &value), value);
        }

        #[test]
        fn prop_terminator_at_byte_length(value in "[^\\x00]*") {
            let mut guest = instance();
            let codec = guest.codec().clone();
            let ptr = codec.encode_for_guest(guest.store_mut(), &value).unwrap();
            let len = codec.memory().terminated_len(guest.store_mut(), ptr, None).unwrap();
            prop_assert_eq!(len as usize, value.len());
            prop_assert_eq!(codec.decode_terminated(guest.store_mut(), ptr).unwrap(), value);
        }
    }
}
