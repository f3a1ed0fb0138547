//! Guest pointers and string descriptors.
//!
//! A guest pointer is an offset into one instance's linear memory. It is
//! not a host address and means nothing outside the memory that issued it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a length-prefixed descriptor pair
pub const DESCRIPTOR_SIZE: u32 = 8;

/// Offset into guest linear memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuestPtr(u32);

impl GuestPtr {
    /// The null offset, which guest allocators return on exhaustion
    pub const NULL: Self = Self(0);

    /// Create a pointer from a raw offset
    #[must_use]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Get the raw offset
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0
    }

    /// Check if this is the null offset
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Exclusive end of a `len`-byte run starting here, widened so it never wraps
    #[must_use]
    pub const fn end(self, len: u32) -> u64 {
        self.0 as u64 + len as u64
    }

    /// Pointer `delta` bytes further on, if it fits in 32 bits
    #[must_use]
    pub fn checked_add(self, delta: u32) -> Option<Self> {
        self.0.checked_add(delta).map(Self)
    }
}

impl fmt::Display for GuestPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl From<u32> for GuestPtr {
    fn from(offset: u32) -> Self {
        Self(offset)
    }
}

/// A UTF-8 byte run inside guest memory
///
/// On the wire this is two consecutive little-endian `u32` words: the data
/// offset, then the byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringDescriptor {
    /// Start of the byte run
    pub data: GuestPtr,
    /// Length of the byte run
    pub len: u32,
}

impl StringDescriptor {
    /// Create a new descriptor
    #[must_use]
    pub const fn new(data: GuestPtr, len: u32) -> Self {
        Self { data, len }
    }

    /// Exclusive end of the described run
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.data.end(self.len)
    }

    /// Check if the run fits inside a memory of `memory_size` bytes
    #[must_use]
    pub const fn fits_within(&self, memory_size: u64) -> bool {
        self.end() <= memory_size
    }

    /// Encode as the two-word wire form
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; DESCRIPTOR_SIZE as usize] {
        let mut out = [0u8; DESCRIPTOR_SIZE as usize];
        out[..4].copy_from_slice(&self.data.offset().to_le_bytes());
        out[4..].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode from the two-word wire form
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; DESCRIPTOR_SIZE as usize]) -> Self {
        let data = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self::new(GuestPtr::new(data), len)
    }
}
