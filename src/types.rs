//! Native handle and flag types shared across the memory subsystem.

use bitflags::bitflags;

/// Opaque handle to a native buffer object.
///
/// The zero handle is the null handle and never refers to a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    /// Wrap a raw native handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw native handle value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque handle to a native device-memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemoryHandle(u64);

impl DeviceMemoryHandle {
    /// Wrap a raw native handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw native handle value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsageFlags: u32 {
        /// Buffer can be the source of a transfer.
        const TRANSFER_SRC = 1 << 0;
        /// Buffer can be the destination of a transfer.
        const TRANSFER_DST = 1 << 1;
        /// Buffer can back a uniform texel view.
        const UNIFORM_TEXEL = 1 << 2;
        /// Buffer can back a storage texel view.
        const STORAGE_TEXEL = 1 << 3;
        /// Buffer can be used as a uniform buffer.
        const UNIFORM = 1 << 4;
        /// Buffer can be used as a storage buffer.
        const STORAGE = 1 << 5;
        /// Buffer can be used as an index buffer.
        const INDEX = 1 << 6;
        /// Buffer can be used as a vertex buffer.
        const VERTEX = 1 << 7;
        /// Buffer can be used as an indirect argument buffer.
        const INDIRECT = 1 << 8;
    }
}

impl Default for BufferUsageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Property flags of a device memory type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Memory local to the device; fastest for GPU access.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory the host can map.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible without explicit flushes.
        const HOST_COHERENT = 1 << 2;
        /// Memory cached on the host side.
        const HOST_CACHED = 1 << 3;
        /// Memory that may be committed lazily.
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

impl Default for MemoryPropertyFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Memory requirements reported by the device for a native resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Required allocation size in bytes.
    pub size: u64,
    /// Required alignment in bytes; always a power of two.
    pub alignment: u64,
    /// Bitmask of compatible memory type indices.
    pub memory_type_bits: u32,
}
