//! Device/context seam for the memory subsystem.
//!
//! [`DeviceBackend`] exposes exactly the native primitives the memory types
//! consume: buffer creation and destruction, requirement queries, the
//! one-shot buffer-to-memory bind, and raw device-memory
//! allocate/free/map/unmap together with the device's memory-type table.
//!
//! # Available backends
//!
//! - [`DummyDevice`]: heap-backed, always available; used for development
//!   and for running the test suite without GPU hardware
//! - `VulkanDevice` (feature `vulkan-backend`): native Vulkan via ash

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::DummyDevice;
#[cfg(feature = "vulkan-backend")]
pub use vulkan::VulkanDevice;

use std::ptr::NonNull;

use crate::error::MemoryError;
use crate::types::{
    BufferHandle, BufferUsageFlags, DeviceMemoryHandle, MemoryPropertyFlags, MemoryRequirements,
};

/// Open connection to the graphics API.
///
/// Handles are opaque; a handle returned by one device must only be passed
/// back to the same device.
pub trait DeviceBackend: Send + Sync + 'static {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Create a native buffer of `size` bytes with exclusive sharing mode.
    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsageFlags,
    ) -> Result<BufferHandle, MemoryError>;

    /// Destroy a native buffer previously created by this device.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Query size, alignment and compatible memory types for a buffer.
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements;

    /// Bind `buffer` to `memory` at `offset`.
    ///
    /// A buffer must be bound at most once; callers enforce the one-shot
    /// protocol before issuing this call.
    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemoryHandle,
        offset: u64,
    ) -> Result<(), MemoryError>;

    /// Allocate `size` bytes of device memory of the given type index.
    fn allocate_memory(
        &self,
        size: u64,
        type_index: u32,
    ) -> Result<DeviceMemoryHandle, MemoryError>;

    /// Release a device-memory allocation.
    fn free_memory(&self, memory: DeviceMemoryHandle);

    /// Map a whole device-memory allocation for CPU access.
    fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<NonNull<u8>, MemoryError>;

    /// Unmap a previously mapped allocation.
    fn unmap_memory(&self, memory: DeviceMemoryHandle);

    /// Property flags of every memory type exposed by the device, indexed by
    /// memory type index.
    fn memory_types(&self) -> Vec<MemoryPropertyFlags>;
}
