//! # Vulkan Memory
//!
//! Reference-counted Vulkan buffer and device memory for media pipelines.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`buffer_memory`] - buffer resources with the one-shot bind protocol
//! - [`device_memory`] - allocated, typed regions of device memory
//! - [`memory`] - the generic memory abstraction both plug into
//! - [`device`] - the device seam: native Vulkan via ash, or a heap-backed
//!   dummy device for running without GPU hardware
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vulkan_memory::{buffer_memory, BufferUsageFlags, MemoryPropertyFlags};
//! use vulkan_memory::device::{DeviceBackend, VulkanDevice};
//! use vulkan_memory::memory::MapFlags;
//!
//! buffer_memory::init_once();
//! let device: Arc<dyn DeviceBackend> = Arc::new(VulkanDevice::new()?);
//!
//! let mem = buffer_memory::alloc_and_bind(
//!     &device,
//!     4096,
//!     BufferUsageFlags::VERTEX,
//!     MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
//! )?;
//!
//! let mut map = mem.map(MapFlags::WRITE).expect("bound and host-visible");
//! map.as_mut_slice().fill(0);
//! mem.unmap(map);
//! ```

pub mod buffer_memory;
pub mod device;
pub mod device_memory;
pub mod error;
pub mod memory;
pub mod types;

// Re-export main types for convenience
pub use buffer_memory::{
    VulkanBufferMemory, VulkanBufferMemoryAllocator, BUFFER_MEMORY_ALLOCATOR_NAME,
};
pub use device::{DeviceBackend, DummyDevice};
#[cfg(feature = "vulkan-backend")]
pub use device::VulkanDevice;
pub use device_memory::{
    find_memory_type_index, VulkanMemory, VulkanMemoryAllocator, MEMORY_ALLOCATOR_NAME,
};
pub use error::MemoryError;
pub use memory::{
    AllocationParams, MapFlags, MapInfo, MemoryAllocator, MemoryFlags, MemoryHeader, MemoryObject,
};
pub use types::{
    BufferHandle, BufferUsageFlags, DeviceMemoryHandle, MemoryPropertyFlags, MemoryRequirements,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_once_registers_allocators() {
        buffer_memory::init_once();
        assert!(memory::registry::find(BUFFER_MEMORY_ALLOCATOR_NAME).is_some());
        assert!(memory::registry::find(MEMORY_ALLOCATOR_NAME).is_some());
    }
}
