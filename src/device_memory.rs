//! Device-memory regions.
//!
//! A [`VulkanMemory`] is an allocated, typed block of device memory that
//! buffer resources bind against. Regions are reference counted
//! independently of the resources bound into them: binding takes its own
//! reference, so a region outlives every resource bound into it even when
//! the caller drops its handle.
//!
//! Mapping requires the region's memory type to be host-visible. Nested
//! maps are counted; the native mapping is created on the first map and
//! released when the count returns to zero.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::device::DeviceBackend;
use crate::error::MemoryError;
use crate::memory::{
    registry, AllocationParams, MapInfo, MemoryAllocator, MemoryHeader, MemoryObject,
};
use crate::types::{DeviceMemoryHandle, MemoryPropertyFlags};

/// Registered name of the device-memory allocator.
pub const MEMORY_ALLOCATOR_NAME: &str = "VulkanMemory";

static ALLOCATOR: OnceLock<Arc<VulkanMemoryAllocator>> = OnceLock::new();

fn allocator() -> Arc<VulkanMemoryAllocator> {
    ALLOCATOR
        .get_or_init(|| {
            let allocator = Arc::new(VulkanMemoryAllocator);
            registry::register(allocator.clone());
            allocator
        })
        .clone()
}

/// Ensure the device-memory allocator is constructed and registered.
///
/// Idempotent and safe to call from any number of threads concurrently.
pub fn init_once() {
    let _ = allocator();
}

/// Find the lowest memory type index compatible with `type_bits` whose
/// property flags contain `properties`.
pub fn find_memory_type_index(
    device: &Arc<dyn DeviceBackend>,
    type_bits: u32,
    properties: MemoryPropertyFlags,
) -> Option<u32> {
    for (index, flags) in device.memory_types().iter().enumerate().take(32) {
        if type_bits & (1 << index) != 0 && flags.contains(properties) {
            return Some(index as u32);
        }
    }
    None
}

#[derive(Default)]
struct MapState {
    count: u32,
    base: Option<NonNull<u8>>,
}

/// An allocated, typed region of device memory.
pub struct VulkanMemory {
    mem: MemoryHeader,
    device: Arc<dyn DeviceBackend>,
    memory: DeviceMemoryHandle,
    type_index: u32,
    properties: MemoryPropertyFlags,
    /// Offset within the allocation at which resources are bound.
    vk_offset: u64,
    map: Mutex<MapState>,
}

// The raw mapped base pointer is only stored and handed out under the map
// lock; the allocation it points into lives as long as `self`.
unsafe impl Send for VulkanMemory {}
unsafe impl Sync for VulkanMemory {}

impl VulkanMemory {
    /// Allocate a region of `size` usable bytes from the given memory type.
    ///
    /// The property flags are taken from the device's memory-type table for
    /// `type_index`.
    pub fn alloc(
        device: &Arc<dyn DeviceBackend>,
        type_index: u32,
        params: &AllocationParams,
        size: u64,
    ) -> Result<Arc<Self>, MemoryError> {
        let types = device.memory_types();
        let properties = *types.get(type_index as usize).ok_or_else(|| {
            MemoryError::InvalidParameter(format!(
                "memory type index {type_index} out of range ({} types)",
                types.len()
            ))
        })?;

        let mem = MemoryHeader::new(allocator(), params, size);
        let vk_offset = (mem.offset() + params.align) & !params.align;
        let memory = device.allocate_memory(mem.maxsize(), type_index)?;

        log::debug!(
            "new Vulkan device memory {:?} size:{} type:{} properties:{:?}",
            memory,
            mem.maxsize(),
            type_index,
            properties
        );

        Ok(Arc::new(Self {
            mem,
            device: device.clone(),
            memory,
            type_index,
            properties,
            vk_offset,
            map: Mutex::new(MapState::default()),
        }))
    }

    /// Native allocation handle.
    pub fn handle(&self) -> DeviceMemoryHandle {
        self.memory
    }

    /// Memory type index the region was allocated from.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Property flags of the region's memory type.
    pub fn properties(&self) -> MemoryPropertyFlags {
        self.properties
    }

    /// Offset within the allocation at which resources are bound.
    pub fn vk_offset(&self) -> u64 {
        self.vk_offset
    }

    /// Usable size in bytes.
    pub fn size(&self) -> u64 {
        self.mem.size()
    }

    /// Total capacity of the backing allocation in bytes.
    pub fn maxsize(&self) -> u64 {
        self.mem.maxsize()
    }

    /// Alignment mask of the region.
    pub fn align(&self) -> u64 {
        self.mem.align()
    }

    fn map_locked(&self) -> Option<NonNull<u8>> {
        if !self.properties.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            log::debug!("device memory {:?} is not host-visible", self.memory);
            return None;
        }

        let mut state = self.map.lock();
        if state.count == 0 {
            match self.device.map_memory(self.memory) {
                Ok(base) => state.base = Some(base),
                Err(e) => {
                    log::error!("failed to map device memory {:?}: {e}", self.memory);
                    return None;
                }
            }
        }
        state.count += 1;

        state
            .base
            .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(self.mem.offset() as usize)) })
    }

    fn unmap_locked(&self) {
        let mut state = self.map.lock();
        match state.count {
            0 => log::warn!(
                "unmap of device memory {:?} with no active mapping",
                self.memory
            ),
            1 => {
                state.count = 0;
                state.base = None;
                self.device.unmap_memory(self.memory);
            }
            _ => state.count -= 1,
        }
    }
}

impl MemoryObject for VulkanMemory {
    fn header(&self) -> &MemoryHeader {
        &self.mem
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl std::fmt::Debug for VulkanMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanMemory")
            .field("memory", &self.memory)
            .field("type_index", &self.type_index)
            .field("properties", &self.properties)
            .field("size", &self.mem.size())
            .finish_non_exhaustive()
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        let allocator = self.mem.allocator().clone();
        allocator.free(self);
    }
}

/// Allocator identity and dispatch target for [`VulkanMemory`].
pub struct VulkanMemoryAllocator;

impl MemoryAllocator for VulkanMemoryAllocator {
    fn mem_type(&self) -> &'static str {
        MEMORY_ALLOCATOR_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn alloc(
        &self,
        _size: u64,
        _params: &AllocationParams,
    ) -> Result<Arc<dyn MemoryObject>, MemoryError> {
        log::error!(
            "device memory cannot be allocated through the generic interface; \
             use VulkanMemory::alloc"
        );
        Err(MemoryError::Unsupported(
            "use VulkanMemory::alloc".to_string(),
        ))
    }

    fn free(&self, mem: &mut dyn MemoryObject) {
        let Some(mem) = mem.as_any_mut().downcast_mut::<VulkanMemory>() else {
            log::error!("free dispatched with a foreign memory object");
            return;
        };

        let state = mem.map.get_mut();
        if state.count > 0 {
            log::warn!(
                "freeing device memory {:?} with {} active mappings",
                mem.memory,
                state.count
            );
            mem.device.unmap_memory(mem.memory);
        }

        log::trace!("freeing device memory {:?}", mem.memory);
        mem.device.free_memory(mem.memory);
    }

    fn map_full(
        &self,
        mem: &dyn MemoryObject,
        _info: &mut MapInfo,
        _size: u64,
    ) -> Option<NonNull<u8>> {
        mem.as_any().downcast_ref::<VulkanMemory>()?.map_locked()
    }

    fn unmap_full(&self, mem: &dyn MemoryObject, _info: &mut MapInfo) {
        if let Some(mem) = mem.as_any().downcast_ref::<VulkanMemory>() {
            mem.unmap_locked();
        }
    }

    fn copy(
        &self,
        _mem: &dyn MemoryObject,
        _offset: i64,
        _size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>> {
        log::trace!("copy is not supported for device memory");
        None
    }

    fn share(
        &self,
        _mem: &dyn MemoryObject,
        _offset: i64,
        _size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>> {
        log::trace!("share is not supported for device memory");
        None
    }

    fn is_span(&self, _mem1: &dyn MemoryObject, _mem2: &dyn MemoryObject) -> Option<u64> {
        None
    }
}

/// Check whether a memory object is a device-memory region.
pub fn is_vulkan_memory(mem: &dyn MemoryObject) -> bool {
    mem.header().allocator().as_any().is::<VulkanMemoryAllocator>()
}
