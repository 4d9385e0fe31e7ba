//! Vulkan buffer memory.
//!
//! [`VulkanBufferMemory`] wraps a native buffer handle and participates in
//! the generic memory abstraction. A buffer binds to a [`VulkanMemory`]
//! region at most once for its whole lifetime: once a buffer is bound to a
//! region of a memory object, it must not be rebound or unbound. Mapping is
//! forwarded to the bound region, so only a bound buffer maps.
//!
//! Two ownership modes exist. Buffers made by [`alloc`] or
//! [`alloc_and_bind`] own their native handle and destroy it at teardown;
//! buffers made by [`wrapped`] borrow a caller-owned handle, are never bound
//! and never mappable, and leave handle destruction to the caller.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::device::DeviceBackend;
use crate::device_memory::{self, find_memory_type_index, VulkanMemory};
use crate::error::MemoryError;
use crate::memory::{
    self, registry, AllocationParams, MapFlags, MapInfo, MemoryAllocator, MemoryFlags,
    MemoryHeader, MemoryObject,
};
use crate::types::{BufferHandle, BufferUsageFlags, MemoryPropertyFlags, MemoryRequirements};

/// Registered name of the buffer-memory allocator.
pub const BUFFER_MEMORY_ALLOCATOR_NAME: &str = "VulkanBuffer";

/// Callback run exactly once when a buffer memory is torn down.
pub type ReleaseFunc = Box<dyn FnOnce() + Send>;

static ALLOCATOR: OnceLock<Arc<VulkanBufferMemoryAllocator>> = OnceLock::new();

fn allocator() -> Arc<VulkanBufferMemoryAllocator> {
    ALLOCATOR
        .get_or_init(|| {
            let allocator = Arc::new(VulkanBufferMemoryAllocator);
            registry::register(allocator.clone());
            allocator
        })
        .clone()
}

/// Ensure the buffer-memory allocator is constructed and registered.
///
/// Idempotent and safe to call from any number of threads concurrently;
/// exactly one caller performs the registration and every caller observes
/// the registered singleton afterwards.
pub fn init_once() {
    device_memory::init_once();
    let _ = allocator();
}

/// Memory object backed by a native Vulkan buffer.
pub struct VulkanBufferMemory {
    mem: MemoryHeader,
    device: Arc<dyn DeviceBackend>,
    buffer: BufferHandle,
    requirements: MemoryRequirements,
    usage: BufferUsageFlags,
    wrapped: bool,
    /// Bound region. The lock guards the one-shot bind transition and keeps
    /// bind, map and unmap mutually exclusive.
    bind: Mutex<Option<Arc<VulkanMemory>>>,
    release: Mutex<Option<ReleaseFunc>>,
}

impl VulkanBufferMemory {
    fn new_alloc(
        device: &Arc<dyn DeviceBackend>,
        size: u64,
        usage: BufferUsageFlags,
    ) -> Result<Arc<Self>, MemoryError> {
        let buffer = device.create_buffer(size, usage).map_err(|e| {
            log::error!("failed to create buffer: {e}");
            e
        })?;

        // The queried requirements, not the requested size, are
        // authoritative for the resource's extent.
        let requirements = device.buffer_memory_requirements(buffer);
        let params = AllocationParams {
            align: requirements.alignment.saturating_sub(1),
            ..Default::default()
        };

        log::debug!(
            "new Vulkan buffer memory {:?} size:{} align:{}",
            buffer,
            requirements.size,
            requirements.alignment
        );

        Ok(Arc::new(Self {
            mem: MemoryHeader::new(allocator(), &params, requirements.size),
            device: device.clone(),
            buffer,
            requirements,
            usage,
            wrapped: false,
            bind: Mutex::new(None),
            release: Mutex::new(None),
        }))
    }

    fn new_wrapped(
        device: &Arc<dyn DeviceBackend>,
        buffer: BufferHandle,
        usage: BufferUsageFlags,
        release: Option<ReleaseFunc>,
    ) -> Arc<Self> {
        let requirements = device.buffer_memory_requirements(buffer);

        // No device memory will ever be bound, so the wrapper cannot map.
        let params = AllocationParams {
            flags: MemoryFlags::NOT_MAPPABLE | MemoryFlags::READONLY,
            align: requirements.alignment.saturating_sub(1),
            ..Default::default()
        };

        log::debug!(
            "new wrapped Vulkan buffer memory {:?} size:{}",
            buffer,
            requirements.size
        );

        Arc::new(Self {
            mem: MemoryHeader::new(allocator(), &params, requirements.size),
            device: device.clone(),
            buffer,
            requirements,
            usage,
            wrapped: true,
            bind: Mutex::new(None),
            release: Mutex::new(release),
        })
    }

    /// Native buffer handle.
    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    /// Memory requirements queried at construction.
    pub fn requirements(&self) -> &MemoryRequirements {
        &self.requirements
    }

    /// Usage flags the buffer was created with.
    pub fn usage(&self) -> BufferUsageFlags {
        self.usage
    }

    /// Whether the native handle is owned by the caller.
    pub fn is_wrapped(&self) -> bool {
        self.wrapped
    }

    /// Usable size in bytes.
    pub fn size(&self) -> u64 {
        self.mem.size()
    }

    /// Currently bound region, if any.
    pub fn bound_memory(&self) -> Option<Arc<VulkanMemory>> {
        self.bind.lock().clone()
    }

    /// Attach a callback to run exactly once at teardown.
    ///
    /// The callback fires after the native handle has been released and
    /// before the device reference is dropped. At most one callback is held;
    /// a second call replaces the first without running it.
    pub fn set_release(&self, release: ReleaseFunc) {
        *self.release.lock() = Some(release);
    }

    /// Map the buffer for CPU access through its bound region.
    ///
    /// Fails for unbound and wrapped buffers.
    pub fn map(&self, flags: MapFlags) -> Option<MapInfo> {
        memory::map(self, flags)
    }

    /// Unmap a mapping returned by [`map`](Self::map).
    pub fn unmap(&self, info: MapInfo) {
        memory::unmap(self, info);
    }
}

impl MemoryObject for VulkanBufferMemory {
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

impl std::fmt::Debug for VulkanBufferMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBufferMemory")
            .field("buffer", &self.buffer)
            .field("requirements", &self.requirements)
            .field("usage", &self.usage)
            .field("wrapped", &self.wrapped)
            .finish_non_exhaustive()
    }
}

impl Drop for VulkanBufferMemory {
    fn drop(&mut self) {
        let allocator = self.mem.allocator().clone();
        allocator.free(self);
    }
}

/// Allocate a new unbound buffer memory.
///
/// The caller is responsible for allocating a compatible [`VulkanMemory`]
/// region and binding it with [`bind`]; [`alloc_and_bind`] does both in one
/// call.
pub fn alloc(
    device: &Arc<dyn DeviceBackend>,
    size: u64,
    usage: BufferUsageFlags,
) -> Result<Arc<VulkanBufferMemory>, MemoryError> {
    VulkanBufferMemory::new_alloc(device, size, usage)
}

/// Allocate a buffer memory together with a compatible device-memory region
/// and bind the two.
///
/// Any failure after buffer creation tears the partially constructed state
/// down before returning.
pub fn alloc_and_bind(
    device: &Arc<dyn DeviceBackend>,
    size: u64,
    usage: BufferUsageFlags,
    properties: MemoryPropertyFlags,
) -> Result<Arc<VulkanBufferMemory>, MemoryError> {
    let mem = alloc(device, size, usage)?;

    let Some(type_index) =
        find_memory_type_index(device, mem.requirements.memory_type_bits, properties)
    else {
        log::error!(
            "no memory type matches bits {:#x} with properties {:?}",
            mem.requirements.memory_type_bits,
            properties
        );
        return Err(MemoryError::NoSuitableMemoryType(format!(
            "bits {:#x}, properties {:?}",
            mem.requirements.memory_type_bits, properties
        )));
    };

    // Alignment is a power of two; the region carries it as a mask.
    let params = AllocationParams {
        align: mem.requirements.alignment.saturating_sub(1),
        ..Default::default()
    };
    let dev_mem = VulkanMemory::alloc(device, type_index, &params, mem.requirements.size)?;

    if !bind(&mem, &dev_mem) {
        return Err(MemoryError::Internal(
            "failed to bind freshly allocated buffer memory".to_string(),
        ));
    }

    // The local region reference is dropped here; bind retained its own.
    Ok(mem)
}

/// Wrap a caller-owned native buffer without taking ownership.
///
/// The returned memory is read-only and not mappable. `release` runs exactly
/// once when the last reference is dropped, after the wrapper has let go of
/// the handle.
pub fn wrapped(
    device: &Arc<dyn DeviceBackend>,
    buffer: BufferHandle,
    usage: BufferUsageFlags,
    release: Option<ReleaseFunc>,
) -> Arc<VulkanBufferMemory> {
    VulkanBufferMemory::new_wrapped(device, buffer, usage, release)
}

/// Bind `mem` to `memory`.
///
/// A buffer binds at most once. Rebinding to the same region is an
/// idempotent success; rebinding to a different region is refused. Returns
/// `false` without touching any state when the buffer would overrun the
/// region or the native bind call fails.
pub fn bind(mem: &Arc<VulkanBufferMemory>, memory: &Arc<VulkanMemory>) -> bool {
    // Would the buffer overrun the region's capacity?
    if memory.vk_offset() + mem.requirements.size > memory.maxsize() {
        log::error!(
            "binding would overrun the region: offset {} + size {} > maxsize {}",
            memory.vk_offset(),
            mem.requirements.size,
            memory.maxsize()
        );
        return false;
    }

    let mut bound = mem.bind.lock();

    // "Once a buffer or image is bound to a region of a memory object, it
    // must not be rebound or unbound."
    if let Some(existing) = bound.as_ref() {
        if Arc::ptr_eq(existing, memory) {
            return true;
        }
        log::error!(
            "buffer {:?} is already bound to a different region",
            mem.buffer
        );
        return false;
    }

    if let Err(e) = mem
        .device
        .bind_buffer_memory(mem.buffer, memory.handle(), memory.vk_offset())
    {
        log::error!("failed to bind buffer {:?}: {e}", mem.buffer);
        return false;
    }

    *bound = Some(memory.clone());
    true
}

/// Check whether a memory object is a Vulkan buffer memory.
pub fn is_buffer_memory(mem: &dyn MemoryObject) -> bool {
    mem.header()
        .allocator()
        .as_any()
        .is::<VulkanBufferMemoryAllocator>()
}

/// Allocator identity and dispatch target for [`VulkanBufferMemory`].
pub struct VulkanBufferMemoryAllocator;

impl MemoryAllocator for VulkanBufferMemoryAllocator {
    fn mem_type(&self) -> &'static str {
        BUFFER_MEMORY_ALLOCATOR_NAME
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
            "buffer memory cannot be allocated through the generic interface; \
             use the typed buffer_memory factory functions"
        );
        Err(MemoryError::Unsupported(
            "use the typed buffer_memory factory functions".to_string(),
        ))
    }

    fn free(&self, mem: &mut dyn MemoryObject) {
        let Some(mem) = mem.as_any_mut().downcast_mut::<VulkanBufferMemory>() else {
            log::error!("free dispatched with a foreign memory object");
            return;
        };

        log::trace!("freeing buffer memory {:?}", mem.buffer);

        if !mem.wrapped && !mem.buffer.is_null() {
            mem.device.destroy_buffer(mem.buffer);
        }

        // The region's own refcount governs when it is released.
        *mem.bind.get_mut() = None;

        if let Some(release) = mem.release.get_mut().take() {
            release();
        }
    }

    fn map_full(
        &self,
        mem: &dyn MemoryObject,
        info: &mut MapInfo,
        _size: u64,
    ) -> Option<NonNull<u8>> {
        let mem = mem.as_any().downcast_ref::<VulkanBufferMemory>()?;

        let bound = mem.bind.lock();
        let Some(region) = bound.as_ref() else {
            log::debug!("buffer {:?} has no bound memory to map", mem.buffer);
            return None;
        };

        // The delegated map happens under the lock so bind, map and unmap
        // stay mutually exclusive.
        let backing = memory::map(region.as_ref(), info.flags())?;
        let data = NonNull::new(backing.data())?;
        info.set_backing(backing);
        Some(data)
    }

    fn unmap_full(&self, mem: &dyn MemoryObject, info: &mut MapInfo) {
        let Some(mem) = mem.as_any().downcast_ref::<VulkanBufferMemory>() else {
            return;
        };

        let bound = mem.bind.lock();
        if let (Some(region), Some(backing)) = (bound.as_ref(), info.take_backing()) {
            memory::unmap(region.as_ref(), backing);
        }
    }

    fn copy(
        &self,
        _mem: &dyn MemoryObject,
        _offset: i64,
        _size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>> {
        log::trace!("copy is not supported for buffer memory");
        None
    }

    fn share(
        &self,
        _mem: &dyn MemoryObject,
        _offset: i64,
        _size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>> {
        log::trace!("share is not supported for buffer memory");
        None
    }

    fn is_span(&self, _mem1: &dyn MemoryObject, _mem2: &dyn MemoryObject) -> Option<u64> {
        None
    }
}
