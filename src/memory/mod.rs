//! Generic reference-counted memory abstraction.
//!
//! Every memory object in this crate is an `Arc`-owned struct implementing
//! [`MemoryObject`]. Each object carries a [`MemoryHeader`] pointing at the
//! [`MemoryAllocator`] that produced it; the allocator is the dispatch target
//! for mapping and teardown, and its concrete type doubles as the identity
//! used to answer "is this memory one of ours".
//!
//! Allocator types register a process-wide singleton under a fixed name in
//! [`registry`], so pipeline code can look allocators up without linking
//! against the concrete type.

pub mod registry;

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::MemoryError;

bitflags! {
    /// Behavioral flags carried by a memory object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// The memory must not be written through a mapping.
        const READONLY = 1 << 0;
        /// The memory cannot be mapped for CPU access at all.
        const NOT_MAPPABLE = 1 << 1;
        /// The prefix region is zero-initialized.
        const ZERO_PREFIXED = 1 << 2;
        /// The padding region is zero-initialized.
        const ZERO_PADDED = 1 << 3;
    }
}

impl Default for MemoryFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Access flags for a map operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Map for reading.
        const READ = 1 << 0;
        /// Map for writing.
        const WRITE = 1 << 1;
        /// Map for reading and writing.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Parameters controlling how a memory object is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationParams {
    /// Flags for the resulting memory object.
    pub flags: MemoryFlags,
    /// Alignment mask; `alignment - 1` for power-of-two alignments.
    pub align: u64,
    /// Bytes reserved before the usable data.
    pub prefix: u64,
    /// Bytes reserved after the usable data.
    pub padding: u64,
}

/// Common header shared by every memory object.
///
/// The header is immutable after construction; `size` and `align` are the
/// authoritative values for the object's usable extent.
pub struct MemoryHeader {
    allocator: Arc<dyn MemoryAllocator>,
    flags: MemoryFlags,
    align: u64,
    offset: u64,
    size: u64,
    maxsize: u64,
}

impl MemoryHeader {
    /// Initialize a header from allocation parameters and a usable size.
    ///
    /// The backing extent reserves room for the prefix, the padding and the
    /// alignment slack on top of the usable size.
    pub fn new(allocator: Arc<dyn MemoryAllocator>, params: &AllocationParams, size: u64) -> Self {
        Self {
            allocator,
            flags: params.flags,
            align: params.align,
            offset: params.prefix,
            size,
            maxsize: size + params.prefix + params.padding + params.align,
        }
    }

    /// Allocator that produced this memory object.
    pub fn allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    /// Behavioral flags.
    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    /// Alignment mask of the usable data.
    pub fn align(&self) -> u64 {
        self.align
    }

    /// Offset of the usable data inside the backing extent.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Usable size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Total backing extent in bytes.
    pub fn maxsize(&self) -> u64 {
        self.maxsize
    }
}

impl std::fmt::Debug for MemoryHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHeader")
            .field("mem_type", &self.allocator.mem_type())
            .field("flags", &self.flags)
            .field("align", &self.align)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("maxsize", &self.maxsize)
            .finish()
    }
}

/// A reference-counted memory object produced by a [`MemoryAllocator`].
pub trait MemoryObject: Send + Sync + 'static {
    /// The common memory header.
    fn header(&self) -> &MemoryHeader;

    /// Downcast access to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast access to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// An active CPU mapping of a memory object.
///
/// Returned by [`map`]; must be handed back to [`unmap`] on the same memory
/// object. The address stays valid until the mapping is unmapped.
pub struct MapInfo {
    data: NonNull<u8>,
    size: u64,
    flags: MapFlags,
    /// Allocator-private state for delegated mappings.
    backing: Option<Box<MapInfo>>,
}

impl MapInfo {
    fn new(flags: MapFlags) -> Self {
        Self {
            data: NonNull::dangling(),
            size: 0,
            flags,
            backing: None,
        }
    }

    /// Mapped address.
    pub fn data(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Access flags the mapping was requested with.
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// View the mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.size as usize) }
    }

    /// Mutably view the mapped bytes.
    ///
    /// Only meaningful for mappings requested with [`MapFlags::WRITE`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.size as usize) }
    }

    /// Stash a delegated mapping inside this one.
    ///
    /// Used by allocators that forward mapping to another memory object and
    /// need the inner [`MapInfo`] back at unmap time.
    pub fn set_backing(&mut self, backing: MapInfo) {
        self.backing = Some(Box::new(backing));
    }

    /// Take back a mapping stashed with [`set_backing`].
    pub fn take_backing(&mut self) -> Option<MapInfo> {
        self.backing.take().map(|b| *b)
    }
}

impl std::fmt::Debug for MapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapInfo")
            .field("data", &self.data)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Capability set implemented by every allocator type.
///
/// Allocator types that do not support a capability return the defined
/// failure value instead of omitting the method.
pub trait MemoryAllocator: Send + Sync + 'static {
    /// Name under which this allocator type registers itself.
    fn mem_type(&self) -> &'static str;

    /// Downcast access to the concrete allocator type.
    fn as_any(&self) -> &dyn Any;

    /// Allocate a new memory object through the generic interface.
    fn alloc(
        &self,
        size: u64,
        params: &AllocationParams,
    ) -> Result<Arc<dyn MemoryObject>, MemoryError>;

    /// Tear down a memory object.
    ///
    /// Invoked exactly once per object, when its last reference is dropped.
    fn free(&self, mem: &mut dyn MemoryObject);

    /// Map up to `size` bytes of `mem`, storing allocator-private state in
    /// `info`. Returns the mapped address, or `None` on failure.
    fn map_full(
        &self,
        mem: &dyn MemoryObject,
        info: &mut MapInfo,
        size: u64,
    ) -> Option<NonNull<u8>>;

    /// Reverse a previous [`map_full`](Self::map_full) call.
    fn unmap_full(&self, mem: &dyn MemoryObject, info: &mut MapInfo);

    /// Copy a sub-region of `mem` into a new memory object.
    fn copy(
        &self,
        mem: &dyn MemoryObject,
        offset: i64,
        size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>>;

    /// Share a sub-region of `mem` without copying.
    fn share(
        &self,
        mem: &dyn MemoryObject,
        offset: i64,
        size: Option<u64>,
    ) -> Option<Arc<dyn MemoryObject>>;

    /// Offset of `mem2` relative to `mem1` if the two objects are contiguous
    /// in the same backing storage.
    fn is_span(&self, mem1: &dyn MemoryObject, mem2: &dyn MemoryObject) -> Option<u64>;
}

/// Map a memory object for CPU access.
///
/// Enforces the header flags before dispatching to the allocator: an object
/// flagged [`MemoryFlags::NOT_MAPPABLE`] never maps, and a read-only object
/// refuses write access.
pub fn map(mem: &dyn MemoryObject, flags: MapFlags) -> Option<MapInfo> {
    let header = mem.header();

    if header.flags().contains(MemoryFlags::NOT_MAPPABLE) {
        log::debug!("{} memory is not mappable", header.allocator().mem_type());
        return None;
    }
    if flags.contains(MapFlags::WRITE) && header.flags().contains(MemoryFlags::READONLY) {
        log::debug!(
            "refusing write map of read-only {} memory",
            header.allocator().mem_type()
        );
        return None;
    }

    let allocator = header.allocator().clone();
    let mut info = MapInfo::new(flags);
    let data = allocator.map_full(mem, &mut info, header.maxsize())?;
    info.data = data;
    info.size = header.size();
    Some(info)
}

/// Unmap a memory object previously mapped with [`map`].
pub fn unmap(mem: &dyn MemoryObject, mut info: MapInfo) {
    let allocator = mem.header().allocator().clone();
    allocator.unmap_full(mem, &mut info);
}
