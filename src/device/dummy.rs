//! Heap-backed device for development and tests.
//!
//! This device doesn't talk to any graphics API but services every native
//! call from the heap, so the memory subsystem can run without GPU
//! hardware. Reported buffer requirements and the memory-type table are
//! configurable, which lets tests model a specific piece of hardware.

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::MemoryError;
use crate::types::{
    BufferHandle, BufferUsageFlags, DeviceMemoryHandle, MemoryPropertyFlags, MemoryRequirements,
};

use super::DeviceBackend;

struct BufferState {
    size: u64,
    #[allow(dead_code)]
    usage: BufferUsageFlags,
    bound: Option<(DeviceMemoryHandle, u64)>,
}

struct AllocationState {
    storage: Box<[u8]>,
    maps: usize,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    buffers: HashMap<u64, BufferState>,
    allocations: HashMap<u64, AllocationState>,
    buffers_destroyed: usize,
    allocations_freed: usize,
}

impl State {
    fn mint_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Heap-backed [`DeviceBackend`] implementation.
pub struct DummyDevice {
    alignment: u64,
    type_bits: u32,
    memory_types: Vec<MemoryPropertyFlags>,
    state: Mutex<State>,
}

impl DummyDevice {
    /// Create a dummy device with a small default memory-type table.
    pub fn new() -> Self {
        Self {
            alignment: 64,
            type_bits: 0x3,
            memory_types: vec![
                MemoryPropertyFlags::DEVICE_LOCAL,
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
            ],
            state: Mutex::new(State::default()),
        }
    }

    /// Set the alignment reported for every buffer.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the compatible-type bitmask reported for every buffer.
    pub fn with_type_bits(mut self, type_bits: u32) -> Self {
        self.type_bits = type_bits;
        self
    }

    /// Replace the memory-type table.
    pub fn with_memory_types(mut self, memory_types: Vec<MemoryPropertyFlags>) -> Self {
        self.memory_types = memory_types;
        self
    }

    /// Number of live (created and not destroyed) buffers.
    pub fn buffers_live(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of buffers destroyed so far.
    pub fn buffers_destroyed(&self) -> usize {
        self.state.lock().buffers_destroyed
    }

    /// Number of live device-memory allocations.
    pub fn allocations_live(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of device-memory allocations freed so far.
    pub fn allocations_freed(&self) -> usize {
        self.state.lock().allocations_freed
    }

    /// Total number of active mappings across all allocations.
    pub fn active_maps(&self) -> usize {
        self.state.lock().allocations.values().map(|a| a.maps).sum()
    }

    /// Whether a buffer has been bound to device memory.
    pub fn is_buffer_bound(&self, buffer: BufferHandle) -> bool {
        self.state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .is_some_and(|b| b.bound.is_some())
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy Device"
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsageFlags,
    ) -> Result<BufferHandle, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidParameter(
                "buffer size must be non-zero".to_string(),
            ));
        }

        let mut state = self.state.lock();
        let handle = state.mint_handle();
        state.buffers.insert(
            handle,
            BufferState {
                size,
                usage,
                bound: None,
            },
        );
        log::trace!("DummyDevice: created buffer {handle:#x} (size: {size})");
        Ok(BufferHandle::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.as_raw()).is_none() {
            log::warn!("DummyDevice: destroy of unknown buffer {:#x}", buffer.as_raw());
            return;
        }
        state.buffers_destroyed += 1;
        log::trace!("DummyDevice: destroyed buffer {:#x}", buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let state = self.state.lock();
        let size = match state.buffers.get(&buffer.as_raw()) {
            Some(b) => (b.size + self.alignment - 1) & !(self.alignment - 1),
            None => {
                log::warn!(
                    "DummyDevice: requirements query for unknown buffer {:#x}",
                    buffer.as_raw()
                );
                0
            }
        };
        MemoryRequirements {
            size,
            alignment: self.alignment,
            memory_type_bits: self.type_bits,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemoryHandle,
        offset: u64,
    ) -> Result<(), MemoryError> {
        let mut state = self.state.lock();

        let capacity = match state.allocations.get(&memory.as_raw()) {
            Some(a) => a.storage.len() as u64,
            None => {
                return Err(MemoryError::InvalidParameter(format!(
                    "unknown device memory {:#x}",
                    memory.as_raw()
                )))
            }
        };
        if offset >= capacity {
            return Err(MemoryError::InvalidParameter(format!(
                "bind offset {offset} outside allocation of {capacity} bytes"
            )));
        }

        let Some(buf) = state.buffers.get_mut(&buffer.as_raw()) else {
            return Err(MemoryError::InvalidParameter(format!(
                "unknown buffer {:#x}",
                buffer.as_raw()
            )));
        };
        if buf.bound.is_some() {
            return Err(MemoryError::InvalidParameter(format!(
                "buffer {:#x} is already bound",
                buffer.as_raw()
            )));
        }
        buf.bound = Some((memory, offset));
        log::trace!(
            "DummyDevice: bound buffer {:#x} to memory {:#x} at offset {offset}",
            buffer.as_raw(),
            memory.as_raw()
        );
        Ok(())
    }

    fn allocate_memory(
        &self,
        size: u64,
        type_index: u32,
    ) -> Result<DeviceMemoryHandle, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidParameter(
                "allocation size must be non-zero".to_string(),
            ));
        }
        if type_index as usize >= self.memory_types.len() {
            return Err(MemoryError::InvalidParameter(format!(
                "memory type index {type_index} out of range ({} types)",
                self.memory_types.len()
            )));
        }

        let mut state = self.state.lock();
        let handle = state.mint_handle();
        state.allocations.insert(
            handle,
            AllocationState {
                storage: vec![0u8; size as usize].into_boxed_slice(),
                maps: 0,
            },
        );
        log::trace!("DummyDevice: allocated memory {handle:#x} (size: {size}, type: {type_index})");
        Ok(DeviceMemoryHandle::from_raw(handle))
    }

    fn free_memory(&self, memory: DeviceMemoryHandle) {
        let mut state = self.state.lock();
        match state.allocations.remove(&memory.as_raw()) {
            Some(a) => {
                if a.maps > 0 {
                    log::warn!(
                        "DummyDevice: freeing memory {:#x} with {} active mappings",
                        memory.as_raw(),
                        a.maps
                    );
                }
                state.allocations_freed += 1;
                log::trace!("DummyDevice: freed memory {:#x}", memory.as_raw());
            }
            None => log::warn!("DummyDevice: free of unknown memory {:#x}", memory.as_raw()),
        }
    }

    fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<NonNull<u8>, MemoryError> {
        let mut state = self.state.lock();
        let Some(allocation) = state.allocations.get_mut(&memory.as_raw()) else {
            return Err(MemoryError::InvalidParameter(format!(
                "unknown device memory {:#x}",
                memory.as_raw()
            )));
        };
        allocation.maps += 1;
        // The boxed storage never moves while the allocation is live.
        NonNull::new(allocation.storage.as_mut_ptr())
            .ok_or_else(|| MemoryError::Internal("null backing storage".to_string()))
    }

    fn unmap_memory(&self, memory: DeviceMemoryHandle) {
        let mut state = self.state.lock();
        match state.allocations.get_mut(&memory.as_raw()) {
            Some(a) if a.maps > 0 => a.maps -= 1,
            Some(_) => log::warn!(
                "DummyDevice: unmap of memory {:#x} with no active mapping",
                memory.as_raw()
            ),
            None => log::warn!("DummyDevice: unmap of unknown memory {:#x}", memory.as_raw()),
        }
    }

    fn memory_types(&self) -> Vec<MemoryPropertyFlags> {
        self.memory_types.clone()
    }
}
