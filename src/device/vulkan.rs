//! Vulkan device backed by ash.
//!
//! The memory subsystem never submits work itself, so the device is opened
//! headless: no surface, no swapchain, and a single queue that exists only
//! because device creation requires one.

use std::ffi::CStr;
use std::ptr::NonNull;

use ash::vk;
use ash::vk::Handle;

use crate::error::MemoryError;
use crate::types::{
    BufferHandle, BufferUsageFlags, DeviceMemoryHandle, MemoryPropertyFlags, MemoryRequirements,
};

use super::DeviceBackend;

/// Translate a native result code into a structured error.
fn vk_error(op: &str, err: vk::Result) -> MemoryError {
    match err {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            MemoryError::OutOfMemory
        }
        vk::Result::ERROR_DEVICE_LOST => MemoryError::DeviceLost,
        _ => MemoryError::Internal(format!("{op} failed: {err:?}")),
    }
}

fn convert_buffer_usage(usage: BufferUsageFlags) -> vk::BufferUsageFlags {
    let mut out = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsageFlags::TRANSFER_SRC) {
        out |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsageFlags::TRANSFER_DST) {
        out |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsageFlags::UNIFORM_TEXEL) {
        out |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
    }
    if usage.contains(BufferUsageFlags::STORAGE_TEXEL) {
        out |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
    }
    if usage.contains(BufferUsageFlags::UNIFORM) {
        out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsageFlags::STORAGE) {
        out |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsageFlags::INDEX) {
        out |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsageFlags::VERTEX) {
        out |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsageFlags::INDIRECT) {
        out |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    out
}

fn convert_memory_properties(flags: vk::MemoryPropertyFlags) -> MemoryPropertyFlags {
    let mut out = MemoryPropertyFlags::empty();
    if flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
        out |= MemoryPropertyFlags::DEVICE_LOCAL;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        out |= MemoryPropertyFlags::HOST_VISIBLE;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
        out |= MemoryPropertyFlags::HOST_COHERENT;
    }
    if flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        out |= MemoryPropertyFlags::HOST_CACHED;
    }
    if flags.contains(vk::MemoryPropertyFlags::LAZILY_ALLOCATED) {
        out |= MemoryPropertyFlags::LAZILY_ALLOCATED;
    }
    out
}

/// Select a physical device, preferring discrete GPUs.
fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, MemoryError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        MemoryError::InitializationFailed(format!("Failed to enumerate physical devices: {e:?}"))
    })?;

    let mut best_device = None;
    let mut best_score = 0u32;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };

        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device.ok_or_else(|| {
        MemoryError::InitializationFailed("No Vulkan-capable GPU found".to_string())
    })
}

/// Create a minimal logical device with a single queue.
fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<ash::Device, MemoryError> {
    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(0)
        .queue_priorities(&queue_priorities);
    let queue_create_infos = [queue_create_info];

    let create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        MemoryError::InitializationFailed(format!("Failed to create logical device: {e:?}"))
    })
}

/// Vulkan implementation of [`DeviceBackend`].
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Open a headless connection to the best available GPU.
    pub fn new() -> Result<Self, MemoryError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            MemoryError::InitializationFailed(format!("Failed to load Vulkan: {e}"))
        })?;

        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            MemoryError::InitializationFailed(format!("Failed to create instance: {e:?}"))
        })?;

        let physical_device = match select_physical_device(&instance) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        // Memory properties are immutable for the device lifetime.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let device = match create_logical_device(&instance, physical_device) {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        log::info!(
            "Vulkan device initialized ({} memory types)",
            memory_properties.memory_type_count
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            memory_properties,
        })
    }

    /// Get the Vulkan instance.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl DeviceBackend for VulkanDevice {
    fn name(&self) -> &'static str {
        "Vulkan Device (ash)"
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

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(convert_buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| vk_error("vkCreateBuffer", e))?;

        Ok(BufferHandle::from_raw(buffer.as_raw()))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        unsafe {
            self.device
                .destroy_buffer(vk::Buffer::from_raw(buffer.as_raw()), None);
        }
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        let requirements = unsafe {
            self.device
                .get_buffer_memory_requirements(vk::Buffer::from_raw(buffer.as_raw()))
        };
        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemoryHandle,
        offset: u64,
    ) -> Result<(), MemoryError> {
        unsafe {
            self.device.bind_buffer_memory(
                vk::Buffer::from_raw(buffer.as_raw()),
                vk::DeviceMemory::from_raw(memory.as_raw()),
                offset,
            )
        }
        .map_err(|e| vk_error("vkBindBufferMemory", e))
    }

    fn allocate_memory(
        &self,
        size: u64,
        type_index: u32,
    ) -> Result<DeviceMemoryHandle, MemoryError> {
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }
            .map_err(|e| vk_error("vkAllocateMemory", e))?;

        Ok(DeviceMemoryHandle::from_raw(memory.as_raw()))
    }

    fn free_memory(&self, memory: DeviceMemoryHandle) {
        unsafe {
            self.device
                .free_memory(vk::DeviceMemory::from_raw(memory.as_raw()), None);
        }
    }

    fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<NonNull<u8>, MemoryError> {
        let data = unsafe {
            self.device.map_memory(
                vk::DeviceMemory::from_raw(memory.as_raw()),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(|e| vk_error("vkMapMemory", e))?;

        NonNull::new(data as *mut u8)
            .ok_or_else(|| MemoryError::Internal("vkMapMemory returned null".to_string()))
    }

    fn unmap_memory(&self, memory: DeviceMemoryHandle) {
        unsafe {
            self.device
                .unmap_memory(vk::DeviceMemory::from_raw(memory.as_raw()));
        }
    }

    fn memory_types(&self) -> Vec<MemoryPropertyFlags> {
        self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
            .iter()
            .map(|t| convert_memory_properties(t.property_flags))
            .collect()
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
