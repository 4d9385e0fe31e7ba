//! Integration tests for the buffer-memory lifecycle.
//!
//! These tests run against the heap-backed [`DummyDevice`] so they need no
//! GPU hardware. They cover the one-shot bind protocol, the two ownership
//! modes, CPU mapping through a bound region, teardown accounting and the
//! process-wide allocator singleton.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rstest::rstest;

use vulkan_memory::device::{DeviceBackend, DummyDevice};
use vulkan_memory::memory::registry;
use vulkan_memory::{
    buffer_memory, memory, AllocationParams, BufferUsageFlags, MapFlags, MemoryObject,
    MemoryPropertyFlags, VulkanMemory, BUFFER_MEMORY_ALLOCATOR_NAME,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn host_visible() -> MemoryPropertyFlags {
    MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
}

/// Device and helpers modelling a GPU with three memory types, of which only
/// index 2 is host-visible.
struct TestContext {
    dummy: Arc<DummyDevice>,
    device: Arc<dyn DeviceBackend>,
}

impl TestContext {
    fn new() -> Self {
        init_logging();
        buffer_memory::init_once();

        let dummy = Arc::new(
            DummyDevice::new()
                .with_alignment(256)
                .with_type_bits(0x7)
                .with_memory_types(vec![
                    MemoryPropertyFlags::DEVICE_LOCAL,
                    MemoryPropertyFlags::DEVICE_LOCAL,
                    host_visible(),
                ]),
        );
        Self {
            device: dummy.clone(),
            dummy,
        }
    }

    /// Allocate a host-visible region of `size` usable bytes.
    fn host_region(&self, size: u64, prefix: u64) -> Arc<VulkanMemory> {
        let params = AllocationParams {
            align: 255,
            prefix,
            ..Default::default()
        };
        VulkanMemory::alloc(&self.device, 2, &params, size).expect("region allocation")
    }
}

// ============================================================================
// Binding protocol
// ============================================================================

#[test]
fn test_bind_is_idempotent_for_same_region() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::VERTEX).expect("alloc");
    let region = ctx.host_region(4096, 0);

    assert!(buffer_memory::bind(&mem, &region));
    assert!(buffer_memory::bind(&mem, &region));

    let bound = mem.bound_memory().expect("bound");
    assert!(Arc::ptr_eq(&bound, &region));
}

#[test]
fn test_bind_refuses_a_different_region() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::VERTEX).expect("alloc");
    let first = ctx.host_region(4096, 0);
    let second = ctx.host_region(4096, 0);

    assert!(buffer_memory::bind(&mem, &first));
    assert!(!buffer_memory::bind(&mem, &second));

    // The original binding is untouched.
    let bound = mem.bound_memory().expect("bound");
    assert!(Arc::ptr_eq(&bound, &first));
}

#[rstest]
#[case::fits(4096, 0, true)]
#[case::region_too_small(1024, 0, false)]
#[case::offset_pushes_past_capacity(3840, 256, false)]
fn test_bind_respects_region_capacity(
    #[case] region_size: u64,
    #[case] prefix: u64,
    #[case] expect: bool,
) {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::STORAGE).expect("alloc");
    let region = ctx.host_region(region_size, prefix);

    assert_eq!(buffer_memory::bind(&mem, &region), expect);
    assert_eq!(mem.bound_memory().is_some(), expect);

    if !expect {
        // A refused bind leaves the buffer free to bind elsewhere.
        let fitting = ctx.host_region(4096, 0);
        assert!(buffer_memory::bind(&mem, &fitting));
    }
}

#[test]
fn test_concurrent_binds_to_same_region_all_succeed() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::VERTEX).expect("alloc");
    let region = ctx.host_region(4096, 0);

    thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mem = mem.clone();
                let region = region.clone();
                s.spawn(move || buffer_memory::bind(&mem, &region))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("bind thread"));
        }
    });

    let bound = mem.bound_memory().expect("bound");
    assert!(Arc::ptr_eq(&bound, &region));
}

#[test]
fn test_concurrent_binds_to_distinct_regions_elect_one_winner() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::VERTEX).expect("alloc");
    let regions: Vec<_> = (0..4).map(|_| ctx.host_region(4096, 0)).collect();

    let results = thread::scope(|s| {
        let handles: Vec<_> = regions
            .iter()
            .map(|region| {
                let mem = mem.clone();
                let region = region.clone();
                s.spawn(move || buffer_memory::bind(&mem, &region))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("bind thread"))
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|&&ok| ok).count(), 1);

    let winner = mem.bound_memory().expect("bound");
    for (region, ok) in regions.iter().zip(&results) {
        assert_eq!(Arc::ptr_eq(region, &winner), *ok);
    }
}

// ============================================================================
// Mapping
// ============================================================================

#[test]
fn test_unbound_buffers_are_not_mappable() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::STORAGE).expect("alloc");

    assert!(mem.map(MapFlags::READ).is_none());

    let region = ctx.host_region(4096, 0);
    assert!(buffer_memory::bind(&mem, &region));
    let map = mem.map(MapFlags::READ).expect("mappable once bound");
    mem.unmap(map);
}

#[test]
fn test_wrapped_buffers_are_never_mappable() {
    let ctx = TestContext::new();
    let handle = ctx
        .device
        .create_buffer(1024, BufferUsageFlags::UNIFORM)
        .expect("caller-owned buffer");
    let mem = buffer_memory::wrapped(&ctx.device, handle, BufferUsageFlags::UNIFORM, None);

    assert!(mem.map(MapFlags::READ).is_none());
    assert!(mem.map(MapFlags::READ_WRITE).is_none());
    assert!(mem.bound_memory().is_none());

    drop(mem);
    ctx.device.destroy_buffer(handle);
}

#[test]
fn test_map_write_unmap_cycle() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc_and_bind(
        &ctx.device,
        4096,
        BufferUsageFlags::TRANSFER_SRC,
        host_visible(),
    )
    .expect("alloc and bind");

    let mut map = mem.map(MapFlags::READ_WRITE).expect("map");
    assert!(map.size() >= 4096);
    map.as_mut_slice()[..8].copy_from_slice(b"pipeline");
    mem.unmap(map);

    // The buffer stays mappable and the bytes persist.
    let map = mem.map(MapFlags::READ).expect("remap");
    assert_eq!(&map.as_slice()[..8], b"pipeline");
    mem.unmap(map);

    assert_eq!(ctx.dummy.active_maps(), 0);
}

// ============================================================================
// Teardown and ownership
// ============================================================================

#[test]
fn test_teardown_destroys_owned_handles_only() {
    let ctx = TestContext::new();

    let owned =
        buffer_memory::alloc(&ctx.device, 1024, BufferUsageFlags::VERTEX).expect("alloc");
    drop(owned);
    assert_eq!(ctx.dummy.buffers_destroyed(), 1);

    let handle = ctx
        .device
        .create_buffer(1024, BufferUsageFlags::VERTEX)
        .expect("caller-owned buffer");
    let wrapper = buffer_memory::wrapped(&ctx.device, handle, BufferUsageFlags::VERTEX, None);
    drop(wrapper);
    // The wrapper must not destroy the caller's handle.
    assert_eq!(ctx.dummy.buffers_destroyed(), 1);
    assert_eq!(ctx.dummy.buffers_live(), 1);

    ctx.device.destroy_buffer(handle);
    assert_eq!(ctx.dummy.buffers_destroyed(), 2);
}

#[test]
fn test_release_callback_fires_exactly_once() {
    let ctx = TestContext::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let handle = ctx
        .device
        .create_buffer(1024, BufferUsageFlags::VERTEX)
        .expect("caller-owned buffer");
    let counter = fired.clone();
    let wrapper = buffer_memory::wrapped(
        &ctx.device,
        handle,
        BufferUsageFlags::VERTEX,
        Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    );

    let extra = wrapper.clone();
    drop(wrapper);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    drop(extra);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    ctx.device.destroy_buffer(handle);
}

#[test]
fn test_release_callback_runs_after_handle_destruction() {
    let ctx = TestContext::new();
    let observed = Arc::new(AtomicUsize::new(usize::MAX));

    let mem = buffer_memory::alloc(&ctx.device, 1024, BufferUsageFlags::VERTEX).expect("alloc");
    let dummy = ctx.dummy.clone();
    let slot = observed.clone();
    mem.set_release(Box::new(move || {
        slot.store(dummy.buffers_destroyed(), Ordering::SeqCst);
    }));

    drop(mem);
    // By the time the callback ran, the native handle was already gone.
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_bound_region_outlives_the_callers_reference() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc(&ctx.device, 4096, BufferUsageFlags::STORAGE).expect("alloc");
    let region = ctx.host_region(4096, 0);

    assert!(buffer_memory::bind(&mem, &region));
    drop(region);
    // The bind's own reference keeps the region alive.
    assert_eq!(ctx.dummy.allocations_freed(), 0);
    assert!(mem.map(MapFlags::READ).is_some_and(|map| {
        mem.unmap(map);
        true
    }));

    drop(mem);
    assert_eq!(ctx.dummy.allocations_freed(), 1);
}

// ============================================================================
// The full convenience path
// ============================================================================

#[test]
fn test_alloc_and_bind_end_to_end() {
    let ctx = TestContext::new();

    let mem = buffer_memory::alloc_and_bind(
        &ctx.device,
        4096,
        BufferUsageFlags::TRANSFER_SRC,
        host_visible(),
    )
    .expect("alloc and bind");

    // Requirements reported by the device: {4096, 256, 0x7}.
    assert_eq!(mem.requirements().size, 4096);
    assert_eq!(mem.requirements().alignment, 256);
    assert_eq!(mem.requirements().memory_type_bits, 0x7);

    // Only type index 2 is host-visible.
    let region = mem.bound_memory().expect("bound");
    assert_eq!(region.type_index(), 2);
    assert_eq!(region.size(), 4096);
    assert_eq!(region.align(), 255);

    let mut map = mem.map(MapFlags::READ_WRITE).expect("map");
    assert_eq!(map.size(), 4096);
    map.as_mut_slice().fill(0xA5);
    mem.unmap(map);

    drop(mem);
    assert_eq!(ctx.dummy.buffers_destroyed(), 1);
    assert_eq!(ctx.dummy.allocations_freed(), 1);
}

#[test]
fn test_alloc_and_bind_fails_without_a_matching_type() {
    let ctx = TestContext::new();

    // No memory type is host-cached; the partially built buffer must be
    // torn down before the error is reported.
    let result = buffer_memory::alloc_and_bind(
        &ctx.device,
        4096,
        BufferUsageFlags::STORAGE,
        MemoryPropertyFlags::HOST_CACHED,
    );
    assert!(result.is_err());
    assert_eq!(ctx.dummy.buffers_live(), 0);
    assert_eq!(ctx.dummy.buffers_destroyed(), 1);
    assert_eq!(ctx.dummy.allocations_live(), 0);
}

// ============================================================================
// Allocator singleton
// ============================================================================

#[test]
fn test_init_once_from_many_threads_registers_one_allocator() {
    init_logging();

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(buffer_memory::init_once);
        }
    });

    let first = registry::find(BUFFER_MEMORY_ALLOCATOR_NAME).expect("registered");
    let second = registry::find(BUFFER_MEMORY_ALLOCATOR_NAME).expect("registered");
    assert!(Arc::ptr_eq(&first, &second));

    // The registered singleton is usable: freshly allocated buffer memory
    // answers the identity check through it.
    let device: Arc<dyn DeviceBackend> = Arc::new(DummyDevice::new());
    let mem = buffer_memory::alloc(&device, 256, BufferUsageFlags::VERTEX).expect("alloc");
    assert!(buffer_memory::is_buffer_memory(mem.as_ref()));
    assert!(Arc::ptr_eq(mem.header().allocator(), &first));
}

#[test]
fn test_generic_map_entry_point_reaches_the_buffer() {
    let ctx = TestContext::new();
    let mem = buffer_memory::alloc_and_bind(
        &ctx.device,
        1024,
        BufferUsageFlags::STORAGE,
        host_visible(),
    )
    .expect("alloc and bind");

    // Dispatch through the generic abstraction instead of the typed method.
    let map = memory::map(mem.as_ref(), MapFlags::READ).expect("map");
    assert_eq!(map.size(), 1024);
    memory::unmap(mem.as_ref(), map);
}
