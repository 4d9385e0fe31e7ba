//! Process-wide registry of named memory allocators.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::MemoryAllocator;

static REGISTRY: OnceLock<RwLock<HashMap<&'static str, Arc<dyn MemoryAllocator>>>> =
    OnceLock::new();

fn registry() -> &'static RwLock<HashMap<&'static str, Arc<dyn MemoryAllocator>>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an allocator under its type name.
///
/// The first registration for a name wins; later registrations for the same
/// name are ignored so lookups keep returning the original instance. Returns
/// whether the allocator was registered.
pub fn register(allocator: Arc<dyn MemoryAllocator>) -> bool {
    let name = allocator.mem_type();
    let mut map = registry().write();
    if map.contains_key(name) {
        log::warn!("allocator {name:?} is already registered");
        return false;
    }
    log::debug!("registered allocator {name:?}");
    map.insert(name, allocator);
    true
}

/// Look up a registered allocator by name.
pub fn find(name: &str) -> Option<Arc<dyn MemoryAllocator>> {
    registry().read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::ptr::NonNull;
    use std::sync::Arc;

    use super::*;
    use crate::error::MemoryError;
    use crate::memory::{AllocationParams, MapInfo, MemoryObject};

    struct StubAllocator(&'static str);

    impl MemoryAllocator for StubAllocator {
        fn mem_type(&self) -> &'static str {
            self.0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn alloc(
            &self,
            _size: u64,
            _params: &AllocationParams,
        ) -> Result<Arc<dyn MemoryObject>, MemoryError> {
            Err(MemoryError::Unsupported("stub".to_string()))
        }

        fn free(&self, _mem: &mut dyn MemoryObject) {}

        fn map_full(
            &self,
            _mem: &dyn MemoryObject,
            _info: &mut MapInfo,
            _size: u64,
        ) -> Option<NonNull<u8>> {
            None
        }

        fn unmap_full(&self, _mem: &dyn MemoryObject, _info: &mut MapInfo) {}

        fn copy(
            &self,
            _mem: &dyn MemoryObject,
            _offset: i64,
            _size: Option<u64>,
        ) -> Option<Arc<dyn MemoryObject>> {
            None
        }

        fn share(
            &self,
            _mem: &dyn MemoryObject,
            _offset: i64,
            _size: Option<u64>,
        ) -> Option<Arc<dyn MemoryObject>> {
            None
        }

        fn is_span(&self, _mem1: &dyn MemoryObject, _mem2: &dyn MemoryObject) -> Option<u64> {
            None
        }
    }

    #[test]
    fn test_register_and_find() {
        let allocator: Arc<dyn MemoryAllocator> = Arc::new(StubAllocator("stub-a"));
        assert!(register(allocator.clone()));

        let found = find("stub-a").expect("allocator registered");
        assert!(Arc::ptr_eq(&found, &allocator));
        assert!(find("stub-missing").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let first: Arc<dyn MemoryAllocator> = Arc::new(StubAllocator("stub-b"));
        let second: Arc<dyn MemoryAllocator> = Arc::new(StubAllocator("stub-b"));

        assert!(register(first.clone()));
        assert!(!register(second));

        let found = find("stub-b").expect("allocator registered");
        assert!(Arc::ptr_eq(&found, &first));
    }
}
