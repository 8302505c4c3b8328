//! Named shared-memory arena backing all suffix trees on a host.
//!
//! The update server creates one fixed-size region per host; every reader
//! process attaches to it by name. The region holds a header with two
//! process-shared locks, the prompt-hash registry, and a block heap from
//! which each tree takes a single contiguous allocation.
//!
//! The heap is a bump allocator with a first-fit free list: freeing a tree
//! returns its whole block, and the next tree of a similar size reuses it.
//! Allocation state is guarded by its own lock so that tree construction
//! never contends with registry readers.

mod layout;

use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use shared_memory::{Shmem, ShmemConf};

use crate::error::CacheError;
use crate::registry::TreeRegistry;

pub(crate) use layout::{
    align_up, ArenaHeader, BlockHeader, RegistryEntry, ARENA_MAGIC, BLOCK_HEADER_SIZE,
};

/// Well-known region name shared by the update server and all readers.
pub const DEFAULT_ARENA_NAME: &str = "SUFFIX_CACHE";

/// Default mapping size. This is address space, not resident memory.
pub const DEFAULT_ARENA_SIZE: usize = 500 * 1024 * 1024 * 1024;

/// Default number of prompt-hash registry slots.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 65_536;

#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub name: String,
    pub size: usize,
    pub registry_capacity: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ARENA_NAME.to_string(),
            size: DEFAULT_ARENA_SIZE,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
        }
    }
}

/// A mapped view of the host-wide cache region.
///
/// The creating process owns the region and removes it on drop; opened
/// views only detach.
pub struct SharedArena {
    shmem: Shmem,
    base: NonNull<u8>,
    name: String,
}

// SAFETY: the raw base pointer targets a shared mapping whose mutable
// state (registry, allocator bookkeeping) is only touched under the
// process-shared locks in the header; published tree blocks are immutable.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl std::fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArena").field("name", &self.name).finish()
    }
}

/// Proof that the arena's registry lock is held.
///
/// Registry operations require a `&ArenaGuard` so that a whole batch of
/// lookups can run under a single acquisition.
pub struct ArenaGuard<'a> {
    _lock: spin::MutexGuard<'a, ()>,
}

impl SharedArena {
    /// Create the region, removing any prior region with the same name.
    ///
    /// Called exactly once per host by the update server. Idempotent
    /// across crashes: a leftover region from a dead server is unlinked
    /// before the fresh one is created.
    pub fn create(config: &ArenaConfig) -> Result<Self, CacheError> {
        unlink_region(&config.name);

        let shmem = ShmemConf::new()
            .os_id(&config.name)
            .size(config.size)
            .create()
            .map_err(|e| {
                CacheError::ArenaUnavailable(format!("create {:?}: {e}", config.name))
            })?;
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| CacheError::ArenaUnavailable("null mapping".into()))?;
        let arena = Self {
            shmem,
            base,
            name: config.name.clone(),
        };

        let header_end = align_up(std::mem::size_of::<ArenaHeader>(), 16);
        let registry_bytes = config.registry_capacity * std::mem::size_of::<RegistryEntry>();
        let heap_off = align_up(header_end + registry_bytes, 16) as u64;
        if heap_off as usize >= config.size {
            return Err(CacheError::ArenaUnavailable(format!(
                "arena of {} bytes cannot hold a registry of {} slots",
                config.size, config.registry_capacity
            )));
        }

        // A fresh POSIX shm object is zero-filled, so every registry slot
        // already reads as empty.
        unsafe {
            let hdr = arena.base.as_ptr() as *mut ArenaHeader;
            std::ptr::write(
                hdr,
                ArenaHeader {
                    magic: ARENA_MAGIC,
                    size: config.size as u64,
                    registry_off: header_end as u64,
                    registry_cap: config.registry_capacity as u64,
                    heap_off,
                    heap_head: AtomicU64::new(heap_off),
                    free_head: AtomicU64::new(0),
                    registry_lock: spin::Mutex::new(()),
                    alloc_lock: spin::Mutex::new(()),
                    ready: AtomicU64::new(0),
                },
            );
            (*hdr).ready.store(ARENA_MAGIC, Ordering::Release);
        }
        tracing::info!(
            name = %config.name,
            size = config.size,
            registry_capacity = config.registry_capacity,
            "shared arena created"
        );
        Ok(arena)
    }

    /// Attach to an existing region by name.
    pub fn open(name: &str) -> Result<Self, CacheError> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| CacheError::ArenaUnavailable(format!("open {name:?}: {e}")))?;
        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| CacheError::ArenaUnavailable("null mapping".into()))?;
        let arena = Self {
            shmem,
            base,
            name: name.to_string(),
        };
        {
            let hdr = arena.header();
            if hdr.ready.load(Ordering::Acquire) != ARENA_MAGIC || hdr.magic != ARENA_MAGIC {
                return Err(CacheError::ArenaUnavailable(format!(
                    "region {name:?} is not an initialized suffix cache arena"
                )));
            }
        }
        Ok(arena)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total mapped bytes.
    pub fn size(&self) -> usize {
        self.shmem.len()
    }

    /// Acquire the process-shared lock guarding the registry.
    pub fn lock(&self) -> ArenaGuard<'_> {
        ArenaGuard {
            _lock: self.header().registry_lock.lock(),
        }
    }

    /// View of the prompt-hash registry. All registry methods additionally
    /// take an [`ArenaGuard`].
    pub fn registry(&self) -> TreeRegistry<'_> {
        TreeRegistry::new(self)
    }

    /// Allocate one contiguous block of at least `bytes` payload bytes.
    ///
    /// Reuses the first free block large enough, otherwise bumps the heap.
    pub fn alloc_bulk(&self, bytes: usize) -> Result<u64, CacheError> {
        let size = align_up(bytes.max(1), 16) as u64;
        let hdr = self.header();
        let _alloc = hdr.alloc_lock.lock();

        let mut prev: u64 = 0;
        let mut cur = hdr.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            let block = unsafe { &mut *(self.ptr_at(cur) as *mut BlockHeader) };
            if block.size >= size {
                let next = block.next_free;
                if prev == 0 {
                    hdr.free_head.store(next, Ordering::Relaxed);
                } else {
                    let prev_block = unsafe { &mut *(self.ptr_at(prev) as *mut BlockHeader) };
                    prev_block.next_free = next;
                }
                block.next_free = 0;
                return Ok(cur + BLOCK_HEADER_SIZE as u64);
            }
            prev = cur;
            cur = block.next_free;
        }

        let head = hdr.heap_head.load(Ordering::Relaxed);
        let total = BLOCK_HEADER_SIZE as u64 + size;
        if head + total > hdr.size {
            return Err(CacheError::OutOfSpace { requested: bytes });
        }
        unsafe {
            let block = self.ptr_at(head) as *mut BlockHeader;
            std::ptr::write(
                block,
                BlockHeader {
                    size,
                    next_free: 0,
                },
            );
        }
        hdr.heap_head.store(head + total, Ordering::Relaxed);
        Ok(head + BLOCK_HEADER_SIZE as u64)
    }

    /// Return a block obtained from [`alloc_bulk`](Self::alloc_bulk) to the
    /// free list. O(1) regardless of the block's content.
    pub fn free(&self, payload_off: u64) {
        let hdr = self.header();
        let _alloc = hdr.alloc_lock.lock();
        let block_off = payload_off - BLOCK_HEADER_SIZE as u64;
        unsafe {
            let block = &mut *(self.ptr_at(block_off) as *mut BlockHeader);
            block.next_free = hdr.free_head.load(Ordering::Relaxed);
        }
        hdr.free_head.store(block_off, Ordering::Relaxed);
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        // SAFETY: the header is written once before `ready` is published
        // and only its atomic / lock fields change afterwards.
        unsafe { &*(self.base.as_ptr() as *const ArenaHeader) }
    }

    /// Raw pointer to an offset inside the region.
    ///
    /// # Safety
    /// `off` must lie within the mapping and point at properly initialized
    /// data for whatever type the caller reads through it.
    pub(crate) unsafe fn ptr_at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.shmem.len());
        self.base.as_ptr().add(off as usize)
    }
}

/// Unlink a leftover POSIX shm object so creation starts from scratch.
///
/// Linux exposes named shm objects under /dev/shm; a missing file is fine.
fn unlink_region(name: &str) {
    let _ = std::fs::remove_file(Path::new("/dev/shm").join(name));
}


#[cfg(test)]
mod tests {
    use super::test_support::small_arena;
    use super::*;

    #[test]
    fn create_then_open_by_name() {
        let arena = small_arena("open");
        let view = SharedArena::open(arena.name()).expect("open existing arena");
        assert_eq!(view.size(), arena.size());
    }

    #[test]
    fn open_missing_region_fails() {
        let err = SharedArena::open("specache-test-definitely-missing").unwrap_err();
        assert!(matches!(err, CacheError::ArenaUnavailable(_)));
    }

    #[test]
    fn create_is_idempotent_across_restarts() {
        let arena = small_arena("recreate");
        let name = arena.name().to_string();
        let size = arena.size();
        drop(arena);
        // Simulates a crashed server restarting with the same name.
        let config = ArenaConfig {
            name: name.clone(),
            size,
            registry_capacity: 64,
        };
        let again = SharedArena::create(&config).expect("recreate after drop");
        assert_eq!(again.name(), name);
    }

    #[test]
    fn alloc_bumps_then_reuses_freed_blocks() {
        let arena = small_arena("alloc");
        let a = arena.alloc_bulk(1000).unwrap();
        let b = arena.alloc_bulk(1000).unwrap();
        assert_ne!(a, b);
        // The first block sits right at the start of the heap.
        assert_eq!(a, arena.header().heap_off + BLOCK_HEADER_SIZE as u64);

        arena.free(a);
        let c = arena.alloc_bulk(900).unwrap();
        // First fit: the freed block is large enough and comes back first.
        assert_eq!(c, a);
    }

    #[test]
    fn alloc_skips_too_small_free_blocks() {
        let arena = small_arena("first-fit");
        let a = arena.alloc_bulk(100).unwrap();
        let _b = arena.alloc_bulk(100).unwrap();
        arena.free(a);
        let big = arena.alloc_bulk(5000).unwrap();
        assert_ne!(big, a);
        // The small block is still available for a small request.
        assert_eq!(arena.alloc_bulk(64).unwrap(), a);
    }

    #[test]
    fn exhaustion_fails_loudly() {
        let arena = small_arena("oom");
        let err = arena.alloc_bulk(64 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, CacheError::OutOfSpace { .. }));
    }

    #[test]
    fn offsets_are_stable_across_views() {
        let arena = small_arena("offsets");
        let off = arena.alloc_bulk(256).unwrap();
        unsafe {
            std::ptr::write(arena.ptr_at(off) as *mut u64, 0xDEAD_BEEF);
        }
        let view = SharedArena::open(arena.name()).unwrap();
        let read = unsafe { std::ptr::read(view.ptr_at(off) as *const u64) };
        assert_eq!(read, 0xDEAD_BEEF);
    }
}
