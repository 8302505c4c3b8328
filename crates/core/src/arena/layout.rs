//! On-disk (well, in-region) layout of the shared arena.
//!
//! Everything stored inside the region is position-independent: references
//! are byte offsets from the region base, never raw addresses, so views
//! mapped at different base addresses in different processes agree.

use std::sync::atomic::AtomicU64;

use spin::Mutex;

/// `b"SPECACHE"` as a little-endian u64.
pub const ARENA_MAGIC: u64 = u64::from_le_bytes(*b"SPECACHE");

/// Size of the bookkeeping header in front of every heap block.
pub const BLOCK_HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Region header, at offset 0 of the mapping.
///
/// `ready` is stored last: a reader that observes `ready == ARENA_MAGIC`
/// (acquire) is guaranteed to see a fully initialized header and registry.
#[repr(C)]
pub struct ArenaHeader {
    pub magic: u64,
    /// Total mapped bytes, including this header.
    pub size: u64,
    /// Byte offset of the registry slot array.
    pub registry_off: u64,
    /// Number of registry slots.
    pub registry_cap: u64,
    /// Byte offset where the block heap begins.
    pub heap_off: u64,
    /// Bump pointer: offset of the first never-allocated byte.
    pub heap_head: AtomicU64,
    /// Offset of the first free block header, 0 if the free list is empty.
    pub free_head: AtomicU64,
    /// Process-shared mutex guarding the registry and the moment of
    /// superseded-tree destruction.
    pub registry_lock: Mutex<()>,
    /// Process-shared mutex guarding `heap_head` / `free_head`.
    pub alloc_lock: Mutex<()>,
    pub ready: AtomicU64,
}

/// Header preceding every allocated block in the heap.
#[repr(C)]
pub struct BlockHeader {
    /// Payload bytes that follow this header.
    pub size: u64,
    /// Next block in the free list; 0 when allocated or last.
    pub next_free: u64,
}

/// One slot of the prompt-hash registry.
///
/// `tree_off == 0` marks a never-used slot; see `registry` for the
/// tombstone convention.
#[repr(C)]
pub struct RegistryEntry {
    pub hash: u64,
    pub tree_off: u64,
}

pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    fn registry_entry_is_two_words() {
        assert_eq!(std::mem::size_of::<RegistryEntry>(), 16);
    }

    #[test]
    fn magic_spells_the_project() {
        assert_eq!(&ARENA_MAGIC.to_le_bytes(), b"SPECACHE");
    }
}
