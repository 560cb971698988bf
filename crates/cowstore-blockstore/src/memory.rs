//! In-memory block store and an LRU-cached wrapper

use crate::section::{read_section, write_section, SectionEntry};
use crate::{Block, BlockId, BlockStore, BlockStoreError, Result, StoreStats, MAX_BLOCK_SIZE};
use bytes::Bytes;
use dashmap::DashMap;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Mints never-reused block ids for one store
struct IdGenerator {
    tag: u64,
    next: AtomicU64,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            tag: uuid::Uuid::new_v4().as_u128() as u64,
            next: AtomicU64::new(1),
        }
    }

    fn mint(&self) -> BlockId {
        BlockId::from_parts(self.tag, self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Keep minting above ids loaded from an image that share our tag
    fn observe(&self, id: &BlockId) {
        if id.tag() == self.tag {
            self.next.fetch_max(id.seq() + 1, Ordering::Relaxed);
        }
    }
}

/// A claimed slot: its allocation size and the last written image
struct Slot {
    size: usize,
    image: Option<Bytes>,
}

struct Inner {
    slots: DashMap<BlockId, Slot>,
    ids: IdGenerator,
    capacity: Option<u64>,
    used: AtomicU64,
}

/// An in-memory block store
///
/// Blocks live in a concurrent map of encoded images. A byte capacity can be
/// set to model bounded backing storage; allocations beyond it fail with
/// [`BlockStoreError::OutOfSpace`].
#[derive(Clone)]
pub struct MemoryBlockStore {
    inner: Arc<Inner>,
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockStore {
    /// Create a new empty, unbounded memory store
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store that holds at most `capacity` bytes of allocations
    pub fn with_capacity(capacity: u64) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                ids: IdGenerator::new(),
                capacity,
                used: AtomicU64::new(0),
            }),
        }
    }

    /// Get the number of allocated blocks
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Read the encoded image of a block without verifying it
    pub fn read_raw(&self, id: &BlockId) -> Option<Bytes> {
        self.inner.slots.get(id).and_then(|slot| slot.image.clone())
    }

    /// Overwrite the encoded image of a block without re-encoding it
    ///
    /// Intended for recovery tooling and fault-injection tests.
    pub fn write_raw(&self, id: &BlockId, image: Bytes) -> Result<()> {
        let mut slot = self
            .inner
            .slots
            .get_mut(id)
            .ok_or_else(|| BlockStoreError::invalid(*id, "unknown block"))?;
        slot.image = Some(image);
        Ok(())
    }

    fn reserve(&self, size: u64) -> Result<()> {
        let capacity = self.inner.capacity;
        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| match capacity {
                Some(cap) if used + size > cap => None,
                _ => Some(used + size),
            })
            .map(|_| ())
            .map_err(|used| BlockStoreError::OutOfSpace {
                requested: size,
                available: capacity.unwrap_or(u64::MAX).saturating_sub(used),
            })
    }
}

impl BlockStore for MemoryBlockStore {
    fn allocate(&self, size: usize) -> Result<BlockId> {
        if size > MAX_BLOCK_SIZE {
            return Err(BlockStoreError::BlockTooLarge {
                size,
                max: MAX_BLOCK_SIZE,
            });
        }
        self.reserve(size as u64)?;
        let id = self.inner.ids.mint();
        self.inner.slots.insert(id, Slot { size, image: None });
        trace!(%id, size, "allocated block");
        Ok(id)
    }

    fn read(&self, id: &BlockId) -> Result<Block> {
        let image = {
            let slot = self
                .inner
                .slots
                .get(id)
                .ok_or_else(|| BlockStoreError::invalid(*id, "unknown or freed block"))?;
            slot.image
                .clone()
                .ok_or_else(|| BlockStoreError::invalid(*id, "allocated but never written"))?
        };
        Block::decode(id, &image)
    }

    fn write(&self, id: &BlockId, block: &Block) -> Result<()> {
        let image = block.encode();
        let mut slot = self
            .inner
            .slots
            .get_mut(id)
            .ok_or_else(|| BlockStoreError::invalid(*id, "write to unallocated block"))?;
        if image.len() > slot.size {
            return Err(BlockStoreError::BlockTooLarge {
                size: image.len(),
                max: slot.size,
            });
        }
        // Whole-image replacement: readers see the old or the new image, never a mix.
        slot.image = Some(image);
        Ok(())
    }

    fn free(&self, id: &BlockId) -> Result<()> {
        let (_, slot) = self
            .inner
            .slots
            .remove(id)
            .ok_or_else(|| BlockStoreError::invalid(*id, "free of unknown block"))?;
        self.inner.used.fetch_sub(slot.size as u64, Ordering::AcqRel);
        trace!(%id, "freed block");
        Ok(())
    }

    fn contains(&self, id: &BlockId) -> bool {
        self.inner.slots.contains_key(id)
    }

    fn block_size(&self, id: &BlockId) -> Result<usize> {
        self.inner
            .slots
            .get(id)
            .map(|slot| slot.size)
            .ok_or_else(|| BlockStoreError::invalid(*id, "unknown block"))
    }

    fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.inner.slots.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            blocks: self.inner.slots.len(),
            bytes_used: self.inner.used.load(Ordering::Acquire),
            capacity: self.inner.capacity,
        }
    }

    fn persist(&self, out: &mut dyn Write) -> Result<()> {
        let mut entries: Vec<SectionEntry> = self
            .inner
            .slots
            .iter()
            .filter_map(|entry| {
                entry.value().image.clone().map(|image| SectionEntry {
                    id: *entry.key(),
                    size: entry.value().size,
                    image,
                })
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        debug!(blocks = entries.len(), "persisting block section");
        write_section(out, &entries)
    }

    fn load(&self, input: &mut dyn Read) -> Result<()> {
        let entries = read_section(input)?;
        for entry in &entries {
            if self.inner.slots.contains_key(&entry.id) {
                return Err(BlockStoreError::invalid(entry.id, "block already present"));
            }
        }
        let total: u64 = entries.iter().map(|e| e.size as u64).sum();
        self.reserve(total)?;
        for entry in entries {
            self.inner.ids.observe(&entry.id);
            self.inner.slots.insert(
                entry.id,
                Slot {
                    size: entry.size,
                    image: Some(entry.image),
                },
            );
        }
        debug!(blocks = self.inner.slots.len(), "loaded block section");
        Ok(())
    }
}

/// LRU-cached wrapper around any block store
///
/// Caches decoded blocks so repeated reads skip checksum verification.
/// Writes and frees invalidate the cached entry.
pub struct CachedBlockStore<S: BlockStore> {
    inner: S,
    cache: parking_lot::Mutex<lru::LruCache<BlockId, Block>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: BlockStore> CachedBlockStore<S> {
    /// Create a new cached store with the given capacity
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            cache: parking_lot::Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Number of cached blocks
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Cache hits and misses since creation
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl<S: BlockStore> BlockStore for CachedBlockStore<S> {
    fn allocate(&self, size: usize) -> Result<BlockId> {
        self.inner.allocate(size)
    }

    fn read(&self, id: &BlockId) -> Result<Block> {
        // Check cache first
        if let Some(block) = self.cache.lock().get(id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let block = self.inner.read(id)?;
        self.cache.lock().put(*id, block.clone());
        Ok(block)
    }

    fn write(&self, id: &BlockId, block: &Block) -> Result<()> {
        self.cache.lock().pop(id);
        self.inner.write(id, block)?;
        self.cache.lock().put(*id, block.clone());
        Ok(())
    }

    fn free(&self, id: &BlockId) -> Result<()> {
        self.cache.lock().pop(id);
        self.inner.free(id)
    }

    fn contains(&self, id: &BlockId) -> bool {
        self.inner.contains(id)
    }

    fn block_size(&self, id: &BlockId) -> Result<usize> {
        self.inner.block_size(id)
    }

    fn block_ids(&self) -> Vec<BlockId> {
        self.inner.block_ids()
    }

    fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    fn persist(&self, out: &mut dyn Write) -> Result<()> {
        self.inner.persist(out)
    }

    fn load(&self, input: &mut dyn Read) -> Result<()> {
        self.clear_cache();
        self.inner.load(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockHeader, BlockKind, HEADER_LEN};
    use rstest::rstest;

    fn leaf(payload: &'static [u8]) -> Block {
        Block::new(BlockHeader::new(BlockKind::Leaf, 3, 1), Bytes::from_static(payload))
    }

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryBlockStore::new();

        let id = store.allocate(128).unwrap();
        store.write(&id, &leaf(b"Hello, World!")).unwrap();

        assert!(store.contains(&id));
        let retrieved = store.read(&id).unwrap();
        assert_eq!(retrieved.as_slice(), b"Hello, World!");
        assert_eq!(retrieved.header.kind, BlockKind::Leaf);
    }

    #[test]
    fn test_memory_store_ids_are_unique() {
        let store = MemoryBlockStore::new();
        let a = store.allocate(64).unwrap();
        store.free(&a).unwrap();
        let b = store.allocate(64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_memory_store_unknown_block() {
        let store = MemoryBlockStore::new();
        let missing = BlockId::from_parts(1, 1);

        assert!(matches!(
            store.read(&missing),
            Err(BlockStoreError::InvalidBlockState { .. })
        ));
        assert!(matches!(
            store.free(&missing),
            Err(BlockStoreError::InvalidBlockState { .. })
        ));
    }

    #[test]
    fn test_memory_store_unwritten_block() {
        let store = MemoryBlockStore::new();
        let id = store.allocate(64).unwrap();
        assert!(matches!(
            store.read(&id),
            Err(BlockStoreError::InvalidBlockState { .. })
        ));
    }

    #[test]
    fn test_memory_store_out_of_space() {
        let store = MemoryBlockStore::with_capacity(256);
        store.allocate(128).unwrap();
        store.allocate(128).unwrap();

        let result = store.allocate(128);
        assert!(matches!(result, Err(BlockStoreError::OutOfSpace { .. })));
        assert_eq!(store.stats().bytes_used, 256);
    }

    #[test]
    fn test_memory_store_free_returns_space() {
        let store = MemoryBlockStore::with_capacity(128);
        let id = store.allocate(128).unwrap();
        store.free(&id).unwrap();
        assert!(store.allocate(128).is_ok());
    }

    #[rstest]
    #[case(HEADER_LEN)]
    #[case(256)]
    #[case(4096)]
    #[case(MAX_BLOCK_SIZE)]
    fn test_memory_store_slot_bounds(#[case] size: usize) {
        let store = MemoryBlockStore::new();
        let id = store.allocate(size).unwrap();
        let full = Block::raw(vec![0xAB; size - HEADER_LEN]);
        store.write(&id, &full).unwrap();
        assert_eq!(store.read(&id).unwrap().payload.len(), size - HEADER_LEN);

        let over = Block::raw(vec![0xAB; size - HEADER_LEN + 1]);
        assert!(matches!(
            store.write(&id, &over),
            Err(BlockStoreError::BlockTooLarge { .. })
        ));
        assert_eq!(store.stats().bytes_used, size as u64);
    }

    #[test]
    fn test_memory_store_rejects_oversized_allocation() {
        let store = MemoryBlockStore::new();
        assert!(matches!(
            store.allocate(MAX_BLOCK_SIZE + 1),
            Err(BlockStoreError::BlockTooLarge { .. })
        ));
        assert_eq!(store.stats().blocks, 0);
    }

    #[test]
    fn test_memory_store_writable_copy() {
        let store = MemoryBlockStore::new();
        let id = store.allocate(128).unwrap();
        store.write(&id, &leaf(b"original")).unwrap();

        let (copy, block) = store.writable_copy(&id).unwrap();
        assert_ne!(copy, id);
        assert_eq!(store.block_size(&copy).unwrap(), 128);
        store.write(&copy, &block).unwrap();
        assert_eq!(store.read(&copy).unwrap(), store.read(&id).unwrap());
    }

    #[test]
    fn test_memory_store_persist_and_load() {
        let store = MemoryBlockStore::new();
        let a = store.allocate(128).unwrap();
        let b = store.allocate(128).unwrap();
        store.write(&a, &leaf(b"alpha")).unwrap();
        store.write(&b, &leaf(b"beta")).unwrap();

        let mut image = Vec::new();
        store.persist(&mut image).unwrap();

        let restored = MemoryBlockStore::new();
        restored.load(&mut image.as_slice()).unwrap();
        assert_eq!(restored.block_ids(), store.block_ids());
        assert_eq!(restored.read(&b).unwrap().as_slice(), b"beta");
        assert_eq!(restored.stats().bytes_used, 256);
    }

    #[test]
    fn test_memory_store_detects_corruption() {
        let store = MemoryBlockStore::new();
        let id = store.allocate(128).unwrap();
        store.write(&id, &leaf(b"payload")).unwrap();

        let mut image = store.read_raw(&id).unwrap().to_vec();
        let last = image.len() - 1;
        image[last] ^= 0x55;
        store.write_raw(&id, Bytes::from(image)).unwrap();

        assert!(matches!(
            store.read(&id),
            Err(BlockStoreError::CorruptBlock { .. })
        ));
    }

    #[test_log::test]
    fn test_cached_store() {
        let cached = CachedBlockStore::new(MemoryBlockStore::new(), 100);

        let id = cached.allocate(128).unwrap();
        cached.write(&id, &leaf(b"cached data")).unwrap();

        // Should be in cache
        assert_eq!(cached.cache_len(), 1);

        // Get should hit cache
        let retrieved = cached.read(&id).unwrap();
        assert_eq!(retrieved.as_slice(), b"cached data");
        assert_eq!(cached.cache_stats(), (1, 0));

        cached.free(&id).unwrap();
        assert_eq!(cached.cache_len(), 0);
        assert!(cached.read(&id).is_err());
    }
}
