//! # Chunk Buffer Pool
//!
//! Slab-backed storage for in-flight chunk payloads, keyed by `(bundle_id,
//! chunk_id)`. O(1) insert/remove with zero heap churn on the hot path, the
//! same shape the send engine needs to hold every outstanding chunk's bytes
//! between transmission and SACK.

use bytes::Bytes;
use courier_core::ids::BundleId;
use slab::Slab;
use std::collections::HashMap;

/// Metadata tracked alongside a pooled chunk's payload.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub chunk_id: u32,
    pub is_parity: bool,
    /// Milliseconds (caller-supplied clock) at which this chunk was first sent.
    pub first_sent_at: u64,
    /// Milliseconds at which this chunk was most recently (re)sent.
    pub last_sent_at: u64,
    pub retry_count: u32,
}

impl ChunkContext {
    pub fn new(chunk_id: u32, is_parity: bool, now_ms: u64) -> Self {
        ChunkContext {
            chunk_id,
            is_parity,
            first_sent_at: now_ms,
            last_sent_at: now_ms,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub context: ChunkContext,
    pub payload: Bytes,
}

/// Handle to a chunk in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle(pub usize);

/// Slab-backed pool of chunk buffers for a single bundle's send window.
///
/// Lookup by `chunk_id` goes through an auxiliary index since the slab key
/// itself is an opaque allocation slot, not the chunk id.
pub struct ChunkPool {
    entries: Slab<ChunkEntry>,
    by_chunk_id: HashMap<u32, ChunkHandle>,
    capacity: usize,
}

impl ChunkPool {
    pub fn new(capacity: usize) -> Self {
        ChunkPool {
            entries: Slab::with_capacity(capacity),
            by_chunk_id: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a chunk. Returns `None` if the pool is at capacity.
    pub fn insert(&mut self, context: ChunkContext, payload: Bytes) -> Option<ChunkHandle> {
        if self.entries.len() >= self.capacity {
            return None;
        }
        let chunk_id = context.chunk_id;
        let key = self.entries.insert(ChunkEntry { context, payload });
        let handle = ChunkHandle(key);
        self.by_chunk_id.insert(chunk_id, handle);
        Some(handle)
    }

    pub fn get(&self, handle: ChunkHandle) -> Option<&ChunkEntry> {
        self.entries.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: ChunkHandle) -> Option<&mut ChunkEntry> {
        self.entries.get_mut(handle.0)
    }

    pub fn handle_for(&self, chunk_id: u32) -> Option<ChunkHandle> {
        self.by_chunk_id.get(&chunk_id).copied()
    }

    pub fn get_by_chunk_id(&self, chunk_id: u32) -> Option<&ChunkEntry> {
        self.handle_for(chunk_id).and_then(|h| self.get(h))
    }

    /// Remove a chunk from the pool, returning it.
    pub fn remove(&mut self, handle: ChunkHandle) -> Option<ChunkEntry> {
        if !self.entries.contains(handle.0) {
            return None;
        }
        let entry = self.entries.remove(handle.0);
        self.by_chunk_id.remove(&entry.context.chunk_id);
        Some(entry)
    }

    pub fn remove_by_chunk_id(&mut self, chunk_id: u32) -> Option<ChunkEntry> {
        let handle = self.handle_for(chunk_id)?;
        self.remove(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkHandle, &ChunkEntry)> {
        self.entries.iter().map(|(k, v)| (ChunkHandle(k), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ChunkHandle, &mut ChunkEntry)> {
        self.entries.iter_mut().map(|(k, v)| (ChunkHandle(k), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: u32) -> ChunkContext {
        ChunkContext::new(id, false, 0)
    }

    #[test]
    fn insert_get_remove_by_handle() {
        let mut pool = ChunkPool::new(4);
        let handle = pool.insert(ctx(3), Bytes::from_static(b"data")).unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(handle).unwrap().context.chunk_id, 3);

        let removed = pool.remove(handle).unwrap();
        assert_eq!(removed.context.chunk_id, 3);
        assert!(pool.is_empty());
        assert!(pool.handle_for(3).is_none());
    }

    #[test]
    fn lookup_by_chunk_id() {
        let mut pool = ChunkPool::new(4);
        pool.insert(ctx(7), Bytes::from_static(b"abc")).unwrap();
        assert_eq!(pool.get_by_chunk_id(7).unwrap().payload, &b"abc"[..]);
        let removed = pool.remove_by_chunk_id(7).unwrap();
        assert_eq!(removed.context.chunk_id, 7);
        assert!(pool.get_by_chunk_id(7).is_none());
    }

    #[test]
    fn capacity_limit() {
        let mut pool = ChunkPool::new(2);
        assert!(pool.insert(ctx(0), Bytes::new()).is_some());
        assert!(pool.insert(ctx(1), Bytes::new()).is_some());
        assert!(pool.insert(ctx(2), Bytes::new()).is_none());
        assert!(pool.is_full());
    }

    #[test]
    fn retry_count_mutable_in_place() {
        let mut pool = ChunkPool::new(4);
        let handle = pool.insert(ctx(1), Bytes::new()).unwrap();
        pool.get_mut(handle).unwrap().context.retry_count += 1;
        assert_eq!(pool.get(handle).unwrap().context.retry_count, 1);
    }
}
