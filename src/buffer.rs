//! Scratch memory for codecs.
//!
//! Decoders never reach for the global heap directly for their working
//! buffers (sliding windows, input staging, copy buffers). They ask an
//! [`Allocator`] injected per extraction session, which lets tests swap in a
//! counting or failure-injecting allocator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// Allocation hook handed to codecs.
///
/// Implementations must be thread-safe: one allocator may serve several
/// concurrent extractions, each getting its own blocks.
pub trait Allocator: Send + Sync {
    /// Return a zero-filled block of exactly `size` bytes.
    fn allocate(&self, size: usize) -> Result<Vec<u8>, Error>;

    /// Give a block back. Called exactly once per allocated block.
    fn deallocate(&self, block: Vec<u8>);
}

/// Plain heap allocator. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<Vec<u8>, Error> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        block.resize(size, 0);
        Ok(block)
    }

    fn deallocate(&self, block: Vec<u8>) {
        drop(block);
    }
}

/// Allocator that tracks live and peak bytes, with an optional ceiling.
///
/// Requests that would push live bytes above the ceiling fail with
/// [`Error::OutOfMemory`].
#[derive(Debug, Default)]
pub struct CountingAllocator {
    live: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
    ceiling: Option<usize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse any request that would exceed `ceiling` live bytes.
    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            ceiling: Some(ceiling),
            ..Self::default()
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Acquire)
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, size: usize) -> Result<Vec<u8>, Error> {
        let live = self.live.fetch_add(size, Ordering::AcqRel) + size;
        if self.ceiling.is_some_and(|ceiling| live > ceiling) {
            self.live.fetch_sub(size, Ordering::AcqRel);
            return Err(Error::OutOfMemory { requested: size });
        }
        self.peak.fetch_max(live, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::AcqRel);
        match HeapAllocator.allocate(size) {
            Ok(block) => Ok(block),
            Err(e) => {
                self.live.fetch_sub(size, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn deallocate(&self, block: Vec<u8>) {
        self.live.fetch_sub(block.len(), Ordering::AcqRel);
    }
}

/// Process-wide default allocator handle.
pub fn default_allocator() -> Arc<dyn Allocator> {
    Arc::new(HeapAllocator)
}

/// Growable byte arena backed by an [`Allocator`].
///
/// `size` bytes are valid; `pos` is the read cursor into them. Growth
/// allocates a new block, copies, and returns the old one; the buffer never
/// shrinks. Buffers are move-only.
pub struct Buffer {
    data: Vec<u8>,
    size: usize,
    pos: usize,
    alloc: Arc<dyn Allocator>,
}

impl Buffer {
    pub fn new(alloc: &Arc<dyn Allocator>, capacity: usize) -> Result<Self, Error> {
        Ok(Self {
            data: alloc.allocate(capacity)?,
            size: 0,
            pos: 0,
            alloc: Arc::clone(alloc),
        })
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Ensure room for at least `capacity` bytes, preserving contents.
    pub fn reserve(&mut self, capacity: usize) -> Result<(), Error> {
        if capacity <= self.data.len() {
            return Ok(());
        }
        let mut grown = self.alloc.allocate(capacity)?;
        grown[..self.size].copy_from_slice(&self.data[..self.size]);
        let old = std::mem::replace(&mut self.data, grown);
        self.alloc.deallocate(old);
        Ok(())
    }

    /// Append bytes, growing geometrically.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let needed = self.size + bytes.len();
        if needed > self.data.len() {
            self.reserve(needed.max(self.data.len() * 2))?;
        }
        self.data[self.size..needed].copy_from_slice(bytes);
        self.size = needed;
        Ok(())
    }

    /// The valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// The whole block, valid or not. Callers that fill it directly must
    /// follow up with [`Self::set_size`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.data.len());
        self.pos = self.pos.min(self.size);
    }

    /// Valid bytes not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..self.size]
    }

    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.size);
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.pos = 0;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.data);
        self.alloc.deallocate(block);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.data.len())
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}
