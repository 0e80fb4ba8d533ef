use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::Arc;

use plain::Plain;

use crate::dma::{BusTranslate, CacheOps, DmaError, DmaRegion};

/// Index of one block inside a [`FixedPool`].
pub struct Block<T> {
    index: u16,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Block<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u16,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Block<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Block<T> {}

impl<T> PartialEq for Block<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Block<T> {}

impl<T> Hash for Block<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<T> fmt::Debug for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.index)
    }
}

/// A fixed number of equally sized, DMA-visible blocks carved out of one region.
///
/// Blocks are zeroed when handed out. All accessors go through the pool so the caller never holds
/// a raw pointer into device-visible memory.
pub struct FixedPool<T> {
    region: DmaRegion,
    free: Vec<u16>,
    used: Vec<bool>,
    _marker: PhantomData<T>,
}

impl<T: Plain> FixedPool<T> {
    pub const BLOCK_SIZE: usize = mem::size_of::<T>();

    pub fn new(count: usize, translate: &Arc<dyn BusTranslate>) -> Result<Self, DmaError> {
        if count == 0 || count > u16::MAX as usize {
            return Err(DmaError::Layout);
        }
        let align = mem::align_of::<T>().max(32);
        let region = DmaRegion::new(Self::BLOCK_SIZE * count, align, translate)?;

        Ok(Self {
            region,
            free: (0..count as u16).rev().collect(),
            used: vec![false; count],
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn alloc(&mut self) -> Option<Block<T>> {
        let index = self.free.pop()? as usize;
        self.used[index] = true;
        unsafe { ptr::write_bytes(self.ptr(index) as *mut u8, 0, Self::BLOCK_SIZE) };
        Some(Block::new(index))
    }

    pub fn free(&mut self, block: Block<T>) {
        let index = block.index();
        if self.used[index] {
            self.used[index] = false;
            self.free.push(index as u16);
        } else {
            log::warn!("double free of pool block {}", index);
        }
    }

    pub fn is_allocated(&self, block: Block<T>) -> bool {
        self.used.get(block.index()).copied().unwrap_or(false)
    }

    pub fn bus(&self, block: Block<T>) -> u32 {
        self.region.bus() + (block.index() * Self::BLOCK_SIZE) as u32
    }

    pub fn addr(&self, block: Block<T>) -> usize {
        self.ptr(block.index()) as usize
    }

    /// Map a bus address read back from hardware to the allocated block starting there.
    pub fn block_at(&self, bus: u32) -> Option<Block<T>> {
        let offset = self.region.bus_offset(bus)?;
        if offset % Self::BLOCK_SIZE != 0 {
            return None;
        }
        let index = offset / Self::BLOCK_SIZE;
        if self.used[index] {
            Some(Block::new(index))
        } else {
            None
        }
    }

    pub fn get(&self, block: Block<T>) -> &T {
        debug_assert!(self.used[block.index()]);
        unsafe { &*self.ptr(block.index()) }
    }

    pub fn get_mut(&mut self, block: Block<T>) -> &mut T {
        debug_assert!(self.used[block.index()]);
        unsafe { &mut *self.ptr(block.index()) }
    }

    /// Mutate a block and write it back for the device.
    pub fn update<R>(&mut self, cache: &dyn CacheOps, block: Block<T>, f: impl FnOnce(&mut T) -> R) -> R {
        let ret = f(self.get_mut(block));
        cache.flush(self.addr(block), Self::BLOCK_SIZE);
        ret
    }

    /// Read a block after discarding stale cache lines.
    pub fn read<R>(&self, cache: &dyn CacheOps, block: Block<T>, f: impl FnOnce(&T) -> R) -> R {
        cache.invalidate(self.addr(block), Self::BLOCK_SIZE);
        f(self.get(block))
    }

    fn ptr(&self, index: usize) -> *mut T {
        unsafe { self.region.as_ptr().add(index * Self::BLOCK_SIZE) as *mut T }
    }
}
