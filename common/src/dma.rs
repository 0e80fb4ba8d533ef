use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub const PAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DmaError {
    #[error("out of DMA memory")]
    OutOfMemory,
    #[error("buffer is outside of the 32-bit bus window")]
    AddressRange,
    #[error("invalid size or alignment for a DMA region")]
    Layout,
}

/// Translation between CPU addresses and the addresses a bus master is given.
///
/// Controllers only ever see bus addresses; a descriptor pointer read back from hardware has to
/// go through `to_virt` before the CPU can touch it.
pub trait BusTranslate: Send + Sync {
    /// Make `len` bytes at `virt` visible to the device and return their bus address.
    fn map(&self, virt: usize, len: usize) -> Result<u32, DmaError>;
    fn unmap(&self, bus: u32);
    fn to_virt(&self, bus: u32) -> Option<usize>;
}

/// Bus addresses equal CPU addresses. Only usable when allocations land below 4 GiB.
pub struct IdentityBus;

impl BusTranslate for IdentityBus {
    fn map(&self, virt: usize, len: usize) -> Result<u32, DmaError> {
        let end = virt.checked_add(len).ok_or(DmaError::AddressRange)?;
        if end > u32::MAX as usize + 1 {
            return Err(DmaError::AddressRange);
        }
        Ok(virt as u32)
    }

    fn unmap(&self, _bus: u32) {}

    fn to_virt(&self, bus: u32) -> Option<usize> {
        Some(bus as usize)
    }
}

struct Window {
    virt: usize,
    len: usize,
}

/// Hands out synthetic 32-bit bus windows for arbitrary CPU allocations, similar to what an
/// IOMMU does. The page offset of every mapping is preserved so alignment carries over.
pub struct WindowedBus {
    state: Mutex<WindowedState>,
}

struct WindowedState {
    next: u32,
    windows: BTreeMap<u32, Window>,
}

impl WindowedBus {
    pub fn new(base: u32) -> Self {
        Self {
            state: Mutex::new(WindowedState {
                next: base & !(PAGE_SIZE as u32 - 1),
                windows: BTreeMap::new(),
            }),
        }
    }
}

impl Default for WindowedBus {
    fn default() -> Self {
        Self::new(0x1000_0000)
    }
}

impl BusTranslate for WindowedBus {
    fn map(&self, virt: usize, len: usize) -> Result<u32, DmaError> {
        let mut state = self.state.lock().map_err(|_| DmaError::OutOfMemory)?;
        let offset = virt % PAGE_SIZE;
        let span = (offset + len).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let base = state.next;
        // One guard page between windows.
        let next = (base as u64) + span as u64 + PAGE_SIZE as u64;
        if next > u32::MAX as u64 {
            return Err(DmaError::AddressRange);
        }
        state.next = next as u32;

        let bus = base + offset as u32;
        state.windows.insert(bus, Window { virt, len });
        Ok(bus)
    }

    fn unmap(&self, bus: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.windows.remove(&bus);
        }
    }

    fn to_virt(&self, bus: u32) -> Option<usize> {
        let state = self.state.lock().ok()?;
        let (&start, window) = state.windows.range(..=bus).next_back()?;
        let offset = (bus - start) as usize;
        if offset < window.len {
            Some(window.virt + offset)
        } else {
            None
        }
    }
}

/// Cache maintenance for memory shared with a bus master.
pub trait CacheOps: Send + Sync {
    /// Write back CPU stores in `[addr, addr + len)` so the device observes them.
    fn flush(&self, addr: usize, len: usize);
    /// Drop stale lines in `[addr, addr + len)` before the CPU reads device writes.
    fn invalidate(&self, addr: usize, len: usize);
}

/// Cache-coherent platforms only need ordering.
pub struct Coherent;

impl CacheOps for Coherent {
    fn flush(&self, _addr: usize, _len: usize) {
        fence(Ordering::Release);
    }

    fn invalidate(&self, _addr: usize, _len: usize) {
        fence(Ordering::Acquire);
    }
}

/// A zeroed, contiguous allocation that is mapped for a bus master for as long as it lives.
pub struct DmaRegion {
    virt: NonNull<u8>,
    layout: Layout,
    bus: u32,
    translate: Arc<dyn BusTranslate>,
}

// The region is plain memory, exclusively owned.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub fn new(
        len: usize,
        align: usize,
        translate: &Arc<dyn BusTranslate>,
    ) -> Result<Self, DmaError> {
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| DmaError::Layout)?;
        let virt = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(DmaError::OutOfMemory)?;

        match translate.map(virt.as_ptr() as usize, layout.size()) {
            Ok(bus) => Ok(Self {
                virt,
                layout,
                bus,
                translate: Arc::clone(translate),
            }),
            Err(err) => {
                unsafe { alloc::dealloc(virt.as_ptr(), layout) };
                Err(err)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn addr(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn bus(&self) -> u32 {
        self.bus
    }

    /// Byte offset of `bus` inside this region.
    pub fn bus_offset(&self, bus: u32) -> Option<usize> {
        let offset = bus.checked_sub(self.bus)? as usize;
        if offset < self.len() {
            Some(offset)
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.virt.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.virt.as_ptr(), self.len()) }
    }

    pub fn flush(&self, cache: &dyn CacheOps) {
        cache.flush(self.addr(), self.len());
    }

    pub fn invalidate(&self, cache: &dyn CacheOps) {
        cache.invalidate(self.addr(), self.len());
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        self.translate.unmap(self.bus);
        unsafe { alloc::dealloc(self.virt.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("virt", &self.virt)
            .field("bus", &format_args!("{:#010x}", self.bus))
            .field("len", &self.len())
            .finish()
    }
}
