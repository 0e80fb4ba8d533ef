use std::sync::Arc;

use common::dma::{BusTranslate, CacheOps};
use common::pool::{Block, FixedPool};
use plain::Plain;

use super::desc::{self, Itd, LinkType, Qtd, QueueHead, Sitd};
use crate::config::StackConfig;
use crate::error::{Result, UsbError};

/// A descriptor type that has its own pool in [`DescMem`].
pub trait Descriptor: Plain + Sized {
    const LINK: LinkType;

    fn pool(mem: &DescMem) -> &FixedPool<Self>;
    fn pool_mut(mem: &mut DescMem) -> &mut FixedPool<Self>;
    fn clear(&mut self);
}

impl Descriptor for QueueHead {
    const LINK: LinkType = LinkType::Qh;

    fn pool(mem: &DescMem) -> &FixedPool<Self> {
        &mem.qh
    }
    fn pool_mut(mem: &mut DescMem) -> &mut FixedPool<Self> {
        &mut mem.qh
    }
    fn clear(&mut self) {
        QueueHead::clear(self)
    }
}

impl Descriptor for Qtd {
    // qTD pointers carry no type bits.
    const LINK: LinkType = LinkType::Itd;

    fn pool(mem: &DescMem) -> &FixedPool<Self> {
        &mem.qtd
    }
    fn pool_mut(mem: &mut DescMem) -> &mut FixedPool<Self> {
        &mut mem.qtd
    }
    fn clear(&mut self) {
        self.words.clear()
    }
}

impl Descriptor for Itd {
    const LINK: LinkType = LinkType::Itd;

    fn pool(mem: &DescMem) -> &FixedPool<Self> {
        &mem.itd
    }
    fn pool_mut(mem: &mut DescMem) -> &mut FixedPool<Self> {
        &mut mem.itd
    }
    fn clear(&mut self) {
        Itd::clear(self)
    }
}

impl Descriptor for Sitd {
    const LINK: LinkType = LinkType::Sitd;

    fn pool(mem: &DescMem) -> &FixedPool<Self> {
        &mem.sitd
    }
    fn pool_mut(mem: &mut DescMem) -> &mut FixedPool<Self> {
        &mut mem.sitd
    }
    fn clear(&mut self) {
        Sitd::clear(self)
    }
}

/// All DMA-visible descriptor memory of one controller.
///
/// Writes go through [`DescMem::update`], which flushes the block afterwards, and reads through
/// [`DescMem::read`], which invalidates it first.
pub struct DescMem {
    pub cache: Arc<dyn CacheOps>,
    pub translate: Arc<dyn BusTranslate>,
    qh: FixedPool<QueueHead>,
    qtd: FixedPool<Qtd>,
    itd: FixedPool<Itd>,
    sitd: FixedPool<Sitd>,
}

impl DescMem {
    /// `extra_qh` covers the async head and the interrupt tree placeholders.
    pub fn new(
        cfg: &StackConfig,
        extra_qh: usize,
        translate: &Arc<dyn BusTranslate>,
        cache: &Arc<dyn CacheOps>,
    ) -> Result<Self> {
        Ok(Self {
            cache: Arc::clone(cache),
            translate: Arc::clone(translate),
            qh: FixedPool::new(cfg.qh_count + extra_qh, translate)?,
            qtd: FixedPool::new(cfg.qtd_count + 1, translate)?,
            itd: FixedPool::new(cfg.itd_count.max(1), translate)?,
            sitd: FixedPool::new(cfg.sitd_count.max(1), translate)?,
        })
    }

    /// Take a cleared descriptor out of its pool and make it visible to the controller.
    pub fn alloc<T: Descriptor>(&mut self) -> Result<Block<T>> {
        let block = T::pool_mut(self).alloc().ok_or_else(|| {
            log::warn!("{} pool exhausted", std::any::type_name::<T>());
            UsbError::Alloc
        })?;
        self.update(block, |d| d.clear());
        Ok(block)
    }

    pub fn free<T: Descriptor>(&mut self, block: Block<T>) {
        T::pool_mut(self).free(block)
    }

    pub fn available<T: Descriptor>(&self) -> usize {
        T::pool(self).available()
    }

    pub fn bus<T: Descriptor>(&self, block: Block<T>) -> u32 {
        T::pool(self).bus(block)
    }

    /// Horizontal link pointer to `block`.
    pub fn link<T: Descriptor>(&self, block: Block<T>) -> u32 {
        desc::link(self.bus(block), T::LINK)
    }

    pub fn block_at<T: Descriptor>(&self, bus: u32) -> Option<Block<T>> {
        T::pool(self).block_at(bus & desc::LINK_ADDR_MASK)
    }

    pub fn update<T: Descriptor, R>(&mut self, block: Block<T>, f: impl FnOnce(&mut T) -> R) -> R {
        let cache = Arc::clone(&self.cache);
        T::pool_mut(self).update(&*cache, block, f)
    }

    pub fn read<T: Descriptor, R>(&self, block: Block<T>, f: impl FnOnce(&T) -> R) -> R {
        T::pool(self).read(&*self.cache, block, f)
    }

    pub fn cache(&self) -> &dyn CacheOps {
        &*self.cache
    }
}
