//! The periodic schedule: a 256-entry frame list feeding a binary tree of interrupt queue heads.
//!
//! The tree has one placeholder queue head per (period, branch) pair for every power-of-two
//! period from 1 to 256 frames, stored heap ordered: node `n` links to node `(n - 1) / 2`, the
//! root (period 1) is node 0 and the 256 leaves are nodes 255..=510. Frame `f` enters the tree at
//! the leaf whose branch is the 8-bit reversal of `f`, which spreads consecutive frames evenly
//! across the subtrees. An endpoint is spliced in right after the placeholder of the node that
//! matches its period and phase.
//!
//! Isochronous descriptors are inserted at the head of a frame slot, in front of its leaf.

use std::sync::Arc;

use common::dma::{BusTranslate, DmaRegion};
use common::io::Io;
use common::pool::Block;
use log::warn;

use super::desc::{self, Itd, LinkType, QhEndpoint, QtdStatus, QueueHead, Sitd, LINK_TERMINATE};
use super::mem::DescMem;
use super::operational::EhciRegs;
use super::{EhciInner, Schedule};
use crate::error::Result;
use crate::usb::Speed;

pub const FRAME_LIST_LEN: usize = 256;
pub const TREE_LEVELS: usize = 9;
pub const TREE_NODES: usize = 2 * FRAME_LIST_LEN - 1;

/// Reverse the low `bits` bits of `value`.
pub fn bit_reverse(value: usize, bits: u32) -> usize {
    if bits == 0 {
        return 0;
    }
    (value.reverse_bits() >> (usize::BITS - bits)) & ((1 << bits) - 1)
}

fn log2(period: usize) -> u32 {
    period.trailing_zeros()
}

pub fn node_index(period: usize, branch: usize) -> usize {
    period - 1 + branch
}

pub fn parent(node: usize) -> Option<usize> {
    (node > 0).then(|| (node - 1) / 2)
}

/// Period in frames served by a node.
pub fn node_period(node: usize) -> usize {
    1 << (usize::BITS - 1 - (node + 1).leading_zeros())
}

pub fn leaf_for_frame(frame: usize) -> usize {
    node_index(FRAME_LIST_LEN, bit_reverse(frame % FRAME_LIST_LEN, log2(FRAME_LIST_LEN)))
}

/// The node visited in every frame `f` with `f % period == phase`.
pub fn node_for(period: usize, phase: usize) -> usize {
    node_index(period, bit_reverse(phase % period, log2(period)))
}

/// The DMA page the controller fetches frame links from.
pub struct FrameList {
    region: DmaRegion,
}

impl FrameList {
    pub fn new(translate: &Arc<dyn BusTranslate>) -> Result<Self> {
        let region = DmaRegion::new(FRAME_LIST_LEN * 4, 4096, translate)?;
        Ok(Self { region })
    }

    pub fn bus(&self) -> u32 {
        self.region.bus()
    }

    fn entry(&self, slot: usize) -> *mut u32 {
        assert!(slot < FRAME_LIST_LEN);
        unsafe { (self.region.as_ptr() as *mut u32).add(slot) }
    }

    pub fn get(&self, mem: &DescMem, slot: usize) -> u32 {
        self.region.invalidate(mem.cache());
        u32::from_le(unsafe { self.entry(slot).read_volatile() })
    }

    pub fn set(&self, mem: &DescMem, slot: usize, link: u32) {
        unsafe { self.entry(slot).write_volatile(link.to_le()) };
        self.region.flush(mem.cache());
    }
}

/// Allocate the placeholder tree and point every frame at its leaf.
pub fn build_tree(mem: &mut DescMem, frame_list: &FrameList) -> Result<Vec<Block<QueueHead>>> {
    let mut tree = Vec::with_capacity(TREE_NODES);
    for node in 0..TREE_NODES {
        let qh = mem.alloc::<QueueHead>()?;
        let next = match parent(node) {
            Some(parent) => mem.link(tree[parent]),
            None => LINK_TERMINATE,
        };
        // Idle forever: the overlay is halted, so the controller only follows `horiz`.
        mem.update(qh, |q| {
            q.set_endpoint(&QhEndpoint {
                speed_bits: desc::speed_bits(Speed::High),
                s_mask: 0x01,
                ..Default::default()
            });
            q.overlay.token.write(QtdStatus::HALTED.bits());
            q.horiz.write(next);
        });
        tree.push(qh);
    }
    for slot in 0..FRAME_LIST_LEN {
        frame_list.set(mem, slot, mem.link(tree[leaf_for_frame(slot)]));
    }
    Ok(tree)
}

/// An isochronous descriptor sitting in a frame slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsoDesc {
    Itd(Block<Itd>),
    Sitd(Block<Sitd>),
}

impl IsoDesc {
    fn at(mem: &DescMem, link: u32) -> Option<Self> {
        if desc::is_terminated(link) {
            return None;
        }
        match desc::link_type(link) {
            LinkType::Itd => mem.block_at(link).map(IsoDesc::Itd),
            LinkType::Sitd => mem.block_at(link).map(IsoDesc::Sitd),
            _ => None,
        }
    }

    pub fn link(self, mem: &DescMem) -> u32 {
        match self {
            IsoDesc::Itd(b) => mem.link(b),
            IsoDesc::Sitd(b) => mem.link(b),
        }
    }

    fn next(self, mem: &DescMem) -> u32 {
        match self {
            IsoDesc::Itd(b) => mem.read(b, |d| d.next.read()),
            IsoDesc::Sitd(b) => mem.read(b, |d| d.next.read()),
        }
    }

    fn set_next(self, mem: &mut DescMem, link: u32) {
        match self {
            IsoDesc::Itd(b) => mem.update(b, |d| d.next.write(link)),
            IsoDesc::Sitd(b) => mem.update(b, |d| d.next.write(link)),
        }
    }

    pub fn free(self, mem: &mut DescMem) {
        match self {
            IsoDesc::Itd(b) => mem.free(b),
            IsoDesc::Sitd(b) => mem.free(b),
        }
    }
}

/// A descriptor unlinked while the controller may still hold it for the current frame.
pub struct Retired {
    pub desc: IsoDesc,
    pub frame: u32,
}

impl<R: EhciRegs> EhciInner<R> {
    /// Splice an interrupt queue head in after its placeholder. The controller sees either the
    /// old or the new link, both valid, so the schedule keeps running.
    pub fn intr_link(&mut self, qh: Block<QueueHead>, node: usize) {
        let placeholder = self.tree[node];
        let next = self.mem.read(placeholder, |p| p.horiz.read());
        self.mem.update(qh, |q| q.horiz.write(next));
        let link = self.mem.link(qh);
        self.mem.update(placeholder, |p| p.horiz.write(link));
        self.tree_users[node] += 1;
    }

    pub fn intr_unlink(&mut self, qh: Block<QueueHead>, node: usize) -> Result<()> {
        self.with_schedule_stopped(Schedule::Periodic, |this| {
            let target = this.mem.bus(qh);
            let mut cur = this.tree[node];
            loop {
                let next = this.mem.read(cur, |q| q.horiz.read());
                if desc::is_terminated(next) {
                    break;
                }
                if desc::link_addr(next) == target {
                    let after = this.mem.read(qh, |q| q.horiz.read());
                    this.mem.update(cur, |q| q.horiz.write(after));
                    this.tree_users[node] -= 1;
                    return;
                }
                match this.mem.block_at::<QueueHead>(next) {
                    Some(b) if this.qh_owner[b.index()].is_some() => cur = b,
                    _ => break,
                }
            }
            warn!("queue head {:?} not found below tree node {}", qh, node);
        })
    }

    /// Queue an isochronous descriptor at the head of a frame slot.
    pub fn iso_link(&mut self, slot: usize, desc: IsoDesc) {
        let head = self.frame_list.get(&self.mem, slot);
        desc.set_next(&mut self.mem, head);
        let link = desc.link(&self.mem);
        self.frame_list.set(&self.mem, slot, link);
    }

    pub fn iso_unlink(&mut self, slot: usize, desc: IsoDesc) -> bool {
        let target = desc.link(&self.mem);
        let after = desc.next(&self.mem);
        let head = self.frame_list.get(&self.mem, slot);
        if head == target {
            self.frame_list.set(&self.mem, slot, after);
            return true;
        }
        let mut cur = IsoDesc::at(&self.mem, head);
        while let Some(d) = cur {
            let next = d.next(&self.mem);
            if next == target {
                d.set_next(&mut self.mem, after);
                return true;
            }
            cur = IsoDesc::at(&self.mem, next);
        }
        warn!("{:?} not found in frame slot {}", desc, slot);
        false
    }

    pub fn retire(&mut self, desc: IsoDesc) {
        let frame = self.frame();
        self.retired.push(Retired { desc, frame });
    }

    /// Free retired descriptors the controller can no longer be looking at.
    pub fn reap_retired(&mut self) {
        if self.retired.is_empty() {
            return;
        }
        let frame = self.frame();
        let running = self.running;
        let mem = &mut self.mem;
        self.retired.retain(|r| {
            if running && r.frame == frame {
                true
            } else {
                r.desc.free(mem);
                false
            }
        });
    }
}
