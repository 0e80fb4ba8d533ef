//! The asynchronous schedule: a circular list of queue heads for control and bulk endpoints,
//! anchored at a permanently halted head with the H bit set.

use common::io::Io;
use common::pool::Block;

use super::desc::{self, QueueHead};
use super::operational::EhciRegs;
use super::{EhciInner, Schedule};
use crate::error::Result;

impl<R: EhciRegs> EhciInner<R> {
    /// Queue heads on the ring, in controller order, without the anchor.
    pub fn async_ring(&self) -> Vec<Block<QueueHead>> {
        let mut ring = Vec::new();
        let mut link = self.mem.read(self.async_head, |q| q.horiz.read());
        while let Some(qh) = self.mem.block_at::<QueueHead>(link) {
            if qh == self.async_head || ring.len() > self.qh_owner.len() {
                break;
            }
            ring.push(qh);
            link = self.mem.read(qh, |q| q.horiz.read());
        }
        ring
    }

    fn async_pred(&self, qh: Block<QueueHead>) -> Option<Block<QueueHead>> {
        let target = self.mem.bus(qh);
        let mut cur = self.async_head;
        for _ in 0..=self.qh_owner.len() {
            let next = self.mem.read(cur, |q| q.horiz.read());
            if desc::link_addr(next) == target {
                return Some(cur);
            }
            cur = self.mem.block_at(next)?;
            if cur == self.async_head {
                return None;
            }
        }
        None
    }

    pub fn async_link(&mut self, qh: Block<QueueHead>) -> Result<()> {
        self.with_schedule_stopped(Schedule::Async, |this| {
            let head = this.async_head;
            let next = this.mem.read(head, |q| q.horiz.read());
            this.mem.update(qh, |q| q.horiz.write(next));
            let link = this.mem.link(qh);
            this.mem.update(head, |q| q.horiz.write(link));
        })
    }

    pub fn async_unlink(&mut self, qh: Block<QueueHead>) -> Result<()> {
        self.with_schedule_stopped(Schedule::Async, |this| match this.async_pred(qh) {
            Some(pred) => {
                let next = this.mem.read(qh, |q| q.horiz.read());
                this.mem.update(pred, |q| q.horiz.write(next));
            }
            None => log::warn!("queue head {:?} is not on the async ring", qh),
        })
    }
}
