//! qTD chains for control, bulk and interrupt transfers.

use common::dma::DmaRegion;
use common::io::Io;
use common::pool::Block;
use log::{error, trace};

use super::desc::{Pid, Qtd, QtdStatus, QtdToken, PAGE_MASK, LINK_TERMINATE, QTD_MAX_BYTES};
use super::mem::DescMem;
use super::operational::EhciRegs;
use super::{EhciInner, EpKind, InFlight, Schedule, Work};
use crate::error::{Result, UsbError};
use crate::hcd::{HcEpHandle, Token, UrbOutcome, UrbRequest};

/// Retry budget written to every qTD.
const CERR: u8 = 3;

/// Where a chain stands, as far as the descriptors tell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Progress {
    pub actual: usize,
    pub packets: usize,
    /// `None` while the controller still owns part of the chain.
    pub status: Option<Result<()>>,
}

/// Packets it took to move `len` bytes (a zero length packet still counts).
fn packets(len: usize, mps: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(mps)
    }
}

/// Error bits only mean something once the qTD has halted; the ping bit is an error only for
/// split transactions.
pub fn classify(status: QtdStatus, split: bool) -> Result<()> {
    if !status.contains(QtdStatus::HALTED) {
        return Ok(());
    }
    let mut errors = QtdStatus::DATA_BUFFER_ERR
        | QtdStatus::BABBLE
        | QtdStatus::XACT_ERR
        | QtdStatus::MISSED_UFRAME;
    if split {
        errors |= QtdStatus::PING;
    }
    if status.intersects(errors) {
        Err(UsbError::Io)
    } else {
        Err(UsbError::Stall)
    }
}

/// Split `len` bytes at bus address `bus` into linked, active qTDs. Every qTD but the last moves
/// a whole number of packets, and only the last one interrupts.
pub fn build_chain(
    mem: &mut DescMem,
    bus: u32,
    len: usize,
    pid: Pid,
    mps: usize,
    toggle: bool,
    max_per_qtd: usize,
    alt_next: u32,
) -> Result<(Block<Qtd>, Vec<usize>)> {
    let mut blocks: Vec<Block<Qtd>> = Vec::new();
    let mut lens = Vec::new();
    let mut toggle = toggle;
    let mut offset = 0;

    loop {
        let remaining = len - offset;
        let start = bus.wrapping_add(offset as u32);
        let fits = QTD_MAX_BYTES - (start & PAGE_MASK) as usize;
        let mut chunk = remaining.min(fits).min(max_per_qtd);
        if chunk < remaining {
            chunk -= chunk % mps;
            if chunk == 0 {
                chunk = mps.min(remaining).min(fits);
            }
        }

        let block = match mem.alloc::<Qtd>() {
            Ok(block) => block,
            Err(err) => {
                for block in blocks {
                    mem.free(block);
                }
                return Err(err);
            }
        };
        mem.update(block, |q| {
            q.set_buffer(start, chunk);
            q.alt_next.write(alt_next);
            q.set_token(&QtdToken {
                status: QtdStatus::ACTIVE,
                pid,
                cerr: CERR,
                c_page: 0,
                ioc: false,
                total_bytes: chunk as u16,
                toggle,
            });
        });
        if let Some(&prev) = blocks.last() {
            let link = mem.bus(block);
            mem.update(prev, |q| q.next.write(link));
        }
        blocks.push(block);
        lens.push(chunk);

        toggle ^= packets(chunk, mps) % 2 == 1;
        offset += chunk;
        if offset >= len {
            break;
        }
    }

    if let Some(&last) = blocks.last() {
        mem.update(last, |q| {
            let mut token = q.token();
            token.ioc = true;
            q.set_token(&token);
        });
    }
    Ok((blocks[0], lens))
}

/// Read back a chain from its first qTD.
pub fn chain_progress(mem: &DescMem, head: Block<Qtd>, lens: &[usize], mps: usize, split: bool) -> Progress {
    let mut progress = Progress {
        actual: 0,
        packets: 0,
        status: Some(Ok(())),
    };
    let mut cur = Some(head);

    for &len in lens.iter() {
        let block = match cur {
            Some(block) => block,
            None => break,
        };
        let (token, next) = mem.read(block, |q| (q.token(), q.next.read()));
        if token.status.contains(QtdStatus::ACTIVE) {
            progress.status = None;
            return progress;
        }

        let done = len.saturating_sub(usize::from(token.total_bytes));
        progress.actual += done;
        let status = classify(token.status, split);
        if status.is_err() {
            progress.packets += done.div_ceil(mps);
            progress.status = Some(status);
            return progress;
        }
        progress.packets += packets(done, mps);
        if done < len {
            // Short packet: the controller went to the alternate next qTD.
            return progress;
        }
        cur = mem.block_at(next).filter(|_| next & LINK_TERMINATE == 0);
    }
    progress
}

pub fn free_chain(mem: &mut DescMem, head: Block<Qtd>, count: usize) {
    let mut cur = Some(head);
    for _ in 0..count {
        let block = match cur {
            Some(block) => block,
            None => break,
        };
        let next = mem.read(block, |q| q.next.read());
        mem.free(block);
        cur = mem.block_at(next).filter(|_| next & LINK_TERMINATE == 0);
    }
}

impl<R: EhciRegs> EhciInner<R> {
    pub fn submit_qtds(&mut self, handle: HcEpHandle, seq: u64, req: &UrbRequest<'_>) -> Result<()> {
        let dead = self.mem.bus(self.dead_qtd);
        let max_per_qtd = self.cfg.qtd_max_len;
        let ep = self.endpoint(handle)?;
        let qh = ep.qh().ok_or(UsbError::InvalidArg)?;
        let mps = usize::from(ep.info.max_packet()).max(1);

        let (pid, dir_in) = match req.token {
            Token::Setup => (Pid::Setup, false),
            Token::In => (Pid::In, true),
            Token::Out => (Pid::Out, false),
        };
        let toggle = match req.token {
            Token::Setup => false,
            _ if req.status_stage => true,
            _ => ep.toggle,
        };

        let mut buffer = DmaRegion::new(req.len, 64, &self.mem.translate)?;
        if !dir_in {
            let n = req.len.min(req.data.len());
            buffer.as_mut_slice()[..n].copy_from_slice(&req.data[..n]);
        }
        buffer.flush(self.mem.cache());

        // IN transfers end at the first short packet.
        let alt_next = if dir_in { dead } else { LINK_TERMINATE };
        let (head, lens) = build_chain(
            &mut self.mem,
            buffer.bus(),
            req.len,
            pid,
            mps,
            toggle,
            max_per_qtd,
            alt_next,
        )?;
        trace!(
            "{:?} seq {}: {:?} {} bytes in {} qTDs, toggle {}",
            handle,
            seq,
            req.token,
            req.len,
            lens.len(),
            toggle as u8
        );

        let head_bus = self.mem.bus(head);
        self.mem.update(qh, |q| q.attach(head_bus, toggle));
        self.endpoint_mut(handle)?.xfer = Some(InFlight {
            seq,
            dir_in,
            buffer,
            work: Some(Work::Qtds { head, lens }),
            outcome: None,
            toggle,
        });
        Ok(())
    }

    /// Retire the chain of `handle` if the controller is done with it. Returns the sequence
    /// number to notify.
    pub fn reap_qtds(&mut self, handle: HcEpHandle) -> Option<u64> {
        let ep = self.endpoint(handle).ok()?;
        let qh = ep.qh()?;
        let xfer = ep.xfer.as_ref()?;
        let (head, lens) = match xfer.work.as_ref()? {
            Work::Qtds { head, lens } => (*head, lens),
            Work::Iso(_) => return None,
        };
        let mps = usize::from(ep.info.max_packet()).max(1);
        let progress = chain_progress(&self.mem, head, lens, mps, ep.is_split());
        let status = progress.status?;
        let count = lens.len();

        self.mem.update(qh, |q| q.reset_overlay());
        free_chain(&mut self.mem, head, count);

        let cache = std::sync::Arc::clone(&self.mem.cache);
        let ep = self.endpoint_mut(handle).ok()?;
        let xfer = ep.xfer.as_mut()?;
        xfer.work = None;
        ep.toggle = xfer.toggle ^ (progress.packets % 2 == 1);
        if status == Err(UsbError::Stall) || status == Err(UsbError::Io) {
            ep.halted = true;
        }
        let data = if xfer.dir_in {
            xfer.buffer.invalidate(&*cache);
            xfer.buffer.as_slice()[..progress.actual].to_vec()
        } else {
            Vec::new()
        };
        xfer.outcome = Some(UrbOutcome {
            actual: progress.actual,
            status,
            data,
            iso_frames: Vec::new(),
        });
        Some(xfer.seq)
    }

    /// Cancel the submission `seq` on `handle`, if it is still the one in flight.
    pub fn abort(&mut self, handle: HcEpHandle, seq: u64) -> Result<()> {
        let ep = self.endpoint(handle)?;
        match ep.xfer.as_ref() {
            Some(xfer) if xfer.seq == seq => {}
            _ => return Ok(()),
        }
        let kind = ep.kind;
        let mps = usize::from(ep.info.max_packet()).max(1);
        let split = ep.is_split();
        let work = self
            .endpoint_mut(handle)?
            .xfer
            .as_mut()
            .and_then(|xfer| xfer.work.take());

        let stopped = match (work, kind) {
            (None, _) => Ok(None),
            (Some(Work::Qtds { head, lens }), EpKind::Async { qh })
            | (Some(Work::Qtds { head, lens }), EpKind::Interrupt { qh, .. }) => {
                let schedule = match kind {
                    EpKind::Async { .. } => Schedule::Async,
                    _ => Schedule::Periodic,
                };
                self.with_schedule_stopped(schedule, |this| {
                    let progress = chain_progress(&this.mem, head, &lens, mps, split);
                    this.mem.update(qh, |q| q.reset_overlay());
                    free_chain(&mut this.mem, head, lens.len());
                    Some(progress.packets)
                })
            }
            (Some(Work::Iso(iso)), _) => self.with_schedule_stopped(Schedule::Periodic, |this| {
                this.drop_iso(iso);
                None
            }),
            (Some(_), _) => Ok(None),
        };

        let ep = self.endpoint_mut(handle)?;
        match stopped {
            Ok(packets) => {
                if let Some(xfer) = ep.xfer.take() {
                    if let Some(packets) = packets {
                        ep.toggle = xfer.toggle ^ (packets % 2 == 1);
                    }
                }
                Ok(())
            }
            Err(err) => {
                // The controller may still write into the buffer.
                error!("{:?}: abort failed, leaking transfer {}", handle, seq);
                if let Some(xfer) = ep.xfer.take() {
                    std::mem::forget(xfer);
                }
                Err(err)
            }
        }
    }
}
