//! Isochronous transfers: iTDs for high-speed endpoints, siTDs for full-speed endpoints behind a
//! transaction translator. Descriptors are queued per submission at the head of the frame slots
//! the endpoint's bandwidth placement owns.

use common::dma::DmaRegion;
use common::pool::Block;
use log::{debug, trace};

use super::desc::{Itd, ItdStatus, Sitd, SitdStatus, ITD_PAGES, PAGE_MASK, PAGE_SIZE};
use super::operational::EhciRegs;
use super::periodic::{IsoDesc, FRAME_LIST_LEN};
use super::{EhciInner, EpKind, InFlight, Work};
use crate::error::{Result, UsbError};
use crate::hcd::{EpInfo, HcEpHandle, IsoFrameResult, TtInfo, Token, UrbOutcome, UrbRequest};
use crate::usb::Speed;

/// Frame numbers wrap at 11 bits.
const FRAME_MASK: usize = 0x7FF;

/// One descriptor of a submission and the request entries it carries.
pub struct IsoSlot {
    pub desc: IsoDesc,
    pub slot: usize,
    /// Frame number the descriptor runs in.
    pub frame: usize,
    /// (microframe, entry) for iTDs; a single (0, entry) for siTDs.
    pub entries: Vec<(usize, usize)>,
}

pub struct IsoWork {
    pub slots: Vec<IsoSlot>,
    pub frame_lens: Vec<u16>,
}

/// First frame at or after `start` that falls on the endpoint's phase.
fn align_to_phase(start: usize, period: usize, phase: usize) -> usize {
    start + (phase + period - start % period) % period
}

/// Whether `frame` is already behind `now`, modulo the frame counter.
fn frame_passed(frame: usize, now: usize) -> bool {
    let delta = now.wrapping_sub(frame) & FRAME_MASK;
    delta > 0 && delta < FRAME_MASK / 2
}

impl<R: EhciRegs> EhciInner<R> {
    pub fn submit_isoch(&mut self, handle: HcEpHandle, seq: u64, req: &UrbRequest<'_>) -> Result<()> {
        let iso = req.iso.ok_or(UsbError::InvalidArg)?;
        let ep = self.endpoint(handle)?;
        let info = ep.info;
        let bw = match ep.kind {
            EpKind::Isoch { bw } => bw,
            _ => return Err(UsbError::InvalidArg),
        };
        let dir_in = info.is_in();
        if matches!(req.token, Token::Setup) || dir_in != matches!(req.token, Token::In) {
            return Err(UsbError::InvalidArg);
        }

        let high_speed = info.speed == Speed::High;
        let max_len = if high_speed {
            usize::from(info.max_packet()) * usize::from(info.mult())
        } else {
            usize::from(info.max_packet())
        };
        let tt = match (high_speed, info.tt) {
            (true, _) => TtInfo { hub_addr: 0, port: 0 },
            (false, Some(tt)) => tt,
            (false, None) => return Err(UsbError::InvalidArg),
        };
        let count = iso.frame_lens.len();
        if count == 0 || iso.frame_lens.iter().any(|&len| usize::from(len) > max_len) {
            return Err(UsbError::InvalidArg);
        }

        let per_desc = if high_speed { bw.s_mask.count_ones() as usize } else { 1 };
        let desc_count = count.div_ceil(per_desc);
        let threshold = usize::from(self.cfg.iso_start_threshold.max(self.caps.iso_threshold_frames()));
        if desc_count * bw.period + threshold > FRAME_LIST_LEN {
            return Err(UsbError::InvalidArg);
        }

        let now = self.frame() as usize;
        let start = match iso.start_frame {
            Some(frame) => {
                let frame = usize::from(frame) & FRAME_MASK;
                let ahead = frame.wrapping_sub(now) & FRAME_MASK;
                if ahead < threshold || ahead + desc_count * bw.period > FRAME_LIST_LEN {
                    debug!("{:?}: start frame {} not schedulable at frame {}", handle, frame, now);
                    return Err(UsbError::InvalidArg);
                }
                now + ahead
            }
            None => now + threshold,
        };
        let first = align_to_phase(start, bw.period, bw.phase);

        let mut offsets = Vec::with_capacity(count);
        let mut total = 0;
        for &len in iso.frame_lens.iter() {
            offsets.push(total);
            total += usize::from(len);
        }
        let mut buffer = DmaRegion::new(total, PAGE_SIZE as usize, &self.mem.translate)?;
        if !dir_in {
            let n = total.min(req.data.len());
            buffer.as_mut_slice()[..n].copy_from_slice(&req.data[..n]);
        }
        buffer.flush(self.mem.cache());

        let mut descs = Vec::with_capacity(desc_count);
        for _ in 0..desc_count {
            let desc = if high_speed {
                self.mem.alloc::<Itd>().map(IsoDesc::Itd)
            } else {
                self.mem.alloc::<Sitd>().map(IsoDesc::Sitd)
            };
            match desc {
                Ok(desc) => descs.push(desc),
                Err(err) => {
                    for desc in descs {
                        desc.free(&mut self.mem);
                    }
                    return Err(err);
                }
            }
        }

        let uframes: Vec<usize> = (0..8).filter(|u| bw.s_mask & (1 << u) != 0).collect();
        let mut slots = Vec::with_capacity(desc_count);
        for (d, desc) in descs.into_iter().enumerate() {
            let frame = (first + d * bw.period) & FRAME_MASK;
            let slot = frame % FRAME_LIST_LEN;
            let entries: Vec<(usize, usize)> = (d * per_desc..((d + 1) * per_desc).min(count))
                .enumerate()
                .map(|(k, entry)| (if high_speed { uframes[k] } else { 0 }, entry))
                .collect();

            match desc {
                IsoDesc::Itd(block) => {
                    self.fill_itd(block, &info, &entries, &iso.frame_lens, &offsets, buffer.bus(), count)
                }
                IsoDesc::Sitd(block) => {
                    let (_, entry) = entries[0];
                    let addr = buffer.bus() + offsets[entry] as u32;
                    let len = iso.frame_lens[entry];
                    self.mem.update(block, |s| {
                        s.set_endpoint(info.dev_addr, info.number(), dir_in, tt.hub_addr, tt.port);
                        s.set_masks(bw.s_mask, bw.c_mask);
                        s.set_transfer(addr, len, dir_in, entry + 1 == count);
                    });
                }
            }
            self.iso_link(slot, desc);
            slots.push(IsoSlot {
                desc,
                slot,
                frame,
                entries,
            });
        }
        trace!(
            "{:?} seq {}: {} isochronous entries in {} descriptors from frame {}",
            handle,
            seq,
            count,
            slots.len(),
            first & FRAME_MASK
        );

        self.endpoint_mut(handle)?.xfer = Some(InFlight {
            seq,
            dir_in,
            buffer,
            work: Some(Work::Iso(IsoWork {
                slots,
                frame_lens: iso.frame_lens.clone(),
            })),
            outcome: None,
            toggle: false,
        });
        Ok(())
    }

    fn fill_itd(
        &mut self,
        block: Block<Itd>,
        info: &EpInfo,
        entries: &[(usize, usize)],
        frame_lens: &[u16],
        offsets: &[usize],
        bus: u32,
        count: usize,
    ) {
        let first_addr = bus + offsets[entries[0].1] as u32;
        let first_page = first_addr & !PAGE_MASK;
        let (_, last) = entries[entries.len() - 1];
        let end = bus + (offsets[last] + usize::from(frame_lens[last])) as u32;
        let last_page = (end.saturating_sub(1).max(first_addr) & !PAGE_MASK).wrapping_sub(first_page) / PAGE_SIZE;

        self.mem.update(block, |itd| {
            for page in 0..=(last_page as usize).min(ITD_PAGES - 1) {
                itd.set_page(page, first_page + page as u32 * PAGE_SIZE);
            }
            itd.set_endpoint(info.dev_addr, info.number(), info.is_in(), info.max_packet(), info.mult());
            for &(uframe, entry) in entries.iter() {
                let addr = bus + offsets[entry] as u32;
                let page = ((addr & !PAGE_MASK) - first_page) / PAGE_SIZE;
                itd.set_transaction(uframe, page as u8, addr & PAGE_MASK, frame_lens[entry], entry + 1 == count);
            }
        });
    }

    /// Per-entry results of one descriptor, or `None` while the controller still owns it.
    fn iso_slot_results(&self, slot: &IsoSlot, work: &IsoWork, dir_in: bool, now: usize) -> Option<Vec<(usize, IsoFrameResult)>> {
        let missed = frame_passed(slot.frame, now);
        let missed_result = IsoFrameResult {
            actual: 0,
            status: Err(UsbError::Io),
        };
        match slot.desc {
            IsoDesc::Itd(block) => {
                let status: Vec<(ItdStatus, u16)> = self.mem.read(block, |itd| {
                    slot.entries
                        .iter()
                        .map(|&(u, _)| (itd.transaction_status(u), itd.transaction_len(u)))
                        .collect()
                });
                if !missed && status.iter().any(|(st, _)| st.contains(ItdStatus::ACTIVE)) {
                    return None;
                }
                Some(
                    slot.entries
                        .iter()
                        .zip(status)
                        .map(|(&(_, entry), (st, len))| {
                            let result = if st.contains(ItdStatus::ACTIVE) {
                                missed_result
                            } else if st.intersects(ItdStatus::XACT_ERR | ItdStatus::BABBLE | ItdStatus::DATA_BUFFER_ERR) {
                                IsoFrameResult {
                                    actual: if dir_in { len } else { 0 },
                                    status: Err(UsbError::Io),
                                }
                            } else {
                                IsoFrameResult {
                                    actual: if dir_in { len } else { work.frame_lens[entry] },
                                    status: Ok(()),
                                }
                            };
                            (entry, result)
                        })
                        .collect(),
                )
            }
            IsoDesc::Sitd(block) => {
                let (st, remaining) = self.mem.read(block, |sitd: &Sitd| (sitd.status(), sitd.remaining()));
                if !missed && st.contains(SitdStatus::ACTIVE) {
                    return None;
                }
                let (_, entry) = slot.entries[0];
                let errors = SitdStatus::ERR
                    | SitdStatus::DATA_BUFFER_ERR
                    | SitdStatus::BABBLE
                    | SitdStatus::XACT_ERR
                    | SitdStatus::MISSED_UFRAME;
                let result = if st.contains(SitdStatus::ACTIVE) {
                    missed_result
                } else {
                    IsoFrameResult {
                        actual: work.frame_lens[entry].saturating_sub(remaining),
                        status: if st.intersects(errors) { Err(UsbError::Io) } else { Ok(()) },
                    }
                };
                Some(vec![(entry, result)])
            }
        }
    }

    /// Retire an isochronous submission once every descriptor is done or its frame has passed.
    pub fn reap_isoch(&mut self, handle: HcEpHandle) -> Option<u64> {
        let now = self.frame() as usize;
        let ep = self.endpoint(handle).ok()?;
        let xfer = ep.xfer.as_ref()?;
        let work = match xfer.work.as_ref()? {
            Work::Iso(work) => work,
            Work::Qtds { .. } => return None,
        };

        let mut frames = vec![
            IsoFrameResult {
                actual: 0,
                status: Ok(())
            };
            work.frame_lens.len()
        ];
        for slot in work.slots.iter() {
            for (entry, result) in self.iso_slot_results(slot, work, xfer.dir_in, now)? {
                frames[entry] = result;
            }
        }

        let cache = std::sync::Arc::clone(&self.mem.cache);
        let ep = self.endpoint_mut(handle).ok()?;
        let xfer = ep.xfer.as_mut()?;
        let work = match xfer.work.take() {
            Some(Work::Iso(work)) => work,
            _ => return None,
        };
        let seq = xfer.seq;
        let actual = frames.iter().map(|f| usize::from(f.actual)).sum();
        let status = frames.iter().find_map(|f| f.status.err()).map_or(Ok(()), Err);
        let data = if xfer.dir_in {
            xfer.buffer.invalidate(&*cache);
            xfer.buffer.as_slice().to_vec()
        } else {
            Vec::new()
        };
        xfer.outcome = Some(UrbOutcome {
            actual,
            status,
            data,
            iso_frames: frames,
        });

        for slot in work.slots {
            // A descriptor missing from its slot is off the schedule already; free it all the same.
            self.iso_unlink(slot.slot, slot.desc);
            self.retire(slot.desc);
        }
        Some(seq)
    }

    /// Unlink and free a submission's descriptors. The periodic schedule must be stopped.
    pub fn drop_iso(&mut self, work: IsoWork) {
        for slot in work.slots {
            self.iso_unlink(slot.slot, slot.desc);
            slot.desc.free(&mut self.mem);
        }
    }
}
