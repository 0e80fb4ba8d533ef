//! Periodic bandwidth bookkeeping and admission control.
//!
//! Every (frame, microframe) cell of the 256-frame schedule holds the bytes still available to
//! periodic traffic. Opening an endpoint picks the placement whose worst touched cell has the most
//! room, and is refused when even that cell cannot carry one packet.

use crate::error::{Result, UsbError};
use crate::hcd::EpInfo;
use crate::usb::{EndpointTy, Speed};

use super::desc::SPLIT_BYTES_PER_UFRAME;
use super::periodic::FRAME_LIST_LEN;

pub const UFRAMES: usize = 8;

/// Placement of one periodic endpoint in the schedule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BwAlloc {
    /// Polling period in frames (power of two, at most 256).
    pub period: usize,
    /// First frame of the period that carries the endpoint.
    pub phase: usize,
    pub s_mask: u8,
    pub c_mask: u8,
    /// Bytes debited from every touched cell.
    pub cost: u16,
}

impl BwAlloc {
    pub fn uframe_mask(&self) -> u8 {
        self.s_mask | self.c_mask
    }

    pub fn frames(&self) -> impl Iterator<Item = usize> {
        (self.phase..FRAME_LIST_LEN).step_by(self.period)
    }
}

/// The candidates admission has to choose from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Plan {
    pub period: usize,
    pub masks: Vec<(u8, u8)>,
    pub cost: u16,
}

/// Contiguous microframe pattern of `n` bits, `n` in 1..=6.
fn pattern(n: usize) -> u8 {
    ((1u16 << n.clamp(1, 6)) - 1) as u8
}

/// Frames between services for a full/low-speed interrupt endpoint: the largest power of two not
/// above bInterval.
fn fs_interrupt_period(interval: u8) -> usize {
    let interval = usize::from(interval.max(1));
    (1 << (usize::BITS - 1 - interval.leading_zeros())).min(FRAME_LIST_LEN)
}

/// 2^(bInterval-1) in the unit of the bus (frames or microframes).
fn exponential_interval(interval: u8) -> usize {
    1usize << (interval.clamp(1, 16) - 1)
}

pub fn plan(info: &EpInfo) -> Result<Plan> {
    let mps = info.max_packet();
    if mps == 0 {
        return Err(UsbError::InvalidArg);
    }

    match (info.speed, info.ty) {
        (Speed::High, EndpointTy::Interrupt) | (Speed::High, EndpointTy::Isoch) => {
            let uframes = exponential_interval(info.interval);
            let (period, masks) = match uframes {
                1 => (1, vec![(0xFF, 0)]),
                2 => (1, vec![(0x55, 0), (0xAA, 0)]),
                4 => (1, vec![(0x11, 0), (0x22, 0), (0x44, 0), (0x88, 0)]),
                _ => (
                    (uframes / UFRAMES).min(FRAME_LIST_LEN),
                    (0..UFRAMES).map(|u| (1u8 << u, 0)).collect(),
                ),
            };
            Ok(Plan {
                period,
                masks,
                cost: mps * u16::from(info.mult()),
            })
        }
        (Speed::Full, EndpointTy::Interrupt) | (Speed::Low, EndpointTy::Interrupt) => Ok(Plan {
            period: fs_interrupt_period(info.interval),
            masks: (0..4).map(|u| (1u8 << u, 0x07u8 << (u + 2))).collect(),
            cost: mps,
        }),
        (Speed::Full, EndpointTy::Isoch) => {
            let transactions = usize::from(mps).div_ceil(SPLIT_BYTES_PER_UFRAME).clamp(1, 6);
            let masks = if info.is_in() {
                let complete = u16::from(pattern((transactions + 1).min(6)));
                (0..UFRAMES)
                    .filter_map(|u| {
                        let c_mask = complete << (u + 2);
                        (c_mask <= 0xFF).then(|| (1u8 << u, c_mask as u8))
                    })
                    .collect()
            } else {
                let start = u16::from(pattern(transactions));
                (0..UFRAMES)
                    .filter_map(|u| {
                        let s_mask = start << u;
                        (s_mask <= 0xFF).then(|| (s_mask as u8, 0))
                    })
                    .collect()
            };
            Ok(Plan {
                period: exponential_interval(info.interval).min(FRAME_LIST_LEN),
                masks,
                cost: mps,
            })
        }
        _ => Err(UsbError::InvalidArg),
    }
}

pub struct BandwidthTable {
    remaining: Box<[[u16; UFRAMES]; FRAME_LIST_LEN]>,
    budget: u16,
}

impl BandwidthTable {
    pub fn new(budget: u16) -> Self {
        Self {
            remaining: Box::new([[budget; UFRAMES]; FRAME_LIST_LEN]),
            budget,
        }
    }

    pub fn budget(&self) -> u16 {
        self.budget
    }

    pub fn remaining(&self, frame: usize, uframe: usize) -> u16 {
        self.remaining[frame][uframe]
    }

    #[cfg(test)]
    pub fn set_remaining(&mut self, frame: usize, uframe: usize, bytes: u16) {
        self.remaining[frame][uframe] = bytes;
    }

    fn min_free(&self, period: usize, phase: usize, mask: u8) -> u16 {
        let mut min = u16::MAX;
        for frame in (phase..FRAME_LIST_LEN).step_by(period) {
            for uframe in 0..UFRAMES {
                if mask & (1 << uframe) != 0 {
                    min = min.min(self.remaining[frame][uframe]);
                }
            }
        }
        min
    }

    /// Choose a placement without touching the table.
    pub fn admit(&self, plan: &Plan) -> Result<BwAlloc> {
        let mut best: Option<(u16, BwAlloc)> = None;
        for phase in 0..plan.period {
            for &(s_mask, c_mask) in plan.masks.iter() {
                let free = self.min_free(plan.period, phase, s_mask | c_mask);
                if best.map_or(true, |(best_free, _)| free > best_free) {
                    best = Some((
                        free,
                        BwAlloc {
                            period: plan.period,
                            phase,
                            s_mask,
                            c_mask,
                            cost: plan.cost,
                        },
                    ));
                }
            }
        }

        match best {
            Some((free, alloc)) if free >= plan.cost => Ok(alloc),
            Some((free, _)) => {
                log::debug!("periodic admission refused: need {} bytes, best cell has {}", plan.cost, free);
                Err(UsbError::BandwidthNotAvailable)
            }
            None => Err(UsbError::BandwidthNotAvailable),
        }
    }

    /// Debit (`use_bw`) or credit an admitted placement.
    pub fn update(&mut self, alloc: &BwAlloc, use_bw: bool) {
        let mask = alloc.uframe_mask();
        for frame in alloc.frames() {
            for uframe in 0..UFRAMES {
                if mask & (1 << uframe) == 0 {
                    continue;
                }
                let cell = &mut self.remaining[frame][uframe];
                *cell = if use_bw {
                    cell.saturating_sub(alloc.cost)
                } else {
                    cell.saturating_add(alloc.cost).min(self.budget)
                };
            }
        }
    }
}
