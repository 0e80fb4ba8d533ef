//! Hardware descriptor layouts for the async and periodic schedules (EHCI section 3).
//!
//! Every structure is 32-byte aligned and only ever lives inside a descriptor pool. Link
//! pointers and buffer pointers hold bus addresses.

use std::ops::{Deref, DerefMut};

use common::io::{Io, Mmio};
use plain::Plain;

use crate::usb::Speed;

pub const LINK_TERMINATE: u32 = 1 << 0;
pub const LINK_TYPE_SHIFT: u8 = 1;
pub const LINK_TYPE_MASK: u32 = 0b11 << LINK_TYPE_SHIFT;
pub const LINK_ADDR_MASK: u32 = !0x1F;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LinkType {
    Itd = 0,
    Qh = 1,
    Sitd = 2,
    Fstn = 3,
}

/// Builds a horizontal link pointer to the descriptor at `bus`.
pub const fn link(bus: u32, ty: LinkType) -> u32 {
    (bus & LINK_ADDR_MASK) | ((ty as u32) << LINK_TYPE_SHIFT)
}

pub const fn link_addr(link: u32) -> u32 {
    link & LINK_ADDR_MASK
}

pub fn link_type(link: u32) -> LinkType {
    match (link & LINK_TYPE_MASK) >> LINK_TYPE_SHIFT {
        0 => LinkType::Itd,
        1 => LinkType::Qh,
        2 => LinkType::Sitd,
        _ => LinkType::Fstn,
    }
}

pub const fn is_terminated(link: u32) -> bool {
    link & LINK_TERMINATE != 0
}

// Queue head endpoint characteristics (dword 1).
pub const QH_CHAR_DEV_ADDR_MASK: u32 = 0x7F;
pub const QH_CHAR_INACTIVATE_BIT: u32 = 1 << 7;
pub const QH_CHAR_ENDP_SHIFT: u8 = 8;
pub const QH_CHAR_ENDP_MASK: u32 = 0xF << QH_CHAR_ENDP_SHIFT;
pub const QH_CHAR_EPS_SHIFT: u8 = 12;
pub const QH_CHAR_EPS_MASK: u32 = 0b11 << QH_CHAR_EPS_SHIFT;
pub const QH_CHAR_DTC_BIT: u32 = 1 << 14;
pub const QH_CHAR_HEAD_BIT: u32 = 1 << 15;
pub const QH_CHAR_MPS_SHIFT: u8 = 16;
pub const QH_CHAR_MPS_MASK: u32 = 0x7FF << QH_CHAR_MPS_SHIFT;
pub const QH_CHAR_CONTROL_BIT: u32 = 1 << 27;
pub const QH_CHAR_NAK_RL_SHIFT: u8 = 28;

// Queue head endpoint capabilities (dword 2).
pub const QH_CAP_SMASK_MASK: u32 = 0xFF;
pub const QH_CAP_CMASK_SHIFT: u8 = 8;
pub const QH_CAP_HUB_SHIFT: u8 = 16;
pub const QH_CAP_PORT_SHIFT: u8 = 23;
pub const QH_CAP_MULT_SHIFT: u8 = 30;

/// EPS encoding of a bus speed.
pub fn speed_bits(speed: Speed) -> u32 {
    match speed {
        Speed::Full => 0,
        Speed::Low => 1,
        Speed::High => 2,
    }
}

/// Static part of a queue head: dwords 1 and 2.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QhEndpoint {
    pub dev_addr: u8,
    pub endpoint: u8,
    pub speed_bits: u32,
    pub max_packet: u16,
    pub head: bool,
    /// Take the data toggle from the qTD instead of the overlay.
    pub dtc: bool,
    /// Full/low-speed control endpoint behind a transaction translator.
    pub control: bool,
    pub nak_reload: u8,
    pub s_mask: u8,
    pub c_mask: u8,
    pub hub_addr: u8,
    pub port: u8,
    pub mult: u8,
}

impl QhEndpoint {
    pub fn characteristics(&self) -> u32 {
        let mut value = u32::from(self.dev_addr) & QH_CHAR_DEV_ADDR_MASK;
        value |= (u32::from(self.endpoint) << QH_CHAR_ENDP_SHIFT) & QH_CHAR_ENDP_MASK;
        value |= (self.speed_bits << QH_CHAR_EPS_SHIFT) & QH_CHAR_EPS_MASK;
        if self.dtc {
            value |= QH_CHAR_DTC_BIT;
        }
        if self.head {
            value |= QH_CHAR_HEAD_BIT;
        }
        value |= (u32::from(self.max_packet) << QH_CHAR_MPS_SHIFT) & QH_CHAR_MPS_MASK;
        if self.control {
            value |= QH_CHAR_CONTROL_BIT;
        }
        value | (u32::from(self.nak_reload & 0xF) << QH_CHAR_NAK_RL_SHIFT)
    }

    pub fn capabilities(&self) -> u32 {
        u32::from(self.s_mask)
            | (u32::from(self.c_mask) << QH_CAP_CMASK_SHIFT)
            | ((u32::from(self.hub_addr) & 0x7F) << QH_CAP_HUB_SHIFT)
            | ((u32::from(self.port) & 0x7F) << QH_CAP_PORT_SHIFT)
            | ((u32::from(self.mult) & 0x3) << QH_CAP_MULT_SHIFT)
    }

    pub fn decode(characteristics: u32, capabilities: u32) -> Self {
        Self {
            dev_addr: (characteristics & QH_CHAR_DEV_ADDR_MASK) as u8,
            endpoint: ((characteristics & QH_CHAR_ENDP_MASK) >> QH_CHAR_ENDP_SHIFT) as u8,
            speed_bits: (characteristics & QH_CHAR_EPS_MASK) >> QH_CHAR_EPS_SHIFT,
            max_packet: ((characteristics & QH_CHAR_MPS_MASK) >> QH_CHAR_MPS_SHIFT) as u16,
            head: characteristics & QH_CHAR_HEAD_BIT != 0,
            dtc: characteristics & QH_CHAR_DTC_BIT != 0,
            control: characteristics & QH_CHAR_CONTROL_BIT != 0,
            nak_reload: (characteristics >> QH_CHAR_NAK_RL_SHIFT) as u8,
            s_mask: (capabilities & QH_CAP_SMASK_MASK) as u8,
            c_mask: (capabilities >> QH_CAP_CMASK_SHIFT) as u8,
            hub_addr: ((capabilities >> QH_CAP_HUB_SHIFT) & 0x7F) as u8,
            port: ((capabilities >> QH_CAP_PORT_SHIFT) & 0x7F) as u8,
            mult: ((capabilities >> QH_CAP_MULT_SHIFT) & 0x3) as u8,
        }
    }
}

// qTD token (EHCI section 3.5.3).
pub const QTD_TOKEN_PID_SHIFT: u8 = 8;
pub const QTD_TOKEN_PID_MASK: u32 = 0b11 << QTD_TOKEN_PID_SHIFT;
pub const QTD_TOKEN_CERR_SHIFT: u8 = 10;
pub const QTD_TOKEN_CERR_MASK: u32 = 0b11 << QTD_TOKEN_CERR_SHIFT;
pub const QTD_TOKEN_CPAGE_SHIFT: u8 = 12;
pub const QTD_TOKEN_IOC_BIT: u32 = 1 << 15;
pub const QTD_TOKEN_BYTES_SHIFT: u8 = 16;
pub const QTD_TOKEN_BYTES_MASK: u32 = 0x7FFF << QTD_TOKEN_BYTES_SHIFT;
pub const QTD_TOKEN_TOGGLE_BIT: u32 = 1 << 31;

pub const QTD_PAGES: usize = 5;
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;
/// Largest transfer one qTD can describe when the buffer starts on a page boundary.
pub const QTD_MAX_BYTES: usize = QTD_PAGES * PAGE_SIZE as usize;

bitflags::bitflags! {
    /// Status byte of a qTD token.
    pub struct QtdStatus: u32 {
        const PING = 1 << 0;
        const SPLIT_STATE = 1 << 1;
        const MISSED_UFRAME = 1 << 2;
        const XACT_ERR = 1 << 3;
        const BABBLE = 1 << 4;
        const DATA_BUFFER_ERR = 1 << 5;
        const HALTED = 1 << 6;
        const ACTIVE = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QtdToken {
    pub status: QtdStatus,
    pub pid: Pid,
    pub cerr: u8,
    pub c_page: u8,
    pub ioc: bool,
    pub total_bytes: u16,
    pub toggle: bool,
}

impl QtdToken {
    pub fn encode(&self) -> u32 {
        let mut value = self.status.bits();
        value |= (self.pid as u32) << QTD_TOKEN_PID_SHIFT;
        value |= (u32::from(self.cerr) << QTD_TOKEN_CERR_SHIFT) & QTD_TOKEN_CERR_MASK;
        value |= (u32::from(self.c_page) & 0x7) << QTD_TOKEN_CPAGE_SHIFT;
        if self.ioc {
            value |= QTD_TOKEN_IOC_BIT;
        }
        value |= (u32::from(self.total_bytes) << QTD_TOKEN_BYTES_SHIFT) & QTD_TOKEN_BYTES_MASK;
        if self.toggle {
            value |= QTD_TOKEN_TOGGLE_BIT;
        }
        value
    }

    pub fn decode(value: u32) -> Self {
        Self {
            status: QtdStatus::from_bits_truncate(value & 0xFF),
            pid: match (value & QTD_TOKEN_PID_MASK) >> QTD_TOKEN_PID_SHIFT {
                0 => Pid::Out,
                1 => Pid::In,
                _ => Pid::Setup,
            },
            cerr: ((value & QTD_TOKEN_CERR_MASK) >> QTD_TOKEN_CERR_SHIFT) as u8,
            c_page: ((value >> QTD_TOKEN_CPAGE_SHIFT) & 0x7) as u8,
            ioc: value & QTD_TOKEN_IOC_BIT != 0,
            total_bytes: ((value & QTD_TOKEN_BYTES_MASK) >> QTD_TOKEN_BYTES_SHIFT) as u16,
            toggle: value & QTD_TOKEN_TOGGLE_BIT != 0,
        }
    }
}

/// The eight dwords shared by a qTD and the transfer overlay of a queue head.
#[repr(C)]
pub struct QtdWords {
    pub next: Mmio<u32>,
    pub alt_next: Mmio<u32>,
    pub token: Mmio<u32>,
    pub buffer: [Mmio<u32>; QTD_PAGES],
}

impl QtdWords {
    /// Inactive, unlinked, no buffer.
    pub fn clear(&mut self) {
        self.next.write(LINK_TERMINATE);
        self.alt_next.write(LINK_TERMINATE);
        self.token.write(0);
        for buffer in self.buffer.iter_mut() {
            buffer.write(0);
        }
    }

    /// Point the buffer list at `len` bytes starting at bus address `start`. Returns how many
    /// bytes fit in the five page pointers.
    pub fn set_buffer(&mut self, start: u32, len: usize) -> usize {
        let fits = QTD_MAX_BYTES - (start & PAGE_MASK) as usize;
        let len = len.min(fits);
        self.buffer[0].write(if len == 0 { 0 } else { start });
        let first_page = start & !PAGE_MASK;
        for i in 1..QTD_PAGES {
            let page = first_page.wrapping_add(i as u32 * PAGE_SIZE);
            let used = len > 0 && (page.wrapping_sub(start) as usize) < len;
            self.buffer[i].write(if used { page } else { 0 });
        }
        len
    }

    pub fn token(&self) -> QtdToken {
        QtdToken::decode(self.token.read())
    }

    pub fn set_token(&mut self, token: &QtdToken) {
        self.token.write(token.encode());
    }
}

/// Queue element transfer descriptor.
#[repr(C, align(32))]
pub struct Qtd {
    pub words: QtdWords,
}

unsafe impl Plain for Qtd {}

impl Deref for Qtd {
    type Target = QtdWords;

    fn deref(&self) -> &QtdWords {
        &self.words
    }
}

impl DerefMut for Qtd {
    fn deref_mut(&mut self) -> &mut QtdWords {
        &mut self.words
    }
}

/// Queue head. The transfer overlay mirrors a [`Qtd`].
///
/// Only the first 48 bytes are read by the controller; the rest pads the block to the alignment.
#[repr(C, align(32))]
pub struct QueueHead {
    pub horiz: Mmio<u32>,
    pub characteristics: Mmio<u32>,
    pub capabilities: Mmio<u32>,
    pub current: Mmio<u32>,
    pub overlay: QtdWords,
}

unsafe impl Plain for QueueHead {}

impl QueueHead {
    pub fn clear(&mut self) {
        self.horiz.write(LINK_TERMINATE);
        self.characteristics.write(0);
        self.capabilities.write(0);
        self.current.write(0);
        self.overlay.clear();
    }

    pub fn set_endpoint(&mut self, ep: &QhEndpoint) {
        self.characteristics.write(ep.characteristics());
        self.capabilities.write(ep.capabilities());
    }

    pub fn endpoint(&self) -> QhEndpoint {
        QhEndpoint::decode(self.characteristics.read(), self.capabilities.read())
    }

    /// Hand a qTD chain to the queue head: the next overlay fetch will pick it up.
    pub fn attach(&mut self, first_qtd: u32, toggle: bool) {
        self.overlay.alt_next.write(LINK_TERMINATE);
        self.overlay.token.write(if toggle { QTD_TOKEN_TOGGLE_BIT } else { 0 });
        self.overlay.next.write(first_qtd);
    }

    /// Drop whatever the overlay holds, including a halt, so the queue head is idle again.
    pub fn reset_overlay(&mut self) {
        self.current.write(0);
        self.overlay.clear();
    }

    pub fn is_halted(&self) -> bool {
        QtdStatus::from_bits_truncate(self.overlay.token.read()).contains(QtdStatus::HALTED)
    }
}

// iTD transaction status/control word (EHCI section 3.3.2).
pub const ITD_TRANS_OFFSET_MASK: u32 = 0xFFF;
pub const ITD_TRANS_PG_SHIFT: u8 = 12;
pub const ITD_TRANS_IOC_BIT: u32 = 1 << 15;
pub const ITD_TRANS_LEN_SHIFT: u8 = 16;
pub const ITD_TRANS_LEN_MASK: u32 = 0xFFF << ITD_TRANS_LEN_SHIFT;
pub const ITD_BUF0_ENDP_SHIFT: u8 = 8;
pub const ITD_BUF1_DIR_IN_BIT: u32 = 1 << 11;
pub const ITD_PAGES: usize = 7;

bitflags::bitflags! {
    pub struct ItdStatus: u32 {
        const XACT_ERR = 1 << 28;
        const BABBLE = 1 << 29;
        const DATA_BUFFER_ERR = 1 << 30;
        const ACTIVE = 1 << 31;
    }
}

/// High-speed isochronous transfer descriptor: one frame, up to eight microframe transactions.
#[repr(C, align(32))]
pub struct Itd {
    pub next: Mmio<u32>,
    pub transaction: [Mmio<u32>; 8],
    pub buffer: [Mmio<u32>; ITD_PAGES],
}

unsafe impl Plain for Itd {}

impl Itd {
    pub fn clear(&mut self) {
        self.next.write(LINK_TERMINATE);
        for t in self.transaction.iter_mut() {
            t.write(0);
        }
        for b in self.buffer.iter_mut() {
            b.write(0);
        }
    }

    /// Endpoint addressing lives in the low bits of the first three page pointers.
    pub fn set_endpoint(&mut self, dev_addr: u8, endpoint: u8, dir_in: bool, max_packet: u16, mult: u8) {
        self.buffer[0].modify(
            PAGE_MASK,
            (u32::from(endpoint & 0xF) << ITD_BUF0_ENDP_SHIFT) | u32::from(dev_addr & 0x7F),
        );
        let dir = if dir_in { ITD_BUF1_DIR_IN_BIT } else { 0 };
        self.buffer[1].modify(PAGE_MASK, dir | (u32::from(max_packet) & 0x7FF));
        self.buffer[2].modify(PAGE_MASK, u32::from(mult & 0x3));
    }

    pub fn set_page(&mut self, index: usize, page: u32) {
        self.buffer[index].modify(!PAGE_MASK, page);
    }

    pub fn set_transaction(&mut self, uframe: usize, page: u8, offset: u32, len: u16, ioc: bool) {
        let mut value = ItdStatus::ACTIVE.bits();
        value |= offset & ITD_TRANS_OFFSET_MASK;
        value |= (u32::from(page) & 0x7) << ITD_TRANS_PG_SHIFT;
        value |= (u32::from(len) << ITD_TRANS_LEN_SHIFT) & ITD_TRANS_LEN_MASK;
        if ioc {
            value |= ITD_TRANS_IOC_BIT;
        }
        self.transaction[uframe].write(value);
    }

    pub fn transaction_status(&self, uframe: usize) -> ItdStatus {
        ItdStatus::from_bits_truncate(self.transaction[uframe].read())
    }

    pub fn transaction_len(&self, uframe: usize) -> u16 {
        ((self.transaction[uframe].read() & ITD_TRANS_LEN_MASK) >> ITD_TRANS_LEN_SHIFT) as u16
    }
}

// siTD (EHCI section 3.4).
pub const SITD_CHAR_DIR_IN_BIT: u32 = 1 << 31;
pub const SITD_CHAR_PORT_SHIFT: u8 = 24;
pub const SITD_CHAR_HUB_SHIFT: u8 = 16;
pub const SITD_CHAR_ENDP_SHIFT: u8 = 8;
pub const SITD_SCHED_CMASK_SHIFT: u8 = 8;
pub const SITD_STATE_IOC_BIT: u32 = 1 << 31;
pub const SITD_STATE_PAGE_SELECT_BIT: u32 = 1 << 30;
pub const SITD_STATE_BYTES_SHIFT: u8 = 16;
pub const SITD_STATE_BYTES_MASK: u32 = 0x3FF << SITD_STATE_BYTES_SHIFT;
pub const SITD_BUF1_TP_SHIFT: u8 = 3;
pub const SITD_BUF1_TCOUNT_MASK: u32 = 0x7;
/// Max bytes a full-speed split transaction moves per microframe.
pub const SPLIT_BYTES_PER_UFRAME: usize = 188;

bitflags::bitflags! {
    pub struct SitdStatus: u32 {
        const SPLIT_STATE = 1 << 1;
        const MISSED_UFRAME = 1 << 2;
        const XACT_ERR = 1 << 3;
        const BABBLE = 1 << 4;
        const DATA_BUFFER_ERR = 1 << 5;
        const ERR = 1 << 6;
        const ACTIVE = 1 << 7;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TransactionPosition {
    All = 0,
    Begin = 1,
    Mid = 2,
    End = 3,
}

/// Split-transaction isochronous descriptor for a full-speed device behind a hub.
#[repr(C, align(32))]
pub struct Sitd {
    pub next: Mmio<u32>,
    pub characteristics: Mmio<u32>,
    pub schedule: Mmio<u32>,
    pub state: Mmio<u32>,
    pub buffer: [Mmio<u32>; 2],
    pub back: Mmio<u32>,
}

unsafe impl Plain for Sitd {}

impl Sitd {
    pub fn clear(&mut self) {
        self.next.write(LINK_TERMINATE);
        self.characteristics.write(0);
        self.schedule.write(0);
        self.state.write(0);
        self.buffer[0].write(0);
        self.buffer[1].write(0);
        self.back.write(LINK_TERMINATE);
    }

    pub fn set_endpoint(&mut self, dev_addr: u8, endpoint: u8, dir_in: bool, hub_addr: u8, port: u8) {
        let mut value = u32::from(dev_addr & 0x7F);
        value |= u32::from(endpoint & 0xF) << SITD_CHAR_ENDP_SHIFT;
        value |= u32::from(hub_addr & 0x7F) << SITD_CHAR_HUB_SHIFT;
        value |= u32::from(port & 0x7F) << SITD_CHAR_PORT_SHIFT;
        if dir_in {
            value |= SITD_CHAR_DIR_IN_BIT;
        }
        self.characteristics.write(value);
    }

    pub fn set_masks(&mut self, s_mask: u8, c_mask: u8) {
        self.schedule
            .write(u32::from(s_mask) | (u32::from(c_mask) << SITD_SCHED_CMASK_SHIFT));
    }

    /// Arm the descriptor for `len` bytes at bus address `start`.
    pub fn set_transfer(&mut self, start: u32, len: u16, dir_in: bool, ioc: bool) {
        self.buffer[0].write(start);
        let mut page1 = (start & !PAGE_MASK).wrapping_add(PAGE_SIZE);
        if !dir_in {
            let count = (usize::from(len).div_ceil(SPLIT_BYTES_PER_UFRAME)).max(1) as u32;
            let tp = if count == 1 {
                TransactionPosition::All
            } else {
                TransactionPosition::Begin
            };
            page1 |= ((tp as u32) << SITD_BUF1_TP_SHIFT) | (count & SITD_BUF1_TCOUNT_MASK);
        }
        self.buffer[1].write(page1);

        let mut state = SitdStatus::ACTIVE.bits();
        state |= (u32::from(len) << SITD_STATE_BYTES_SHIFT) & SITD_STATE_BYTES_MASK;
        if ioc {
            state |= SITD_STATE_IOC_BIT;
        }
        self.state.write(state);
    }

    pub fn status(&self) -> SitdStatus {
        SitdStatus::from_bits_truncate(self.state.read() & 0xFF)
    }

    pub fn remaining(&self) -> u16 {
        ((self.state.read() & SITD_STATE_BYTES_MASK) >> SITD_STATE_BYTES_SHIFT) as u16
    }
}
