use common::io::{Io, Mmio};

use super::capability::{Capabilities, CapabilityRegs};

/// The operational registers (EHCI section 2.3). The port status/control array follows at 0x44.
#[repr(C)]
pub struct OperationalRegs {
    pub usb_cmd: Mmio<u32>,
    pub usb_sts: Mmio<u32>,
    pub usb_intr: Mmio<u32>,
    pub frindex: Mmio<u32>,
    pub ctrl_ds_segment: Mmio<u32>,
    pub periodic_list_base: Mmio<u32>,
    pub async_list_addr: Mmio<u32>,
    _rsvd: [Mmio<u32>; 9],
    pub config_flag: Mmio<u32>,
}

pub const PORTSC_OFFSET: usize = 0x44;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpReg {
    UsbCmd,
    UsbSts,
    UsbIntr,
    FrIndex,
    CtrlDsSegment,
    PeriodicListBase,
    AsyncListAddr,
    ConfigFlag,
}

bitflags::bitflags! {
    pub struct UsbCmd: u32 {
        const RS = 1 << 0;
        const HCRESET = 1 << 1;
        /// Frame list size field (bits 2-3) set to 256 entries.
        const FLS_256 = 0b10 << 2;
        const FLS_MASK = 0b11 << 2;
        const PSE = 1 << 4;
        const ASE = 1 << 5;
        const IAAD = 1 << 6;
        const LHCRESET = 1 << 7;
        /// Interrupt threshold control (bits 16-23) of one microframe.
        const ITC_1 = 0x01 << 16;
        const ITC_MASK = 0xFF << 16;
    }
}

bitflags::bitflags! {
    pub struct UsbSts: u32 {
        const USBINT = 1 << 0;
        const USBERRINT = 1 << 1;
        const PCD = 1 << 2;
        const FLR = 1 << 3;
        const HSE = 1 << 4;
        const IAA = 1 << 5;
        const HCHALTED = 1 << 12;
        const RECLAMATION = 1 << 13;
        const PSS = 1 << 14;
        const ASS = 1 << 15;
        /// The write-1-to-clear interrupt bits.
        const ACK_MASK = 0x3F;
    }
}

bitflags::bitflags! {
    pub struct UsbIntr: u32 {
        const USBINT = 1 << 0;
        const USBERRINT = 1 << 1;
        const PCD = 1 << 2;
        const FLR = 1 << 3;
        const HSE = 1 << 4;
        const IAA = 1 << 5;
    }
}

bitflags::bitflags! {
    pub struct PortSc: u32 {
        const CCS = 1 << 0;
        const CSC = 1 << 1;
        const PE = 1 << 2;
        const PEC = 1 << 3;
        const OCA = 1 << 4;
        const OCC = 1 << 5;
        const FPR = 1 << 6;
        const SUSPEND = 1 << 7;
        const PR = 1 << 8;
        /// Line status K-state: a low-speed device is attached.
        const LS_K = 0b01 << 10;
        const LS_J = 0b10 << 10;
        const LS_MASK = 0b11 << 10;
        const PP = 1 << 12;
        /// Port owned by the companion controller.
        const PO = 1 << 13;
        const WKCNNT_E = 1 << 20;
        const WKDSCNNT_E = 1 << 21;
        const WKOC_E = 1 << 22;
        /// Write-1-to-clear change bits that must not be echoed back on read-modify-write.
        const W1C_MASK = Self::CSC.bits | Self::PEC.bits | Self::OCC.bits;
    }
}

impl PortSc {
    pub fn is_low_speed(self) -> bool {
        self & Self::LS_MASK == Self::LS_K
    }
}

/// Register access for one EHCI instance.
pub trait EhciRegs: Send {
    fn hcs_params(&self) -> u32;
    fn hcc_params(&self) -> u32;
    fn read(&self, reg: OpReg) -> u32;
    fn write(&mut self, reg: OpReg, value: u32);
    /// `port` is zero based.
    fn port_read(&self, port: usize) -> u32;
    fn port_write(&mut self, port: usize, value: u32);

    fn capabilities(&self) -> Capabilities {
        Capabilities::decode(self.hcs_params(), self.hcc_params())
    }

    fn cmd(&self) -> UsbCmd {
        UsbCmd::from_bits_truncate(self.read(OpReg::UsbCmd))
    }

    fn set_cmd(&mut self, cmd: UsbCmd) {
        self.write(OpReg::UsbCmd, cmd.bits());
    }

    fn sts(&self) -> UsbSts {
        UsbSts::from_bits_truncate(self.read(OpReg::UsbSts))
    }

    fn ack(&mut self, sts: UsbSts) {
        self.write(OpReg::UsbSts, (sts & UsbSts::ACK_MASK).bits());
    }

    fn portsc(&self, port: usize) -> PortSc {
        PortSc::from_bits_truncate(self.port_read(port))
    }

    /// Read-modify-write a port without clearing pending change bits by accident.
    fn portsc_modify(&mut self, port: usize, f: impl FnOnce(PortSc) -> PortSc)
    where
        Self: Sized,
    {
        let value = self.portsc(port) - PortSc::W1C_MASK;
        self.port_write(port, f(value).bits());
    }
}

/// The real register window of a memory mapped controller.
pub struct MmioRegs {
    cap: &'static CapabilityRegs,
    op: &'static mut OperationalRegs,
    ports: &'static mut [Mmio<u32>],
}

impl MmioRegs {
    /// # Safety
    /// `base` must be the virtual address of a mapped EHCI register window that stays mapped for
    /// the lifetime of the program and is not accessed through any other path.
    pub unsafe fn new(base: usize) -> Self {
        let cap = &*(base as *const CapabilityRegs);
        let op_base = base + usize::from(cap.len.read());
        let op = &mut *(op_base as *mut OperationalRegs);
        let n_ports = usize::from(cap.capabilities().ports);
        let ports = std::slice::from_raw_parts_mut((op_base + PORTSC_OFFSET) as *mut Mmio<u32>, n_ports);

        log::debug!(
            "EHCI {:#x}: version {:#06x}, {} ports",
            base,
            cap.hci_ver.read(),
            n_ports
        );

        Self { cap, op, ports }
    }

    fn reg(&self, reg: OpReg) -> &Mmio<u32> {
        match reg {
            OpReg::UsbCmd => &self.op.usb_cmd,
            OpReg::UsbSts => &self.op.usb_sts,
            OpReg::UsbIntr => &self.op.usb_intr,
            OpReg::FrIndex => &self.op.frindex,
            OpReg::CtrlDsSegment => &self.op.ctrl_ds_segment,
            OpReg::PeriodicListBase => &self.op.periodic_list_base,
            OpReg::AsyncListAddr => &self.op.async_list_addr,
            OpReg::ConfigFlag => &self.op.config_flag,
        }
    }

    fn reg_mut(&mut self, reg: OpReg) -> &mut Mmio<u32> {
        match reg {
            OpReg::UsbCmd => &mut self.op.usb_cmd,
            OpReg::UsbSts => &mut self.op.usb_sts,
            OpReg::UsbIntr => &mut self.op.usb_intr,
            OpReg::FrIndex => &mut self.op.frindex,
            OpReg::CtrlDsSegment => &mut self.op.ctrl_ds_segment,
            OpReg::PeriodicListBase => &mut self.op.periodic_list_base,
            OpReg::AsyncListAddr => &mut self.op.async_list_addr,
            OpReg::ConfigFlag => &mut self.op.config_flag,
        }
    }
}

impl EhciRegs for MmioRegs {
    fn hcs_params(&self) -> u32 {
        self.cap.hcs_params.read()
    }

    fn hcc_params(&self) -> u32 {
        self.cap.hcc_params.read()
    }

    fn read(&self, reg: OpReg) -> u32 {
        self.reg(reg).read()
    }

    fn write(&mut self, reg: OpReg, value: u32) {
        self.reg_mut(reg).write(value)
    }

    fn port_read(&self, port: usize) -> u32 {
        self.ports[port].read()
    }

    fn port_write(&mut self, port: usize, value: u32) {
        self.ports[port].write(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<OperationalRegs>(), 0x44);
    }

    #[test]
    fn port_bits() {
        assert!(PortSc::LS_K.is_low_speed());
        assert!(!(PortSc::LS_J | PortSc::CCS).is_low_speed());
        assert_eq!(PortSc::W1C_MASK.bits(), 0x2A);
        assert_eq!(UsbCmd::FLS_256.bits(), 0x8);
    }
}
