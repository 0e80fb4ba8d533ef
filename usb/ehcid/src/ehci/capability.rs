use common::io::{Io, Mmio};

/// The read-only capability registers at the start of the EHCI register window.
///
/// See EHCI section 2.2. The operational registers follow after `len` bytes.
#[repr(C)]
pub struct CapabilityRegs {
    /// CAPLENGTH
    pub len: Mmio<u8>,
    _rsvd: Mmio<u8>,
    /// HCIVERSION in binary-coded decimal.
    pub hci_ver: Mmio<u16>,
    /// HCSPARAMS
    ///
    /// - Bits 0-3 are the number of root ports (N_PORTS).
    /// - Bit 4 is Port Power Control (PPC).
    /// - Bits 8-11 are ports per companion controller, bits 12-15 the number of companions.
    pub hcs_params: Mmio<u32>,
    /// HCCPARAMS
    ///
    /// - Bit 0 is 64-bit addressing capability (AC64).
    /// - Bit 1 is the programmable frame list flag (PFLF).
    /// - Bits 4-7 are the isochronous scheduling threshold (IST).
    pub hcc_params: Mmio<u32>,
}

pub const HCS_PARAMS_N_PORTS_MASK: u32 = 0x0000_000F;
pub const HCS_PARAMS_PPC_BIT: u32 = 1 << 4;
pub const HCS_PARAMS_N_CC_MASK: u32 = 0x0000_F000;
pub const HCS_PARAMS_N_CC_SHIFT: u8 = 12;

pub const HCC_PARAMS_AC64_BIT: u32 = 1 << 0;
pub const HCC_PARAMS_PFLF_BIT: u32 = 1 << 1;
pub const HCC_PARAMS_IST_MASK: u32 = 0x0000_00F0;
pub const HCC_PARAMS_IST_SHIFT: u8 = 4;

/// Decoded structural and capability parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    pub ports: u8,
    pub port_power_control: bool,
    pub companions: u8,
    pub ac64: bool,
    pub programmable_frame_list: bool,
    /// Isochronous scheduling threshold, in microframes.
    pub iso_threshold_uframes: u8,
}

impl Capabilities {
    pub fn decode(hcs_params: u32, hcc_params: u32) -> Self {
        let ist = ((hcc_params & HCC_PARAMS_IST_MASK) >> HCC_PARAMS_IST_SHIFT) as u8;
        Self {
            ports: (hcs_params & HCS_PARAMS_N_PORTS_MASK) as u8,
            port_power_control: hcs_params & HCS_PARAMS_PPC_BIT != 0,
            companions: ((hcs_params & HCS_PARAMS_N_CC_MASK) >> HCS_PARAMS_N_CC_SHIFT) as u8,
            ac64: hcc_params & HCC_PARAMS_AC64_BIT != 0,
            programmable_frame_list: hcc_params & HCC_PARAMS_PFLF_BIT != 0,
            // Bit 3 set means a whole frame (8 microframes) regardless of bits 0-2.
            iso_threshold_uframes: if ist & 0x8 != 0 { 8 } else { ist & 0x7 },
        }
    }

    /// Whole frames that must separate "now" from a newly queued isochronous descriptor.
    pub fn iso_threshold_frames(&self) -> u16 {
        u16::from(self.iso_threshold_uframes).div_ceil(8) + 1
    }
}

impl CapabilityRegs {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::decode(self.hcs_params.read(), self.hcc_params.read())
    }
}
