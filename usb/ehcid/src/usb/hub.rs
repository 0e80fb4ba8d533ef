use super::setup::Setup;

/// Hub class descriptor (USB2 section 11.23.2.1), without the variable-length port bitmaps.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HubDescriptorV2 {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    pub power_on_good: u8,
    pub current: u8,
}

unsafe impl plain::Plain for HubDescriptorV2 {}

impl HubDescriptorV2 {
    pub const DESCRIPTOR_KIND: u8 = 0x29;
    pub const SIZE: usize = 7;

    /// Time between powering a port and the port being usable.
    pub fn power_on_delay_ms(&self) -> u64 {
        u64::from(self.power_on_good) * 2
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
    PortTest = 21,
    PortIndicator = 22,
}

bitflags::bitflags! {
    /// wPortStatus in the low half, wPortChange in the high half (USB2 section 11.24.2.7).
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatusV2: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
        // bits 13-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        // bits 21 - 31 reserved
    }
}

unsafe impl plain::Plain for HubPortStatusV2 {}

impl HubPortStatusV2 {
    pub const CHANGE_MASK: Self = Self::from_bits_truncate(0x001F_0000);

    pub fn from_le_bytes(raw: [u8; 4]) -> Self {
        Self::from_bits_truncate(u32::from_le_bytes(raw))
    }

    pub fn is_powered(&self) -> bool {
        self.contains(Self::POWER)
    }

    pub fn is_connected(&self) -> bool {
        self.contains(Self::CONNECTION)
    }

    pub fn is_resetting(&self) -> bool {
        self.contains(Self::RESET)
    }

    pub fn is_enabled(&self) -> bool {
        self.contains(Self::ENABLE)
    }

    pub fn speed(&self) -> super::Speed {
        if self.contains(Self::HIGH_SPEED) {
            super::Speed::High
        } else if self.contains(Self::LOW_SPEED) {
            super::Speed::Low
        } else {
            super::Speed::Full
        }
    }
}

/// Hub class requests.
impl Setup {
    pub const fn get_hub_descriptor(length: u16) -> Self {
        Self {
            kind: 0b1010_0000,
            request: 0x06,
            value: (HubDescriptorV2::DESCRIPTOR_KIND as u16) << 8,
            index: 0,
            length,
        }
    }

    pub const fn get_port_status(port: u8) -> Self {
        Self {
            kind: 0b1010_0011,
            request: 0x00,
            value: 0,
            index: port as u16,
            length: 4,
        }
    }

    pub const fn set_port_feature(port: u8, feature: HubPortFeature) -> Self {
        Self {
            kind: 0b0010_0011,
            request: 0x03,
            value: feature as u16,
            index: port as u16,
            length: 0,
        }
    }

    pub const fn clear_port_feature(port: u8, feature: HubPortFeature) -> Self {
        Self {
            kind: 0b0010_0011,
            request: 0x01,
            value: feature as u16,
            index: port as u16,
            length: 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn port_status_from_wire() {
        let status = HubPortStatusV2::from_le_bytes([0x03, 0x05, 0x01, 0x00]);
        assert!(status.is_connected());
        assert!(status.is_enabled());
        assert!(status.is_powered());
        assert_eq!(status.speed(), crate::usb::Speed::High);
        assert_eq!(status & HubPortStatusV2::CHANGE_MASK, HubPortStatusV2::CONNECTION_CHANGED);
    }

    #[test]
    fn port_requests() {
        let setup = Setup::set_port_feature(3, HubPortFeature::PortReset);
        assert_eq!(setup.to_bytes(), [0x23, 0x03, 4, 0, 3, 0, 0, 0]);
        let setup = Setup::get_port_status(2);
        assert_eq!(setup.to_bytes(), [0xA3, 0x00, 0, 0, 2, 0, 4, 0]);
    }
}
