use super::DescriptorKind;

/// The eight-byte SETUP packet of a control transfer (USB2 section 9.3).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
pub enum ReqType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;

/// Standard feature selector for ENDPOINT_HALT.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;

impl Setup {
    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }

    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }

    pub const fn req_recipient(&self) -> u8 {
        self.kind & USB_SETUP_RECIPIENT_MASK
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let (value, index, length) = (self.value, self.index, self.length);
        let mut raw = [0u8; 8];
        raw[0] = self.kind;
        raw[1] = self.request;
        raw[2..4].copy_from_slice(&value.to_le_bytes());
        raw[4..6].copy_from_slice(&index.to_le_bytes());
        raw[6..8].copy_from_slice(&length.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < 8 {
            return None;
        }
        Some(Self {
            kind: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    pub const fn get_status() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x00,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x01,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x03,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn clear_endpoint_halt(endpoint_address: u8) -> Self {
        Self {
            kind: 0b0000_0010,
            request: 0x01,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    pub const fn set_endpoint_halt(endpoint_address: u8) -> Self {
        Self {
            kind: 0b0000_0010,
            request: 0x03,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x05,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x06,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn get_configuration() -> Self {
        Self {
            kind: 0b1000_0000,
            request: 0x08,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: 0x09,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_interface(interface: u8, alternate_setting: u8) -> Self {
        Self {
            kind: 0b0000_0001,
            request: 0x0B,
            value: alternate_setting as u16,
            index: interface as u16,
            length: 0,
        }
    }
}
