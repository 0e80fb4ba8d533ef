use plain::Plain;

pub const ENDP_ATTR_TY_MASK: u8 = 0x3;
pub const ENDP_ADDR_DIR_IN: u8 = 0x80;
pub const ENDP_ADDR_NUM_MASK: u8 = 0x0F;
/// Bits 4..=6 of bEndpointAddress must be zero.
pub const ENDP_ADDR_RESERVED_MASK: u8 = 0x70;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl Plain for EndpointDescriptor {}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum EndpointTy {
    Ctrl = 0,
    Isoch = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointTy {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDP_ATTR_TY_MASK {
            0 => EndpointTy::Ctrl,
            1 => EndpointTy::Isoch,
            2 => EndpointTy::Bulk,
            _ => EndpointTy::Interrupt,
        }
    }
}
