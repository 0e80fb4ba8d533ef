pub use self::config::ConfigDescriptor;
pub use self::device::{DeviceDescriptor, DeviceDescriptor8Byte, DeviceQualifier};
pub use self::endpoint::{EndpointDescriptor, EndpointTy, ENDP_ATTR_TY_MASK};
pub use self::hub::*;
pub use self::interface::InterfaceDescriptor;
pub use self::setup::Setup;

pub mod config;
pub mod device;
pub mod endpoint;
pub mod hub;
pub mod interface;
pub mod setup;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DescriptorKind {
    None = 0,
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Otg = 9,
    Debug = 10,
    InterfaceAssociation = 11,
    Hid = 33,
    Report = 34,
    Hub = 41,
}

/// Bus speed of a device as seen by the host controller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Speed {
    Low,
    Full,
    High,
}

impl Speed {
    /// Default control endpoint packet size to use before the device descriptor is known.
    pub fn default_mps0(self) -> u16 {
        match self {
            Speed::Low => 8,
            Speed::Full => 8,
            Speed::High => 64,
        }
    }
}

pub const CLASS_PER_INTERFACE: u8 = 0x00;
pub const CLASS_HUB: u8 = 0x09;
pub const CLASS_MISC: u8 = 0xEF;
pub const CLASS_VENDOR: u8 = 0xFF;

/// Class codes assigned by the USB-IF. Anything else in a descriptor is treated as corruption.
pub fn is_known_class(class: u8) -> bool {
    matches!(
        class,
        0x00..=0x03
            | 0x05..=0x0B
            | 0x0D..=0x12
            | 0xDC
            | 0xE0
            | CLASS_MISC
            | 0xFE
            | CLASS_VENDOR
    )
}

pub const DEFAULT_LANGUAGE: u16 = 0x0409;

/// Decode a string descriptor (UTF-16LE payload after the two header bytes).
pub fn decode_string(bytes: &[u8]) -> Option<String> {
    if bytes.len() < 2 || bytes[1] != DescriptorKind::String as u8 {
        return None;
    }
    let len = usize::from(bytes[0]).min(bytes.len());
    let units: Vec<u16> = bytes[2..len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).ok()
}
