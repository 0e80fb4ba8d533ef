//! Owned, validated views of a device's descriptors as handed to class drivers.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Result, UsbError};
use crate::usb::endpoint::{ENDP_ADDR_DIR_IN, ENDP_ADDR_NUM_MASK, ENDP_ADDR_RESERVED_MASK};
use crate::usb::{
    self, ConfigDescriptor, DescriptorKind, DeviceDescriptor, EndpointDescriptor, EndpointTy,
    InterfaceDescriptor,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevDesc {
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: Option<String>,
    pub product_str: Option<String>,
    pub serial_str: Option<String>,
    pub configurations: u8,
    pub config_descs: SmallVec<[ConfDesc; 1]>,
}

impl DevDesc {
    pub fn major_version(&self) -> u8 {
        ((self.usb & 0xFF00) >> 8) as u8
    }

    pub fn minor_version(&self) -> u8 {
        self.usb as u8
    }

    pub fn from_raw(raw: &DeviceDescriptor) -> Result<Self> {
        if usize::from(raw.length) < DeviceDescriptor::SIZE
            || raw.kind != DescriptorKind::Device as u8
        {
            return Err(UsbError::Descriptor("bad device descriptor header"));
        }
        if !matches!(raw.packet_size, 8 | 16 | 32 | 64) {
            return Err(UsbError::Descriptor("bad control packet size"));
        }
        if !usb::is_known_class(raw.class) {
            return Err(UsbError::Descriptor("unknown device class"));
        }
        if raw.configurations == 0 {
            return Err(UsbError::Descriptor("device has no configuration"));
        }

        Ok(Self {
            usb: raw.usb,
            class: raw.class,
            sub_class: raw.sub_class,
            protocol: raw.protocol,
            packet_size: raw.packet_size,
            vendor: raw.vendor,
            product: raw.product,
            release: raw.release,
            manufacturer_str: None,
            product_str: None,
            serial_str: None,
            configurations: raw.configurations,
            config_descs: SmallVec::new(),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfDesc {
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub configuration: Option<String>,
    pub attributes: u8,
    pub max_power: u8,
    pub interface_descs: SmallVec<[IfDesc; 1]>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IfDesc {
    pub number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: Option<String>,
    pub endpoints: SmallVec<[EndpDesc; 4]>,
    pub hid_descs: SmallVec<[HidDesc; 1]>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HidDesc {
    pub hid_spec_release: u16,
    pub country: u8,
    pub desc_count: u8,
    pub desc_ty: u8,
    pub desc_len: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpDesc {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EndpDirection {
    Out,
    In,
    Bidirectional,
}

impl EndpDesc {
    /// The default control endpoint, which has no descriptor of its own.
    pub const fn control(max_packet_size: u16) -> Self {
        Self {
            address: 0,
            attributes: 0,
            max_packet_size,
            interval: 0,
        }
    }

    pub fn ty(&self) -> EndpointTy {
        EndpointTy::from_attributes(self.attributes)
    }

    pub fn is_control(&self) -> bool {
        self.ty() == EndpointTy::Ctrl
    }

    pub fn is_interrupt(&self) -> bool {
        self.ty() == EndpointTy::Interrupt
    }

    pub fn is_bulk(&self) -> bool {
        self.ty() == EndpointTy::Bulk
    }

    pub fn is_isoch(&self) -> bool {
        self.ty() == EndpointTy::Isoch
    }

    pub fn is_periodic(&self) -> bool {
        self.is_interrupt() || self.is_isoch()
    }

    pub fn number(&self) -> u8 {
        self.address & ENDP_ADDR_NUM_MASK
    }

    pub fn direction(&self) -> EndpDirection {
        if self.is_control() {
            return EndpDirection::Bidirectional;
        }
        if self.address & ENDP_ADDR_DIR_IN != 0 {
            EndpDirection::In
        } else {
            EndpDirection::Out
        }
    }

    /// Packet size field, without the high-bandwidth multiplier bits.
    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    /// Transactions per microframe for high-bandwidth endpoints (1..=3).
    pub fn mult(&self) -> u8 {
        (((self.max_packet_size >> 11) & 0x3) as u8 + 1).min(3)
    }

    fn from_raw(raw: &EndpointDescriptor) -> Result<Self> {
        let desc = Self {
            address: raw.address,
            attributes: raw.attributes,
            max_packet_size: raw.max_packet_size,
            interval: raw.interval,
        };
        if desc.address & ENDP_ADDR_RESERVED_MASK != 0 {
            return Err(UsbError::Descriptor("reserved endpoint address bits set"));
        }
        if desc.number() == 0 {
            return Err(UsbError::Descriptor("endpoint zero in interface"));
        }
        if desc.max_packet() == 0 {
            return Err(UsbError::Descriptor("zero max packet size"));
        }
        if desc.is_periodic() && desc.interval == 0 {
            return Err(UsbError::Descriptor("zero periodic interval"));
        }
        Ok(desc)
    }
}

fn read_plain<T: plain::Plain + Copy + Default>(bytes: &[u8]) -> Result<T> {
    let mut value = T::default();
    plain::copy_from_bytes(&mut value, bytes)
        .map_err(|_| UsbError::Descriptor("descriptor too short"))?;
    Ok(value)
}

impl ConfDesc {
    /// Parse and validate a full configuration descriptor set.
    pub fn parse(bytes: &[u8], max_len: usize) -> Result<Self> {
        let config: ConfigDescriptor = read_plain(bytes)?;
        if usize::from(config.length) < ConfigDescriptor::SIZE
            || config.kind != DescriptorKind::Configuration as u8
        {
            return Err(UsbError::Descriptor("bad configuration header"));
        }
        let total = usize::from(config.total_length);
        if total > max_len {
            return Err(UsbError::Descriptor("configuration too large"));
        }
        if total > bytes.len() || total < ConfigDescriptor::SIZE {
            return Err(UsbError::Descriptor("truncated configuration"));
        }

        let mut desc = ConfDesc {
            configuration_value: config.configuration_value,
            configuration_str: config.configuration_str,
            configuration: None,
            attributes: config.attributes,
            max_power: config.max_power,
            interface_descs: SmallVec::new(),
        };

        let mut offset = usize::from(config.length);
        while offset < total {
            let rest = &bytes[offset..total];
            let len = usize::from(rest[0]);
            if len < 2 || len > rest.len() {
                return Err(UsbError::Descriptor("bad descriptor length"));
            }
            let item = &rest[..len];

            match item[1] {
                k if k == DescriptorKind::Interface as u8 => {
                    let raw: InterfaceDescriptor = read_plain(item)?;
                    if !usb::is_known_class(raw.class) || raw.class == usb::CLASS_PER_INTERFACE {
                        return Err(UsbError::Descriptor("unknown interface class"));
                    }
                    desc.interface_descs.push(IfDesc {
                        number: raw.number,
                        alternate_setting: raw.alternate_setting,
                        class: raw.class,
                        sub_class: raw.sub_class,
                        protocol: raw.protocol,
                        interface_str: None,
                        endpoints: SmallVec::new(),
                        hid_descs: SmallVec::new(),
                    });
                }
                k if k == DescriptorKind::Endpoint as u8 => {
                    let raw: EndpointDescriptor = read_plain(item)?;
                    let endp = EndpDesc::from_raw(&raw)?;
                    let iface = desc
                        .interface_descs
                        .last_mut()
                        .ok_or(UsbError::Descriptor("endpoint outside of interface"))?;
                    iface.endpoints.push(endp);
                }
                k if k == DescriptorKind::Hid as u8 => {
                    if item.len() < 9 {
                        return Err(UsbError::Descriptor("short HID descriptor"));
                    }
                    if let Some(iface) = desc.interface_descs.last_mut() {
                        iface.hid_descs.push(HidDesc {
                            hid_spec_release: u16::from_le_bytes([item[2], item[3]]),
                            country: item[4],
                            desc_count: item[5],
                            desc_ty: item[6],
                            desc_len: u16::from_le_bytes([item[7], item[8]]),
                        });
                    }
                }
                other => log::trace!("skipping descriptor kind {:#04x}", other),
            }
            offset += len;
        }

        for iface in desc.interface_descs.iter() {
            if iface.alternate_setting == 0 && iface.endpoints.len() > 15 * 2 {
                return Err(UsbError::Descriptor("too many endpoints"));
            }
        }
        if desc.interface_descs.is_empty() {
            return Err(UsbError::Descriptor("configuration without interfaces"));
        }

        Ok(desc)
    }

    pub fn interface(&self, number: u8, alternate_setting: u8) -> Option<&IfDesc> {
        self.interface_descs
            .iter()
            .find(|i| i.number == number && i.alternate_setting == alternate_setting)
    }
}
