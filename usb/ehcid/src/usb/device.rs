//! The standard Device descriptor (USB2 section 9.6.1) and its short forms.

/// A USB Device Descriptor.
///
/// It describes information that applies globally to the device and all of its configurations.
/// A device has exactly one. Field offsets follow USB2 Table 9-8.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// bLength
    pub length: u8,
    /// bDescriptorType, see [super::DescriptorKind]
    pub kind: u8,
    /// bcdUSB. USB 2.0 is encoded as 0x0200.
    pub usb: u16,
    /// bDeviceClass. Zero means every interface reports its own class.
    pub class: u8,
    /// bDeviceSubClass
    pub sub_class: u8,
    /// bDeviceProtocol
    pub protocol: u8,
    /// bMaxPacketSize0, the packet size of the default control endpoint.
    pub packet_size: u8,
    /// idVendor
    pub vendor: u16,
    /// idProduct
    pub product: u16,
    /// bcdDevice
    pub release: u16,
    /// iManufacturer
    pub manufacturer_str: u8,
    /// iProduct
    pub product_str: u8,
    /// iSerialNumber
    pub serial_str: u8,
    /// bNumConfigurations
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn minor_usb_vers(&self) -> u8 {
        (self.usb & 0xFF) as u8
    }

    pub fn major_usb_vers(&self) -> u8 {
        ((self.usb >> 8) & 0xFF) as u8
    }
}

/// The first eight bytes of the Device descriptor.
///
/// Enumeration reads only this much while the device is still at the default address, because
/// the real control packet size is not known yet and eight bytes always fit in one packet.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor8Byte {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub packet_size: u8,
}

unsafe impl plain::Plain for DeviceDescriptor8Byte {}

/// Device Qualifier descriptor (USB2 section 9.6.2). Reported by high-speed capable devices to
/// describe how they would look at the other speed.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceQualifier {
    pub length: u8,
    pub kind: u8,
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub pkgsz_other_speed: u8,
    pub num_other_speed_cfgs: u8,
    pub _rsvd: u8,
}

unsafe impl plain::Plain for DeviceQualifier {}
