#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

impl ConfigDescriptor {
    pub const SIZE: usize = 9;
    pub const ATTR_SELF_POWERED: u8 = 1 << 6;
    pub const ATTR_REMOTE_WAKEUP: u8 = 1 << 5;
}
