//! Bringing a freshly reset device from the default address to a configured state.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use super::device::{Device, DeviceParts};
use super::endpoint::Endpoint;
use super::hub::Hub;
use super::HostShared;
use crate::driver_interface::{ConfDesc, DevDesc, EndpDesc};
use crate::error::{Result, UsbError};
use crate::hcd::EpInfo;
use crate::usb::{self, ConfigDescriptor, DescriptorKind, DeviceDescriptor, DeviceDescriptor8Byte, EndpointTy, Setup, Speed};

const RETRY_DELAY: Duration = Duration::from_millis(10);

fn read_plain<T: plain::Plain + Default>(raw: &[u8], what: &'static str) -> Result<T> {
    let mut value = T::default();
    plain::copy_from_bytes(&mut value, raw).map_err(|_| UsbError::Descriptor(what))?;
    Ok(value)
}

/// Run `op` up to `retries` times, clearing any halt on the default pipe between attempts.
fn with_retries<T>(ep0: &Endpoint, retries: u8, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last = UsbError::Io;
    for attempt in 1..=retries.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!("{}: attempt {} failed: {}", what, attempt, err);
                last = err;
                ep0.abort();
                let _ = ep0.reset_toggle();
                thread::sleep(RETRY_DELAY);
            }
        }
    }
    Err(last)
}

fn valid_mps0(speed: Speed, mps: u8) -> bool {
    match speed {
        Speed::Low => mps == 8,
        Speed::Full => matches!(mps, 8 | 16 | 32 | 64),
        Speed::High => mps == 64,
    }
}

/// Address, describe and configure the device just reset on `port` of `hub`.
///
/// Anything partially set up is released again on failure.
pub(crate) fn enumerate(host: &Arc<HostShared>, hub: &Hub, port: u8, speed: Speed) -> Result<Arc<Device>> {
    let address = hub.addresses().alloc()?;
    let result = enumerate_at(host, hub, port, speed, address);
    if result.is_err() {
        hub.addresses().free(address);
    }
    result
}

fn enumerate_at(host: &Arc<HostShared>, hub: &Hub, port: u8, speed: Speed, address: u8) -> Result<Arc<Device>> {
    let cfg = &host.cfg;
    let timeout = cfg.ctrl_timeout();
    let attachment = hub.child_attachment(port, speed);
    let mps0 = speed.default_mps0();

    let ep0 = Endpoint::open(
        Arc::clone(hub.hc()),
        EpInfo {
            dev_addr: 0,
            speed,
            ep_addr: 0,
            ty: EndpointTy::Ctrl,
            max_packet_size: mps0,
            interval: 0,
            tt: attachment.tt,
        },
        EndpDesc::control(mps0),
        host.async_tx.clone(),
        Arc::clone(&host.pool),
    )?;

    let head: DeviceDescriptor8Byte = with_retries(&ep0, cfg.desc_retries, "device descriptor probe", || {
        let raw = ep0.control(Setup::get_descriptor(DescriptorKind::Device, 0, 0, 8), &[], timeout)?;
        read_plain(&raw, "short device descriptor")
    })?;
    if head.kind != DescriptorKind::Device as u8 {
        return Err(UsbError::Descriptor("bad device descriptor header"));
    }
    if !valid_mps0(speed, head.packet_size) {
        return Err(UsbError::Descriptor("bad control packet size"));
    }
    if u16::from(head.packet_size) != mps0 {
        ep0.update_max_packet(u16::from(head.packet_size))?;
    }

    ep0.control(Setup::set_address(u16::from(address)), &[], timeout)?;
    thread::sleep(Duration::from_millis(cfg.set_address_recovery_ms));
    ep0.update_address(address)?;
    debug!("hub {:?} port {}: device now at address {}", hub.id(), port, address);

    let raw: DeviceDescriptor = with_retries(&ep0, cfg.desc_retries, "device descriptor", || {
        let raw = ep0.control(
            Setup::get_descriptor(DescriptorKind::Device, 0, 0, DeviceDescriptor::SIZE as u16),
            &[],
            timeout,
        )?;
        read_plain(&raw, "short device descriptor")
    })?;
    let mut desc = DevDesc::from_raw(&raw)?;

    let head = ep0.control(
        Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, ConfigDescriptor::SIZE as u16),
        &[],
        timeout,
    )?;
    let config: ConfigDescriptor = read_plain(&head, "short configuration descriptor")?;
    let total = usize::from(config.total_length);
    if total > cfg.max_config_len {
        return Err(UsbError::Descriptor("configuration too large"));
    }
    if total < ConfigDescriptor::SIZE {
        return Err(UsbError::Descriptor("truncated configuration"));
    }
    let full = ep0.control(
        Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, total as u16),
        &[],
        timeout,
    )?;
    let mut conf = ConfDesc::parse(&full, cfg.max_config_len)?;

    read_strings(&ep0, &raw, &mut desc, &mut conf, timeout);

    ep0.control(Setup::set_configuration(conf.configuration_value), &[], timeout)?;
    debug!("device {}: configuration {} selected", address, conf.configuration_value);
    desc.config_descs.push(conf);

    Ok(Device::new(DeviceParts {
        hc: Arc::clone(hub.hc()),
        hc_index: hub.hc_index(),
        address,
        speed,
        attachment,
        desc,
        ep0,
        addresses: Arc::clone(hub.addresses()),
        async_tx: host.async_tx.clone(),
        pool: Arc::clone(&host.pool),
        timeout,
    }))
}

/// Best effort: a device without strings, or with broken ones, is still usable.
fn read_strings(ep0: &Endpoint, raw: &DeviceDescriptor, desc: &mut DevDesc, conf: &mut ConfDesc, timeout: Duration) {
    let langs = match ep0.control(Setup::get_descriptor(DescriptorKind::String, 0, 0, 255), &[], timeout) {
        Ok(langs) if langs.len() >= 4 => langs,
        _ => {
            trace!("no string descriptors");
            return;
        }
    };
    let lang = u16::from_le_bytes([langs[2], langs[3]]);
    let read = |index: u8| -> Option<String> {
        if index == 0 {
            return None;
        }
        let raw = ep0
            .control(Setup::get_descriptor(DescriptorKind::String, index, lang, 255), &[], timeout)
            .ok()?;
        usb::decode_string(&raw)
    };
    desc.manufacturer_str = read(raw.manufacturer_str);
    desc.product_str = read(raw.product_str);
    desc.serial_str = read(raw.serial_str);
    conf.configuration = read(conf.configuration_str);
}
