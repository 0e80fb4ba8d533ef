use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, warn};

use super::class::ClassDriver;
use super::endpoint::{AsyncEvent, Endpoint};
use super::hub::HubId;
use super::urb::UrbPool;
use crate::driver_interface::{ConfDesc, DevDesc, EndpDesc, IfDesc};
use crate::error::{Result, UsbError};
use crate::hcd::{EpInfo, HostController, TtInfo};
use crate::usb::{self, DescriptorKind, Setup, Speed};

/// Device addresses of one bus.
pub struct AddressPool {
    used: Mutex<u128>,
}

impl AddressPool {
    pub const MAX: u8 = 127;

    pub fn new() -> Self {
        // Address 0 is the default address and never handed out.
        Self { used: Mutex::new(1) }
    }

    pub fn alloc(&self) -> Result<u8> {
        let mut used = self.used.lock().unwrap();
        let addr = (1..=Self::MAX)
            .find(|&a| *used & (1 << a) == 0)
            .ok_or(UsbError::NoAddress)?;
        *used |= 1 << addr;
        Ok(addr)
    }

    pub fn free(&self, addr: u8) {
        if addr != 0 && addr <= Self::MAX {
            *self.used.lock().unwrap() &= !(1u128 << addr);
        }
    }

    pub fn in_use(&self) -> usize {
        (*self.used.lock().unwrap()).count_ones() as usize - 1
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a device hangs off the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attachment {
    pub hub: HubId,
    pub port: u8,
    /// Hub tier: 1 for devices on a root port.
    pub depth: u8,
    pub tt: Option<TtInfo>,
}

/// One addressed and configured device.
pub struct Device {
    hc: Arc<dyn HostController>,
    hc_index: usize,
    address: u8,
    speed: Speed,
    attachment: Attachment,
    desc: DevDesc,
    ep0: Arc<Endpoint>,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    drivers: Mutex<Vec<Arc<dyn ClassDriver>>>,
    gone: AtomicBool,
    addresses: Arc<AddressPool>,
    async_tx: Sender<AsyncEvent>,
    pool: Arc<UrbPool>,
    timeout: Duration,
}

pub(crate) struct DeviceParts {
    pub hc: Arc<dyn HostController>,
    pub hc_index: usize,
    pub address: u8,
    pub speed: Speed,
    pub attachment: Attachment,
    pub desc: DevDesc,
    pub ep0: Arc<Endpoint>,
    pub addresses: Arc<AddressPool>,
    pub async_tx: Sender<AsyncEvent>,
    pub pool: Arc<UrbPool>,
    pub timeout: Duration,
}

impl Device {
    pub(crate) fn new(parts: DeviceParts) -> Arc<Self> {
        Arc::new(Self {
            hc: parts.hc,
            hc_index: parts.hc_index,
            address: parts.address,
            speed: parts.speed,
            attachment: parts.attachment,
            desc: parts.desc,
            ep0: parts.ep0,
            endpoints: Mutex::new(Vec::new()),
            drivers: Mutex::new(Vec::new()),
            gone: AtomicBool::new(false),
            addresses: parts.addresses,
            async_tx: parts.async_tx,
            pool: parts.pool,
            timeout: parts.timeout,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn hc_index(&self) -> usize {
        self.hc_index
    }

    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    pub fn depth(&self) -> u8 {
        self.attachment.depth
    }

    pub fn tt(&self) -> Option<TtInfo> {
        self.attachment.tt
    }

    pub fn desc(&self) -> &DevDesc {
        &self.desc
    }

    /// The active configuration.
    pub fn config(&self) -> Option<&ConfDesc> {
        self.desc.config_descs.first()
    }

    pub fn is_gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    pub fn default_endpoint(&self) -> &Arc<Endpoint> {
        &self.ep0
    }

    pub fn frame_number(&self) -> u32 {
        self.hc.frame_number()
    }

    fn check(&self) -> Result<()> {
        if self.is_gone() {
            Err(UsbError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Device-to-host request on the default pipe.
    pub fn control_in(&self, setup: Setup) -> Result<Vec<u8>> {
        self.check()?;
        self.ep0.control(setup, &[], self.timeout)
    }

    /// Host-to-device request on the default pipe; `data` is the data stage.
    pub fn control_out(&self, setup: Setup, data: &[u8]) -> Result<()> {
        self.check()?;
        self.ep0.control(setup, data, self.timeout).map(|_| ())
    }

    pub fn get_descriptor(&self, kind: DescriptorKind, index: u8, language: u16, len: u16) -> Result<Vec<u8>> {
        self.control_in(Setup::get_descriptor(kind, index, language, len))
    }

    pub fn string(&self, index: u8) -> Result<String> {
        if index == 0 {
            return Err(UsbError::InvalidArg);
        }
        let raw = self.get_descriptor(DescriptorKind::String, index, usb::DEFAULT_LANGUAGE, 255)?;
        usb::decode_string(&raw).ok_or(UsbError::Descriptor("bad string descriptor"))
    }

    pub fn set_configuration(&self, value: u8) -> Result<()> {
        self.control_out(Setup::set_configuration(value), &[])
    }

    /// Select an alternate setting; it must exist in the active configuration.
    pub fn set_interface(&self, interface: u8, alternate_setting: u8) -> Result<&IfDesc> {
        let iface = self
            .config()
            .and_then(|c| c.interface(interface, alternate_setting))
            .ok_or(UsbError::InvalidArg)?;
        self.control_out(Setup::set_interface(interface, alternate_setting), &[])?;
        debug!(
            "device {}: interface {} alternate setting {}",
            self.address, interface, alternate_setting
        );
        Ok(iface)
    }

    /// Open one of the endpoints described by the active configuration.
    pub fn open_endpoint(&self, desc: &EndpDesc) -> Result<Arc<Endpoint>> {
        self.check()?;
        if desc.is_control() && desc.number() == 0 {
            return Ok(Arc::clone(&self.ep0));
        }
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.iter().any(|ep| ep.address() == desc.address && !ep.is_closed()) {
            return Err(UsbError::EpBusy);
        }
        let info = EpInfo {
            dev_addr: self.address,
            speed: self.speed,
            ep_addr: desc.address,
            ty: desc.ty(),
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
            tt: self.attachment.tt,
        };
        let ep = Endpoint::open(
            Arc::clone(&self.hc),
            info,
            *desc,
            self.async_tx.clone(),
            Arc::clone(&self.pool),
        )?;
        endpoints.retain(|ep| !ep.is_closed());
        endpoints.push(Arc::clone(&ep));
        Ok(ep)
    }

    pub fn close_endpoint(&self, ep: &Arc<Endpoint>) -> Result<()> {
        self.endpoints
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, ep));
        ep.close()
    }

    /// Tell the device to halt the endpoint.
    pub fn set_stall(&self, ep: &Endpoint) -> Result<()> {
        self.control_out(Setup::set_endpoint_halt(ep.address()), &[])
    }

    /// Clear a halt on both ends: the device's ENDPOINT_HALT and the host's data toggle.
    pub fn clear_stall(&self, ep: &Endpoint) -> Result<()> {
        self.control_out(Setup::clear_endpoint_halt(ep.address()), &[])?;
        ep.reset_toggle()
    }

    /// Abort, close and reopen `ep`. The old handle is dead afterwards.
    pub fn reset_endpoint(&self, ep: &Arc<Endpoint>) -> Result<Arc<Endpoint>> {
        let desc = *ep.desc();
        if Arc::ptr_eq(ep, &self.ep0) {
            self.ep0.abort();
            return self.ep0.reset_toggle().map(|_| Arc::clone(&self.ep0));
        }
        self.close_endpoint(ep)?;
        self.open_endpoint(&desc)
    }

    pub(crate) fn claim(&self, driver: Arc<dyn ClassDriver>) {
        let mut drivers = self.drivers.lock().unwrap();
        if !drivers.iter().any(|d| d.name() == driver.name()) {
            drivers.push(driver);
        }
    }

    pub fn drivers(&self) -> Vec<String> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    pub(crate) fn suspend_drivers(self: &Arc<Self>) {
        let drivers = self.drivers.lock().unwrap().clone();
        for driver in drivers {
            driver.suspend(self);
        }
    }

    pub(crate) fn resume_drivers(self: &Arc<Self>) {
        let drivers = self.drivers.lock().unwrap().clone();
        for driver in drivers {
            driver.resume(self);
        }
    }

    /// Detach: drivers first, then every endpoint, then the address.
    pub(crate) fn teardown(self: &Arc<Self>) {
        if self.gone.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "USB device {} ({:04x}:{:04x}) detached",
            self.address, self.desc.vendor, self.desc.product
        );

        let drivers = std::mem::take(&mut *self.drivers.lock().unwrap());
        for driver in drivers {
            driver.disconnect(self);
        }

        let endpoints = std::mem::take(&mut *self.endpoints.lock().unwrap());
        for ep in endpoints.iter().chain(std::iter::once(&self.ep0)) {
            if let Err(err) = ep.close() {
                warn!("device {}: closing endpoint {:#04x}: {}", self.address, ep.address(), err);
            }
        }
        self.addresses.free(self.address);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addresses() {
        let pool = AddressPool::new();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!((a, b), (1, 2));
        pool.free(a);
        assert_eq!(pool.alloc().unwrap(), 1);
        for _ in 0..125 {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.in_use(), 127);
        assert_eq!(pool.alloc().unwrap_err(), UsbError::NoAddress);
        pool.free(0);
        assert_eq!(pool.in_use(), 127);
    }
}
