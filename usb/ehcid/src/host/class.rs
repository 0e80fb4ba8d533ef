//! Class drivers and the registry that matches them against new devices.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use super::device::Device;
use crate::config::StackConfig;
use crate::driver_interface::IfDesc;
use crate::error::{Result, UsbError};
use crate::usb;

/// A driver that can take over a whole device or single interfaces of it.
///
/// Probe and disconnect run on the hub worker. Declining a device is done by returning
/// [`UsbError::ClassNotSupported`].
pub trait ClassDriver: Send + Sync {
    fn name(&self) -> &str;

    fn probe_device(&self, _dev: &Arc<Device>) -> Result<()> {
        Err(UsbError::ClassNotSupported)
    }

    fn probe_interface(&self, _dev: &Arc<Device>, _iface: &IfDesc) -> Result<()> {
        Err(UsbError::ClassNotSupported)
    }

    /// The device is gone or being torn down. Its endpoints are closed right after this returns.
    fn disconnect(&self, dev: &Arc<Device>);

    fn suspend(&self, _dev: &Arc<Device>) {}

    fn resume(&self, _dev: &Arc<Device>) {}
}

#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<Vec<Arc<dyn ClassDriver>>>,
}

impl DriverRegistry {
    pub fn register(&self, driver: Arc<dyn ClassDriver>) {
        let mut drivers = self.drivers.lock().unwrap();
        drivers.retain(|d| d.name() != driver.name());
        debug!("registered class driver {}", driver.name());
        drivers.push(driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ClassDriver>> {
        self.drivers
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    fn lookup(&self, cfg: &StackConfig, class: u8, subclass: u8) -> Option<Arc<dyn ClassDriver>> {
        let entry = cfg.driver_for(class, subclass)?;
        let driver = self.get(&entry.name);
        if driver.is_none() {
            debug!("driver {} for class {:#04x} is not registered", entry.name, class);
        }
        driver
    }

    /// Offer a freshly configured device to the drivers: the whole device first, then each
    /// interface of its first alternate setting.
    pub fn probe(&self, cfg: &StackConfig, dev: &Arc<Device>) {
        let desc = dev.desc();
        if desc.class != usb::CLASS_PER_INTERFACE {
            if let Some(driver) = self.lookup(cfg, desc.class, desc.sub_class) {
                match driver.probe_device(dev) {
                    Ok(()) => {
                        info!("device {}: claimed by {}", dev.address(), driver.name());
                        dev.claim(driver);
                        return;
                    }
                    Err(UsbError::ClassNotSupported) => {}
                    Err(err) => warn!("device {}: {} probe failed: {}", dev.address(), driver.name(), err),
                }
            }
        }

        let config = match dev.config() {
            Some(config) => config,
            None => return,
        };
        for iface in config.interface_descs.iter().filter(|i| i.alternate_setting == 0) {
            let driver = match self.lookup(cfg, iface.class, iface.sub_class) {
                Some(driver) => driver,
                None => {
                    debug!(
                        "device {} interface {}: no driver for class {:#04x}",
                        dev.address(),
                        iface.number,
                        iface.class
                    );
                    continue;
                }
            };
            match driver.probe_interface(dev, iface) {
                Ok(()) => {
                    info!(
                        "device {} interface {}: claimed by {}",
                        dev.address(),
                        iface.number,
                        driver.name()
                    );
                    dev.claim(driver);
                }
                Err(UsbError::ClassNotSupported) => {}
                Err(err) => warn!(
                    "device {} interface {}: {} probe failed: {}",
                    dev.address(),
                    iface.number,
                    driver.name(),
                    err
                ),
            }
        }
    }
}
