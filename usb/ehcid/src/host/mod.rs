//! The controller independent part of the stack: endpoints, URBs, hubs and enumeration.

use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, trace, warn};

use self::class::{ClassDriver, DriverRegistry};
use self::device::{AddressPool, Device};
use self::endpoint::AsyncEvent;
use self::hub::{Hub, HubDriver, HubEvent, HubId, PortState};
use self::urb::UrbPool;
use crate::config::StackConfig;
use crate::error::{Result, UsbError};
use crate::hcd::{HostController, PortChangeSink};

pub mod class;
pub mod device;
pub mod endpoint;
mod enumerator;
pub mod hub;
pub mod urb;

#[cfg(test)]
pub(crate) mod test_hcd;

struct HubSlot {
    generation: u32,
    hub: Option<Arc<Hub>>,
}

struct HcEntry {
    hc: Arc<dyn HostController>,
    addresses: Arc<AddressPool>,
    root: HubId,
    _sink: Arc<RootPortSink>,
}

/// Forwards root port changes of one controller to the hub worker.
struct RootPortSink {
    tx: Sender<HubEvent>,
    hub: HubId,
}

impl PortChangeSink for RootPortSink {
    fn port_changed(&self) {
        let _ = self.tx.send(HubEvent::Changed(self.hub));
    }
}

/// State shared by the host handle, the workers and the hub class driver.
pub(crate) struct HostShared {
    pub(crate) cfg: StackConfig,
    pub(crate) registry: DriverRegistry,
    pub(crate) async_tx: Sender<AsyncEvent>,
    pub(crate) hub_tx: Sender<HubEvent>,
    pub(crate) pool: Arc<UrbPool>,
    controllers: Mutex<Vec<HcEntry>>,
    hubs: Mutex<Vec<HubSlot>>,
}

impl HostShared {
    pub(crate) fn hub(&self, id: HubId) -> Option<Arc<Hub>> {
        let hubs = self.hubs.lock().unwrap();
        let slot = hubs.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.hub.clone()
    }

    /// Build a hub in a free table slot of controller `hc_index`.
    pub(crate) fn insert_hub(
        &self,
        hc_index: usize,
        make: impl FnOnce(HubId, Arc<dyn HostController>, Arc<AddressPool>) -> Hub,
    ) -> Result<Arc<Hub>> {
        let (hc, addresses) = {
            let controllers = self.controllers.lock().unwrap();
            let entry = controllers.get(hc_index).ok_or(UsbError::InvalidArg)?;
            (Arc::clone(&entry.hc), Arc::clone(&entry.addresses))
        };
        Ok(self.insert_hub_with(hc, addresses, make))
    }

    fn insert_hub_with(
        &self,
        hc: Arc<dyn HostController>,
        addresses: Arc<AddressPool>,
        make: impl FnOnce(HubId, Arc<dyn HostController>, Arc<AddressPool>) -> Hub,
    ) -> Arc<Hub> {
        let mut hubs = self.hubs.lock().unwrap();
        let index = match hubs.iter().position(|slot| slot.hub.is_none()) {
            Some(index) => index,
            None => {
                hubs.push(HubSlot {
                    generation: 0,
                    hub: None,
                });
                hubs.len() - 1
            }
        };
        let id = HubId {
            index,
            generation: hubs[index].generation,
        };
        let hub = Arc::new(make(id, hc, addresses));
        hubs[index].hub = Some(Arc::clone(&hub));
        trace!("hub table: {:?} in use", id);
        hub
    }

    pub(crate) fn remove_hub(&self, id: HubId) -> Option<Arc<Hub>> {
        let mut hubs = self.hubs.lock().unwrap();
        let slot = hubs.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        slot.hub.take()
    }

    pub(crate) fn notify(&self, id: HubId) {
        if self.hub_tx.send(HubEvent::Changed(id)).is_err() {
            warn!("hub worker is gone");
        }
    }

    fn all_hubs(&self) -> Vec<Arc<Hub>> {
        self.hubs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|slot| slot.hub.clone())
            .collect()
    }
}

fn async_worker(rx: Receiver<AsyncEvent>) {
    for event in rx.iter() {
        match event {
            AsyncEvent::Done { ep, seq } => {
                if let Some(ep) = ep.upgrade() {
                    ep.harvest_async(seq);
                }
            }
            AsyncEvent::Deliver {
                callback,
                completion,
            } => callback(completion),
            AsyncEvent::Shutdown => break,
        }
    }
    debug!("completion worker exiting");
}

fn hub_worker(shared: Weak<HostShared>, rx: Receiver<HubEvent>) {
    for event in rx.iter() {
        match event {
            HubEvent::Changed(id) => {
                let shared = match shared.upgrade() {
                    Some(shared) => shared,
                    None => break,
                };
                match shared.hub(id) {
                    Some(hub) => hub.service(&shared),
                    None => trace!("event for removed hub {:?}", id),
                }
            }
            HubEvent::StatusFailed(id) => {
                let shared = match shared.upgrade() {
                    Some(shared) => shared,
                    None => break,
                };
                match shared.hub(id) {
                    Some(hub) => hub.recover_status(&shared),
                    None => trace!("event for removed hub {:?}", id),
                }
            }
            HubEvent::Shutdown => break,
        }
    }
    debug!("hub worker exiting");
}

/// One USB host stack instance, driving any number of host controllers.
pub struct Host {
    shared: Arc<HostShared>,
    async_worker: Mutex<Option<JoinHandle<()>>>,
    hub_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    pub fn new(cfg: StackConfig) -> Self {
        let (async_tx, async_rx) = crossbeam_channel::unbounded();
        let (hub_tx, hub_rx) = crossbeam_channel::unbounded();
        let pool = Arc::new(UrbPool::new(cfg.urb_pool_size));
        let shared = Arc::new(HostShared {
            cfg,
            registry: DriverRegistry::default(),
            async_tx,
            hub_tx,
            pool,
            controllers: Mutex::new(Vec::new()),
            hubs: Mutex::new(Vec::new()),
        });
        shared
            .registry
            .register(Arc::new(HubDriver::new(Arc::downgrade(&shared))));

        let async_worker = thread::spawn(move || async_worker(async_rx));
        let weak = Arc::downgrade(&shared);
        let hub_worker = thread::spawn(move || hub_worker(weak, hub_rx));

        Self {
            shared,
            async_worker: Mutex::new(Some(async_worker)),
            hub_worker: Mutex::new(Some(hub_worker)),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.shared.cfg
    }

    pub fn register_driver(&self, driver: Arc<dyn ClassDriver>) {
        self.shared.registry.register(driver);
    }

    /// Start `hc` and begin watching its root ports. Returns the controller's index.
    pub fn add_controller(&self, hc: Arc<dyn HostController>) -> Result<usize> {
        hc.start()?;
        let addresses = Arc::new(AddressPool::new());
        let index = self.shared.controllers.lock().unwrap().len();
        let root = self
            .shared
            .insert_hub_with(Arc::clone(&hc), Arc::clone(&addresses), |id, hc, addresses| {
                Hub::root(id, index, hc, addresses)
            });

        let sink = Arc::new(RootPortSink {
            tx: self.shared.hub_tx.clone(),
            hub: root.id(),
        });
        let weak: Weak<dyn PortChangeSink> = Arc::downgrade(&sink) as Weak<dyn PortChangeSink>;
        hc.rh_set_change_sink(weak);
        info!(
            "{}: controller {} with {} root ports",
            hc.name(),
            index,
            root.port_count()
        );
        self.shared.controllers.lock().unwrap().push(HcEntry {
            hc,
            addresses,
            root: root.id(),
            _sink: sink,
        });

        root.power_on();
        self.shared.notify(root.id());
        Ok(index)
    }

    pub fn controller(&self, index: usize) -> Option<Arc<dyn HostController>> {
        let controllers = self.shared.controllers.lock().unwrap();
        controllers.get(index).map(|entry| Arc::clone(&entry.hc))
    }

    pub fn root_hub(&self, index: usize) -> Option<Arc<Hub>> {
        let root = self.shared.controllers.lock().unwrap().get(index)?.root;
        self.shared.hub(root)
    }

    pub fn frame_number(&self, index: usize) -> Result<u32> {
        Ok(self.controller(index).ok_or(UsbError::InvalidArg)?.frame_number())
    }

    pub fn port_state(&self, index: usize, port: u8) -> Option<PortState> {
        self.root_hub(index)?.port_state(port)
    }

    pub fn disable_port(&self, index: usize, port: u8) -> Result<()> {
        self.root_hub(index).ok_or(UsbError::InvalidArg)?.disable_port(port)
    }

    pub fn enable_port(&self, index: usize, port: u8) -> Result<()> {
        let hub = self.root_hub(index).ok_or(UsbError::InvalidArg)?;
        hub.enable_port(port)?;
        self.shared.notify(hub.id());
        Ok(())
    }

    /// Every attached device, on all controllers and behind all hubs.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.shared
            .all_hubs()
            .iter()
            .flat_map(|hub| hub.devices())
            .collect()
    }

    pub fn suspend(&self) -> Result<()> {
        for dev in self.devices() {
            dev.suspend_drivers();
        }
        let controllers: Vec<_> = self.shared.controllers.lock().unwrap().iter().map(|e| Arc::clone(&e.hc)).collect();
        for hc in controllers {
            hc.suspend()?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let controllers: Vec<_> = self.shared.controllers.lock().unwrap().iter().map(|e| Arc::clone(&e.hc)).collect();
        for hc in controllers {
            hc.resume()?;
        }
        for dev in self.devices() {
            dev.resume_drivers();
        }
        Ok(())
    }

    /// Detach every device, stop the controllers and the workers.
    pub fn shutdown(&self) {
        if let Some(worker) = self.hub_worker.lock().unwrap().take() {
            let _ = self.shared.hub_tx.send(HubEvent::Shutdown);
            if worker.join().is_err() {
                error!("hub worker panicked");
            }
        }

        let controllers = std::mem::take(&mut *self.shared.controllers.lock().unwrap());
        for entry in controllers {
            if let Some(root) = self.shared.remove_hub(entry.root) {
                root.detach_all();
            }
            if let Err(err) = entry.hc.stop() {
                warn!("{}: stop failed: {}", entry.hc.name(), err);
            }
        }

        if let Some(worker) = self.async_worker.lock().unwrap().take() {
            let _ = self.shared.async_tx.send(AsyncEvent::Shutdown);
            if worker.join().is_err() {
                error!("completion worker panicked");
            }
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::test_hcd::{bulk_config, Behavior, FakeDevice, TestHc};
    use super::urb::Completion;
    use super::*;
    use crate::config::DriverConfig;
    use crate::driver_interface::IfDesc;
    use crate::usb::{HubPortStatusV2, Setup, Speed};

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ClassDriver for Recorder {
        fn name(&self) -> &str {
            "vendor"
        }

        fn probe_interface(&self, dev: &Arc<Device>, iface: &IfDesc) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("probe {} {}", dev.address(), iface.number));
            Ok(())
        }

        fn disconnect(&self, dev: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("disconnect {}", dev.address()));
        }

        fn suspend(&self, dev: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("suspend {}", dev.address()));
        }

        fn resume(&self, dev: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("resume {}", dev.address()));
        }
    }

    fn config() -> StackConfig {
        let mut cfg = StackConfig::fast();
        cfg.drivers.push(DriverConfig {
            name: "vendor".to_string(),
            class: 0xFF,
            subclass: -1,
        });
        cfg
    }

    fn start(cfg: StackConfig, ports: u8) -> (Host, Arc<TestHc>, Arc<Recorder>) {
        let host = Host::new(cfg);
        let recorder = Arc::new(Recorder::default());
        host.register_driver(Arc::clone(&recorder) as Arc<dyn ClassDriver>);
        let hc = TestHc::new(ports);
        assert_eq!(host.add_controller(Arc::clone(&hc) as Arc<dyn HostController>).unwrap(), 0);
        (host, hc, recorder)
    }

    #[test]
    fn enumerates_and_binds_a_driver() {
        let (host, hc, recorder) = start(config(), 2);
        hc.connect(2, FakeDevice::bulk(Speed::High));
        wait_for("probe", || recorder.events().len() == 1);

        let devices = host.devices();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.address(), 1);
        assert_eq!(dev.speed(), Speed::High);
        assert_eq!(dev.depth(), 1);
        assert_eq!(dev.tt(), None);
        assert_eq!(dev.desc().vendor, 0x1234);
        assert_eq!(dev.desc().manufacturer_str.as_deref(), Some("Fake Inc."));
        assert_eq!(dev.desc().product_str.as_deref(), Some("Fake device"));
        assert_eq!(dev.desc().serial_str, None);
        assert_eq!(dev.config().unwrap().interface_descs[0].endpoints.len(), 2);
        assert_eq!(dev.drivers(), vec!["vendor".to_string()]);
        assert_eq!(recorder.events(), vec!["probe 1 0".to_string()]);
        assert_eq!(host.port_state(0, 2), Some(PortState::Operational));
        assert_eq!(host.port_state(0, 1), Some(PortState::Idle));

        // SET_ADDRESS went to the default address, SET_CONFIGURATION to the new one.
        let requests = hc.requests();
        assert!(requests.contains(&(0, 0x05, 1)));
        assert!(requests.contains(&(1, 0x09, 1)));
    }

    #[test]
    fn descriptor_probe_is_retried() {
        let (host, hc, _recorder) = start(config(), 1);
        let mut dev = FakeDevice::bulk(Speed::High);
        dev.fail_probes = 2;
        hc.connect(1, dev);
        wait_for("enumeration", || host.port_state(0, 1) == Some(PortState::Operational));
        let probes = hc
            .requests()
            .iter()
            .filter(|&&(addr, req, value)| addr == 0 && req == 0x06 && value == 0x0100)
            .count();
        assert_eq!(probes, 3);
    }

    #[test]
    fn broken_device_leaves_the_port_disabled() {
        let (host, hc, _recorder) = start(config(), 1);
        let mut dev = FakeDevice::bulk(Speed::High);
        dev.fail_probes = usize::MAX;
        hc.connect(1, dev);
        wait_for("give up", || host.port_state(0, 1) == Some(PortState::Failed));

        assert!(host.devices().is_empty());
        assert!(!hc.rh_port_status(1).unwrap().is_enabled());
        let probes = hc
            .requests()
            .iter()
            .filter(|&&(_, req, value)| req == 0x06 && value == 0x0100)
            .count();
        let cfg = host.config();
        assert_eq!(probes, usize::from(cfg.enum_retries) * usize::from(cfg.desc_retries));
        wait_for("endpoints closed", || hc.open_endpoints() == 0);

        // A fresh connect starts over and reuses address 1.
        hc.disconnect(1);
        wait_for("idle", || host.port_state(0, 1) == Some(PortState::Idle));
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("enumeration", || host.devices().len() == 1);
        assert_eq!(host.devices()[0].address(), 1);
    }

    #[test]
    fn oversized_configuration_is_refused() {
        let mut cfg = config();
        cfg.max_config_len = 16;
        cfg.enum_retries = 1;
        let (host, hc, _recorder) = start(cfg, 1);
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("give up", || host.port_state(0, 1) == Some(PortState::Failed));
        assert!(host.devices().is_empty());
    }

    #[test]
    fn disconnect_cancels_outstanding_requests_once() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("probe", || recorder.events().len() == 1);
        let dev = Arc::clone(&host.devices()[0]);
        let iface = dev.config().unwrap().interface(0, 0).unwrap().clone();
        let ep_in = dev.open_endpoint(&iface.endpoints[0]).unwrap();
        let ep_out = dev.open_endpoint(&iface.endpoints[1]).unwrap();
        hc.set_behavior(dev.address(), 0x02, Behavior::Never);

        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            ep_in
                .read_async(512, Box::new(move |c: Completion| tx.send((i, c.status)).unwrap()))
                .unwrap();
        }
        let out_tx = tx.clone();
        ep_out
            .write_async(vec![0; 64], Box::new(move |c: Completion| out_tx.send((3, c.status)).unwrap()))
            .unwrap();

        hc.disconnect(1);
        let mut seen: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        seen.sort_by_key(|(i, _)| *i);
        assert_eq!(
            seen,
            (0..4).map(|i| (i, Err::<(), _>(UsbError::Aborted))).collect::<Vec<_>>()
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        assert!(dev.is_gone());
        assert!(host.devices().is_empty());
        assert_eq!(recorder.events(), vec!["probe 1 0".to_string(), "disconnect 1".to_string()]);
        assert_eq!(ep_in.read(8, Duration::from_millis(10)).unwrap_err(), UsbError::EpInvalidState);
        assert_eq!(dev.control_in(Setup::get_status()).unwrap_err(), UsbError::Disconnected);
        wait_for("endpoints closed", || hc.open_endpoints() == 0);
    }

    #[test]
    fn devices_behind_a_hub() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::hub(Speed::High, 4));
        wait_for("hub", || host.devices().len() == 1 && host.devices()[0].drivers() == vec!["hub".to_string()]);
        let hub_addr = host.devices()[0].address();

        hc.hub_connect(hub_addr, 3, FakeDevice::bulk(Speed::Full));
        wait_for("child", || recorder.events().len() == 1);
        let child = host
            .devices()
            .into_iter()
            .find(|d| d.address() != hub_addr)
            .unwrap();
        assert_eq!(child.speed(), Speed::Full);
        assert_eq!(child.depth(), 2);
        assert_eq!(
            child.tt(),
            Some(crate::hcd::TtInfo {
                hub_addr,
                port: 3
            })
        );

        // Unplugging the hub takes the child with it.
        hc.disconnect(1);
        wait_for("child teardown", || recorder.events().last().map(String::as_str) == Some("disconnect 2"));
        assert!(child.is_gone());
        wait_for("teardown", || host.devices().is_empty());
        wait_for("endpoints closed", || hc.open_endpoints() == 0);
    }

    #[test]
    fn hub_status_errors_are_retried() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::hub(Speed::High, 2));
        wait_for("hub", || host.devices().len() == 1 && !host.devices()[0].drivers().is_empty());
        let hub_addr = host.devices()[0].address();

        for _ in 0..2 {
            wait_for("status read", || hc.fail_hub_status(hub_addr, UsbError::Io));
        }
        hc.hub_connect(hub_addr, 2, FakeDevice::bulk(Speed::High));
        wait_for("child", || recorder.events().len() == 1);
        // The halt left by the error is cleared on the device too.
        assert!(hc.requests().contains(&(hub_addr, 0x01, 0)));

        // A good report resets the count, so three more errors are still tolerated.
        hc.hub_disconnect(hub_addr, 2);
        wait_for("child gone", || host.devices().len() == 1);
        for _ in 0..3 {
            wait_for("status read", || hc.fail_hub_status(hub_addr, UsbError::Io));
        }
        hc.hub_connect(hub_addr, 1, FakeDevice::bulk(Speed::High));
        wait_for("second child", || recorder.events().len() == 3);
    }

    #[test]
    fn hub_child_disconnect() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::hub(Speed::High, 2));
        wait_for("hub", || host.devices().len() == 1 && !host.devices()[0].drivers().is_empty());
        let hub_addr = host.devices()[0].address();

        hc.hub_connect(hub_addr, 1, FakeDevice::bulk(Speed::High));
        wait_for("child", || host.devices().len() == 2);
        hc.hub_disconnect(hub_addr, 1);
        wait_for("child gone", || host.devices().len() == 1);
        wait_for("driver told", || recorder.events().iter().any(|e| e.starts_with("disconnect")));
        assert_eq!(host.devices()[0].address(), hub_addr);
    }

    #[test]
    fn hub_tier_limit() {
        let mut cfg = config();
        cfg.max_hub_depth = 1;
        let (host, hc, _recorder) = start(cfg, 1);
        hc.connect(1, FakeDevice::hub(Speed::High, 2));
        wait_for("hub", || host.devices().len() == 1 && !host.devices()[0].drivers().is_empty());
        let hub_addr = host.devices()[0].address();

        hc.hub_connect(hub_addr, 2, FakeDevice::hub(Speed::High, 2));
        wait_for("second hub", || host.devices().len() == 2);
        let nested = host
            .devices()
            .into_iter()
            .find(|d| d.address() != hub_addr)
            .unwrap();
        assert_eq!(nested.depth(), 2);
        assert!(nested.drivers().is_empty());
    }

    #[test]
    fn over_current_power_cycles_the_port() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("probe", || recorder.events().len() == 1);
        hc.over_current(1);
        wait_for("detach", || recorder.events().len() == 2);
        assert!(host.devices().is_empty());
        wait_for("power back", || {
            let status = hc.rh_port_status(1).unwrap();
            status.is_powered() && !status.intersects(HubPortStatusV2::OVER_CURRENT | HubPortStatusV2::OVER_CURRENT_CHANGED)
        });
    }

    #[test]
    fn port_disable_and_enable() {
        let (host, hc, _recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("enumeration", || host.devices().len() == 1);
        host.disable_port(0, 1).unwrap();
        assert!(host.devices().is_empty());
        assert_eq!(host.port_state(0, 1), Some(PortState::Failed));

        host.enable_port(0, 1).unwrap();
        wait_for("enumeration", || host.devices().len() == 1);
        assert_eq!(host.disable_port(0, 9).unwrap_err(), UsbError::InvalidArg);
    }

    #[test]
    fn suspend_and_resume_reach_drivers() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::bulk(Speed::High));
        wait_for("probe", || recorder.events().len() == 1);
        host.suspend().unwrap();
        assert!(hc.is_suspended());
        host.resume().unwrap();
        assert!(!hc.is_suspended());
        assert_eq!(
            recorder.events(),
            vec!["probe 1 0".to_string(), "suspend 1".to_string(), "resume 1".to_string()]
        );
    }

    #[test]
    fn control_requests_and_stalls() {
        let (host, hc, recorder) = start(config(), 1);
        hc.connect(1, FakeDevice::new(Speed::High, 0, bulk_config(0xFF)));
        wait_for("probe", || recorder.events().len() == 1);
        let dev = Arc::clone(&host.devices()[0]);

        assert_eq!(dev.string(2).unwrap(), "Fake device");
        assert_eq!(dev.string(7).unwrap_err(), UsbError::Stall);
        assert_eq!(dev.set_interface(0, 1).unwrap_err(), UsbError::InvalidArg);
        assert_eq!(dev.set_interface(0, 0).unwrap().number, 0);

        let desc = dev.config().unwrap().interface_descs[0].endpoints[0];
        let ep = dev.open_endpoint(&desc).unwrap();
        assert_eq!(dev.open_endpoint(&desc).err(), Some(UsbError::EpBusy));
        hc.set_behavior(1, 0x81, Behavior::Fail(UsbError::Stall));
        assert_eq!(ep.read(64, Duration::from_secs(1)).unwrap_err(), UsbError::Stall);
        assert!(ep.is_halted());
        dev.clear_stall(&ep).unwrap();
        assert!(!ep.is_halted());
        assert!(hc.requests().contains(&(1, 0x01, 0)));

        let ep = dev.reset_endpoint(&ep).unwrap();
        hc.set_behavior(1, 0x81, Behavior::Data(vec![5; 4]));
        assert_eq!(ep.read(64, Duration::from_secs(1)).unwrap(), vec![5; 4]);
        assert!(host.frame_number(0).is_ok());
    }
}
