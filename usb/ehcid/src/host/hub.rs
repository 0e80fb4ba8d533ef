//! Hubs and the per-port attach state machine, for root hubs and external hubs alike.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};

use super::class::ClassDriver;
use super::device::{AddressPool, Attachment, Device};
use super::endpoint::Endpoint;
use super::enumerator;
use super::urb::Completion;
use super::HostShared;
use crate::driver_interface::EndpDirection;
use crate::error::{Result, UsbError};
use crate::hcd::{HostController, TtInfo};
use crate::usb::{self, HubDescriptorV2, HubPortFeature, HubPortStatusV2, Setup, Speed};

/// Stable reference to a hub in the host's hub table.
///
/// The generation changes whenever a table slot is reused, so events queued for a hub that
/// went away are recognized and dropped.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HubId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

pub enum HubEvent {
    /// Something changed on one or more ports of the hub.
    Changed(HubId),
    /// The status change endpoint of the hub completed with an error and is no longer polled.
    StatusFailed(HubId),
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortState {
    Idle,
    /// Connect seen, waiting out the debounce interval.
    Connected,
    ResetPending,
    /// Reset finished and the speed is known.
    ResetComplete,
    Enumerating,
    Operational,
    /// Enumeration failed too often; the port stays disabled until the next connect.
    Failed,
}

struct Port {
    state: PortState,
    device: Option<Arc<Device>>,
}

enum Upstream {
    Root,
    External {
        dev: Arc<Device>,
        status_ep: Arc<Endpoint>,
    },
}

const ROOT_POWER_ON_DELAY: Duration = Duration::from_millis(20);
/// Polls of the port status while waiting for a reset to finish.
const RESET_POLLS: usize = 10;
/// Consecutive status endpoint errors tolerated before a hub is left unpolled.
const STATUS_RETRIES: u8 = 3;

pub struct Hub {
    id: HubId,
    hc_index: usize,
    hc: Arc<dyn HostController>,
    addresses: Arc<AddressPool>,
    upstream: Upstream,
    ports: Mutex<Vec<Port>>,
    power_on_delay: Duration,
    status_failures: AtomicU8,
}

fn ports(count: u8) -> Mutex<Vec<Port>> {
    Mutex::new(
        (0..count)
            .map(|_| Port {
                state: PortState::Idle,
                device: None,
            })
            .collect(),
    )
}

impl Hub {
    pub(crate) fn root(id: HubId, hc_index: usize, hc: Arc<dyn HostController>, addresses: Arc<AddressPool>) -> Self {
        let count = hc.rh_port_count();
        Self {
            id,
            hc_index,
            hc,
            addresses,
            upstream: Upstream::Root,
            ports: ports(count),
            power_on_delay: ROOT_POWER_ON_DELAY,
            status_failures: AtomicU8::new(0),
        }
    }

    fn external(
        id: HubId,
        hc: Arc<dyn HostController>,
        addresses: Arc<AddressPool>,
        dev: Arc<Device>,
        status_ep: Arc<Endpoint>,
        desc: &HubDescriptorV2,
    ) -> Self {
        Self {
            id,
            hc_index: dev.hc_index(),
            hc,
            addresses,
            upstream: Upstream::External { dev, status_ep },
            ports: ports(desc.ports),
            power_on_delay: Duration::from_millis(desc.power_on_delay_ms()),
            status_failures: AtomicU8::new(0),
        }
    }

    pub fn id(&self) -> HubId {
        self.id
    }

    pub fn hc_index(&self) -> usize {
        self.hc_index
    }

    pub(crate) fn hc(&self) -> &Arc<dyn HostController> {
        &self.hc
    }

    pub(crate) fn addresses(&self) -> &Arc<AddressPool> {
        &self.addresses
    }

    pub fn is_root(&self) -> bool {
        matches!(self.upstream, Upstream::Root)
    }

    /// Tier of the hub: 0 for a root hub.
    pub fn depth(&self) -> u8 {
        match &self.upstream {
            Upstream::Root => 0,
            Upstream::External { dev, .. } => dev.depth(),
        }
    }

    pub fn port_count(&self) -> u8 {
        self.ports.lock().unwrap().len() as u8
    }

    pub fn port_state(&self, port: u8) -> Option<PortState> {
        let ports = self.ports.lock().unwrap();
        ports.get(usize::from(port).checked_sub(1)?).map(|p| p.state)
    }

    pub fn device(&self, port: u8) -> Option<Arc<Device>> {
        let ports = self.ports.lock().unwrap();
        ports.get(usize::from(port).checked_sub(1)?)?.device.clone()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.ports
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.device.clone())
            .collect()
    }

    fn set_state(&self, port: u8, state: PortState) {
        let mut ports = self.ports.lock().unwrap();
        if let Some(p) = ports.get_mut(usize::from(port) - 1) {
            if p.state != state {
                debug!("hub {:?} port {}: {:?} -> {:?}", self.id, port, p.state, state);
                p.state = state;
            }
        }
    }

    fn port_status(&self, port: u8) -> Result<HubPortStatusV2> {
        match &self.upstream {
            Upstream::Root => self.hc.rh_port_status(port),
            Upstream::External { dev, .. } => {
                let raw = dev.control_in(Setup::get_port_status(port))?;
                if raw.len() < 4 {
                    return Err(UsbError::Io);
                }
                Ok(HubPortStatusV2::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
        }
    }

    fn set_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        match &self.upstream {
            Upstream::Root => self.hc.rh_set_port_feature(port, feature),
            Upstream::External { dev, .. } => dev.control_out(Setup::set_port_feature(port, feature), &[]),
        }
    }

    fn clear_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        match &self.upstream {
            Upstream::Root => self.hc.rh_clear_port_feature(port, feature),
            Upstream::External { dev, .. } => dev.control_out(Setup::clear_port_feature(port, feature), &[]),
        }
    }

    pub(crate) fn power_on(&self) {
        for port in 1..=self.port_count() {
            if let Err(err) = self.set_feature(port, HubPortFeature::PortPower) {
                warn!("hub {:?} port {}: power on failed: {}", self.id, port, err);
            }
        }
        thread::sleep(self.power_on_delay);
    }

    /// Where a device of `speed` on `port` sits, and which transaction translator serves it.
    pub(crate) fn child_attachment(&self, port: u8, speed: Speed) -> Attachment {
        let tt = match &self.upstream {
            Upstream::Root => None,
            Upstream::External { .. } if speed == Speed::High => None,
            Upstream::External { dev, .. } if dev.speed() == Speed::High => Some(TtInfo {
                hub_addr: dev.address(),
                port,
            }),
            Upstream::External { dev, .. } => dev.tt(),
        };
        Attachment {
            hub: self.id,
            port,
            depth: self.depth() + 1,
            tt,
        }
    }

    /// Poll the status change endpoint of an external hub; every report queues a hub event.
    fn arm_status(self: &Arc<Self>, tx: Sender<HubEvent>) {
        let status_ep = match &self.upstream {
            Upstream::External { status_ep, .. } => status_ep,
            Upstream::Root => return,
        };
        let len = (usize::from(self.port_count()) + 8) / 8;
        let id = self.id;
        let hub = Arc::downgrade(self);
        let armed = status_ep.read_async(
            len,
            Box::new(move |c: Completion| match c.status {
                Ok(()) => {
                    trace!("hub {:?}: status change {:02x?}", id, c.buffer);
                    if tx.send(HubEvent::Changed(id)).is_ok() {
                        if let Some(hub) = hub.upgrade() {
                            hub.status_failures.store(0, Ordering::Relaxed);
                            hub.arm_status(tx);
                        }
                    }
                }
                Err(UsbError::Aborted) => {}
                Err(err) => {
                    warn!("hub {:?}: status endpoint failed: {}", id, err);
                    let _ = tx.send(HubEvent::StatusFailed(id));
                }
            }),
        );
        if let Err(err) = armed {
            warn!("hub {:?}: cannot poll status endpoint: {}", self.id, err);
        }
    }

    /// Restart status polling after an error, clearing a halt first. Ports are rescanned since
    /// the failed report may have carried a change.
    pub(crate) fn recover_status(self: &Arc<Self>, host: &Arc<HostShared>) {
        let (dev, status_ep) = match &self.upstream {
            Upstream::External { dev, status_ep } => (dev, status_ep),
            Upstream::Root => return,
        };
        let failures = self.status_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures > STATUS_RETRIES {
            error!("hub {:?}: status endpoint failed {} times in a row, no longer polled", self.id, failures);
            return;
        }
        if status_ep.is_halted() {
            if let Err(err) = dev.clear_stall(status_ep) {
                warn!("hub {:?}: cannot clear status endpoint halt: {}", self.id, err);
            }
        }
        debug!("hub {:?}: re-arming status endpoint, attempt {}", self.id, failures);
        self.arm_status(host.hub_tx.clone());
        self.service(host);
    }

    /// Handle whatever changed on any port.
    pub(crate) fn service(self: &Arc<Self>, host: &Arc<HostShared>) {
        for port in 1..=self.port_count() {
            if let Err(err) = self.service_port(host, port) {
                warn!("hub {:?} port {}: {}", self.id, port, err);
            }
        }
    }

    fn service_port(self: &Arc<Self>, host: &Arc<HostShared>, port: u8) -> Result<()> {
        let status = self.port_status(port)?;
        let changes = status & HubPortStatusV2::CHANGE_MASK;
        const ACKS: [(HubPortStatusV2, HubPortFeature); 5] = [
            (HubPortStatusV2::CONNECTION_CHANGED, HubPortFeature::CPortConnection),
            (HubPortStatusV2::ENABLE_CHANGED, HubPortFeature::CPortEnable),
            (HubPortStatusV2::SUSPEND_CHANGED, HubPortFeature::CPortSuspend),
            (HubPortStatusV2::OVER_CURRENT_CHANGED, HubPortFeature::CPortOverCurrent),
            (HubPortStatusV2::RESET_CHANGED, HubPortFeature::CPortReset),
        ];
        for (bit, feature) in ACKS.iter() {
            if changes.contains(*bit) {
                self.clear_feature(port, *feature)?;
            }
        }

        if changes.contains(HubPortStatusV2::OVER_CURRENT_CHANGED) && status.contains(HubPortStatusV2::OVER_CURRENT) {
            warn!("hub {:?} port {}: over-current, power cycling", self.id, port);
            self.detach(port);
            self.clear_feature(port, HubPortFeature::PortPower)?;
            thread::sleep(self.power_on_delay);
            self.set_feature(port, HubPortFeature::PortPower)?;
            thread::sleep(self.power_on_delay);
            return Ok(());
        }

        let attached = self.device(port).is_some();
        let lost = changes.contains(HubPortStatusV2::CONNECTION_CHANGED)
            || !status.is_connected()
            || (changes.contains(HubPortStatusV2::ENABLE_CHANGED) && !status.is_enabled());
        if attached && lost {
            self.detach(port);
        }

        let state = self.port_state(port).unwrap_or(PortState::Idle);
        if !status.is_connected() {
            if state != PortState::Idle {
                self.set_state(port, PortState::Idle);
            }
            return Ok(());
        }
        if self.device(port).is_none()
            && (changes.contains(HubPortStatusV2::CONNECTION_CHANGED) || state == PortState::Idle)
        {
            self.attach(host, port);
        }
        Ok(())
    }

    fn attach(self: &Arc<Self>, host: &Arc<HostShared>, port: u8) {
        self.set_state(port, PortState::Connected);
        thread::sleep(Duration::from_millis(host.cfg.debounce_ms));

        for attempt in 1..=host.cfg.enum_retries.max(1) {
            let speed = match self.reset_port(host, port) {
                Ok(Some(speed)) => speed,
                Ok(None) => {
                    self.set_state(port, PortState::Idle);
                    return;
                }
                Err(err) => {
                    warn!("hub {:?} port {}: reset failed: {}", self.id, port, err);
                    continue;
                }
            };

            self.set_state(port, PortState::Enumerating);
            match enumerator::enumerate(host, self, port, speed) {
                Ok(dev) => {
                    info!(
                        "USB device {} ({:04x}:{:04x}, {:?} speed) on hub {:?} port {}",
                        dev.address(),
                        dev.desc().vendor,
                        dev.desc().product,
                        speed,
                        self.id,
                        port
                    );
                    {
                        let mut ports = self.ports.lock().unwrap();
                        let p = &mut ports[usize::from(port) - 1];
                        p.device = Some(Arc::clone(&dev));
                        p.state = PortState::Operational;
                    }
                    host.registry.probe(&host.cfg, &dev);
                    return;
                }
                Err(err) => {
                    warn!(
                        "hub {:?} port {}: enumeration attempt {} failed: {}",
                        self.id, port, attempt, err
                    );
                    match self.port_status(port) {
                        Ok(status) if status.is_connected() => {}
                        _ => {
                            self.set_state(port, PortState::Idle);
                            return;
                        }
                    }
                }
            }
        }

        error!("hub {:?} port {}: giving up on device", self.id, port);
        self.set_state(port, PortState::Failed);
        if let Err(err) = self.clear_feature(port, HubPortFeature::PortEnable) {
            warn!("hub {:?} port {}: disable failed: {}", self.id, port, err);
        }
    }

    /// Reset the port; `None` when nothing usable is attached afterwards.
    fn reset_port(&self, host: &HostShared, port: u8) -> Result<Option<Speed>> {
        self.set_state(port, PortState::ResetPending);
        self.set_feature(port, HubPortFeature::PortReset)?;
        thread::sleep(Duration::from_millis(host.cfg.reset_ms));
        if self.is_root() {
            self.clear_feature(port, HubPortFeature::PortReset)?;
        }

        let mut status = self.port_status(port)?;
        for _ in 0..RESET_POLLS {
            if !status.is_resetting() {
                break;
            }
            thread::sleep(Duration::from_millis(host.cfg.reset_ms));
            status = self.port_status(port)?;
        }
        if status.is_resetting() {
            return Err(UsbError::Timeout);
        }
        if status.contains(HubPortStatusV2::RESET_CHANGED) {
            self.clear_feature(port, HubPortFeature::CPortReset)?;
        }
        if !status.is_connected() {
            debug!("hub {:?} port {}: nothing connected after reset", self.id, port);
            return Ok(None);
        }
        if !status.is_enabled() {
            info!("hub {:?} port {}: port not enabled after reset", self.id, port);
            return Ok(None);
        }

        self.set_state(port, PortState::ResetComplete);
        thread::sleep(Duration::from_millis(host.cfg.reset_recovery_ms));
        Ok(Some(status.speed()))
    }

    fn detach(&self, port: u8) {
        let dev = {
            let mut ports = self.ports.lock().unwrap();
            match ports.get_mut(usize::from(port) - 1) {
                Some(p) => {
                    p.state = PortState::Idle;
                    p.device.take()
                }
                None => None,
            }
        };
        if let Some(dev) = dev {
            dev.teardown();
        }
    }

    /// Tear down every downstream device.
    pub(crate) fn detach_all(&self) {
        for port in 1..=self.port_count() {
            self.detach(port);
        }
    }

    /// Disable the port and drop its device; it stays off until [`Hub::enable_port`].
    pub fn disable_port(&self, port: u8) -> Result<()> {
        if port == 0 || port > self.port_count() {
            return Err(UsbError::InvalidArg);
        }
        self.detach(port);
        self.set_state(port, PortState::Failed);
        self.clear_feature(port, HubPortFeature::PortEnable)
    }

    /// Allow the port to enumerate again on the next hub event.
    pub fn enable_port(&self, port: u8) -> Result<()> {
        if port == 0 || port > self.port_count() {
            return Err(UsbError::InvalidArg);
        }
        if self.port_state(port) == Some(PortState::Failed) {
            self.set_state(port, PortState::Idle);
        }
        Ok(())
    }
}

/// The built-in hub class driver.
pub struct HubDriver {
    host: Weak<HostShared>,
    hubs: Mutex<HashMap<(usize, u8), HubId>>,
}

impl HubDriver {
    pub(crate) fn new(host: Weak<HostShared>) -> Self {
        Self {
            host,
            hubs: Mutex::new(HashMap::new()),
        }
    }
}

impl ClassDriver for HubDriver {
    fn name(&self) -> &str {
        "hub"
    }

    fn probe_device(&self, dev: &Arc<Device>) -> Result<()> {
        let host = self.host.upgrade().ok_or(UsbError::Disconnected)?;
        if dev.desc().class != usb::CLASS_HUB {
            return Err(UsbError::ClassNotSupported);
        }
        if dev.depth() > host.cfg.max_hub_depth {
            warn!(
                "hub {} at tier {} exceeds the limit of {}",
                dev.address(),
                dev.depth(),
                host.cfg.max_hub_depth
            );
            return Err(UsbError::NotSupported);
        }

        let raw = dev.control_in(Setup::get_hub_descriptor(HubDescriptorV2::SIZE as u16 + 2))?;
        let mut desc = HubDescriptorV2::default();
        plain::copy_from_bytes(&mut desc, &raw).map_err(|_| UsbError::Descriptor("short hub descriptor"))?;
        if desc.kind != HubDescriptorV2::DESCRIPTOR_KIND || desc.ports == 0 {
            return Err(UsbError::Descriptor("bad hub descriptor"));
        }

        let status_desc = dev
            .config()
            .and_then(|c| c.interface_descs.first())
            .and_then(|i| {
                i.endpoints
                    .iter()
                    .find(|e| e.is_interrupt() && e.direction() == EndpDirection::In)
                    .copied()
            })
            .ok_or(UsbError::Descriptor("hub without status endpoint"))?;
        let status_ep = dev.open_endpoint(&status_desc)?;

        let hub = host.insert_hub(dev.hc_index(), |id, hc, addresses| {
            Hub::external(id, hc, addresses, Arc::clone(dev), status_ep, &desc)
        })?;
        self.hubs
            .lock()
            .unwrap()
            .insert((dev.hc_index(), dev.address()), hub.id());
        info!("hub {}: {} ports, tier {}", dev.address(), desc.ports, dev.depth());

        hub.power_on();
        hub.arm_status(host.hub_tx.clone());
        host.notify(hub.id());
        Ok(())
    }

    fn disconnect(&self, dev: &Arc<Device>) {
        let id = match self.hubs.lock().unwrap().remove(&(dev.hc_index(), dev.address())) {
            Some(id) => id,
            None => return,
        };
        if let Some(host) = self.host.upgrade() {
            if let Some(hub) = host.remove_hub(id) {
                hub.detach_all();
            }
        }
    }
}
