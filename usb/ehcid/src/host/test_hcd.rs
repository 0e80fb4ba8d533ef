//! A scripted host controller: fake devices answer standard and hub requests, and a separate
//! "hardware" thread signals completions the way an interrupt handler would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, UsbError};
use crate::hcd::{
    EpInfo, HcEpHandle, HostController, IsoFrameResult, PortChangeSink, Token, UrbOutcome, UrbRequest, UrbSink,
};
use crate::usb::{EndpointTy, HubPortFeature, HubPortStatusV2, Setup, Speed};

/// How a non-control endpoint answers.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// IN transfers return these bytes; OUT transfers are accepted.
    Data(Vec<u8>),
    Fail(UsbError),
    /// Nothing ever completes.
    Never,
    /// Every byte is accepted.
    Accept,
}

#[derive(Clone, Debug)]
pub struct FakeDevice {
    pub speed: Speed,
    pub device: Vec<u8>,
    pub config: Vec<u8>,
    pub strings: Vec<String>,
    /// How many eight-byte descriptor probes fail before one succeeds.
    pub fail_probes: usize,
    pub hub_ports: Option<Vec<FakePort>>,
    address: u8,
    pending: Option<(Setup, Result<Vec<u8>>)>,
}

#[derive(Clone, Debug, Default)]
pub struct FakePort {
    pub status: HubPortStatusV2,
    pub device: Option<FakeDevice>,
}

fn device_descriptor(speed: Speed, class: u8) -> Vec<u8> {
    let mps0 = match speed {
        Speed::Low => 8,
        _ => 64,
    };
    vec![18, 1, 0x00, 0x02, class, 0, 0, mps0, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 0, 1]
}

fn string_descriptor(s: &str) -> Vec<u8> {
    let mut raw = vec![0, 3];
    for unit in s.encode_utf16() {
        raw.extend_from_slice(&unit.to_le_bytes());
    }
    raw[0] = raw.len() as u8;
    raw
}

/// A configuration with one interface of `class` holding a bulk IN and a bulk OUT endpoint.
pub fn bulk_config(class: u8) -> Vec<u8> {
    let mut raw = vec![
        9, 2, 0, 0, 1, 1, 0, 0x80, 50, //
        9, 4, 0, 0, 2, class, 0, 0, 0, //
        7, 5, 0x81, 2, 0x00, 0x02, 0, //
        7, 5, 0x02, 2, 0x00, 0x02, 0,
    ];
    let total = raw.len() as u16;
    raw[2..4].copy_from_slice(&total.to_le_bytes());
    raw
}

fn hub_config() -> Vec<u8> {
    vec![
        9, 2, 25, 0, 1, 1, 0, 0xE0, 0, //
        9, 4, 0, 0, 1, 9, 0, 0, 0, //
        7, 5, 0x81, 3, 1, 0, 12,
    ]
}

impl FakeDevice {
    pub fn new(speed: Speed, class: u8, config: Vec<u8>) -> Self {
        Self {
            speed,
            device: device_descriptor(speed, class),
            config,
            strings: vec!["Fake Inc.".to_string(), "Fake device".to_string()],
            fail_probes: 0,
            hub_ports: None,
            address: 0,
            pending: None,
        }
    }

    /// A vendor specific device with one bulk interface.
    pub fn bulk(speed: Speed) -> Self {
        Self::new(speed, 0, bulk_config(0xFF))
    }

    pub fn hub(speed: Speed, ports: u8) -> Self {
        let mut dev = Self::new(speed, 9, hub_config());
        dev.hub_ports = Some(vec![FakePort::default(); usize::from(ports)]);
        dev
    }

    fn answer(&mut self, setup: Setup) -> Result<Vec<u8>> {
        let (value, index, length) = (setup.value, setup.index, setup.length);
        match (setup.kind, setup.request) {
            (0x80, 0x06) => match (value >> 8) as u8 {
                1 => {
                    if length == 8 && self.fail_probes > 0 {
                        self.fail_probes -= 1;
                        return Err(UsbError::Io);
                    }
                    Ok(self.device.clone())
                }
                2 => Ok(self.config.clone()),
                3 => match value & 0xFF {
                    0 => Ok(vec![4, 3, 0x09, 0x04]),
                    i => self
                        .strings
                        .get(usize::from(i) - 1)
                        .map(|s| string_descriptor(s))
                        .ok_or(UsbError::Stall),
                },
                _ => Err(UsbError::Stall),
            },
            (0x00, 0x05) | (0x00, 0x09) | (0x01, 0x0B) | (0x02, 0x01) | (0x02, 0x03) => Ok(Vec::new()),
            (0xA0, 0x06) => match &self.hub_ports {
                Some(ports) => Ok(vec![9, 0x29, ports.len() as u8, 0, 0, 1, 0, 0, 0xFF]),
                None => Err(UsbError::Stall),
            },
            (0xA3, 0x00) => match self.port_mut(index) {
                Some(port) => Ok(port.status.bits().to_le_bytes().to_vec()),
                None => Err(UsbError::Stall),
            },
            (0x23, request @ 0x01) | (0x23, request @ 0x03) => match self.port_mut(index) {
                Some(port) => {
                    port.feature(request == 0x03, value, true);
                    Ok(Vec::new())
                }
                None => Err(UsbError::Stall),
            },
            _ => Err(UsbError::Stall),
        }
    }

    fn port_mut(&mut self, index: u16) -> Option<&mut FakePort> {
        let ports = self.hub_ports.as_mut()?;
        ports.get_mut(usize::from(index).checked_sub(1)?)
    }

    fn status_change_bitmap(&self) -> Option<Vec<u8>> {
        let ports = self.hub_ports.as_ref()?;
        let mut bitmap = vec![0u8; (ports.len() + 8) / 8];
        for (i, port) in ports.iter().enumerate() {
            if port.status.intersects(HubPortStatusV2::CHANGE_MASK) {
                bitmap[(i + 1) / 8] |= 1 << ((i + 1) % 8);
            }
        }
        if bitmap.iter().any(|&b| b != 0) {
            Some(bitmap)
        } else {
            None
        }
    }
}

impl FakePort {
    fn attach(&mut self, dev: FakeDevice) {
        self.status.remove(HubPortStatusV2::LOW_SPEED | HubPortStatusV2::HIGH_SPEED | HubPortStatusV2::ENABLE);
        self.status.insert(HubPortStatusV2::CONNECTION | HubPortStatusV2::CONNECTION_CHANGED);
        if dev.speed == Speed::Low {
            self.status.insert(HubPortStatusV2::LOW_SPEED);
        }
        self.device = Some(dev);
    }

    fn detach(&mut self) {
        self.status.remove(
            HubPortStatusV2::CONNECTION
                | HubPortStatusV2::ENABLE
                | HubPortStatusV2::LOW_SPEED
                | HubPortStatusV2::HIGH_SPEED,
        );
        self.status.insert(HubPortStatusV2::CONNECTION_CHANGED);
        self.device = None;
    }

    fn finish_reset(&mut self) {
        self.status.remove(HubPortStatusV2::RESET);
        self.status.insert(HubPortStatusV2::RESET_CHANGED);
        if let Some(dev) = self.device.as_mut() {
            self.status.insert(HubPortStatusV2::ENABLE);
            if dev.speed == Speed::High {
                self.status.insert(HubPortStatusV2::HIGH_SPEED);
            }
            dev.address = 0;
            dev.pending = None;
        }
    }

    /// SET_FEATURE/CLEAR_FEATURE; external hubs finish a reset on their own.
    fn feature(&mut self, set: bool, feature: u16, instant_reset: bool) {
        use HubPortStatusV2 as S;
        let change = |f: HubPortFeature| feature == f as u16;
        if set {
            if change(HubPortFeature::PortPower) {
                self.status.insert(S::POWER);
            } else if change(HubPortFeature::PortReset) {
                self.status.remove(S::ENABLE);
                self.status.insert(S::RESET);
                if instant_reset {
                    self.finish_reset();
                }
            } else if change(HubPortFeature::PortSuspend) {
                self.status.insert(S::SUSPEND);
            }
            return;
        }
        let bits = match feature {
            f if f == HubPortFeature::PortEnable as u16 => S::ENABLE,
            f if f == HubPortFeature::PortSuspend as u16 => S::SUSPEND,
            f if f == HubPortFeature::PortPower as u16 => S::POWER | S::ENABLE,
            f if f == HubPortFeature::CPortConnection as u16 => S::CONNECTION_CHANGED,
            f if f == HubPortFeature::CPortEnable as u16 => S::ENABLE_CHANGED,
            f if f == HubPortFeature::CPortSuspend as u16 => S::SUSPEND_CHANGED,
            f if f == HubPortFeature::CPortOverCurrent as u16 => S::OVER_CURRENT_CHANGED | S::OVER_CURRENT,
            f if f == HubPortFeature::CPortReset as u16 => S::RESET_CHANGED,
            f if f == HubPortFeature::PortReset as u16 => {
                if self.status.is_resetting() {
                    self.finish_reset();
                }
                S::empty()
            }
            _ => S::empty(),
        };
        self.status.remove(bits);
    }
}

fn find_device(ports: &mut [FakePort], addr: u8) -> Option<&mut FakeDevice> {
    for port in ports.iter_mut() {
        if !port.status.is_enabled() {
            continue;
        }
        if let Some(dev) = port.device.as_mut() {
            if dev.address == addr {
                return Some(dev);
            }
            if let Some(children) = dev.hub_ports.as_mut() {
                if let Some(found) = find_device(children, addr) {
                    return Some(found);
                }
            }
        }
    }
    None
}

struct Pending {
    seq: u64,
    /// Computed at submission, handed over by the hardware thread.
    ready: Option<UrbOutcome>,
    outcome: Option<UrbOutcome>,
}

struct OpenEp {
    info: EpInfo,
    sink: Weak<dyn UrbSink>,
    pending: Option<Pending>,
    halted: bool,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<usize, OpenEp>,
    next_handle: usize,
    behaviors: HashMap<(u8, u8), Behavior>,
    root: Vec<FakePort>,
    aborted: usize,
    submitted: Vec<(u8, u8, usize)>,
    requests: Vec<(u8, u8, u16)>,
    suspended: bool,
}

struct Job {
    handle: usize,
    seq: u64,
}

fn outcome(status: Result<()>, actual: usize, data: Vec<u8>, req: &UrbRequest<'_>) -> UrbOutcome {
    let iso_frames = req
        .iso
        .map(|iso| {
            iso.frame_lens
                .iter()
                .map(|&len| IsoFrameResult { actual: len, status })
                .collect()
        })
        .unwrap_or_default();
    UrbOutcome {
        actual,
        status,
        data,
        iso_frames,
    }
}

impl Inner {
    fn compute(&mut self, info: EpInfo, req: &UrbRequest<'_>) -> Option<UrbOutcome> {
        if info.ty == EndpointTy::Ctrl {
            let dev = match find_device(&mut self.root, info.dev_addr) {
                Some(dev) => dev,
                None => return Some(outcome(Err(UsbError::Io), 0, Vec::new(), req)),
            };
            let result = match (req.token, req.status_stage) {
                (Token::Setup, _) => match Setup::from_bytes(req.data) {
                    Some(setup) => {
                        self.requests.push((info.dev_addr, setup.request, setup.value));
                        let answer = dev.answer(setup);
                        dev.pending = Some((setup, answer));
                        Ok((8, Vec::new()))
                    }
                    None => Err(UsbError::Io),
                },
                (_, true) => match dev.pending.take() {
                    Some((setup, Ok(_))) => {
                        if setup.kind == 0 && setup.request == 0x05 {
                            dev.address = setup.value as u8;
                        }
                        Ok((0, Vec::new()))
                    }
                    Some((_, Err(err))) => Err(err),
                    None => Ok((0, Vec::new())),
                },
                (Token::In, false) => match &dev.pending {
                    Some((_, Ok(data))) => {
                        let data = data[..data.len().min(req.len)].to_vec();
                        Ok((data.len(), data))
                    }
                    Some((_, Err(err))) => Err(*err),
                    None => Err(UsbError::Stall),
                },
                (Token::Out, false) => Ok((req.len, Vec::new())),
            };
            return Some(match result {
                Ok((actual, data)) => outcome(Ok(()), actual, data, req),
                Err(err) => outcome(Err(err), 0, Vec::new(), req),
            });
        }

        // Hub status reads park until a port changes; see `TestHc::kick_hub`.
        if info.ty == EndpointTy::Interrupt && info.ep_addr == 0x81 {
            if let Some(dev) = find_device(&mut self.root, info.dev_addr) {
                if dev.hub_ports.is_some() {
                    return None;
                }
            }
        }

        match self.behaviors.get(&(info.dev_addr, info.ep_addr)) {
            Some(Behavior::Data(data)) if req.token == Token::In => {
                let data = data[..data.len().min(req.len)].to_vec();
                Some(outcome(Ok(()), data.len(), data, req))
            }
            Some(Behavior::Data(_)) | Some(Behavior::Accept) => Some(outcome(Ok(()), req.len, Vec::new(), req)),
            Some(Behavior::Fail(err)) => Some(outcome(Err(*err), 0, Vec::new(), req)),
            Some(Behavior::Never) | None => None,
        }
    }
}

fn hardware(inner: Arc<Mutex<Inner>>, rx: Receiver<Job>) {
    for job in rx.iter() {
        let sink = {
            let mut inner = inner.lock().unwrap();
            let ep = match inner.endpoints.get_mut(&job.handle) {
                Some(ep) => ep,
                None => continue,
            };
            let status = match ep.pending.as_mut() {
                Some(p) if p.seq == job.seq && p.ready.is_some() => {
                    p.outcome = p.ready.take();
                    p.outcome.as_ref().map(|o| o.status)
                }
                _ => continue,
            };
            if matches!(status, Some(Err(UsbError::Stall)) | Some(Err(UsbError::Io))) {
                ep.halted = true;
            }
            ep.sink.clone()
        };
        if let Some(sink) = sink.upgrade() {
            sink.urb_done(job.seq);
        }
    }
}

pub struct TestHc {
    inner: Arc<Mutex<Inner>>,
    hw_tx: Sender<Job>,
    port_sink: Mutex<Option<Weak<dyn PortChangeSink>>>,
    frame: AtomicU32,
}

impl TestHc {
    pub fn new(ports: u8) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(Inner {
            root: vec![FakePort::default(); usize::from(ports)],
            ..Inner::default()
        }));
        let (hw_tx, hw_rx) = crossbeam_channel::unbounded();
        let hw_inner = Arc::clone(&inner);
        thread::spawn(move || hardware(hw_inner, hw_rx));
        Arc::new(Self {
            inner,
            hw_tx,
            port_sink: Mutex::new(None),
            frame: AtomicU32::new(0),
        })
    }

    fn notify_ports(&self) {
        let sink = self.port_sink.lock().unwrap().clone();
        if let Some(sink) = sink.and_then(|w| w.upgrade()) {
            sink.port_changed();
        }
    }

    /// Complete parked status reads of the hub at `hub_addr`.
    fn kick_hub(&self, hub_addr: u8) {
        let mut inner = self.inner.lock().unwrap();
        let bitmap = match find_device(&mut inner.root, hub_addr).and_then(|d| d.status_change_bitmap()) {
            Some(bitmap) => bitmap,
            None => return,
        };
        for (handle, ep) in inner.endpoints.iter_mut() {
            if ep.info.dev_addr != hub_addr || ep.info.ep_addr != 0x81 {
                continue;
            }
            if let Some(p) = ep.pending.as_mut() {
                if p.ready.is_none() && p.outcome.is_none() {
                    p.ready = Some(UrbOutcome {
                        actual: bitmap.len(),
                        status: Ok(()),
                        data: bitmap.clone(),
                        iso_frames: Vec::new(),
                    });
                    let _ = self.hw_tx.send(Job {
                        handle: *handle,
                        seq: p.seq,
                    });
                }
            }
        }
    }

    /// Fail the parked status read of the hub at `hub_addr`. Returns whether one was parked.
    pub fn fail_hub_status(&self, hub_addr: u8, err: UsbError) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut failed = false;
        for (handle, ep) in inner.endpoints.iter_mut() {
            if ep.info.dev_addr != hub_addr || ep.info.ep_addr != 0x81 {
                continue;
            }
            if let Some(p) = ep.pending.as_mut() {
                if p.ready.is_none() && p.outcome.is_none() {
                    p.ready = Some(UrbOutcome {
                        actual: 0,
                        status: Err(err),
                        data: Vec::new(),
                        iso_frames: Vec::new(),
                    });
                    let _ = self.hw_tx.send(Job {
                        handle: *handle,
                        seq: p.seq,
                    });
                    failed = true;
                }
            }
        }
        failed
    }

    pub fn set_behavior(&self, dev_addr: u8, ep_addr: u8, behavior: Behavior) {
        self.inner
            .lock()
            .unwrap()
            .behaviors
            .insert((dev_addr, ep_addr), behavior);
    }

    pub fn connect(&self, port: u8, dev: FakeDevice) {
        self.inner.lock().unwrap().root[usize::from(port) - 1].attach(dev);
        self.notify_ports();
    }

    pub fn disconnect(&self, port: u8) {
        self.inner.lock().unwrap().root[usize::from(port) - 1].detach();
        self.notify_ports();
    }

    pub fn over_current(&self, port: u8) {
        {
            let mut inner = self.inner.lock().unwrap();
            let port = &mut inner.root[usize::from(port) - 1];
            port.status
                .insert(HubPortStatusV2::OVER_CURRENT | HubPortStatusV2::OVER_CURRENT_CHANGED);
        }
        self.notify_ports();
    }

    pub fn hub_connect(&self, hub_addr: u8, port: u8, dev: FakeDevice) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(hub) = find_device(&mut inner.root, hub_addr) {
                if let Some(p) = hub.port_mut(u16::from(port)) {
                    p.attach(dev);
                }
            }
        }
        self.kick_hub(hub_addr);
    }

    pub fn hub_disconnect(&self, hub_addr: u8, port: u8) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(hub) = find_device(&mut inner.root, hub_addr) {
                if let Some(p) = hub.port_mut(u16::from(port)) {
                    p.detach();
                }
            }
        }
        self.kick_hub(hub_addr);
    }

    pub fn aborted(&self) -> usize {
        self.inner.lock().unwrap().aborted
    }

    pub fn open_endpoints(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    pub fn submitted_lens(&self, dev_addr: u8, ep_addr: u8) -> Vec<usize> {
        self.inner
            .lock()
            .unwrap()
            .submitted
            .iter()
            .filter(|(d, e, _)| *d == dev_addr && *e == ep_addr)
            .map(|(_, _, len)| *len)
            .collect()
    }

    /// `(address, bRequest, wValue)` of every SETUP seen so far.
    pub fn requests(&self) -> Vec<(u8, u8, u16)> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().unwrap().suspended
    }
}

impl HostController for TestHc {
    fn name(&self) -> &str {
        "testhc"
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn speed(&self) -> Speed {
        Speed::High
    }

    fn suspend(&self) -> Result<()> {
        self.inner.lock().unwrap().suspended = true;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.inner.lock().unwrap().suspended = false;
        Ok(())
    }

    fn frame_number(&self) -> u32 {
        self.frame.fetch_add(1, Ordering::SeqCst)
    }

    fn ep_open(&self, info: &EpInfo, sink: Weak<dyn UrbSink>) -> Result<HcEpHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.endpoints.insert(
            handle,
            OpenEp {
                info: *info,
                sink,
                pending: None,
                halted: false,
            },
        );
        Ok(HcEpHandle(handle))
    }

    fn ep_close(&self, ep: HcEpHandle) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .remove(&ep.0)
            .map(|_| ())
            .ok_or(UsbError::InvalidArg)
    }

    fn ep_abort(&self, ep: HcEpHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ep = inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?;
        ep.pending = None;
        Ok(())
    }

    fn ep_halted(&self, ep: HcEpHandle) -> bool {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .get(&ep.0)
            .map_or(false, |ep| ep.halted)
    }

    fn ep_reset_toggle(&self, ep: HcEpHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?.halted = false;
        Ok(())
    }

    fn ep_update_mps(&self, ep: HcEpHandle, max_packet_size: u16) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?.info.max_packet_size = max_packet_size;
        Ok(())
    }

    fn ep_update_addr(&self, ep: HcEpHandle, dev_addr: u8) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?.info.dev_addr = dev_addr;
        Ok(())
    }

    fn urb_submit(&self, ep: HcEpHandle, seq: u64, req: UrbRequest<'_>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let info = match inner.endpoints.get(&ep.0) {
            Some(open) if open.pending.is_some() => return Err(UsbError::EpBusy),
            Some(open) => open.info,
            None => return Err(UsbError::InvalidArg),
        };
        inner.submitted.push((info.dev_addr, info.ep_addr, req.len));
        let ready = inner.compute(info, &req);
        let signal = ready.is_some();
        if let Some(open) = inner.endpoints.get_mut(&ep.0) {
            open.pending = Some(Pending {
                seq,
                ready,
                outcome: None,
            });
        }
        if signal {
            let _ = self.hw_tx.send(Job { handle: ep.0, seq });
        }
        Ok(())
    }

    fn urb_complete(&self, ep: HcEpHandle, seq: u64) -> Result<UrbOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let open = inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?;
        match open.pending.take() {
            Some(Pending {
                seq: s,
                outcome: Some(outcome),
                ..
            }) if s == seq => Ok(outcome),
            other => {
                open.pending = other;
                Err(UsbError::EpInvalidState)
            }
        }
    }

    fn urb_abort(&self, ep: HcEpHandle, seq: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let open = inner.endpoints.get_mut(&ep.0).ok_or(UsbError::InvalidArg)?;
        if open.pending.as_ref().map(|p| p.seq) == Some(seq) {
            open.pending = None;
            inner.aborted += 1;
        }
        Ok(())
    }

    fn rh_port_count(&self) -> u8 {
        self.inner.lock().unwrap().root.len() as u8
    }

    fn rh_port_status(&self, port: u8) -> Result<HubPortStatusV2> {
        let inner = self.inner.lock().unwrap();
        let port = inner
            .root
            .get(usize::from(port).wrapping_sub(1))
            .ok_or(UsbError::InvalidArg)?;
        Ok(port.status)
    }

    fn rh_set_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let port = inner
            .root
            .get_mut(usize::from(port).wrapping_sub(1))
            .ok_or(UsbError::InvalidArg)?;
        port.feature(true, feature as u16, false);
        Ok(())
    }

    fn rh_clear_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let port = inner
            .root
            .get_mut(usize::from(port).wrapping_sub(1))
            .ok_or(UsbError::InvalidArg)?;
        port.feature(false, feature as u16, false);
        Ok(())
    }

    fn rh_set_change_sink(&self, sink: Weak<dyn PortChangeSink>) {
        *self.port_sink.lock().unwrap() = Some(sink);
    }
}
