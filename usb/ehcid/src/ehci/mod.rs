//! Enhanced Host Controller Interface driver.
//!
//! One [`Ehci`] owns the register window and all descriptor memory of a controller behind a
//! single lock. The completion path ([`Ehci::handle_irq`]) collects notifications while holding
//! the lock and delivers them after releasing it, so a completion sink may call straight back
//! into the controller.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use common::dma::{BusTranslate, CacheOps};
use common::io::Io;
use common::pool::Block;
use common::timeout::{poll_retries, Timeout};
use log::{debug, error, info, warn};

use crate::config::StackConfig;
use crate::error::{Result, UsbError};
use crate::hcd::{
    EpInfo, HcEpHandle, HostController, PortChangeSink, UrbOutcome, UrbRequest, UrbSink,
};
use crate::usb::{EndpointTy, HubPortFeature, HubPortStatusV2, Speed};

use self::bandwidth::{BandwidthTable, BwAlloc};
use self::capability::Capabilities;
use self::desc::{QhEndpoint, Qtd, QtdStatus, QueueHead};
use self::isoch::IsoWork;
use self::mem::DescMem;
use self::operational::{OpReg, UsbCmd, UsbIntr, UsbSts};
use self::periodic::{FrameList, Retired};

pub use self::operational::{EhciRegs, MmioRegs};

pub mod bandwidth;
pub mod capability;
pub mod desc;
pub mod operational;
pub mod periodic;

mod async_sched;
mod irq_reactor;
mod isoch;
mod mem;
mod root_hub;
mod transfer;

#[cfg(test)]
pub(crate) mod sim;

pub use self::irq_reactor::InterruptMethod;

/// NAK reload count for high-speed async endpoints.
const NAK_RELOAD: u8 = 4;
/// How long resume signalling is driven on a suspended port.
const RESUME_SIGNAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Schedule {
    Async,
    Periodic,
}

impl Schedule {
    fn bits(self) -> (UsbCmd, UsbSts) {
        match self {
            Schedule::Async => (UsbCmd::ASE, UsbSts::ASS),
            Schedule::Periodic => (UsbCmd::PSE, UsbSts::PSS),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum EpKind {
    /// Control and bulk: a queue head on the async ring.
    Async { qh: Block<QueueHead> },
    /// A queue head spliced in after one interrupt tree placeholder.
    Interrupt {
        qh: Block<QueueHead>,
        node: usize,
        bw: BwAlloc,
    },
    /// Software-only; descriptors are queued per transfer.
    Isoch { bw: BwAlloc },
}

pub(crate) enum Work {
    Qtds { head: Block<Qtd>, lens: Vec<usize> },
    Iso(IsoWork),
}

pub(crate) struct InFlight {
    pub seq: u64,
    pub dir_in: bool,
    pub buffer: common::dma::DmaRegion,
    /// `None` once the completion path has retired the hardware descriptors.
    pub work: Option<Work>,
    pub outcome: Option<UrbOutcome>,
    /// Data toggle at submission.
    pub toggle: bool,
}

pub(crate) struct HcEndpoint {
    pub info: EpInfo,
    pub sink: Weak<dyn UrbSink>,
    pub kind: EpKind,
    /// Next data toggle.
    pub toggle: bool,
    pub halted: bool,
    pub xfer: Option<InFlight>,
}

impl HcEndpoint {
    pub fn qh(&self) -> Option<Block<QueueHead>> {
        match self.kind {
            EpKind::Async { qh } | EpKind::Interrupt { qh, .. } => Some(qh),
            EpKind::Isoch { .. } => None,
        }
    }

    fn is_split(&self) -> bool {
        self.info.speed != Speed::High
    }
}

/// Tunables copied out of the stack configuration.
#[derive(Clone, Debug)]
pub(crate) struct EhciConfig {
    pub ack_retries: u32,
    pub ack_delay: Duration,
    pub qtd_max_len: usize,
    pub iso_start_threshold: u16,
    pub iso_ep_count: usize,
    pub poll_interval: Duration,
}

impl From<&StackConfig> for EhciConfig {
    fn from(cfg: &StackConfig) -> Self {
        Self {
            ack_retries: cfg.sched_ack_retries,
            ack_delay: cfg.sched_ack_delay(),
            qtd_max_len: cfg.qtd_max_len.max(64),
            iso_start_threshold: cfg.iso_start_threshold,
            iso_ep_count: cfg.iso_ep_count,
            poll_interval: cfg.poll_interval(),
        }
    }
}

pub(crate) struct EhciInner<R> {
    pub regs: R,
    pub caps: Capabilities,
    pub cfg: EhciConfig,
    pub mem: DescMem,
    pub frame_list: FrameList,
    pub async_head: Block<QueueHead>,
    /// Always-inactive qTD that IN transfers use as alternate next, so a short packet ends the
    /// chain.
    pub dead_qtd: Block<Qtd>,
    /// Interrupt tree placeholders, heap ordered: node 0 is the 1 ms root.
    pub tree: Vec<Block<QueueHead>>,
    pub tree_users: Vec<usize>,
    pub bw: BandwidthTable,
    pub endpoints: Vec<Option<HcEndpoint>>,
    /// Owner of each queue head by pool index; placeholders and the async head have none.
    pub qh_owner: Vec<Option<HcEpHandle>>,
    pub isoch: Vec<HcEpHandle>,
    pub retired: Vec<Retired>,
    pub running: bool,
    /// Root port reset completions, reported as C_PORT_RESET.
    pub reset_changed: Vec<bool>,
}

impl<R: EhciRegs> EhciInner<R> {
    pub fn endpoint(&self, ep: HcEpHandle) -> Result<&HcEndpoint> {
        self.endpoints
            .get(ep.0)
            .and_then(Option::as_ref)
            .ok_or(UsbError::InvalidArg)
    }

    pub fn endpoint_mut(&mut self, ep: HcEpHandle) -> Result<&mut HcEndpoint> {
        self.endpoints
            .get_mut(ep.0)
            .and_then(Option::as_mut)
            .ok_or(UsbError::InvalidArg)
    }

    fn insert_endpoint(&mut self, ep: HcEndpoint) -> HcEpHandle {
        let qh = ep.qh();
        let index = match self.endpoints.iter().position(Option::is_none) {
            Some(index) => {
                self.endpoints[index] = Some(ep);
                index
            }
            None => {
                self.endpoints.push(Some(ep));
                self.endpoints.len() - 1
            }
        };
        let handle = HcEpHandle(index);
        if let Some(qh) = qh {
            self.qh_owner[qh.index()] = Some(handle);
        }
        handle
    }

    fn remove_endpoint(&mut self, ep: HcEpHandle) -> Option<HcEndpoint> {
        let removed = self.endpoints.get_mut(ep.0)?.take()?;
        if let Some(qh) = removed.qh() {
            self.qh_owner[qh.index()] = None;
        }
        Some(removed)
    }

    /// Current frame number from FRINDEX.
    pub fn frame(&self) -> u32 {
        (self.regs.read(OpReg::FrIndex) >> 3) & 0x7FF
    }

    /// Flip a schedule enable bit and wait for the status bit to follow.
    pub fn set_schedule(&mut self, which: Schedule, enable: bool) -> Result<()> {
        let (cmd_bit, sts_bit) = which.bits();
        let mut cmd = self.regs.cmd();
        cmd.set(cmd_bit, enable);
        self.regs.set_cmd(cmd);

        if !self.running {
            return Ok(());
        }
        let regs = &self.regs;
        poll_retries(self.cfg.ack_retries, self.cfg.ack_delay, || {
            regs.sts().contains(sts_bit) == enable
        })
        .map_err(|()| {
            error!(
                "{:?} schedule did not {} after {} polls",
                which,
                if enable { "start" } else { "stop" },
                self.cfg.ack_retries
            );
            UsbError::HcAckTimeout
        })
    }

    /// Run `f` while the controller is guaranteed not to walk the given schedule.
    pub fn with_schedule_stopped<T>(
        &mut self,
        which: Schedule,
        f: impl FnOnce(&mut Self) -> T,
    ) -> Result<T> {
        if let Err(err) = self.set_schedule(which, false) {
            // Leave the schedule enabled; nothing was touched.
            let mut cmd = self.regs.cmd();
            cmd.insert(which.bits().0);
            self.regs.set_cmd(cmd);
            return Err(err);
        }
        let ret = f(self);
        self.set_schedule(which, true)?;
        Ok(ret)
    }

    fn qh_endpoint(info: &EpInfo) -> QhEndpoint {
        let split = info.speed != Speed::High;
        let tt = info.tt.unwrap_or(crate::hcd::TtInfo { hub_addr: 0, port: 0 });
        QhEndpoint {
            dev_addr: info.dev_addr,
            endpoint: info.number(),
            speed_bits: desc::speed_bits(info.speed),
            max_packet: info.max_packet(),
            head: false,
            dtc: true,
            control: split && info.ty == EndpointTy::Ctrl,
            nak_reload: if split { 0 } else { NAK_RELOAD },
            s_mask: 0,
            c_mask: 0,
            hub_addr: if split { tt.hub_addr } else { 0 },
            port: if split { tt.port } else { 0 },
            mult: info.mult(),
        }
    }

    fn open(&mut self, info: &EpInfo, sink: Weak<dyn UrbSink>) -> Result<HcEpHandle> {
        if info.speed != Speed::High && info.tt.is_none() {
            warn!("{:?} endpoint without a transaction translator", info.speed);
            return Err(UsbError::InvalidArg);
        }

        match info.ty {
            EndpointTy::Ctrl | EndpointTy::Bulk => {
                let qh = self.mem.alloc::<QueueHead>().map_err(|_| UsbError::EpAlloc)?;
                let endpoint = Self::qh_endpoint(info);
                self.mem.update(qh, |q| q.set_endpoint(&endpoint));
                let handle = self.insert_endpoint(HcEndpoint {
                    info: *info,
                    sink,
                    kind: EpKind::Async { qh },
                    toggle: false,
                    halted: false,
                    xfer: None,
                });
                if let Err(err) = self.async_link(qh) {
                    // The controller may still see the queue head, so it is never reused.
                    error!("leaking queue head {:?} after {}", qh, err);
                    self.remove_endpoint(handle);
                    return Err(UsbError::EpAlloc);
                }
                Ok(handle)
            }
            EndpointTy::Interrupt => {
                let plan = bandwidth::plan(info)?;
                let bw = self.bw.admit(&plan)?;
                let qh = self.mem.alloc::<QueueHead>().map_err(|_| UsbError::EpAlloc)?;
                let mut endpoint = Self::qh_endpoint(info);
                endpoint.s_mask = bw.s_mask;
                endpoint.c_mask = bw.c_mask;
                self.mem.update(qh, |q| q.set_endpoint(&endpoint));

                let node = periodic::node_for(bw.period, bw.phase);
                let handle = self.insert_endpoint(HcEndpoint {
                    info: *info,
                    sink,
                    kind: EpKind::Interrupt { qh, node, bw },
                    toggle: false,
                    halted: false,
                    xfer: None,
                });
                self.intr_link(qh, node);
                self.bw.update(&bw, true);
                debug!(
                    "interrupt endpoint {:?}: period {} phase {} smask {:#04x} cmask {:#04x}",
                    handle, bw.period, bw.phase, bw.s_mask, bw.c_mask
                );
                Ok(handle)
            }
            EndpointTy::Isoch => {
                if info.speed == Speed::Low {
                    return Err(UsbError::InvalidArg);
                }
                if self.isoch.len() >= self.cfg.iso_ep_count {
                    warn!("no isochronous endpoint descriptor left");
                    return Err(UsbError::EpAlloc);
                }
                let plan = bandwidth::plan(info)?;
                let bw = self.bw.admit(&plan)?;
                let handle = self.insert_endpoint(HcEndpoint {
                    info: *info,
                    sink,
                    kind: EpKind::Isoch { bw },
                    toggle: false,
                    halted: false,
                    xfer: None,
                });
                self.bw.update(&bw, true);
                self.isoch.push(handle);
                Ok(handle)
            }
        }
    }

    fn close(&mut self, handle: HcEpHandle) -> Result<()> {
        if self.endpoint(handle)?.xfer.is_some() {
            let seq = self.endpoint(handle)?.xfer.as_ref().map_or(0, |x| x.seq);
            self.abort(handle, seq)?;
        }

        match self.endpoint(handle)?.kind {
            EpKind::Async { qh } => {
                if let Err(err) = self.async_unlink(qh) {
                    error!("leaking queue head {:?} after {}", qh, err);
                    self.remove_endpoint(handle);
                    return Err(UsbError::EpFree);
                }
                self.remove_endpoint(handle);
                self.mem.free(qh);
            }
            EpKind::Interrupt { qh, node, bw } => {
                if let Err(err) = self.intr_unlink(qh, node) {
                    // Still on the tree as far as the controller knows: its bandwidth stays taken.
                    error!("leaking queue head {:?} and its bandwidth after {}", qh, err);
                    self.remove_endpoint(handle);
                    return Err(UsbError::EpFree);
                }
                self.remove_endpoint(handle);
                self.mem.free(qh);
                self.bw.update(&bw, false);
            }
            EpKind::Isoch { bw } => {
                self.remove_endpoint(handle);
                self.isoch.retain(|&h| h != handle);
                self.bw.update(&bw, false);
            }
        }
        self.reap_retired();
        Ok(())
    }

    fn reset_toggle(&mut self, handle: HcEpHandle) -> Result<()> {
        let ep = self.endpoint_mut(handle)?;
        ep.toggle = false;
        ep.halted = false;
        if let Some(qh) = ep.qh() {
            if ep.xfer.is_none() {
                self.mem.update(qh, |q| q.reset_overlay());
            }
        }
        Ok(())
    }

    fn update_endpoint(&mut self, handle: HcEpHandle, f: impl FnOnce(&mut EpInfo)) -> Result<()> {
        let ep = self.endpoint_mut(handle)?;
        if ep.xfer.is_some() {
            return Err(UsbError::EpBusy);
        }
        f(&mut ep.info);
        let info = ep.info;
        if let Some(qh) = ep.qh() {
            self.mem.update(qh, |q| {
                let mut endpoint = q.endpoint();
                endpoint.dev_addr = info.dev_addr;
                endpoint.max_packet = info.max_packet();
                q.set_endpoint(&endpoint);
            });
        }
        Ok(())
    }
}

pub struct Ehci<R> {
    name: String,
    pub(crate) inner: Mutex<EhciInner<R>>,
    rollovers: AtomicU32,
    halted: AtomicBool,
    pub(crate) port_sink: Mutex<Option<Weak<dyn PortChangeSink>>>,
    pub(crate) irq_reactor: Mutex<Option<thread::JoinHandle<()>>>,
    pub(crate) reactor_stop: Arc<AtomicBool>,
}

impl<R: EhciRegs> Ehci<R> {
    /// Reset the controller and build both schedules. The controller stays halted until
    /// [`HostController::start`].
    pub fn new(
        name: impl Into<String>,
        mut regs: R,
        cfg: &StackConfig,
        translate: Arc<dyn BusTranslate>,
        cache: Arc<dyn CacheOps>,
    ) -> Result<Self> {
        let name = name.into();
        let caps = regs.capabilities();
        if !caps.programmable_frame_list {
            error!("{}: controller has a fixed 1024-entry frame list", name);
            return Err(UsbError::NotSupported);
        }

        Self::reset(&mut regs)?;

        let mut mem = DescMem::new(cfg, 1 + periodic::TREE_NODES, &translate, &cache)?;
        let async_head = mem.alloc::<QueueHead>()?;
        let head_link = mem.link(async_head);
        mem.update(async_head, |q| {
            q.set_endpoint(&QhEndpoint {
                head: true,
                speed_bits: desc::speed_bits(Speed::High),
                ..Default::default()
            });
            q.horiz.write(head_link);
            q.overlay.token.write(QtdStatus::HALTED.bits());
        });
        let dead_qtd = mem.alloc::<Qtd>()?;

        let frame_list = FrameList::new(&translate)?;
        let tree = periodic::build_tree(&mut mem, &frame_list)?;
        let qh_capacity = cfg.qh_count + 1 + periodic::TREE_NODES;

        regs.write(OpReg::CtrlDsSegment, 0);
        regs.write(OpReg::PeriodicListBase, frame_list.bus());
        regs.write(OpReg::AsyncListAddr, mem.bus(async_head));
        regs.write(
            OpReg::UsbIntr,
            (UsbIntr::USBINT | UsbIntr::USBERRINT | UsbIntr::PCD | UsbIntr::FLR | UsbIntr::HSE)
                .bits(),
        );
        regs.set_cmd(UsbCmd::FLS_256 | UsbCmd::ITC_1);

        info!(
            "{}: {} root ports, {} companion controllers, IST {} microframes",
            name, caps.ports, caps.companions, caps.iso_threshold_uframes
        );

        let inner = EhciInner {
            caps,
            cfg: EhciConfig::from(cfg),
            reset_changed: vec![false; usize::from(caps.ports)],
            regs,
            mem,
            frame_list,
            async_head,
            dead_qtd,
            tree_users: vec![0; tree.len()],
            tree,
            bw: BandwidthTable::new(cfg.uframe_budget),
            endpoints: Vec::new(),
            qh_owner: vec![None; qh_capacity],
            isoch: Vec::new(),
            retired: Vec::new(),
            running: false,
        };

        Ok(Self {
            name,
            inner: Mutex::new(inner),
            rollovers: AtomicU32::new(0),
            halted: AtomicBool::new(true),
            port_sink: Mutex::new(None),
            irq_reactor: Mutex::new(None),
            reactor_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn reset(regs: &mut R) -> Result<()> {
        let cmd = regs.cmd();
        regs.set_cmd(cmd - UsbCmd::RS);
        let timeout = Timeout::from_millis(16);
        while !regs.sts().contains(UsbSts::HCHALTED) {
            timeout.run().map_err(|()| {
                error!("controller did not halt");
                UsbError::HcAckTimeout
            })?;
        }

        regs.set_cmd(UsbCmd::HCRESET);
        let timeout = Timeout::from_millis(250);
        while regs.cmd().contains(UsbCmd::HCRESET) {
            timeout.run().map_err(|()| {
                error!("controller did not complete reset");
                UsbError::HcAckTimeout
            })?;
        }
        Ok(())
    }

    pub fn frame_rollovers(&self) -> u32 {
        self.rollovers.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    fn run(inner: &mut EhciInner<R>) -> Result<()> {
        let cmd = inner.regs.cmd();
        inner.regs.set_cmd(cmd | UsbCmd::RS);
        let timeout = Timeout::from_millis(16);
        while inner.regs.sts().contains(UsbSts::HCHALTED) {
            timeout.run().map_err(|()| {
                error!("controller did not leave the halted state");
                UsbError::HcAckTimeout
            })?;
        }
        inner.running = true;
        inner.set_schedule(Schedule::Periodic, true)?;
        inner.set_schedule(Schedule::Async, true)
    }

    fn halt(inner: &mut EhciInner<R>) -> Result<()> {
        inner.set_schedule(Schedule::Async, false)?;
        inner.set_schedule(Schedule::Periodic, false)?;
        let cmd = inner.regs.cmd();
        inner.regs.set_cmd(cmd - UsbCmd::RS);
        inner.running = false;
        let timeout = Timeout::from_millis(16);
        while !inner.regs.sts().contains(UsbSts::HCHALTED) {
            timeout.run().map_err(|()| {
                error!("controller did not halt");
                UsbError::HcAckTimeout
            })?;
        }
        Ok(())
    }
}

impl<R: EhciRegs> HostController for Ehci<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::run(&mut inner)?;
        inner.regs.write(OpReg::ConfigFlag, 1);
        if inner.caps.port_power_control {
            for port in 0..usize::from(inner.caps.ports) {
                inner.regs.portsc_modify(port, |p| p | operational::PortSc::PP);
            }
        }
        self.halted.store(false, Ordering::Relaxed);
        info!("{}: running", self.name);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_irq_reactor();
        let mut inner = self.inner.lock().unwrap();
        Self::halt(&mut inner)?;
        // Hand every port back to the companion controllers.
        inner.regs.write(OpReg::ConfigFlag, 0);
        self.halted.store(true, Ordering::Relaxed);
        info!("{}: stopped", self.name);
        Ok(())
    }

    fn speed(&self) -> Speed {
        Speed::High
    }

    fn suspend(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for port in 0..usize::from(inner.caps.ports) {
            if inner.regs.portsc(port).contains(operational::PortSc::PE) {
                inner.regs.portsc_modify(port, |p| p | operational::PortSc::SUSPEND);
            }
        }
        Self::halt(&mut inner)?;
        debug!("{}: suspended", self.name);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let suspended: Vec<usize> = {
            let mut inner = self.inner.lock().unwrap();
            let suspended: Vec<usize> = (0..usize::from(inner.caps.ports))
                .filter(|&port| inner.regs.portsc(port).contains(operational::PortSc::SUSPEND))
                .collect();
            for &port in suspended.iter() {
                inner.regs.portsc_modify(port, |p| p | operational::PortSc::FPR);
            }
            suspended
        };
        if !suspended.is_empty() {
            thread::sleep(RESUME_SIGNAL);
        }

        let mut inner = self.inner.lock().unwrap();
        for &port in suspended.iter() {
            inner.regs.portsc_modify(port, |p| p - operational::PortSc::FPR);
        }
        Self::run(&mut inner)?;
        debug!("{}: resumed {} ports", self.name, suspended.len());
        Ok(())
    }

    fn frame_number(&self) -> u32 {
        self.inner.lock().unwrap().frame()
    }

    fn ep_open(&self, info: &EpInfo, sink: Weak<dyn UrbSink>) -> Result<HcEpHandle> {
        let handle = self.inner.lock().unwrap().open(info, sink)?;
        debug!(
            "{}: opened {:?} endpoint {:#04x} of device {} as {:?}",
            self.name, info.ty, info.ep_addr, info.dev_addr, handle
        );
        Ok(handle)
    }

    fn ep_close(&self, ep: HcEpHandle) -> Result<()> {
        self.inner.lock().unwrap().close(ep)
    }

    fn ep_abort(&self, ep: HcEpHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.endpoint(ep)?.xfer.as_ref().map(|x| x.seq) {
            Some(seq) => inner.abort(ep, seq),
            None => Ok(()),
        }
    }

    fn ep_halted(&self, ep: HcEpHandle) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.endpoint(ep).map_or(false, |e| e.halted)
    }

    fn ep_reset_toggle(&self, ep: HcEpHandle) -> Result<()> {
        self.inner.lock().unwrap().reset_toggle(ep)
    }

    fn ep_update_mps(&self, ep: HcEpHandle, max_packet_size: u16) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .update_endpoint(ep, |info| info.max_packet_size = max_packet_size)
    }

    fn ep_update_addr(&self, ep: HcEpHandle, dev_addr: u8) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .update_endpoint(ep, |info| info.dev_addr = dev_addr)
    }

    fn urb_submit(&self, ep: HcEpHandle, seq: u64, req: UrbRequest<'_>) -> Result<()> {
        if self.is_halted() {
            return Err(UsbError::HcHalted);
        }
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner.endpoint(ep)?;
        if endpoint.xfer.is_some() {
            return Err(UsbError::EpBusy);
        }
        match endpoint.kind {
            EpKind::Isoch { .. } => inner.submit_isoch(ep, seq, &req),
            _ => inner.submit_qtds(ep, seq, &req),
        }
    }

    fn urb_complete(&self, ep: HcEpHandle, seq: u64) -> Result<UrbOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let endpoint = inner.endpoint_mut(ep)?;
        match endpoint.xfer.as_ref() {
            Some(xfer) if xfer.seq == seq && xfer.outcome.is_some() => {}
            _ => return Err(UsbError::EpInvalidState),
        }
        let xfer = endpoint.xfer.take().ok_or(UsbError::EpInvalidState)?;
        xfer.outcome.ok_or(UsbError::EpInvalidState)
    }

    fn urb_abort(&self, ep: HcEpHandle, seq: u64) -> Result<()> {
        self.inner.lock().unwrap().abort(ep, seq)
    }

    fn rh_port_count(&self) -> u8 {
        self.inner.lock().unwrap().caps.ports
    }

    fn rh_port_status(&self, port: u8) -> Result<HubPortStatusV2> {
        self.inner.lock().unwrap().port_status(port)
    }

    fn rh_set_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        self.inner.lock().unwrap().set_port_feature(port, feature)
    }

    fn rh_clear_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()> {
        self.inner.lock().unwrap().clear_port_feature(port, feature)
    }

    fn rh_set_change_sink(&self, sink: Weak<dyn PortChangeSink>) {
        *self.port_sink.lock().unwrap() = Some(sink);
    }
}

impl<R> Drop for Ehci<R> {
    fn drop(&mut self) {
        self.reactor_stop.store(true, Ordering::SeqCst);
    }
}
