//! A register-level stand-in for an EHCI controller, for tests. Schedule status follows the
//! enable bits unless told to get stuck, and ports behave like a minimal root hub. Tests play the
//! part of the DMA engine by editing descriptors directly.

use std::sync::{Arc, Mutex, Weak};

use common::dma::{BusTranslate, CacheOps, Coherent, WindowedBus};
use common::io::Io;

use super::capability::{HCC_PARAMS_PFLF_BIT, HCS_PARAMS_PPC_BIT};
use super::desc::{Qtd, QtdStatus, LINK_TERMINATE};
use super::operational::{EhciRegs, OpReg, PortSc, UsbCmd, UsbSts};
use super::{Ehci, Work};
use crate::config::StackConfig;
use crate::hcd::{HcEpHandle, UrbSink};
use crate::usb::Speed;

pub struct SimState {
    pub hcs_params: u32,
    pub hcc_params: u32,
    pub cmd: u32,
    pub sts: u32,
    pub intr: u32,
    pub frindex: u32,
    pub ctrl_ds_segment: u32,
    pub periodic_list_base: u32,
    pub async_list_addr: u32,
    pub config_flag: u32,
    pub ports: Vec<u32>,
    pub devices: Vec<Option<Speed>>,
    /// ASS stops following ASE.
    pub async_stuck: bool,
    /// PSS stops following PSE.
    pub periodic_stuck: bool,
}

impl SimState {
    pub fn new(ports: usize) -> Self {
        Self {
            hcs_params: ports as u32 | HCS_PARAMS_PPC_BIT | (1 << 12),
            hcc_params: HCC_PARAMS_PFLF_BIT | (1 << 4),
            cmd: 0,
            sts: UsbSts::HCHALTED.bits(),
            intr: 0,
            frindex: 0,
            ctrl_ds_segment: 0,
            periodic_list_base: 0,
            async_list_addr: 0,
            config_flag: 0,
            ports: vec![0; ports],
            devices: vec![None; ports],
            async_stuck: false,
            periodic_stuck: false,
        }
    }

    fn reset(&mut self) {
        let ports = self.ports.len();
        let devices = std::mem::take(&mut self.devices);
        *self = Self::new(ports);
        for (port, device) in devices.into_iter().enumerate() {
            if let Some(speed) = device {
                self.connect(port, speed);
            }
        }
    }

    pub fn connect(&mut self, port: usize, speed: Speed) {
        let line = if speed == Speed::Low { PortSc::LS_K } else { PortSc::LS_J };
        let mut portsc = PortSc::from_bits_truncate(self.ports[port]) - PortSc::LS_MASK;
        portsc |= PortSc::CCS | PortSc::CSC | line;
        self.ports[port] = portsc.bits();
        self.devices[port] = Some(speed);
        self.sts |= UsbSts::PCD.bits();
    }

    pub fn disconnect(&mut self, port: usize) {
        let mut portsc = PortSc::from_bits_truncate(self.ports[port]);
        if portsc.contains(PortSc::PE) {
            portsc |= PortSc::PEC;
        }
        portsc = (portsc - PortSc::CCS - PortSc::PE - PortSc::LS_MASK - PortSc::PO) | PortSc::CSC;
        self.ports[port] = portsc.bits();
        self.devices[port] = None;
        self.sts |= UsbSts::PCD.bits();
    }

    pub fn advance_frames(&mut self, frames: u32) {
        self.frindex = (self.frindex + (frames << 3)) & 0x3FFF;
    }

    fn write_cmd(&mut self, value: u32) {
        let cmd = UsbCmd::from_bits_truncate(value);
        if cmd.contains(UsbCmd::HCRESET) {
            self.reset();
            return;
        }
        self.cmd = value;
        let mut sts = UsbSts::from_bits_truncate(self.sts);
        sts.set(UsbSts::HCHALTED, !cmd.contains(UsbCmd::RS));
        if !self.async_stuck {
            sts.set(UsbSts::ASS, cmd.contains(UsbCmd::ASE));
        }
        if !self.periodic_stuck {
            sts.set(UsbSts::PSS, cmd.contains(UsbCmd::PSE));
        }
        self.sts = sts.bits();
    }

    fn write_port(&mut self, port: usize, value: u32) {
        let value = PortSc::from_bits_truncate(value);
        let mut portsc = PortSc::from_bits_truncate(self.ports[port]);
        portsc.remove(value & PortSc::W1C_MASK);

        if !value.contains(PortSc::PE) {
            portsc.remove(PortSc::PE);
        }
        if value.contains(PortSc::PR) && !portsc.contains(PortSc::PR) {
            portsc.insert(PortSc::PR);
            portsc.remove(PortSc::PE);
        } else if !value.contains(PortSc::PR) && portsc.contains(PortSc::PR) {
            portsc.remove(PortSc::PR);
            if self.devices[port] == Some(Speed::High) {
                portsc.insert(PortSc::PE);
            }
        }
        for bit in [PortSc::PP, PortSc::SUSPEND, PortSc::FPR, PortSc::PO] {
            portsc.set(bit, value.contains(bit));
        }
        self.ports[port] = portsc.bits();
    }
}

pub struct SimRegs {
    pub state: Arc<Mutex<SimState>>,
}

impl EhciRegs for SimRegs {
    fn hcs_params(&self) -> u32 {
        self.state.lock().unwrap().hcs_params
    }

    fn hcc_params(&self) -> u32 {
        self.state.lock().unwrap().hcc_params
    }

    fn read(&self, reg: OpReg) -> u32 {
        let state = self.state.lock().unwrap();
        match reg {
            OpReg::UsbCmd => state.cmd,
            OpReg::UsbSts => state.sts,
            OpReg::UsbIntr => state.intr,
            OpReg::FrIndex => state.frindex,
            OpReg::CtrlDsSegment => state.ctrl_ds_segment,
            OpReg::PeriodicListBase => state.periodic_list_base,
            OpReg::AsyncListAddr => state.async_list_addr,
            OpReg::ConfigFlag => state.config_flag,
        }
    }

    fn write(&mut self, reg: OpReg, value: u32) {
        let mut state = self.state.lock().unwrap();
        match reg {
            OpReg::UsbCmd => state.write_cmd(value),
            OpReg::UsbSts => state.sts &= !(value & UsbSts::ACK_MASK.bits()),
            OpReg::UsbIntr => state.intr = value,
            OpReg::FrIndex => state.frindex = value & 0x3FFF,
            OpReg::CtrlDsSegment => state.ctrl_ds_segment = value,
            OpReg::PeriodicListBase => state.periodic_list_base = value,
            OpReg::AsyncListAddr => state.async_list_addr = value,
            OpReg::ConfigFlag => state.config_flag = value,
        }
    }

    fn port_read(&self, port: usize) -> u32 {
        self.state.lock().unwrap().ports[port]
    }

    fn port_write(&mut self, port: usize, value: u32) {
        self.state.lock().unwrap().write_port(port, value)
    }
}

pub fn controller(ports: usize) -> (Arc<Ehci<SimRegs>>, Arc<Mutex<SimState>>) {
    let state = Arc::new(Mutex::new(SimState::new(ports)));
    let regs = SimRegs {
        state: Arc::clone(&state),
    };
    let translate: Arc<dyn BusTranslate> = Arc::new(WindowedBus::default());
    let cache: Arc<dyn CacheOps> = Arc::new(Coherent);
    let hc = Ehci::new("ehci-sim", regs, &StackConfig::fast(), translate, cache).unwrap();
    (Arc::new(hc), state)
}

pub fn raise(hc: &Ehci<SimRegs>, sts: UsbSts) {
    let inner = hc.inner.lock().unwrap();
    inner.regs.state.lock().unwrap().sts |= sts.bits();
}

struct NullSink;

impl UrbSink for NullSink {
    fn urb_done(&self, _seq: u64) {}
}

pub fn null_sink() -> Weak<dyn UrbSink> {
    Weak::<NullSink>::new()
}

#[derive(Default)]
pub struct RecordingSink {
    done: Mutex<Vec<u64>>,
}

impl RecordingSink {
    pub fn done(&self) -> Vec<u64> {
        self.done.lock().unwrap().clone()
    }
}

impl UrbSink for RecordingSink {
    fn urb_done(&self, seq: u64) {
        self.done.lock().unwrap().push(seq);
    }
}

/// Act as the controller for the qTD chain in flight on `ep`: qTD `i` moves `results[i].0` bytes
/// and ends with status `results[i].1`. `data` lands in the transfer buffer.
pub fn complete_qtds(hc: &Ehci<SimRegs>, ep: HcEpHandle, results: &[(usize, QtdStatus)], data: &[u8]) {
    let mut inner = hc.inner.lock().unwrap();
    let qh = inner.endpoint(ep).unwrap().qh().unwrap();
    let head = {
        let xfer = inner.endpoint_mut(ep).unwrap().xfer.as_mut().unwrap();
        xfer.buffer.as_mut_slice()[..data.len()].copy_from_slice(data);
        match xfer.work.as_ref().unwrap() {
            Work::Qtds { head, .. } => *head,
            Work::Iso(_) => panic!("isochronous transfer"),
        }
    };

    let mut cur = Some(head);
    let mut last = 0;
    for &(done, status) in results {
        let block = cur.unwrap();
        last = inner.mem.bus(block);
        let next = inner.mem.update(block, |q: &mut Qtd| {
            let mut token = q.token();
            token.total_bytes -= done as u16;
            token.status = status;
            q.set_token(&token);
            q.next.read()
        });
        cur = if next & LINK_TERMINATE != 0 {
            None
        } else {
            inner.mem.block_at(next)
        };
    }
    inner.mem.update(qh, |q| q.current.write(last));
}
