//! The root hub, presented through the same port status words an external hub returns.
//!
//! Ports are numbered from 1. A low-speed device is recognised by the K state on an unreset port
//! and a full-speed device by the port staying disabled after reset; both are handed to the
//! companion controller, after which the port reads as empty.

use std::thread;
use std::time::Duration;

use common::timeout::poll_retries;
use log::{debug, info};

use super::operational::{EhciRegs, PortSc};
use super::EhciInner;
use crate::error::{Result, UsbError};
use crate::usb::{HubPortFeature, HubPortStatusV2};

/// How long a resume is driven before FPR is released.
const RESUME_MS: u64 = 20;

impl<R: EhciRegs> EhciInner<R> {
    fn port_index(&self, port: u8) -> Result<usize> {
        if port == 0 || port > self.caps.ports {
            return Err(UsbError::InvalidArg);
        }
        Ok(usize::from(port - 1))
    }

    pub fn port_status(&self, port: u8) -> Result<HubPortStatusV2> {
        let index = self.port_index(port)?;
        let portsc = self.regs.portsc(index);
        let mut status = HubPortStatusV2::empty();

        if !self.caps.port_power_control || portsc.contains(PortSc::PP) {
            status |= HubPortStatusV2::POWER;
        }
        if portsc.contains(PortSc::OCA) {
            status |= HubPortStatusV2::OVER_CURRENT;
        }
        if portsc.contains(PortSc::OCC) {
            status |= HubPortStatusV2::OVER_CURRENT_CHANGED;
        }
        if self.reset_changed[index] {
            status |= HubPortStatusV2::RESET_CHANGED;
        }
        if portsc.contains(PortSc::CSC) {
            status |= HubPortStatusV2::CONNECTION_CHANGED;
        }
        if portsc.contains(PortSc::PO) {
            // Owned by a companion controller.
            return Ok(status);
        }

        if portsc.contains(PortSc::CCS) {
            status |= HubPortStatusV2::CONNECTION;
        }
        if portsc.contains(PortSc::PE) {
            // Only high-speed devices ever get enabled here.
            status |= HubPortStatusV2::ENABLE | HubPortStatusV2::HIGH_SPEED;
        }
        if portsc.contains(PortSc::SUSPEND) {
            status |= HubPortStatusV2::SUSPEND;
        }
        if portsc.contains(PortSc::PR) {
            status |= HubPortStatusV2::RESET;
        }
        if portsc.contains(PortSc::PEC) {
            status |= HubPortStatusV2::ENABLE_CHANGED;
        }
        Ok(status)
    }

    fn hand_off(&mut self, index: usize) {
        info!("root port {}: handing full/low-speed device to companion", index + 1);
        self.regs.portsc_modify(index, |p| p | PortSc::PO);
    }

    pub fn set_port_feature(&mut self, port: u8, feature: HubPortFeature) -> Result<()> {
        let index = self.port_index(port)?;
        match feature {
            HubPortFeature::PortPower => {
                if self.caps.port_power_control {
                    self.regs.portsc_modify(index, |p| p | PortSc::PP);
                }
            }
            HubPortFeature::PortReset => {
                let portsc = self.regs.portsc(index);
                if portsc.contains(PortSc::CCS) && portsc.is_low_speed() {
                    self.hand_off(index);
                    self.reset_changed[index] = true;
                    return Ok(());
                }
                debug!("root port {}: reset", port);
                self.regs.portsc_modify(index, |p| (p | PortSc::PR) - PortSc::PE);
            }
            HubPortFeature::PortSuspend => {
                self.regs.portsc_modify(index, |p| p | PortSc::SUSPEND);
            }
            _ => return Err(UsbError::NotSupported),
        }
        Ok(())
    }

    /// Release PR and wait for the controller to finish the reset handshake.
    fn end_reset(&mut self, index: usize) -> Result<()> {
        self.regs.portsc_modify(index, |p| p - PortSc::PR);
        let regs = &self.regs;
        poll_retries(self.cfg.ack_retries, self.cfg.ack_delay, || {
            !regs.portsc(index).contains(PortSc::PR)
        })
        .map_err(|()| UsbError::Timeout)?;

        let portsc = self.regs.portsc(index);
        if portsc.contains(PortSc::CCS) && !portsc.contains(PortSc::PE) {
            self.hand_off(index);
        }
        self.reset_changed[index] = true;
        Ok(())
    }

    pub fn clear_port_feature(&mut self, port: u8, feature: HubPortFeature) -> Result<()> {
        let index = self.port_index(port)?;
        match feature {
            HubPortFeature::PortEnable => self.regs.portsc_modify(index, |p| p - PortSc::PE),
            HubPortFeature::PortPower => {
                if self.caps.port_power_control {
                    self.regs.portsc_modify(index, |p| p - PortSc::PP);
                }
            }
            HubPortFeature::PortSuspend => {
                self.regs.portsc_modify(index, |p| p | PortSc::FPR);
                thread::sleep(Duration::from_millis(RESUME_MS));
                self.regs.portsc_modify(index, |p| p - PortSc::FPR - PortSc::SUSPEND);
            }
            HubPortFeature::PortReset => self.end_reset(index)?,
            HubPortFeature::CPortConnection => self.regs.portsc_modify(index, |p| p | PortSc::CSC),
            HubPortFeature::CPortEnable => self.regs.portsc_modify(index, |p| p | PortSc::PEC),
            HubPortFeature::CPortOverCurrent => self.regs.portsc_modify(index, |p| p | PortSc::OCC),
            HubPortFeature::CPortReset => self.reset_changed[index] = false,
            HubPortFeature::CPortSuspend => {}
            _ => return Err(UsbError::NotSupported),
        }
        Ok(())
    }
}
