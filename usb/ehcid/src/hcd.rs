//! The boundary between the host stack core and a host controller driver.

use std::sync::Weak;

use crate::error::Result;
use crate::usb::{EndpointTy, HubPortFeature, HubPortStatusV2, Speed};

/// Opaque handle of an endpoint opened on a host controller.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HcEpHandle(pub(crate) usize);

/// Transaction translator a full/low-speed device is reached through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TtInfo {
    pub hub_addr: u8,
    pub port: u8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EpInfo {
    pub dev_addr: u8,
    pub speed: Speed,
    /// bEndpointAddress, including the direction bit.
    pub ep_addr: u8,
    pub ty: EndpointTy,
    /// wMaxPacketSize as in the descriptor, multiplier bits included.
    pub max_packet_size: u16,
    pub interval: u8,
    pub tt: Option<TtInfo>,
}

impl EpInfo {
    pub fn number(&self) -> u8 {
        self.ep_addr & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.ep_addr & 0x80 != 0
    }

    pub fn max_packet(&self) -> u16 {
        self.max_packet_size & 0x7FF
    }

    pub fn mult(&self) -> u8 {
        (((self.max_packet_size >> 11) & 0x3) as u8 + 1).min(3)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Token {
    Setup,
    In,
    Out,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IsoRequest {
    /// First frame to use; the controller picks one when `None`.
    pub start_frame: Option<u16>,
    /// Bytes per service interval, in order.
    pub frame_lens: Vec<u16>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsoFrameResult {
    pub actual: u16,
    pub status: Result<()>,
}

/// One hardware submission.
pub struct UrbRequest<'a> {
    pub token: Token,
    /// Payload for SETUP/OUT; ignored for IN.
    pub data: &'a [u8],
    /// Bytes to transfer.
    pub len: usize,
    /// The status stage of a control transfer always uses DATA1.
    pub status_stage: bool,
    pub iso: Option<&'a IsoRequest>,
}

/// Result of a retired submission, read back by the core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UrbOutcome {
    pub actual: usize,
    pub status: Result<()>,
    /// Received bytes for IN submissions.
    pub data: Vec<u8>,
    pub iso_frames: Vec<IsoFrameResult>,
}

/// Receives completion notifications from interrupt context.
///
/// Called without any host controller lock held.
pub trait UrbSink: Send + Sync {
    fn urb_done(&self, seq: u64);
}

/// Receives root hub port change notifications.
pub trait PortChangeSink: Send + Sync {
    fn port_changed(&self);
}

pub trait HostController: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn speed(&self) -> Speed;
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    fn frame_number(&self) -> u32;

    fn ep_open(&self, info: &EpInfo, sink: Weak<dyn UrbSink>) -> Result<HcEpHandle>;
    fn ep_close(&self, ep: HcEpHandle) -> Result<()>;
    /// Cancel whatever is in flight on the endpoint.
    fn ep_abort(&self, ep: HcEpHandle) -> Result<()>;
    fn ep_halted(&self, ep: HcEpHandle) -> bool;
    /// Forget the halt condition and restart the data toggle at DATA0.
    fn ep_reset_toggle(&self, ep: HcEpHandle) -> Result<()>;
    /// Change the packet size of an open endpoint (default control pipe during enumeration).
    fn ep_update_mps(&self, ep: HcEpHandle, max_packet_size: u16) -> Result<()>;
    fn ep_update_addr(&self, ep: HcEpHandle, dev_addr: u8) -> Result<()>;

    fn urb_submit(&self, ep: HcEpHandle, seq: u64, req: UrbRequest<'_>) -> Result<()>;
    /// Collect the result of a submission the sink was notified about and release its resources.
    fn urb_complete(&self, ep: HcEpHandle, seq: u64) -> Result<UrbOutcome>;
    fn urb_abort(&self, ep: HcEpHandle, seq: u64) -> Result<()>;

    fn rh_port_count(&self) -> u8;
    fn rh_port_status(&self, port: u8) -> Result<HubPortStatusV2>;
    fn rh_set_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()>;
    fn rh_clear_port_feature(&self, port: u8, feature: HubPortFeature) -> Result<()>;
    fn rh_set_change_sink(&self, sink: Weak<dyn PortChangeSink>);
}
