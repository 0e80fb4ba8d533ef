use std::result;

use thiserror::Error;

/// Errors surfaced by the host stack.
///
/// Host controller internals (timeouts, pool exhaustion) are folded into a handful of generic
/// variants at the driver boundary; the details are logged where they happen.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum UsbError {
    #[error("out of memory")]
    Alloc,
    #[error("failed to open endpoint")]
    EpAlloc,
    #[error("failed to close endpoint")]
    EpFree,
    #[error("host controller did not acknowledge a schedule change")]
    HcAckTimeout,
    #[error("not enough periodic bandwidth")]
    BandwidthNotAvailable,
    #[error("endpoint stalled")]
    Stall,
    #[error("transaction error")]
    Io,
    #[error("transfer timed out")]
    Timeout,
    #[error("transfer aborted")]
    Aborted,
    #[error("invalid descriptor: {0}")]
    Descriptor(&'static str),
    #[error("class not supported")]
    ClassNotSupported,
    #[error("no free device address")]
    NoAddress,
    #[error("invalid argument")]
    InvalidArg,
    #[error("endpoint busy")]
    EpBusy,
    #[error("endpoint in invalid state")]
    EpInvalidState,
    #[error("host controller halted")]
    HcHalted,
    #[error("operation not supported")]
    NotSupported,
    #[error("device disconnected")]
    Disconnected,
}

pub type Result<T, E = UsbError> = result::Result<T, E>;

impl From<common::dma::DmaError> for UsbError {
    fn from(_: common::dma::DmaError) -> Self {
        UsbError::Alloc
    }
}
