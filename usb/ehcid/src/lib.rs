//! A USB 2.0 host stack: an EHCI host controller driver and the controller independent core
//! (endpoints, URBs, hubs, enumeration and class driver matching) on top of it.
//!
//! The two halves meet at [`hcd::HostController`]. A [`host::Host`] drives any number of
//! controllers; every controller gets its own root hub and device address space.

pub mod config;
pub mod driver_interface;
pub mod ehci;
pub mod error;
pub mod hcd;
pub mod host;
pub mod usb;

pub use crate::config::StackConfig;
pub use crate::error::{Result, UsbError};
pub use crate::host::Host;
