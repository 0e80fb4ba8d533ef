//! Shared plumbing for the USB host drivers: register access, DMA memory and logging.

pub mod dma;
pub mod io;
pub mod logger;
pub mod pool;
pub mod timeout;

pub use logger::{file_level, output_level, setup_logging};
