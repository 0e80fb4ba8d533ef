//! The Enhanced Host Controller Interface (EHCI) daemon.
//!
//! Usage: `ehcid <register base> [config.toml]`
//!
//! The register window of the controller must already be mapped at `register base` (hex), with
//! physical and virtual addresses matching below 4 GiB. The controller is driven in polling mode;
//! hubs and devices found on its root ports are enumerated and handed to the class drivers named
//! in the configuration.

use std::env;
use std::fs;
use std::sync::Arc;
use std::thread;

use common::dma::{BusTranslate, CacheOps, Coherent, IdentityBus};
use ehcid::ehci::{Ehci, InterruptMethod, MmioRegs};
use ehcid::hcd::HostController;
use ehcid::{Host, StackConfig};

fn parse_base(arg: &str) -> usize {
    let digits = arg.trim_start_matches("0x").trim_start_matches("0X");
    usize::from_str_radix(digits, 16).expect("ehcid: register base must be a hex address")
}

fn load_config(path: Option<String>) -> StackConfig {
    match path {
        Some(path) => {
            let text = fs::read_to_string(&path).expect("ehcid: failed to read config file");
            StackConfig::from_toml_str(&text).expect("ehcid: failed to parse config file")
        }
        None => ehcid::config::DEFAULT_CONFIG.clone(),
    }
}

fn main() {
    let mut args = env::args().skip(1);
    let base = parse_base(&args.next().expect("ehcid: no register base given"));
    let cfg = load_config(args.next());

    let name = format!("ehci_{:x}", base);
    common::setup_logging(
        "usb",
        "host",
        &name,
        common::output_level(),
        common::file_level(),
    );

    // SAFETY: the caller hands us an exclusively owned, permanently mapped register window.
    let regs = unsafe { MmioRegs::new(base) };
    let translate: Arc<dyn BusTranslate> = Arc::new(IdentityBus);
    let cache: Arc<dyn CacheOps> = Arc::new(Coherent);
    let hc = Arc::new(
        Ehci::new(name.clone(), regs, &cfg, translate, cache).expect("ehcid: failed to set up controller"),
    );
    hc.start_irq_reactor(InterruptMethod::Polling);

    let host = Host::new(cfg);
    let index = host
        .add_controller(Arc::clone(&hc) as Arc<dyn HostController>)
        .expect("ehcid: failed to start controller");
    log::info!("{}: controller {} up with {} root ports", name, index, hc.rh_port_count());

    loop {
        thread::park();
    }
}
