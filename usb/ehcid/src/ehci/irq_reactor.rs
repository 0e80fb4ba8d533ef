use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

use common::io::Io;
use log::{debug, error, trace, warn};

use super::operational::{EhciRegs, UsbSts};
use super::{Ehci, EhciInner};
use crate::hcd::{HcEpHandle, UrbSink};

/// How the completion path gets driven.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptMethod {
    /// A reactor thread calls [`Ehci::handle_irq`] every poll interval.
    Polling,
    /// The integrator calls [`Ehci::handle_irq`] from its interrupt path.
    Irq,
}

type Notification = (Weak<dyn UrbSink>, u64);

impl<R: EhciRegs> EhciInner<R> {
    /// Endpoints whose queue heads hang below the interrupt tree.
    fn interrupt_endpoints(&self) -> Vec<HcEpHandle> {
        let mut handles = Vec::new();
        for (node, &users) in self.tree_users.iter().enumerate() {
            if users == 0 {
                continue;
            }
            let mut link = self.mem.read(self.tree[node], |q| q.horiz.read());
            while let Some(qh) = self.mem.block_at::<super::desc::QueueHead>(link) {
                match self.qh_owner[qh.index()] {
                    Some(handle) => handles.push(handle),
                    // Reached the parent placeholder.
                    None => break,
                }
                link = self.mem.read(qh, |q| q.horiz.read());
            }
        }
        handles
    }

    fn notification(&self, handle: HcEpHandle, seq: u64) -> Option<Notification> {
        self.endpoint(handle).ok().map(|ep| (Weak::clone(&ep.sink), seq))
    }

    fn scan(&mut self, transfers: bool, done: &mut Vec<Notification>) {
        if transfers {
            for qh in self.async_ring() {
                let handle = match self.qh_owner[qh.index()] {
                    Some(handle) => handle,
                    None => continue,
                };
                // A queue head that never fetched a qTD has nothing to reclaim.
                if self.mem.read(qh, |q| q.current.read()) == 0 {
                    continue;
                }
                if let Some(seq) = self.reap_qtds(handle) {
                    done.extend(self.notification(handle, seq));
                }
            }
            for handle in self.interrupt_endpoints() {
                if let Some(seq) = self.reap_qtds(handle) {
                    done.extend(self.notification(handle, seq));
                }
            }
        }

        // Isochronous descriptors can also expire without raising anything.
        for handle in self.isoch.clone() {
            if let Some(seq) = self.reap_isoch(handle) {
                done.extend(self.notification(handle, seq));
            }
        }
        self.reap_retired();
    }
}

impl<R: EhciRegs> Ehci<R> {
    /// Service the controller: acknowledge status, retire finished transfers and notify their
    /// sinks, and forward root port changes. Returns whether anything was pending.
    pub fn handle_irq(&self) -> bool {
        let mut done = Vec::new();
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let pending = inner.regs.sts() & UsbSts::ACK_MASK;
            if !pending.is_empty() {
                inner.regs.ack(pending);
                trace!("{}: status {:?}", self.name, pending);
            }

            if pending.contains(UsbSts::FLR) {
                self.rollovers.fetch_add(1, Ordering::Relaxed);
            }
            if pending.contains(UsbSts::HSE) {
                error!("{}: host system error, controller halted", self.name);
                self.halted.store(true, Ordering::Relaxed);
                inner.running = false;
                return true;
            }

            if inner.running {
                inner.scan(pending.intersects(UsbSts::USBINT | UsbSts::USBERRINT), &mut done);
            }
            pending
        };

        for (sink, seq) in done {
            match sink.upgrade() {
                Some(sink) => sink.urb_done(seq),
                None => debug!("{}: completion {} has no listener", self.name, seq),
            }
        }

        if pending.contains(UsbSts::PCD) {
            let sink = self.port_sink.lock().unwrap().clone();
            match sink.and_then(|sink| sink.upgrade()) {
                Some(sink) => sink.port_changed(),
                None => warn!("{}: port change without a listener", self.name),
            }
        }
        !pending.is_empty()
    }
}

impl<R: EhciRegs + 'static> Ehci<R> {
    /// Spawn the polling reactor. It holds only a weak reference and exits with the controller.
    pub fn start_irq_reactor(self: &Arc<Self>, method: InterruptMethod) {
        if method == InterruptMethod::Irq {
            return;
        }
        let hc = Arc::downgrade(self);
        let stop = Arc::clone(&self.reactor_stop);
        let interval = self.inner.lock().unwrap().cfg.poll_interval;
        stop.store(false, Ordering::SeqCst);
        let handle = thread::spawn(move || {
            debug!("Running IRQ reactor in polling mode.");
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                match hc.upgrade() {
                    Some(hc) => {
                        hc.handle_irq();
                    }
                    None => break,
                }
            }
        });
        *self.irq_reactor.lock().unwrap() = Some(handle);
    }
}

impl<R> Ehci<R> {
    pub(crate) fn stop_irq_reactor(&self) {
        self.reactor_stop.store(true, Ordering::SeqCst);
        let handle = self.irq_reactor.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("IRQ reactor thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::ehci::operational::{PortSc, UsbSts};
    use crate::ehci::sim;
    use crate::hcd::{HostController, PortChangeSink};
    use crate::usb::Speed;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl PortChangeSink for Counter {
        fn port_changed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rollover_and_port_change() {
        let (hc, state) = sim::controller(2);
        hc.start().unwrap();
        let counter = Arc::new(Counter::default());
        let weak = Arc::downgrade(&counter);
        hc.rh_set_change_sink(weak);

        assert!(!hc.handle_irq());
        sim::raise(&hc, UsbSts::FLR);
        assert!(hc.handle_irq());
        assert_eq!(hc.frame_rollovers(), 1);
        // Acknowledged.
        assert!(!hc.handle_irq());

        state.lock().unwrap().connect(0, Speed::High);
        hc.handle_irq();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(state.lock().unwrap().ports[0] & PortSc::CSC.bits() != 0);
    }

    #[test]
    fn system_error_halts() {
        let (hc, _state) = sim::controller(1);
        hc.start().unwrap();
        sim::raise(&hc, UsbSts::HSE);
        hc.handle_irq();
        assert!(hc.is_halted());
        assert_eq!(
            hc.urb_submit(
                crate::hcd::HcEpHandle(0),
                1,
                crate::hcd::UrbRequest {
                    token: crate::hcd::Token::In,
                    data: &[],
                    len: 0,
                    status_stage: false,
                    iso: None
                }
            )
            .unwrap_err(),
            crate::error::UsbError::HcHalted
        );
    }
}
