//! Logical endpoints: synchronous and asynchronous transfers on top of a host controller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};

use super::urb::{Callback, Completion, Urb, UrbPool, UrbState};
use crate::driver_interface::EndpDesc;
use crate::error::{Result, UsbError};
use crate::hcd::{EpInfo, HcEpHandle, HostController, IsoFrameResult, IsoRequest, Token, UrbOutcome, UrbRequest, UrbSink};
use crate::usb::setup::ReqDirection;
use crate::usb::Setup;

/// Work for the asynchronous completion worker.
pub enum AsyncEvent {
    /// The controller finished submission `seq`; collect it and run the callback.
    Done { ep: Weak<Endpoint>, seq: u64 },
    /// A request that ended without reaching the controller, or was cancelled.
    Deliver { callback: Callback, completion: Completion },
    Shutdown,
}

enum Wake {
    Done(u64),
    Aborted(u64),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Current {
    Embedded,
    /// The front of the extra queue.
    Extra,
}

struct EpState {
    urb: Urb,
    extra: VecDeque<Box<Urb>>,
    current: Option<Current>,
    next_seq: u64,
    closed: bool,
}

impl EpState {
    fn current_urb(&mut self) -> Option<&mut Urb> {
        match self.current? {
            Current::Embedded => Some(&mut self.urb),
            Current::Extra => self.extra.front_mut().map(|urb| &mut **urb),
        }
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Result of a synchronous transfer.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub actual: usize,
    pub data: Vec<u8>,
    pub iso_frames: Vec<IsoFrameResult>,
}

struct EpSink {
    ep: Mutex<Weak<Endpoint>>,
}

impl UrbSink for EpSink {
    fn urb_done(&self, seq: u64) {
        let ep = self.ep.lock().unwrap().upgrade();
        if let Some(ep) = ep {
            ep.on_done(seq);
        }
    }
}

pub struct Endpoint {
    hc: Arc<dyn HostController>,
    handle: HcEpHandle,
    info: Mutex<EpInfo>,
    desc: EndpDesc,
    /// Serializes synchronous requests.
    xfer_lock: Mutex<()>,
    state: Mutex<EpState>,
    wake_tx: Sender<Wake>,
    wake_rx: Receiver<Wake>,
    async_tx: Sender<AsyncEvent>,
    pool: Arc<UrbPool>,
    _sink: Arc<EpSink>,
}

impl Endpoint {
    pub(crate) fn open(
        hc: Arc<dyn HostController>,
        info: EpInfo,
        desc: EndpDesc,
        async_tx: Sender<AsyncEvent>,
        pool: Arc<UrbPool>,
    ) -> Result<Arc<Self>> {
        let sink = Arc::new(EpSink {
            ep: Mutex::new(Weak::new()),
        });
        let weak: Weak<dyn UrbSink> = Arc::downgrade(&sink) as Weak<dyn UrbSink>;
        let handle = hc.ep_open(&info, weak)?;
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);

        let ep = Arc::new(Self {
            hc,
            handle,
            info: Mutex::new(info),
            desc,
            xfer_lock: Mutex::new(()),
            state: Mutex::new(EpState {
                urb: Urb::default(),
                extra: VecDeque::new(),
                current: None,
                next_seq: 0,
                closed: false,
            }),
            wake_tx,
            wake_rx,
            async_tx,
            pool,
            _sink: Arc::clone(&sink),
        });
        *sink.ep.lock().unwrap() = Arc::downgrade(&ep);
        debug!(
            "opened endpoint {:#04x} of device {} ({:?})",
            info.ep_addr, info.dev_addr, info.ty
        );
        Ok(ep)
    }

    pub fn desc(&self) -> &EndpDesc {
        &self.desc
    }

    pub fn info(&self) -> EpInfo {
        *self.info.lock().unwrap()
    }

    pub fn address(&self) -> u8 {
        self.desc.address
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn is_halted(&self) -> bool {
        self.hc.ep_halted(self.handle)
    }

    /// Restart the data toggle and forget a halt; pairs with CLEAR_FEATURE(ENDPOINT_HALT).
    pub fn reset_toggle(&self) -> Result<()> {
        self.hc.ep_reset_toggle(self.handle)
    }

    pub(crate) fn update_address(&self, dev_addr: u8) -> Result<()> {
        self.hc.ep_update_addr(self.handle, dev_addr)?;
        self.info.lock().unwrap().dev_addr = dev_addr;
        Ok(())
    }

    pub(crate) fn update_max_packet(&self, max_packet_size: u16) -> Result<()> {
        self.hc.ep_update_mps(self.handle, max_packet_size)?;
        self.info.lock().unwrap().max_packet_size = max_packet_size;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn urb_history(&self) -> Vec<UrbState> {
        self.state.lock().unwrap().urb.history.clone()
    }

    #[cfg(test)]
    pub(crate) fn embedded_state(&self) -> UrbState {
        self.state.lock().unwrap().urb.state()
    }

    fn data_token(&self) -> Token {
        if self.info().is_in() {
            Token::In
        } else {
            Token::Out
        }
    }

    fn submit(&self, seq: u64, urb: &Urb, status_stage: bool) -> Result<()> {
        self.hc.urb_submit(
            self.handle,
            seq,
            UrbRequest {
                token: urb.token,
                data: &urb.buffer,
                len: urb.len,
                status_stage,
                iso: urb.iso.as_ref(),
            },
        )
    }

    /// Called from interrupt context once the controller retired submission `seq`.
    fn on_done(self: Arc<Self>, seq: u64) {
        let mut state = self.state.lock().unwrap();
        let sync = match state.current_urb() {
            Some(urb) if urb.seq == seq && urb.state() == UrbState::Scheduled => {
                if urb.set_state(UrbState::Queued).is_err() {
                    return;
                }
                urb.callback.is_none()
            }
            _ => {
                trace!("endpoint {:#04x}: stale completion {}", self.desc.address, seq);
                return;
            }
        };
        drop(state);

        if sync {
            let _ = self.wake_tx.try_send(Wake::Done(seq));
        } else if self
            .async_tx
            .send(AsyncEvent::Done {
                ep: Arc::downgrade(&self),
                seq,
            })
            .is_err()
        {
            warn!("endpoint {:#04x}: completion worker is gone", self.desc.address);
        }
    }

    fn apply(urb: &mut Urb, outcome: Result<UrbOutcome>) {
        match outcome {
            Ok(outcome) => {
                urb.actual = outcome.actual;
                urb.status = outcome.status;
                if urb.token == Token::In {
                    urb.buffer = outcome.data;
                }
                urb.iso_frames = outcome.iso_frames;
            }
            Err(err) => urb.status = Err(err),
        }
    }

    /// Hand the next queued asynchronous request to the controller.
    fn start_next(&self, state: &mut EpState) {
        while state.current.is_none() {
            let seq = state.seq();
            let submitted = match state.extra.front_mut() {
                Some(urb) => {
                    urb.seq = seq;
                    self.submit(seq, urb, false)
                }
                None => return,
            };
            match submitted {
                Ok(()) => {
                    if let Some(urb) = state.extra.front_mut() {
                        let _ = urb.set_state(UrbState::Scheduled);
                    }
                    state.current = Some(Current::Extra);
                }
                Err(err) => {
                    if let Some(mut urb) = state.extra.pop_front() {
                        urb.status = Err(err);
                        self.deliver(&mut urb);
                        self.pool.put(urb);
                    }
                }
            }
        }
    }

    fn deliver(&self, urb: &mut Urb) {
        let (callback, completion) = urb.finish(self.desc.address);
        if let Some(callback) = callback {
            if self
                .async_tx
                .send(AsyncEvent::Deliver {
                    callback,
                    completion,
                })
                .is_err()
            {
                warn!("endpoint {:#04x}: completion worker is gone", self.desc.address);
            }
        }
    }

    fn run_sync(
        &self,
        token: Token,
        buffer: Vec<u8>,
        len: usize,
        iso: Option<IsoRequest>,
        status_stage: bool,
        deadline: Instant,
    ) -> Result<SyncResult> {
        let seq = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(UsbError::EpInvalidState);
            }
            if state.current.is_some() {
                return Err(UsbError::EpBusy);
            }
            while self.wake_rx.try_recv().is_ok() {}
            state.urb.fill(token, buffer, len, iso, None)?;
            let seq = state.seq();
            state.urb.seq = seq;
            self.submit(seq, &state.urb, status_stage)?;
            state.urb.set_state(UrbState::Scheduled)?;
            state.current = Some(Current::Embedded);
            seq
        };

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.wake_rx.recv_timeout(left) {
                Ok(Wake::Done(done)) if done == seq => return self.harvest_sync(seq),
                Ok(Wake::Aborted(done)) if done == seq => return Err(UsbError::Aborted),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return self.sync_timeout(seq),
                Err(RecvTimeoutError::Disconnected) => return Err(UsbError::Aborted),
            }
        }
    }

    fn harvest_sync(&self, seq: u64) -> Result<SyncResult> {
        let mut state = self.state.lock().unwrap();
        if state.current != Some(Current::Embedded) || state.urb.seq != seq {
            return Err(UsbError::Aborted);
        }
        let outcome = self.hc.urb_complete(self.handle, seq);
        Self::apply(&mut state.urb, outcome);
        self.finish_sync(&mut state)
    }

    fn finish_sync(&self, state: &mut MutexGuard<'_, EpState>) -> Result<SyncResult> {
        state.urb.set_state(UrbState::None)?;
        state.current = None;
        let (_, completion) = state.urb.finish(self.desc.address);
        self.start_next(state);
        completion.status?;
        Ok(SyncResult {
            actual: completion.actual,
            data: completion.buffer,
            iso_frames: completion.iso_frames,
        })
    }

    fn sync_timeout(&self, seq: u64) -> Result<SyncResult> {
        let mut state = self.state.lock().unwrap();
        if state.current != Some(Current::Embedded) || state.urb.seq != seq {
            return Err(UsbError::Aborted);
        }
        match state.urb.state() {
            UrbState::Queued => {
                // Finished while the deadline ran out.
                while self.wake_rx.try_recv().is_ok() {}
                let outcome = self.hc.urb_complete(self.handle, seq);
                Self::apply(&mut state.urb, outcome);
                self.finish_sync(&mut state)
            }
            _ => {
                warn!(
                    "endpoint {:#04x} of device {}: transfer timed out",
                    self.desc.address,
                    self.info().dev_addr
                );
                state.urb.set_state(UrbState::Aborted)?;
                if let Err(err) = self.hc.urb_abort(self.handle, seq) {
                    warn!("endpoint {:#04x}: abort failed: {}", self.desc.address, err);
                }
                state.urb.status = Err(UsbError::Timeout);
                while self.wake_rx.try_recv().is_ok() {}
                self.finish_sync(&mut state)
            }
        }
    }

    fn sync_data(&self, token: Token, buffer: Vec<u8>, len: usize, iso: Option<IsoRequest>, timeout: Duration) -> Result<SyncResult> {
        let _guard = self.xfer_lock.lock().unwrap();
        self.run_sync(token, buffer, len, iso, false, Instant::now() + timeout)
    }

    /// Blocking IN transfer of up to `len` bytes.
    pub fn read(&self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        if self.data_token() != Token::In || self.desc.is_isoch() {
            return Err(UsbError::InvalidArg);
        }
        Ok(self.sync_data(Token::In, Vec::new(), len, None, timeout)?.data)
    }

    /// Blocking OUT transfer; returns the bytes sent.
    pub fn write(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        if self.data_token() != Token::Out || self.desc.is_isoch() {
            return Err(UsbError::InvalidArg);
        }
        Ok(self.sync_data(Token::Out, data.to_vec(), data.len(), None, timeout)?.actual)
    }

    /// Blocking isochronous transfer. `data` carries the OUT payload, or is empty for IN.
    pub fn transfer_iso(&self, data: Vec<u8>, iso: IsoRequest, timeout: Duration) -> Result<SyncResult> {
        if !self.desc.is_isoch() {
            return Err(UsbError::InvalidArg);
        }
        let len = iso.frame_lens.iter().map(|&l| usize::from(l)).sum();
        let token = self.data_token();
        if token == Token::Out && data.len() < len {
            return Err(UsbError::InvalidArg);
        }
        self.sync_data(token, data, len, Some(iso), timeout)
    }

    /// Run a complete control transfer on a control endpoint.
    ///
    /// `out` supplies the data stage of host-to-device requests and must hold `setup.length`
    /// bytes. Returns the data stage of device-to-host requests.
    pub fn control(&self, setup: Setup, out: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if !self.desc.is_control() {
            return Err(UsbError::InvalidArg);
        }
        let len = usize::from(setup.length);
        let dir_in = setup.direction() == ReqDirection::DeviceToHost;
        if !dir_in && out.len() < len {
            return Err(UsbError::InvalidArg);
        }

        let _guard = self.xfer_lock.lock().unwrap();
        let deadline = Instant::now() + timeout;
        self.run_sync(Token::Setup, setup.to_bytes().to_vec(), 8, None, false, deadline)?;
        let data = match (len, dir_in) {
            (0, _) => Vec::new(),
            (_, true) => self.run_sync(Token::In, Vec::new(), len, None, false, deadline)?.data,
            (_, false) => {
                self.run_sync(Token::Out, out[..len].to_vec(), len, None, false, deadline)?;
                Vec::new()
            }
        };
        let status = if dir_in && len > 0 { Token::Out } else { Token::In };
        self.run_sync(status, Vec::new(), 0, None, true, deadline)?;
        Ok(data)
    }

    fn submit_async(&self, token: Token, buffer: Vec<u8>, len: usize, iso: Option<IsoRequest>, callback: Callback) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(UsbError::EpInvalidState);
        }
        if state.current.is_none() && state.extra.is_empty() && state.urb.state() == UrbState::None {
            state.urb.fill(token, buffer, len, iso, Some(callback))?;
            let seq = state.seq();
            state.urb.seq = seq;
            if let Err(err) = self.submit(seq, &state.urb, false) {
                state.urb.callback = None;
                state.urb.buffer = Vec::new();
                return Err(err);
            }
            state.urb.set_state(UrbState::Scheduled)?;
            state.current = Some(Current::Embedded);
            return Ok(());
        }

        let mut urb = self.pool.get()?;
        urb.fill(token, buffer, len, iso, Some(callback))?;
        state.extra.push_back(urb);
        trace!(
            "endpoint {:#04x}: queued request behind {} others",
            self.desc.address,
            state.extra.len() - 1
        );
        self.start_next(&mut state);
        Ok(())
    }

    /// Queue an IN transfer; `callback` runs on the completion worker.
    pub fn read_async(&self, len: usize, callback: Callback) -> Result<()> {
        if self.data_token() != Token::In || self.desc.is_isoch() || self.desc.is_control() {
            return Err(UsbError::InvalidArg);
        }
        self.submit_async(Token::In, Vec::new(), len, None, callback)
    }

    /// Queue an OUT transfer; `callback` runs on the completion worker.
    pub fn write_async(&self, data: Vec<u8>, callback: Callback) -> Result<()> {
        if self.data_token() != Token::Out || self.desc.is_isoch() || self.desc.is_control() {
            return Err(UsbError::InvalidArg);
        }
        let len = data.len();
        self.submit_async(Token::Out, data, len, None, callback)
    }

    pub fn transfer_iso_async(&self, data: Vec<u8>, iso: IsoRequest, callback: Callback) -> Result<()> {
        if !self.desc.is_isoch() {
            return Err(UsbError::InvalidArg);
        }
        let len = iso.frame_lens.iter().map(|&l| usize::from(l)).sum();
        let token = self.data_token();
        if token == Token::Out && data.len() < len {
            return Err(UsbError::InvalidArg);
        }
        self.submit_async(token, data, len, Some(iso), callback)
    }

    /// Collect an asynchronous completion; runs on the completion worker.
    pub(crate) fn harvest_async(&self, seq: u64) {
        let mut state = self.state.lock().unwrap();
        let current = state.current;
        match state.current_urb() {
            Some(urb) if urb.seq == seq && urb.state() == UrbState::Queued => {
                let outcome = self.hc.urb_complete(self.handle, seq);
                Self::apply(urb, outcome);
                let _ = urb.set_state(UrbState::None);
            }
            _ => return,
        }

        let (callback, completion) = match current {
            Some(Current::Extra) => match state.extra.pop_front() {
                Some(mut urb) => {
                    let finished = urb.finish(self.desc.address);
                    self.pool.put(urb);
                    finished
                }
                None => return,
            },
            _ => state.urb.finish(self.desc.address),
        };
        state.current = None;
        self.start_next(&mut state);
        drop(state);

        if let Some(callback) = callback {
            callback(completion);
        }
    }

    /// Cancel everything outstanding; each asynchronous request gets one callback with `err`.
    fn abort_locked(&self, state: &mut EpState, err: UsbError) {
        if let Some(current) = state.current.take() {
            let mut extra = match current {
                Current::Extra => state.extra.pop_front(),
                Current::Embedded => None,
            };
            let urb = match extra.as_mut() {
                Some(urb) => &mut **urb,
                None => &mut state.urb,
            };
            let seq = urb.seq;
            if urb.state() == UrbState::Scheduled {
                let _ = urb.set_state(UrbState::Aborted);
            }
            if let Err(e) = self.hc.urb_abort(self.handle, seq) {
                warn!("endpoint {:#04x}: abort of {} failed: {}", self.desc.address, seq, e);
            }
            urb.status = Err(err);
            let _ = urb.set_state(UrbState::None);
            if urb.callback.is_none() {
                let _ = urb.finish(self.desc.address);
                let _ = self.wake_tx.try_send(Wake::Aborted(seq));
            } else {
                self.deliver(urb);
            }
            if let Some(urb) = extra {
                self.pool.put(urb);
            }
        }

        while let Some(mut urb) = state.extra.pop_front() {
            urb.status = Err(err);
            self.deliver(&mut urb);
            self.pool.put(urb);
        }
    }

    /// Cancel all outstanding requests; the endpoint stays open.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        self.abort_locked(&mut state, UsbError::Aborted);
    }

    /// Abort everything and release the controller's resources. Further requests fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.abort_locked(&mut state, UsbError::Aborted);
        drop(state);
        debug!("closing endpoint {:#04x} of device {}", self.desc.address, self.info().dev_addr);
        self.hc.ep_close(self.handle)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("endpoint {:#04x}: close failed: {}", self.desc.address, err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;

    use super::*;
    use crate::host::test_hcd::{Behavior, TestHc};
    use crate::usb::{EndpointTy, Speed};

    fn bulk(hc: &Arc<TestHc>, ep_addr: u8) -> (Arc<Endpoint>, Receiver<AsyncEvent>, Arc<UrbPool>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = Arc::new(UrbPool::new(4));
        let info = EpInfo {
            dev_addr: 1,
            speed: Speed::High,
            ep_addr,
            ty: EndpointTy::Bulk,
            max_packet_size: 512,
            interval: 0,
            tt: None,
        };
        let desc = EndpDesc {
            address: ep_addr,
            attributes: 2,
            max_packet_size: 512,
            interval: 0,
        };
        let hc_dyn: Arc<dyn HostController> = Arc::clone(hc) as Arc<dyn HostController>;
        let ep = Endpoint::open(hc_dyn, info, desc, tx, Arc::clone(&pool)).unwrap();
        (ep, rx, pool)
    }

    /// Run the completion worker's job inline.
    fn pump(rx: &Receiver<AsyncEvent>) -> bool {
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(AsyncEvent::Done { ep, seq }) => {
                if let Some(ep) = ep.upgrade() {
                    ep.harvest_async(seq);
                }
                true
            }
            Ok(AsyncEvent::Deliver { callback, completion }) => {
                callback(completion);
                true
            }
            _ => false,
        }
    }

    #[test]
    fn sync_read() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x81, Behavior::Data(vec![7; 100]));
        let (ep, _rx, _pool) = bulk(&hc, 0x81);
        let data = ep.read(512, Duration::from_secs(2)).unwrap();
        assert_eq!(data, vec![7; 100]);
        assert_eq!(
            ep.urb_history(),
            vec![UrbState::None, UrbState::Scheduled, UrbState::Queued, UrbState::None]
        );
    }

    #[test]
    fn sync_errors_surface() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x81, Behavior::Fail(UsbError::Stall));
        let (ep, _rx, _pool) = bulk(&hc, 0x81);
        assert_eq!(ep.read(64, Duration::from_secs(2)).unwrap_err(), UsbError::Stall);
        assert_eq!(ep.embedded_state(), UrbState::None);
        assert_eq!(ep.write(&[1], Duration::from_secs(1)).unwrap_err(), UsbError::InvalidArg);
    }

    #[test]
    fn timeout_aborts_and_frees_the_slot() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x81, Behavior::Never);
        let (ep, _rx, _pool) = bulk(&hc, 0x81);

        let started = Instant::now();
        assert_eq!(ep.read(64, Duration::from_millis(50)).unwrap_err(), UsbError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            ep.urb_history(),
            vec![UrbState::None, UrbState::Scheduled, UrbState::Aborted, UrbState::None]
        );
        assert_eq!(ep.embedded_state(), UrbState::None);
        assert_eq!(hc.aborted(), 1);

        hc.set_behavior(1, 0x81, Behavior::Data(vec![1, 2, 3]));
        assert_eq!(ep.read(64, Duration::from_secs(2)).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn async_requests_complete_in_order() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x02, Behavior::Accept);
        let (ep, rx, pool) = bulk(&hc, 0x02);
        let (done_tx, done_rx) = mpsc::channel();

        for i in 0..3u8 {
            let done_tx = done_tx.clone();
            ep.write_async(
                vec![i; 10 + usize::from(i)],
                Box::new(move |c: Completion| done_tx.send((i, c.actual, c.status)).unwrap()),
            )
            .unwrap();
        }
        // The first rides the embedded URB, the rest wait in the pool's URBs.
        assert_eq!(pool.available(), 2);

        let mut seen = Vec::new();
        while seen.len() < 3 && pump(&rx) {
            while let Ok(item) = done_rx.try_recv() {
                seen.push(item);
            }
        }
        assert_eq!(seen, vec![(0, 10, Ok(())), (1, 11, Ok(())), (2, 12, Ok(()))]);
        assert_eq!(pool.available(), 4);
        assert_eq!(hc.submitted_lens(1, 0x02), vec![10, 11, 12]);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x81, Behavior::Never);
        let (ep, _rx, _pool) = bulk(&hc, 0x81);
        for _ in 0..5 {
            ep.read_async(8, Box::new(|_| {})).unwrap();
        }
        assert_eq!(ep.read_async(8, Box::new(|_| {})).unwrap_err(), UsbError::Alloc);
        assert_eq!(ep.read(8, Duration::from_millis(10)).unwrap_err(), UsbError::EpBusy);
    }

    #[test]
    fn close_cancels_each_request_once() {
        let hc = TestHc::new(1);
        hc.set_behavior(1, 0x81, Behavior::Never);
        let (ep, rx, pool) = bulk(&hc, 0x81);
        let (done_tx, done_rx) = mpsc::channel();
        for i in 0..3 {
            let done_tx = done_tx.clone();
            ep.read_async(8, Box::new(move |c: Completion| done_tx.send((i, c.status)).unwrap()))
                .unwrap();
        }

        ep.close().unwrap();
        for _ in 0..3 {
            assert!(pump(&rx));
        }
        let mut seen: Vec<_> = done_rx.try_iter().collect();
        seen.sort_by_key(|(i, _)| *i);
        assert_eq!(
            seen,
            vec![(0, Err(UsbError::Aborted)), (1, Err(UsbError::Aborted)), (2, Err(UsbError::Aborted))]
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(pool.available(), 4);
        assert_eq!(ep.read_async(8, Box::new(|_| {})).unwrap_err(), UsbError::EpInvalidState);
        assert_eq!(hc.open_endpoints(), 0);
    }
}
