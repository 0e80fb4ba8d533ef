//! USB request blocks: one transfer request and its completion state.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::warn;

use crate::error::{Result, UsbError};
use crate::hcd::{IsoFrameResult, IsoRequest, Token};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UrbState {
    /// Free, or harvested.
    None,
    /// Handed to the host controller.
    Scheduled,
    /// The controller reported completion; the result has not been collected yet.
    Queued,
    /// Cancelled before the controller finished.
    Aborted,
}

/// What an asynchronous completion callback receives.
#[derive(Debug)]
pub struct Completion {
    pub ep_addr: u8,
    /// Received data for IN transfers, the submitted data for OUT transfers.
    pub buffer: Vec<u8>,
    pub requested: usize,
    pub actual: usize,
    pub status: Result<()>,
    pub iso_frames: Vec<IsoFrameResult>,
}

pub type Callback = Box<dyn FnOnce(Completion) + Send>;

pub struct Urb {
    pub token: Token,
    pub buffer: Vec<u8>,
    pub len: usize,
    pub actual: usize,
    pub iso: Option<IsoRequest>,
    pub iso_frames: Vec<IsoFrameResult>,
    pub status: Result<()>,
    pub callback: Option<Callback>,
    /// Submission the controller knows this request by.
    pub seq: u64,
    state: UrbState,
    #[cfg(test)]
    pub history: Vec<UrbState>,
}

impl Default for Urb {
    fn default() -> Self {
        Self {
            token: Token::In,
            buffer: Vec::new(),
            len: 0,
            actual: 0,
            iso: None,
            iso_frames: Vec::new(),
            status: Ok(()),
            callback: None,
            seq: 0,
            state: UrbState::None,
            #[cfg(test)]
            history: vec![UrbState::None],
        }
    }
}

impl Urb {
    pub fn state(&self) -> UrbState {
        self.state
    }

    /// Move along `NONE -> SCHEDULED -> QUEUED | ABORTED -> NONE`.
    pub fn set_state(&mut self, next: UrbState) -> Result<()> {
        use UrbState::*;
        let allowed = matches!(
            (self.state, next),
            (None, Scheduled) | (Scheduled, Queued) | (Scheduled, Aborted) | (Queued, None) | (Aborted, None)
        );
        if !allowed {
            warn!("URB {}: refusing {:?} -> {:?}", self.seq, self.state, next);
            return Err(UsbError::EpInvalidState);
        }
        self.state = next;
        #[cfg(test)]
        self.history.push(next);
        Ok(())
    }

    /// Load a new request into an idle URB.
    pub fn fill(
        &mut self,
        token: Token,
        buffer: Vec<u8>,
        len: usize,
        iso: Option<IsoRequest>,
        callback: Option<Callback>,
    ) -> Result<()> {
        if self.state != UrbState::None {
            return Err(UsbError::EpBusy);
        }
        self.token = token;
        self.buffer = buffer;
        self.len = len;
        self.actual = 0;
        self.iso = iso;
        self.iso_frames.clear();
        self.status = Ok(());
        self.callback = callback;
        #[cfg(test)]
        {
            self.history = vec![UrbState::None];
        }
        Ok(())
    }

    /// Take the result out, leaving the URB idle.
    pub fn finish(&mut self, ep_addr: u8) -> (Option<Callback>, Completion) {
        let completion = Completion {
            ep_addr,
            buffer: std::mem::take(&mut self.buffer),
            requested: self.len,
            actual: self.actual,
            status: self.status,
            iso_frames: std::mem::take(&mut self.iso_frames),
        };
        (self.callback.take(), completion)
    }
}

/// Extra URBs shared by every endpoint of a host, for asynchronous requests beyond the first.
pub struct UrbPool {
    free: Mutex<VecDeque<Box<Urb>>>,
    capacity: usize,
}

impl UrbPool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Box::new(Urb::default())).collect();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn get(&self) -> Result<Box<Urb>> {
        self.free.lock().unwrap().pop_front().ok_or_else(|| {
            warn!("URB pool exhausted");
            UsbError::Alloc
        })
    }

    pub fn put(&self, mut urb: Box<Urb>) {
        *urb = Urb::default();
        self.free.lock().unwrap().push_back(urb);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_machine() {
        let mut urb = Urb::default();
        urb.fill(Token::In, Vec::new(), 8, None, None).unwrap();
        assert!(urb.set_state(UrbState::Queued).is_err());
        urb.set_state(UrbState::Scheduled).unwrap();
        assert_eq!(urb.fill(Token::In, Vec::new(), 8, None, None), Err(UsbError::EpBusy));
        urb.set_state(UrbState::Aborted).unwrap();
        assert!(urb.set_state(UrbState::Queued).is_err());
        urb.set_state(UrbState::None).unwrap();
        assert_eq!(
            urb.history,
            vec![UrbState::None, UrbState::Scheduled, UrbState::Aborted, UrbState::None]
        );
    }

    #[test]
    fn pool_runs_dry() {
        let pool = UrbPool::new(2);
        let a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        assert_eq!(pool.get().err(), Some(UsbError::Alloc));
        pool.put(a);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.capacity(), 2);
    }
}
