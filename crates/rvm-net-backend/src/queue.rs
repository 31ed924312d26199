use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::{PollEvents, Tap, TapError};

const DEFAULT_TX_CAPACITY: usize = 64;

struct QueueState {
    /// Host → guest frames, delivered by `recv`.
    rx: VecDeque<Vec<u8>>,
    /// Guest → host frames, produced by `send`.
    tx: VecDeque<Vec<u8>>,
    tx_capacity: usize,
    mac: [u8; 6],
    link_up: bool,
    /// Sticky wake, consumed by the next poll.
    woken: bool,
}

/// In-memory tap backed by a pair of frame queues.
///
/// The portable fallback when no kernel TAP is available, and the harness
/// for integration tests: the "host" side injects frames with
/// [`HostQueueTap::push_rx`] and drains transmissions with
/// [`HostQueueTap::pop_tx`].
pub struct HostQueueTap {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl Default for HostQueueTap {
    fn default() -> Self {
        Self::new()
    }
}

impl HostQueueTap {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                rx: VecDeque::new(),
                tx: VecDeque::new(),
                tx_capacity: DEFAULT_TX_CAPACITY,
                mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
                link_up: true,
                woken: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Host side: queue a frame for the guest to receive.
    pub fn push_rx(&self, frame: Vec<u8>) {
        self.state.lock().unwrap().rx.push_back(frame);
        self.cond.notify_all();
    }

    /// Host side: take the next transmitted frame, if any.
    pub fn pop_tx(&self) -> Option<Vec<u8>> {
        let frame = self.state.lock().unwrap().tx.pop_front();
        if frame.is_some() {
            self.cond.notify_all();
        }
        frame
    }

    pub fn set_link_up(&self, up: bool) {
        self.state.lock().unwrap().link_up = up;
    }

    fn readiness(state: &QueueState, interest: PollEvents) -> PollEvents {
        let mut ready = PollEvents::empty();
        if interest.contains(PollEvents::IN) && !state.rx.is_empty() {
            ready |= PollEvents::IN;
        }
        if interest.contains(PollEvents::OUT) && state.tx.len() < state.tx_capacity {
            ready |= PollEvents::OUT;
        }
        ready
    }
}

impl Tap for HostQueueTap {
    fn poll(&self, interest: PollEvents, timeout: Option<Duration>) -> Result<PollEvents, TapError> {
        let mut state = self.state.lock().unwrap();
        loop {
            let ready = Self::readiness(&state, interest);
            if state.woken {
                state.woken = false;
                return Ok(ready);
            }
            if !ready.is_empty() {
                return Ok(ready);
            }
            match timeout {
                None => state = self.cond.wait(state).unwrap(),
                Some(dur) => {
                    let (guard, res) = self.cond.wait_timeout(state, dur).unwrap();
                    state = guard;
                    if res.timed_out() {
                        return Ok(Self::readiness(&state, interest));
                    }
                }
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, TapError> {
        let mut state = self.state.lock().unwrap();
        let frame = state.rx.pop_front().ok_or(TapError::WouldBlock)?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, TapError> {
        let mut state = self.state.lock().unwrap();
        if state.tx.len() >= state.tx_capacity {
            return Err(TapError::WouldBlock);
        }
        state.tx.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn wake(&self) {
        self.state.lock().unwrap().woken = true;
        self.cond.notify_all();
    }

    fn mac(&self) -> [u8; 6] {
        self.state.lock().unwrap().mac
    }

    fn set_mac(&self, mac: [u8; 6]) {
        self.state.lock().unwrap().mac = mac;
    }

    fn link_up(&self) -> bool {
        self.state.lock().unwrap().link_up
    }
}
