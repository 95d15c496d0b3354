use parking_lot::{ Condvar, Mutex };
use std::{
    fmt::Debug,
    sync::atomic::{ AtomicU8, Ordering },
    time::{ Duration, Instant }
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Pending = 0,
    Ready = 1,
    Failed = 2
}

impl InitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Failed,
            _ => Self::Pending
        }
    }
    pub fn is_settled(self) -> bool { self != Self::Pending }
}

/// One-way readiness barrier for a single object.
///
/// Lets the thread that created an object run its initialization without
/// holding any shared lock, while later lookups of the same object park here
/// until it settles. The first `signal_*` call wins; later ones are no-ops.
pub struct DeferredInitGate {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar
}

impl DeferredInitGate {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(InitState::Pending as u8),
            lock: Mutex::new(()),
            cond: Condvar::new()
        }
    }

    pub fn state(&self) -> InitState { InitState::from_u8(self.state.load(Ordering::Acquire)) }
    pub fn is_ready(&self) -> bool { self.state() == InitState::Ready }

    pub fn signal_ready(&self) -> bool { self.settle(InitState::Ready) }
    pub fn signal_failed(&self) -> bool { self.settle(InitState::Failed) }

    fn settle(&self, to: InitState) -> bool {
        // The store happens under the lock so a waiter can't check the state,
        // miss the notify, and then park forever.
        let _guard = self.lock.lock();
        let won = self.state.compare_exchange(
            InitState::Pending as u8, to as u8, Ordering::Release, Ordering::Relaxed).is_ok();
        if won { self.cond.notify_all(); }
        won
    }

    /// Blocks until the gate settles and returns the final state.
    pub fn wait(&self) -> InitState {
        let state = self.state();
        if state.is_settled() { return state }
        let mut guard = self.lock.lock();
        loop {
            let state = self.state();
            if state.is_settled() { return state }
            self.cond.wait(&mut guard);
        }
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`. `None` means the
    /// gate was still pending when time ran out.
    pub fn wait_for(&self, timeout: Duration) -> Option<InitState> {
        let state = self.state();
        if state.is_settled() { return Some(state) }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            let state = self.state();
            if state.is_settled() { return Some(state) }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                let state = self.state();
                return if state.is_settled() { Some(state) } else { None }
            }
        }
    }
}

impl Default for DeferredInitGate {
    fn default() -> Self { Self::new() }
}

impl Debug for DeferredInitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeferredInitGate {{ state: {:?} }}", self.state())
    }
}
