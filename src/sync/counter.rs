use std::{
    fmt::Debug,
    process::abort,
    sync::atomic::{
        self,
        AtomicUsize,
        Ordering
    }
};

// Same ceiling std::sync::Arc uses: leaked handles can push the count up, but
// not far enough to wrap around before we notice.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Strong reference count with the usual shared-ownership ordering contract:
///
/// - increments are relaxed and only legal while the caller already owns a
///   reference ([`acquire`](Self::acquire)),
/// - increments from an unowned position go through a CAS loop that refuses
///   to leave zero ([`try_acquire_unless_zero`](Self::try_acquire_unless_zero)),
/// - decrements release, and the decrement that reaches zero is followed by an
///   acquire fence so the destroying thread sees every other owner's writes.
///
/// The counter never destroys anything itself. [`release`](Self::release)
/// reports whether the caller dropped the last reference, and that caller runs
/// destruction exactly once.
#[repr(transparent)]
pub struct AtomicRefCounter {
    count: AtomicUsize
}

impl AtomicRefCounter {
    /// Relaxed initialization. The owning object is not visible to other
    /// threads yet; publication happens through whatever hands out the
    /// pointer (a lock, or [`Published`](crate::sync::publish::Published)).
    pub const fn new(initial: usize) -> Self {
        Self { count: AtomicUsize::new(initial) }
    }

    pub fn acquire(&self) {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old != 0, "acquire() on a counter that already reached zero");
        if old > MAX_REFCOUNT { abort() }
    }

    /// Takes a reference only if the count is still non-zero. Use this whenever
    /// the pointer was found through a shared table rather than an owned handle.
    pub fn try_acquire_unless_zero(&self) -> bool {
        // A stale zero is permanent, so a relaxed first read is fine; any other
        // value is confirmed by the CAS.
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 { return false }
            if cur > MAX_REFCOUNT { abort() }
            match self.count.compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(seen) => cur = seen
            }
        }
    }

    /// Drops one reference. Returns `true` if it was the last one, in which
    /// case the caller owns destruction.
    pub fn release(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(old != 0, "release() on a counter that already reached zero");
        if old != 1 { return false }
        atomic::fence(Ordering::Acquire);
        true
    }

    /// Snapshot for diagnostics. Stale as soon as it returns.
    pub fn count(&self) -> usize { self.count.load(Ordering::Acquire) }
}

impl Debug for AtomicRefCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AtomicRefCounter({})", self.count())
    }
}
