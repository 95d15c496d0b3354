// Like Option<T>, but filled at most once and readable from other threads
// without a lock. Replaces "store the pointer, spin until it shows up".

use std::{
    cell::UnsafeCell,
    fmt::Debug,
    mem::MaybeUninit,
    sync::atomic::{ AtomicU8, Ordering }
};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const PUBLISHED: u8 = 2;

pub struct Published<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8
}

unsafe impl<T: Send> Send for Published<T> {}
unsafe impl<T: Send + Sync> Sync for Published<T> {}

impl<T> Published<T> {
    pub const fn new() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(EMPTY)
        }
    }

    /// Stores `value` and makes it visible to every later [`observe`](Self::observe).
    /// Only the first call succeeds; the rest get their value handed back.
    pub fn publish(&self, value: T) -> Result<(), T> {
        if self.state.compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed).is_err() {
            return Err(value)
        }
        // WRITING excludes every other writer and every reader
        unsafe { (*self.value.get()).write(value); }
        self.state.store(PUBLISHED, Ordering::Release);
        Ok(())
    }

    pub fn observe(&self) -> Option<&T> {
        match self.state.load(Ordering::Acquire) {
            PUBLISHED => Some(unsafe { (*self.value.get()).assume_init_ref() }),
            _ => None
        }
    }

    pub fn is_published(&self) -> bool { self.state.load(Ordering::Acquire) == PUBLISHED }
}

impl<T> Default for Published<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Drop for Published<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == PUBLISHED {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

impl<T> Debug for Published<T>
where T: Debug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.observe() {
            Some(v) => write!(f, "Published({:?})", v),
            None => write!(f, "Unpublished"),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::Published;
    use std::{
        error::Error,
        sync::{
            atomic::{ AtomicUsize, Ordering },
            Arc
        },
        thread
    };
    type TestReturn = Result<(), Box<dyn Error>>;

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) { self.0.fetch_add(1, Ordering::Relaxed); }
    }

    #[test]
    fn publish_once() -> TestReturn {
        let slot = Published::new();
        assert!(slot.observe().is_none(), "Empty slot should observe None");
        assert!(slot.publish(10).is_ok(), "First publish should succeed");
        assert!(slot.publish(20) == Err(20), "Second publish should hand the value back");
        assert!(slot.observe() == Some(&10), "Slot should hold the first published value");
        Ok(())
    }

    #[test]
    fn drops_published_value() -> TestReturn {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let slot = Published::new();
            assert!(slot.publish(DropCount(drops.clone())).is_ok(), "Publish should succeed");
        }
        assert!(drops.load(Ordering::Relaxed) == 1, "Published value should drop with the slot");
        let empty: Published<DropCount> = Published::new();
        drop(empty);
        assert!(drops.load(Ordering::Relaxed) == 1, "Empty slot must not drop anything");
        Ok(())
    }

    #[test]
    fn debug_shows_state() -> TestReturn {
        let slot = Published::new();
        assert!(format!("{:?}", slot) == "Unpublished", "Empty slot should format as Unpublished");
        assert!(slot.publish(String::from("Player")).is_ok(), "Publish should succeed");
        assert!(slot.is_published(), "Slot should report published");
        assert!(format!("{:?}", slot) == "Published(\"Player\")", "Got {:?}", slot);
        Ok(())
    }

    #[test]
    fn observed_from_other_thread() -> TestReturn {
        let slot: Published<Vec<u32>> = Published::new();
        thread::scope(|s| {
            let reader = s.spawn(|| {
                loop {
                    if let Some(v) = slot.observe() { return v.clone() }
                    thread::yield_now();
                }
            });
            assert!(slot.publish(vec![1u32, 2, 3]).is_ok(), "Publish should succeed");
            let seen = reader.join().unwrap();
            assert!(seen == vec![1, 2, 3], "Reader should see the full value, got {:?}", seen);
        });
        Ok(())
    }
}
