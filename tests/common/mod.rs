#![allow(dead_code)]
use allocator_api2::alloc::{ AllocError, Allocator, Global };
use std::{
    alloc::Layout,
    ptr::NonNull,
    sync::{
        atomic::{ AtomicBool, AtomicUsize, Ordering },
        Arc
    }
};

pub type TestReturn = Result<(), Box<dyn std::error::Error>>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
pub struct AllocStats {
    allocs: AtomicUsize,
    frees: AtomicUsize
}

/// Forwards to `Global` and counts every call, so tests can check that each
/// allocation is returned exactly once.
#[derive(Clone, Default)]
pub struct CountingAlloc(Arc<AllocStats>);

impl CountingAlloc {
    pub fn allocs(&self) -> usize { self.0.allocs.load(Ordering::SeqCst) }
    pub fn frees(&self) -> usize { self.0.frees.load(Ordering::SeqCst) }
    pub fn outstanding(&self) -> usize { self.allocs() - self.frees() }
}

unsafe impl Allocator for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.0.allocs.fetch_add(1, Ordering::SeqCst);
        Global.allocate(layout)
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.frees.fetch_add(1, Ordering::SeqCst);
        unsafe { Global.deallocate(ptr, layout) }
    }
}

/// Refuses every allocation while closed.
#[derive(Clone)]
pub struct GatedAlloc(Arc<AtomicBool>);

impl GatedAlloc {
    pub fn closed() -> Self { Self(Arc::new(AtomicBool::new(false))) }
    pub fn open(&self) { self.0.store(true, Ordering::SeqCst) }
}

unsafe impl Allocator for GatedAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if !self.0.load(Ordering::SeqCst) { return Err(AllocError) }
        Global.allocate(layout)
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { Global.deallocate(ptr, layout) }
    }
}
