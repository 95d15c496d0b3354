use allocator_api2::{
    alloc::{ Allocator, Global },
    boxed::Box as ABox
};
use crate::{
    error::{ Error, Result },
    sync::counter::AtomicRefCounter
};
use std::{
    alloc::{ handle_alloc_error, Layout },
    fmt::{ Debug, Display },
    marker::PhantomData,
    ops::Deref,
    ptr::{ self, NonNull },
    sync::atomic::{ AtomicPtr, Ordering }
};

// std::_Ref_count_base, except that the payload always lives in its own
// allocation so it can be destroyed while weak handles keep the block alive.
//
// Every strong handle also owns one weak count, so weaks >= uses holds and the
// block can't disappear underneath a strong handle that is still releasing.
pub struct ControlBlock<T, A = Global>
where A: Allocator + Clone
{
    uses: AtomicRefCounter,
    weaks: AtomicRefCounter,
    payload: AtomicPtr<T>,
    _allocator: A
}

impl<T, A> ControlBlock<T, A>
where A: Allocator + Clone
{
    fn get_layout() -> Layout { Layout::new::<Self>() }

    fn try_new_in(payload: NonNull<T>, alloc: A) -> Result<NonNull<Self>> {
        let layout = Self::get_layout();
        let out = alloc.allocate(layout).map_err(|_| Error::alloc_failure(layout))?.cast::<Self>();
        unsafe {
            ptr::write(out.as_ptr(), Self {
                uses: AtomicRefCounter::new(1),
                weaks: AtomicRefCounter::new(1),
                payload: AtomicPtr::new(payload.as_ptr()),
                _allocator: alloc
            });
        }
        log::trace!("shared_ptr: control block {:p} created", out);
        Ok(out)
    }

    fn add_strong_ref(&self) {
        self.uses.acquire();
        self.weaks.acquire();
    }

    fn add_weak_ref(&self) { self.weaks.acquire() }

    fn try_add_strong_ref(&self) -> bool {
        if !self.uses.try_acquire_unless_zero() { return false }
        // we now hold a strong ref, so weaks is at least 1 and can't hit zero
        self.weaks.acquire();
        true
    }

    // Only meaningful while the caller holds a strong reference.
    fn payload(&self) -> *mut T { self.payload.load(Ordering::Relaxed) }

    unsafe fn release_strong_ref(this: NonNull<Self>) {
        let rep = unsafe { this.as_ref() };
        if rep.uses.release() {
            let payload = rep.payload.swap(ptr::null_mut(), Ordering::Relaxed);
            if !payload.is_null() {
                drop(unsafe { ABox::from_raw_in(payload, rep._allocator.clone()) });
            }
        }
        unsafe { Self::release_weak_ref(this) }
    }

    unsafe fn release_weak_ref(this: NonNull<Self>) {
        if !unsafe { this.as_ref() }.weaks.release() { return }
        let alloc = unsafe { this.as_ref() }._allocator.clone();
        unsafe {
            ptr::drop_in_place(this.as_ptr());
            alloc.deallocate(this.cast(), Self::get_layout());
        }
        log::trace!("shared_ptr: control block {:p} freed", this);
    }
}

// std::shared_ptr
pub struct SharedPtr<T, A = Global>
where A: Allocator + Clone
{
    _ptr: *mut T,
    _rep: Option<NonNull<ControlBlock<T, A>>>,
    _data: PhantomData<T>
}

unsafe impl<T: Send + Sync, A: Allocator + Clone + Send + Sync> Send for SharedPtr<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Clone + Send + Sync> Sync for SharedPtr<T, A> {}

impl<T> SharedPtr<T, Global> {
    /// Construct an object of type T and wrap it in a SharedPtr to act as a reference counting
    /// smart pointer.
    pub fn new(data: T) -> Self { Self::new_in(data, Global) }
}

impl<T, A> SharedPtr<T, A>
where A: Allocator + Clone
{
    /// Handle that owns nothing. Same as `SharedPtr::default()`.
    pub const fn empty() -> Self {
        Self { _ptr: ptr::null_mut(), _rep: None, _data: PhantomData }
    }

    pub fn new_in(data: T, alloc: A) -> Self {
        match Self::try_new_in(data, alloc) {
            Ok(v) => v,
            Err(_) => handle_alloc_error(Layout::new::<ControlBlock<T, A>>())
        }
    }

    pub fn try_new_in(data: T, alloc: A) -> Result<Self> {
        let payload = ABox::try_new_in(data, alloc.clone())
            .map_err(|_| Error::alloc_failure(Layout::new::<T>()))?;
        Self::from_box(payload)
    }

    /// Take ownership of an already boxed payload. Only the control block is
    /// allocated here; if that fails, the payload is dropped.
    pub fn from_box(payload: ABox<T, A>) -> Result<Self> {
        let (raw, alloc) = ABox::into_raw_with_allocator(payload);
        unsafe { Self::from_raw_in(raw, alloc) }
    }

    /// # Safety
    /// `raw` must come from an allocator box (see [`from_box`](Self::from_box))
    /// allocated in `alloc`, and nothing else may own it.
    pub unsafe fn from_raw_in(raw: *mut T, alloc: A) -> Result<Self> {
        let payload = unsafe { NonNull::new_unchecked(raw) };
        match ControlBlock::try_new_in(payload, alloc.clone()) {
            Ok(rep) => Ok(Self { _ptr: raw, _rep: Some(rep), _data: PhantomData }),
            Err(e) => {
                drop(unsafe { ABox::from_raw_in(raw, alloc) });
                Err(e)
            }
        }
    }

    fn get_rep(&self) -> Option<&ControlBlock<T, A>> {
        self._rep.map(|r| unsafe { &*r.as_ptr() })
    }

    pub fn get(&self) -> Option<&T> {
        match self._ptr.is_null() {
            true => None,
            false => Some(unsafe { &*self._ptr })
        }
    }
    pub fn get_ptr(&self) -> *const T { self._ptr }

    pub fn is_valid(&self) -> bool { self._rep.is_some() }

    /// Drop this handle's reference and leave it empty.
    pub fn reset(&mut self) { *self = Self::empty(); }

    pub fn strong_count(&self) -> usize { self.get_rep().map_or(0, |r| r.uses.count()) }
    pub fn weak_count(&self) -> usize { self.get_rep().map_or(0, |r| r.weaks.count()) }

    pub fn unique(&self) -> bool { self.strong_count() == 1 }

    pub fn ptr_eq(&self, other: &Self) -> bool { self._rep == other._rep }

    pub fn downgrade(&self) -> WeakPtr<T, A> {
        if let Some(rep) = self.get_rep() { rep.add_weak_ref(); }
        WeakPtr { _rep: self._rep, _data: PhantomData }
    }
}

impl<T, A> SharedPtr<T, A>
where A: Allocator + Clone
{
    pub fn _debug_get_ptr(&self) -> *const u8 { self._ptr as *const u8 }
    pub fn _debug_get_rep(&self) -> *const u8 {
        self._rep.map_or(ptr::null(), |r| r.as_ptr() as *const u8)
    }
}

impl<T, A> Default for SharedPtr<T, A>
where A: Allocator + Clone
{
    fn default() -> Self { Self::empty() }
}

impl<T, A> Clone for SharedPtr<T, A>
where A: Allocator + Clone
{
    fn clone(&self) -> Self {
        if let Some(rep) = self.get_rep() { rep.add_strong_ref(); }
        Self {
            _ptr: self._ptr,
            _rep: self._rep,
            _data: PhantomData
        }
    }
}

impl<T, A> Deref for SharedPtr<T, A>
where A: Allocator + Clone
{
    type Target = T;
    /// # Panics
    /// If the handle is empty. Use [`SharedPtr::get`] when that is possible.
    fn deref(&self) -> &Self::Target {
        match self.get() {
            Some(v) => v,
            None => panic!("dereferenced an empty SharedPtr")
        }
    }
}

impl<T, A> Drop for SharedPtr<T, A>
where A: Allocator + Clone
{
    fn drop(&mut self) {
        if let Some(rep) = self._rep.take() {
            unsafe { ControlBlock::release_strong_ref(rep) }
        }
    }
}

impl<T, A> From<ABox<T, A>> for SharedPtr<T, A>
where A: Allocator + Clone
{
    fn from(value: ABox<T, A>) -> Self {
        match Self::from_box(value) {
            Ok(v) => v,
            Err(_) => handle_alloc_error(Layout::new::<ControlBlock<T, A>>())
        }
    }
}

impl<T, A> Debug for SharedPtr<T, A>
where T: Debug,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedPtr {{ data: {:?}, strong: {}, weak: {} }}",
            self.get(), self.strong_count(), self.weak_count())
    }
}

impl<T, A> Display for SharedPtr<T, A>
where T: Display,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "None")
        }
    }
}

// std::weak_ptr
pub struct WeakPtr<T, A = Global>
where A: Allocator + Clone
{
    _rep: Option<NonNull<ControlBlock<T, A>>>,
    _data: PhantomData<T>
}

unsafe impl<T: Send + Sync, A: Allocator + Clone + Send + Sync> Send for WeakPtr<T, A> {}
unsafe impl<T: Send + Sync, A: Allocator + Clone + Send + Sync> Sync for WeakPtr<T, A> {}

impl<T, A> WeakPtr<T, A>
where A: Allocator + Clone
{
    /// Weak handle that never upgrades.
    pub const fn new() -> Self { Self { _rep: None, _data: PhantomData } }

    fn get_rep(&self) -> Option<&ControlBlock<T, A>> {
        self._rep.map(|r| unsafe { &*r.as_ptr() })
    }

    /// Never blocks. Returns `None` once the last strong handle is gone.
    pub fn upgrade(&self) -> Option<SharedPtr<T, A>> {
        let rep = self.get_rep()?;
        if !rep.try_add_strong_ref() { return None }
        Some(SharedPtr { _ptr: rep.payload(), _rep: self._rep, _data: PhantomData })
    }

    pub fn try_upgrade(&self) -> Result<SharedPtr<T, A>> {
        self.upgrade().ok_or(Error::ObjectDestroyed)
    }

    pub fn expired(&self) -> bool { self.strong_count() == 0 }

    pub fn strong_count(&self) -> usize { self.get_rep().map_or(0, |r| r.uses.count()) }
    pub fn weak_count(&self) -> usize { self.get_rep().map_or(0, |r| r.weaks.count()) }

    pub fn ptr_eq(&self, other: &Self) -> bool { self._rep == other._rep }
}

impl<T, A> WeakPtr<T, A>
where A: Allocator + Clone
{
    pub fn _debug_get_rep(&self) -> *const u8 {
        self._rep.map_or(ptr::null(), |r| r.as_ptr() as *const u8)
    }
}

impl<T, A> Default for WeakPtr<T, A>
where A: Allocator + Clone
{
    fn default() -> Self { Self::new() }
}

impl<T, A> Clone for WeakPtr<T, A>
where A: Allocator + Clone
{
    fn clone(&self) -> Self {
        if let Some(rep) = self.get_rep() { rep.add_weak_ref(); }
        Self { _rep: self._rep, _data: PhantomData }
    }
}

impl<T, A> Drop for WeakPtr<T, A>
where A: Allocator + Clone
{
    fn drop(&mut self) {
        if let Some(rep) = self._rep.take() {
            unsafe { ControlBlock::release_weak_ref(rep) }
        }
    }
}

impl<T, A> Debug for WeakPtr<T, A>
where A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakPtr {{ strong: {}, weak: {} }}", self.strong_count(), self.weak_count())
    }
}
