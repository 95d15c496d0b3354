//! Keyed registry of reference-counted objects.
//!
//! Each key maps to at most one live object. The first [`acquire`] of an
//! absent key inserts a placeholder under the structural lock, drops the lock,
//! and runs the initializer; concurrent lookups of the same key bump the
//! count and park on that object's [`DeferredInitGate`] until it settles.
//! Lookups of other keys never wait on somebody else's initializer.
//!
//! Releases decrement without the lock. Only the release that takes the
//! count to zero locks, unlinks the entry and then destroys the object after
//! unlocking. A lookup racing that release finds a zero count, refuses to
//! bump it and returns [`Error::NotFound`]; callers may simply retry.
//!
//! The registry is an ordinary value: construct it where the objects are
//! needed and pass it by reference. Handles borrow it, so it can't be torn
//! down while any handle is alive.
//!
//! [`acquire`]: KeyedRegistry::acquire

use allocator_api2::{
    alloc::{ Allocator, Global },
    boxed::Box as ABox
};
use crate::{
    error::{ Error, InitError, Result },
    hash::FnvBuildHasher,
    sync::{
        counter::AtomicRefCounter,
        gate::{ DeferredInitGate, InitState },
        publish::Published
    }
};
use parking_lot::{ Mutex, MutexGuard };
use std::{
    alloc::Layout,
    borrow::Borrow,
    collections::HashMap,
    fmt::Debug,
    hash::{ BuildHasher, Hash },
    marker::PhantomData,
    ops::Deref,
    ptr::NonNull,
    time::Duration
};

#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// How long a lookup waits for another thread's initializer. `None` waits
    /// forever.
    pub init_wait_timeout: Option<Duration>,
    pub initial_capacity: usize
}

impl RegistryOptions {
    pub fn new() -> Self { Self::default() }

    pub fn init_wait_timeout(mut self, timeout: Duration) -> Self {
        self.init_wait_timeout = Some(timeout);
        self
    }

    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }
}

struct ManagedObject<K, P> {
    key: K,
    uses: AtomicRefCounter,
    gate: DeferredInitGate,
    payload: Published<P>
}

type Entries<K, P, S> = HashMap<K, NonNull<ManagedObject<K, P>>, S>;

pub struct KeyedRegistry<K, P, F, S = FnvBuildHasher, A = Global>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    // Non-owning: an object is freed by whoever drops its last reference,
    // after unlinking it here.
    entries: Mutex<Entries<K, P, S>>,
    init: F,
    options: RegistryOptions,
    _allocator: A,
    _data: PhantomData<ManagedObject<K, P>>
}

unsafe impl<K, P, F, S, A> Send for KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq + Send + Sync,
      P: Send + Sync,
      F: Send,
      S: BuildHasher + Send,
      A: Allocator + Clone + Send
{}

unsafe impl<K, P, F, S, A> Sync for KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq + Send + Sync,
      P: Send + Sync,
      F: Sync,
      S: BuildHasher + Send,
      A: Allocator + Clone + Send + Sync
{}

impl<K, P, F> KeyedRegistry<K, P, F, FnvBuildHasher, Global>
where K: Hash + Eq,
      F: Fn(&K) -> std::result::Result<P, InitError>
{
    pub fn new(init: F) -> Self { Self::with_options(init, RegistryOptions::default()) }

    pub fn with_options(init: F, options: RegistryOptions) -> Self {
        Self::with_hasher_in(init, options, FnvBuildHasher::default(), Global)
    }
}

impl<K, P, F, S, A> KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    pub fn with_hasher_in(init: F, options: RegistryOptions, hasher: S, alloc: A) -> Self {
        let entries = HashMap::with_capacity_and_hasher(options.initial_capacity, hasher);
        Self {
            entries: Mutex::new(entries),
            init,
            options,
            _allocator: alloc,
            _data: PhantomData
        }
    }

    pub fn options(&self) -> &RegistryOptions { &self.options }

    /// Number of registered objects, including ones still initializing.
    pub fn len(&self) -> usize { self.entries.lock().len() }
    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where K: Borrow<Q>,
          Q: Hash + Eq + ?Sized
    {
        self.entries.lock().contains_key(key)
    }

    /// Snapshot of the strong count for `key`, for diagnostics.
    pub fn use_count<Q>(&self, key: &Q) -> Option<usize>
    where K: Borrow<Q>,
          Q: Hash + Eq + ?Sized
    {
        let entries = self.entries.lock();
        entries.get(key).map(|obj| unsafe { obj.as_ref() }.uses.count())
    }

    /// Existing objects only. Never runs the initializer.
    pub fn lookup<Q>(&self, key: &Q) -> Result<ObjectHandle<'_, K, P, F, S, A>>
    where K: Borrow<Q>,
          Q: Hash + Eq + ?Sized
    {
        let entries = self.entries.lock();
        let obj = match entries.get(key).copied() {
            Some(obj) => obj,
            None => return Err(Error::NotFound)
        };
        self.enter_existing(entries, obj)
    }

    /// Explicit form of dropping the handle.
    pub fn release(&self, handle: ObjectHandle<'_, K, P, F, S, A>) {
        debug_assert!(std::ptr::eq(handle.registry, self), "handle released into a different registry");
        drop(handle)
    }

    // Takes a reference to an object found in the map, then waits outside the
    // lock for it to become ready.
    fn enter_existing(&self, entries: MutexGuard<'_, Entries<K, P, S>>,
        obj: NonNull<ManagedObject<K, P>>) -> Result<ObjectHandle<'_, K, P, F, S, A>>
    {
        // the entry keeps `obj` allocated for as long as we hold the lock
        let acquired = unsafe { obj.as_ref() }.uses.try_acquire_unless_zero();
        drop(entries);
        if !acquired {
            log::debug!("registry: lookup of {:p} raced its final release", obj);
            return Err(Error::NotFound)
        }
        let gate = &unsafe { obj.as_ref() }.gate;
        let state = match self.options.init_wait_timeout {
            None => gate.wait(),
            Some(timeout) => match gate.wait_for(timeout) {
                Some(state) => state,
                None => {
                    self.release_object(obj);
                    return Err(Error::InitTimeout(timeout))
                }
            }
        };
        match state {
            InitState::Ready => self.make_handle(obj),
            _ => {
                self.release_object(obj);
                Err(Error::InitAborted)
            }
        }
    }

    // Caller owns one reference to a ready object; the handle takes it over.
    fn make_handle(&self, obj: NonNull<ManagedObject<K, P>>) -> Result<ObjectHandle<'_, K, P, F, S, A>> {
        match unsafe { obj.as_ref() }.payload.observe() {
            Some(payload) => Ok(ObjectHandle { registry: self, object: obj, payload: NonNull::from(payload) }),
            None => {
                self.release_object(obj);
                Err(Error::InitAborted)
            }
        }
    }

    fn unlink(&self, obj: NonNull<ManagedObject<K, P>>) {
        let key = &unsafe { obj.as_ref() }.key;
        let mut entries = self.entries.lock();
        // the key may already belong to a newer object if this one failed to initialize
        if entries.get(key) == Some(&obj) {
            entries.remove(key);
        }
    }

    fn release_object(&self, obj: NonNull<ManagedObject<K, P>>) {
        if !unsafe { obj.as_ref() }.uses.release() { return }
        self.unlink(obj);
        log::trace!("registry: destroying {:p}", obj);
        drop(unsafe { ABox::from_raw_in(obj.as_ptr(), self._allocator.clone()) });
    }

    // Initializer failed or panicked: make the key available again, wake the
    // waiters with a failure, and drop the creator's own reference.
    fn abort_init(&self, obj: NonNull<ManagedObject<K, P>>) {
        self.unlink(obj);
        unsafe { obj.as_ref() }.gate.signal_failed();
        self.release_object(obj);
    }
}

impl<K, P, F, S, A> KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq + Clone,
      F: Fn(&K) -> std::result::Result<P, InitError>,
      S: BuildHasher,
      A: Allocator + Clone
{
    /// Returns the object for `key`, creating it if absent.
    ///
    /// Blocks only while another thread is still initializing the same key.
    /// Fails with [`Error::NotFound`] if the existing object is mid-destruction,
    /// in which case retrying creates a fresh one. Calling this for the same
    /// key from inside the initializer deadlocks.
    pub fn acquire<Q>(&self, key: &Q) -> Result<ObjectHandle<'_, K, P, F, S, A>>
    where K: Borrow<Q>,
          Q: Hash + Eq + ToOwned<Owned = K> + ?Sized
    {
        let mut entries = self.entries.lock();
        if let Some(obj) = entries.get(key).copied() {
            return self.enter_existing(entries, obj)
        }
        let key = key.to_owned();
        let obj = self.alloc_object(key.clone())?;
        entries.insert(key, obj);
        drop(entries);
        log::trace!("registry: created {:p}", obj);
        self.initialize(obj)
    }

    fn alloc_object(&self, key: K) -> Result<NonNull<ManagedObject<K, P>>> {
        let object = ManagedObject {
            key,
            uses: AtomicRefCounter::new(1),
            gate: DeferredInitGate::new(),
            payload: Published::new()
        };
        let boxed = ABox::try_new_in(object, self._allocator.clone())
            .map_err(|_| Error::alloc_failure(Layout::new::<ManagedObject<K, P>>()))?;
        let (raw, _) = ABox::into_raw_with_allocator(boxed);
        Ok(unsafe { NonNull::new_unchecked(raw) })
    }

    fn initialize(&self, obj: NonNull<ManagedObject<K, P>>) -> Result<ObjectHandle<'_, K, P, F, S, A>> {
        let guard = AbortOnUnwind { registry: self, object: obj, armed: true };
        let object = unsafe { obj.as_ref() };
        match (self.init)(&object.key) {
            Ok(payload) => {
                guard.disarm();
                // only the creating thread ever publishes
                let published = object.payload.publish(payload).is_ok();
                debug_assert!(published, "payload published twice for {:p}", obj);
                object.gate.signal_ready();
                self.make_handle(obj)
            }
            Err(e) => {
                log::warn!("registry: initializer failed for {:p}: {}", obj, e);
                drop(guard);
                Err(Error::InitFailed(e))
            }
        }
    }
}

impl<K, P, F, S, A> Drop for KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn drop(&mut self) {
        let entries = self.entries.get_mut();
        if !entries.is_empty() {
            // only reachable through leaked handles; their objects leak with them
            log::warn!("registry: dropped with {} objects still registered", entries.len());
        }
    }
}

impl<K, P, F, S, A> Debug for KeyedRegistry<K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyedRegistry {{ len: {}, options: {:?} }}", self.len(), self.options)
    }
}

struct AbortOnUnwind<'a, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    registry: &'a KeyedRegistry<K, P, F, S, A>,
    object: NonNull<ManagedObject<K, P>>,
    armed: bool
}

impl<'a, K, P, F, S, A> AbortOnUnwind<'a, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn disarm(mut self) { self.armed = false; }
}

impl<'a, K, P, F, S, A> Drop for AbortOnUnwind<'a, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn drop(&mut self) {
        if self.armed { self.registry.abort_init(self.object) }
    }
}

/// One strong reference to a registered, fully initialized object.
pub struct ObjectHandle<'r, K, P, F, S = FnvBuildHasher, A = Global>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    registry: &'r KeyedRegistry<K, P, F, S, A>,
    object: NonNull<ManagedObject<K, P>>,
    payload: NonNull<P>
}

unsafe impl<'r, K, P, F, S, A> Send for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq + Send + Sync,
      P: Send + Sync,
      F: Sync,
      S: BuildHasher + Send,
      A: Allocator + Clone + Send + Sync
{}

unsafe impl<'r, K, P, F, S, A> Sync for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq + Send + Sync,
      P: Send + Sync,
      F: Sync,
      S: BuildHasher + Send,
      A: Allocator + Clone + Send + Sync
{}

impl<'r, K, P, F, S, A> ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn get_object(&self) -> &ManagedObject<K, P> { unsafe { self.object.as_ref() } }

    pub fn key(&self) -> &K { &self.get_object().key }
    pub fn use_count(&self) -> usize { self.get_object().uses.count() }
    pub fn ptr_eq(&self, other: &Self) -> bool { self.object == other.object }
    pub fn registry(&self) -> &'r KeyedRegistry<K, P, F, S, A> { self.registry }
}

impl<'r, K, P, F, S, A> Clone for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn clone(&self) -> Self {
        self.get_object().uses.acquire();
        Self { registry: self.registry, object: self.object, payload: self.payload }
    }
}

impl<'r, K, P, F, S, A> Deref for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    type Target = P;
    fn deref(&self) -> &P { unsafe { self.payload.as_ref() } }
}

impl<'r, K, P, F, S, A> Drop for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn drop(&mut self) { self.registry.release_object(self.object) }
}

impl<'r, K, P, F, S, A> Debug for ObjectHandle<'r, K, P, F, S, A>
where K: Hash + Eq + Debug,
      P: Debug,
      S: BuildHasher,
      A: Allocator + Clone
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHandle {{ key: {:?}, data: {:?}, uses: {} }}", self.key(), &**self, self.use_count())
    }
}
