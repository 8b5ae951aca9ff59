//! Thread-local object recycling for allocation-heavy hot paths.
//!
//! A [`Recycler`] hands out objects and takes them back through per-object
//! [`Handle`]s, reusing them instead of hitting the allocator. Objects
//! recycled on the thread that allocated them land directly on that thread's
//! LIFO stack; objects recycled anywhere else travel through a lock-free
//! single-producer/single-consumer queue back to their home stack.
//!
//! # Architecture
//!
//! ```text
//! [home thread]                      [foreign threads]
//!   get ──► Stack.pop                  handle.recycle(obj)
//!              │ empty                        │
//!              ▼                              ▼
//!          scavenge ◄──── transfer ──── WeakOrderQueue (one per
//!              │ empty                  foreign thread and stack,
//!              ▼                        chained fixed-size links)
//!          new_object(handle)
//! ```
//!
//! The hot recycle path takes no locks: the home path is a plain vector push
//! behind a thread check, the foreign path a slot write published with one
//! release store. A single compare-and-set per handle arbitrates racing
//! recyclers; losers silently drop their object, which under contention is
//! intended behavior rather than an error.
//!
//! # Admission throttling
//!
//! Freshly allocated objects are only admitted to a pool once per `ratio`
//! recycles, so an allocation burst grows the pool slowly instead of
//! permanently. Objects that already survived one full cycle are always
//! admitted.
//!
//! # Example
//!
//! ```rust
//! use restash::{Handle, Recycler};
//!
//! struct Message {
//!     payload: String,
//!     handle: Handle<Message>,
//! }
//!
//! let recycler = Recycler::new(|handle| Message {
//!     payload: String::new(),
//!     handle,
//! });
//!
//! let mut message = recycler.get();
//! message.payload.push_str("hello");
//!
//! // Hand it back; the next `get` on this thread reuses it.
//! message.payload.clear();
//! let handle = message.handle.clone();
//! handle.recycle(message).unwrap();
//! ```

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;

pub(crate) mod handle;
pub(crate) mod link;
pub(crate) mod queue;
pub(crate) mod stack;
pub(crate) mod token;

use handle::{Entry, HandleState};
use stack::Stack;

const DEFAULT_MAX_CAPACITY_PER_THREAD: usize = 4 * 1024;
const DEFAULT_MAX_SHARED_CAPACITY_FACTOR: u32 = 2;
const DEFAULT_LINK_CAPACITY: usize = 16;
const MIN_LINK_CAPACITY: usize = 16;
const DEFAULT_RATIO: u32 = 8;

static ID_GENERATOR: AtomicU64 = AtomicU64::new(1);

/// Process-wide id source for recyclers, stacks, queues and thread tokens.
/// Never yields 0: that value means "unclaimed" on a handle.
pub(crate) fn next_id() -> u64 {
    ID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecycleError {
    /// The handle was recycled twice without an intervening `get`. The
    /// object of the second recycle is dropped; the pool stays intact.
    #[error("handle recycled already")]
    AlreadyRecycled,
}

/// The token through which user code returns an object to the pool.
///
/// The factory passed to [`Recycler::new`] receives a handle for every object
/// it builds and typically stores it inside the object. Handles are cheap to
/// clone and may be used from any thread; recycling from a thread other than
/// the allocating one is routed through that thread's weak-order queue.
pub struct Handle<T> {
    state: Option<Arc<HandleState<T>>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send + 'static> Handle<T> {
    /// Returns `value` to the pool this handle was issued from.
    ///
    /// With pooling disabled, or when the home thread has exited, the value
    /// is simply dropped. Errors only on a double recycle, which indicates an
    /// application bug; the value is dropped in that case too.
    pub fn recycle(&self, value: T) -> Result<(), RecycleError> {
        let Some(state) = &self.state else {
            // Pooling is disabled; nothing to return to.
            return Ok(());
        };
        if state.last_recycled_id.load(Ordering::Relaxed)
            != state.recycle_id.load(Ordering::Relaxed)
        {
            return Err(RecycleError::AlreadyRecycled);
        }
        let Some(home) = state.home.upgrade() else {
            // The home thread is gone; the object can never be served again.
            return Ok(());
        };
        home.push(Entry {
            handle: state.clone(),
            value,
        })
    }

    pub(crate) fn noop() -> Self {
        Self { state: None }
    }

    pub(crate) fn fresh(state: Arc<HandleState<T>>) -> Self {
        Self { state: Some(state) }
    }
}

/// An object pool that recycles per thread.
///
/// Each thread that calls [`Recycler::get`] lazily receives its own stack of
/// up to `max_capacity_per_thread` objects, so the common get/recycle cycle
/// never synchronizes with other threads. A recycler is `Send + Sync`; share
/// it behind an `Arc` or a `static`.
pub struct Recycler<T> {
    id: u64,
    max_capacity_per_thread: usize,
    max_shared_capacity_factor: u32,
    interval: u32,
    max_delayed_queues_per_thread: usize,
    delayed_queue_interval: u32,
    link_capacity: usize,
    new_object: Box<dyn Fn(Handle<T>) -> T + Send + Sync>,
}

thread_local! {
    /// This thread's stacks, one per recycler that has served it. Dropped
    /// with the thread, which is what ends a stack's life.
    static STACKS: RefCell<HashMap<u64, Arc<dyn Any + Send + Sync>>> =
        RefCell::new(HashMap::new());
}

impl<T: Send + 'static> Recycler<T> {
    /// Creates a recycler with default configuration. `new_object` is called
    /// on every pool miss and must bind the given handle into the object it
    /// builds.
    pub fn new<F>(new_object: F) -> Self
    where
        F: Fn(Handle<T>) -> T + Send + Sync + 'static,
    {
        RecyclerBuilder::new().build(new_object)
    }

    pub fn builder() -> RecyclerBuilder {
        RecyclerBuilder::new()
    }

    /// Takes an object from the calling thread's pool, allocating through the
    /// factory when nothing is available. Never blocks; at worst it walks the
    /// thread's queue list once looking for scavengeable objects.
    pub fn get(&self) -> T {
        if self.max_capacity_per_thread == 0 {
            return (self.new_object)(Handle::noop());
        }
        let Some(stack) = self.thread_stack() else {
            // Thread-local storage is being torn down.
            return (self.new_object)(Handle::noop());
        };
        match stack.pop() {
            Some(entry) => entry.value,
            None => {
                let state = Arc::new(HandleState::new(
                    stack.recycler_id(),
                    Arc::downgrade(&stack),
                ));
                (self.new_object)(Handle::fresh(state))
            }
        }
    }

    /// Returns `Ok(false)` when the handle does not belong to this recycler,
    /// in which case the value is dropped and the caller may allocate anew.
    #[deprecated(note = "recycle through `Handle::recycle` instead")]
    pub fn recycle(&self, value: T, handle: &Handle<T>) -> Result<bool, RecycleError> {
        let Some(state) = &handle.state else {
            return Ok(false);
        };
        if state.recycler_id != self.id {
            return Ok(false);
        }
        handle.recycle(value)?;
        Ok(true)
    }

    fn thread_stack(&self) -> Option<Arc<Stack<T>>> {
        let token = token::current()?;
        STACKS
            .try_with(|stacks| {
                let mut stacks = stacks.borrow_mut();
                let erased = stacks
                    .entry(self.id)
                    .or_insert_with(|| {
                        Arc::new(Stack::<T>::new(
                            self.id,
                            &token,
                            self.max_capacity_per_thread,
                            self.max_shared_capacity_factor,
                            self.interval,
                            self.max_delayed_queues_per_thread,
                            self.delayed_queue_interval,
                            self.link_capacity,
                        )) as Arc<dyn Any + Send + Sync>
                    })
                    .clone();
                erased.downcast::<Stack<T>>().ok()
            })
            .ok()
            .flatten()
    }

    #[cfg(test)]
    fn thread_local_size(&self) -> usize {
        self.thread_stack().map_or(0, |stack| stack.size())
    }

    #[cfg(test)]
    fn thread_local_capacity(&self) -> usize {
        self.thread_stack().map_or(0, |stack| stack.capacity())
    }

    #[cfg(test)]
    fn thread_local_queue_count(&self) -> usize {
        self.thread_stack().map_or(0, |stack| stack.queue_count())
    }

    #[cfg(test)]
    fn thread_local_shared_available(&self) -> usize {
        self.thread_stack()
            .map_or(0, |stack| stack.shared_capacity().available())
    }
}

/// Configuration for a [`Recycler`]. The defaults match a busy server
/// workload; see the builder methods for what each knob trades off.
pub struct RecyclerBuilder {
    max_capacity_per_thread: usize,
    max_shared_capacity_factor: u32,
    max_delayed_queues_per_thread: usize,
    link_capacity: usize,
    ratio: u32,
    delayed_queue_ratio: Option<u32>,
}

impl Default for RecyclerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecyclerBuilder {
    pub fn new() -> Self {
        Self {
            max_capacity_per_thread: DEFAULT_MAX_CAPACITY_PER_THREAD,
            max_shared_capacity_factor: DEFAULT_MAX_SHARED_CAPACITY_FACTOR,
            max_delayed_queues_per_thread: 2 * num_cpus::get(),
            link_capacity: DEFAULT_LINK_CAPACITY,
            ratio: DEFAULT_RATIO,
            delayed_queue_ratio: None,
        }
    }

    /// Most objects one stack may hold. `0` disables pooling entirely:
    /// `get` always allocates and handles recycle to nothing.
    pub fn with_max_capacity_per_thread(mut self, max: usize) -> Self {
        self.max_capacity_per_thread = max;
        self
    }

    /// Divides `max_capacity_per_thread` to bound how much memory foreign
    /// queues may hold for one stack. Clamped to at least 2.
    pub fn with_max_shared_capacity_factor(mut self, factor: u32) -> Self {
        self.max_shared_capacity_factor = factor;
        self
    }

    /// Most distinct foreign stacks one thread may recycle into. Objects
    /// recycled toward further stacks are dropped.
    pub fn with_max_delayed_queues_per_thread(mut self, max: usize) -> Self {
        self.max_delayed_queues_per_thread = max;
        self
    }

    /// Slots per queue chunk; rounded up to a power of two, minimum 16.
    pub fn with_link_capacity(mut self, capacity: usize) -> Self {
        self.link_capacity = capacity;
        self
    }

    /// Admit one fresh handle per `ratio` recycles on the home path.
    pub fn with_ratio(mut self, ratio: u32) -> Self {
        self.ratio = ratio;
        self
    }

    /// Same as `ratio`, for the foreign queues. Defaults to `ratio`.
    pub fn with_delayed_queue_ratio(mut self, ratio: u32) -> Self {
        self.delayed_queue_ratio = Some(ratio);
        self
    }

    pub fn build<T, F>(self, new_object: F) -> Recycler<T>
    where
        T: Send + 'static,
        F: Fn(Handle<T>) -> T + Send + Sync + 'static,
    {
        let link_capacity = self.link_capacity.max(MIN_LINK_CAPACITY).next_power_of_two();
        let (max_capacity, factor, delayed_queues) = if self.max_capacity_per_thread == 0 {
            (0, 1, 0)
        } else {
            (
                self.max_capacity_per_thread,
                self.max_shared_capacity_factor.max(2),
                self.max_delayed_queues_per_thread,
            )
        };
        let recycler = Recycler {
            id: next_id(),
            max_capacity_per_thread: max_capacity,
            max_shared_capacity_factor: factor,
            interval: self.ratio,
            max_delayed_queues_per_thread: delayed_queues,
            delayed_queue_interval: self.delayed_queue_ratio.unwrap_or(self.ratio),
            link_capacity,
            new_object: Box::new(new_object),
        };
        if recycler.max_capacity_per_thread == 0 {
            debug!("recycler {}: pooling disabled", recycler.id);
        } else {
            debug!(
                "recycler {}: max_capacity_per_thread={} max_shared_capacity_factor={} \
                 max_delayed_queues_per_thread={} link_capacity={} ratio={} delayed_queue_ratio={}",
                recycler.id,
                recycler.max_capacity_per_thread,
                recycler.max_shared_capacity_factor,
                recycler.max_delayed_queues_per_thread,
                recycler.link_capacity,
                recycler.interval,
                recycler.delayed_queue_interval,
            );
        }
        recycler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Pooled {
        serial: usize,
        handle: Handle<Pooled>,
    }

    fn counting(builder: RecyclerBuilder) -> (Recycler<Pooled>, Arc<AtomicUsize>) {
        let allocated = Arc::new(AtomicUsize::new(0));
        let counter = allocated.clone();
        let recycler = builder.build(move |handle| Pooled {
            serial: counter.fetch_add(1, Ordering::Relaxed),
            handle,
        });
        (recycler, allocated)
    }

    #[test]
    fn same_thread_reuse() {
        let (recycler, allocated) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_ratio(1),
        );
        let first = recycler.get();
        let serial = first.serial;
        let handle = first.handle.clone();
        handle.recycle(first).unwrap();

        let second = recycler.get();
        assert_eq!(second.serial, serial);
        assert_eq!(allocated.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn cross_thread_reuse_after_producer_exit() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_ratio(1),
        );
        let object = recycler.get();
        let serial = object.serial;
        thread::spawn(move || {
            let handle = object.handle.clone();
            handle.recycle(object).unwrap();
        })
        .join()
        .unwrap();

        let mut reused = false;
        for _ in 0..8 {
            if recycler.get().serial == serial {
                reused = true;
                break;
            }
        }
        assert!(reused);
    }

    #[test]
    fn capacity_limit_drops_excess_objects() {
        let (recycler, allocated) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(2)
                .with_ratio(1),
        );
        let a = recycler.get();
        let b = recycler.get();
        let c = recycler.get();
        assert_eq!(allocated.load(Ordering::Relaxed), 3);
        for object in [a, b, c] {
            let handle = object.handle.clone();
            handle.recycle(object).unwrap();
        }
        assert_eq!(recycler.thread_local_size(), 2);

        // Two come back from the pool, the third recycle was dropped.
        let _keep: Vec<Pooled> = (0..3).map(|_| recycler.get()).collect();
        assert_eq!(allocated.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn shared_capacity_clamps_foreign_flood() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_max_shared_capacity_factor(16)
                .with_link_capacity(16)
                .with_ratio(0),
        );
        // Shared budget: max(16 / 16, 16) = 16 slots, exactly one link.
        let objects: Vec<Pooled> = (0..40).map(|_| recycler.get()).collect();
        thread::spawn(move || {
            for object in objects {
                let handle = object.handle.clone();
                handle.recycle(object).unwrap();
            }
        })
        .join()
        .unwrap();

        let mut recovered = HashSet::new();
        for _ in 0..60 {
            let object = recycler.get();
            if object.serial < 40 {
                assert!(recovered.insert(object.serial));
            }
        }
        // One link's worth got through; everything past it was dropped.
        assert_eq!(recovered.len(), 16);
        assert_eq!(recycler.thread_local_shared_available(), 0);
    }

    #[test]
    fn transfer_grows_stack_capacity_past_its_initial_seed() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(1024)
                .with_link_capacity(512)
                .with_ratio(0),
        );
        let objects: Vec<Pooled> = (0..300).map(|_| recycler.get()).collect();
        thread::spawn(move || {
            for object in objects {
                let handle = object.handle.clone();
                handle.recycle(object).unwrap();
            }
        })
        .join()
        .unwrap();
        assert_eq!(recycler.thread_local_capacity(), 256);

        // All 300 returns sit in one 512-slot link, so the first scavenge
        // moves a batch that outgrows the 256-entry seed and doubles the
        // stack.
        let first = recycler.get();
        assert!(first.serial < 300);
        assert_eq!(recycler.thread_local_capacity(), 512);
        assert_eq!(recycler.thread_local_size(), 299);

        let mut recovered = 1;
        while recycler.thread_local_size() > 0 {
            let object = recycler.get();
            assert!(object.serial < 300);
            recovered += 1;
        }
        assert_eq!(recovered, 300);
    }

    #[test]
    fn dead_producers_drain_and_unlink() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(4096)
                .with_max_delayed_queues_per_thread(16)
                .with_ratio(0),
        );
        let per_producer = 1000;
        // Allocate everything up front so no producer can hand an object
        // back while we are still taking them out.
        let mut objects: Vec<Pooled> = (0..3 * per_producer).map(|_| recycler.get()).collect();
        assert!(objects.iter().all(|object| object.serial < 3 * per_producer));

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let batch: Vec<Pooled> = objects.drain(..per_producer).collect();
                thread::spawn(move || {
                    for object in batch {
                        let handle = object.handle.clone();
                        handle.recycle(object).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(recycler.thread_local_queue_count(), 3);

        // Drain everything the producers managed to publish. Every recovered
        // object shows up exactly once.
        let mut recovered = HashSet::new();
        for _ in 0..8000 {
            let object = recycler.get();
            if object.serial < 3 * per_producer {
                assert!(recovered.insert(object.serial));
            }
        }
        // Each producer filled at least its first link before any could run
        // out of shared capacity.
        assert!(recovered.len() >= 48);

        // The drained dead queues are spliced out; only the list head stays.
        assert_eq!(recycler.thread_local_queue_count(), 1);
    }

    #[test]
    fn double_recycle_is_an_error() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_ratio(8),
        );
        let a = recycler.get();
        let b = recycler.get();
        let handle = a.handle.clone();
        handle.recycle(a).unwrap();
        assert_eq!(handle.recycle(b), Err(RecycleError::AlreadyRecycled));
    }

    #[test]
    fn in_flight_handle_cannot_be_recycled_again() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_max_delayed_queues_per_thread(4)
                .with_ratio(0),
        );
        let a = recycler.get();
        let b = recycler.get();
        let handle = a.handle.clone();
        thread::spawn(move || {
            let h = a.handle.clone();
            h.recycle(a).unwrap();
        })
        .join()
        .unwrap();
        // `a` sits in a foreign queue; its handle stays claimed until popped.
        assert_eq!(handle.recycle(b), Err(RecycleError::AlreadyRecycled));
    }

    #[test]
    fn ratio_filter_admission_count() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(4096)
                .with_ratio(4),
        );
        let objects: Vec<Pooled> = (0..13).map(|_| recycler.get()).collect();
        for object in objects {
            let handle = object.handle.clone();
            handle.recycle(object).unwrap();
        }
        // ceil(13 / 4) of the first 13 fresh recycles are admitted.
        assert_eq!(recycler.thread_local_size(), 4);
    }

    #[test]
    fn disabled_pooling_always_allocates() {
        let (recycler, allocated) =
            counting(RecyclerBuilder::new().with_max_capacity_per_thread(0));
        for expected in 0..4usize {
            let object = recycler.get();
            assert_eq!(object.serial, expected);
            let handle = object.handle.clone();
            handle.recycle(object).unwrap();
        }
        assert_eq!(allocated.load(Ordering::Relaxed), 4);
    }

    #[test]
    #[allow(deprecated)]
    fn recycle_rejects_foreign_handles() {
        let (first, _) = counting(RecyclerBuilder::new().with_ratio(0));
        let (second, _) = counting(RecyclerBuilder::new().with_ratio(0));
        let a = first.get();
        let b = second.get();
        let handle = b.handle.clone();
        drop(b);
        assert_eq!(first.recycle(a, &handle), Ok(false));

        let c = first.get();
        let handle = c.handle.clone();
        assert_eq!(first.recycle(c, &handle), Ok(true));
        assert_eq!(first.thread_local_size(), 1);
    }

    #[test]
    fn recycle_after_home_thread_exit_drops_quietly() {
        let (recycler, allocated) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_ratio(0),
        );
        let recycler = Arc::new(recycler);
        let remote = recycler.clone();
        let object = thread::spawn(move || remote.get()).join().unwrap();
        assert_eq!(allocated.load(Ordering::Relaxed), 1);

        // Its home stack died with the thread; recycling is a quiet drop.
        let handle = object.handle.clone();
        handle.recycle(object).unwrap();
        assert_eq!(recycler.thread_local_size(), 0);
    }

    #[test]
    fn delayed_queue_quota_marks_further_stacks_dropped() {
        let (recycler, _) = counting(
            RecyclerBuilder::new()
                .with_max_capacity_per_thread(16)
                .with_max_delayed_queues_per_thread(0)
                .with_ratio(0),
        );
        let object = recycler.get();
        let serial = object.serial;
        thread::spawn(move || {
            let handle = object.handle.clone();
            handle.recycle(object).unwrap();
        })
        .join()
        .unwrap();

        // Cross-thread recycling disabled: nothing ever comes back.
        for _ in 0..4 {
            assert_ne!(recycler.get().serial, serial);
        }
    }

    #[test]
    fn builder_clamps_configuration() {
        let recycler: Recycler<Pooled> = RecyclerBuilder::new()
            .with_link_capacity(10)
            .with_max_shared_capacity_factor(1)
            .build(|handle| Pooled { serial: 0, handle });
        assert_eq!(recycler.link_capacity, 16);
        assert_eq!(recycler.max_shared_capacity_factor, 2);

        let recycler: Recycler<Pooled> = RecyclerBuilder::new()
            .with_link_capacity(17)
            .build(|handle| Pooled { serial: 0, handle });
        assert_eq!(recycler.link_capacity, 32);

        let disabled: Recycler<Pooled> = RecyclerBuilder::new()
            .with_max_capacity_per_thread(0)
            .build(|handle| Pooled { serial: 0, handle });
        assert_eq!(disabled.max_shared_capacity_factor, 1);
        assert_eq!(disabled.max_delayed_queues_per_thread, 0);

        let defaults = RecyclerBuilder::new();
        assert_eq!(defaults.max_delayed_queues_per_thread, 2 * num_cpus::get());
    }

    #[test]
    fn id_generator_never_yields_zero() {
        for _ in 0..64 {
            assert_ne!(next_id(), 0);
        }
    }
}
