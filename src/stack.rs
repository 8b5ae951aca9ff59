//! Per-thread LIFO storage for recycled objects, the queue list targeting it,
//! and the scavenging that moves foreign returns back onto the stack.

use std::{
    any::Any,
    cell::{RefCell, UnsafeCell},
    collections::HashMap,
    sync::{atomic::Ordering, Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    handle::{Entry, HandleState},
    link::SharedCapacity,
    queue::WeakOrderQueue,
    token::{self, ThreadToken},
    RecycleError,
};

const INITIAL_CAPACITY: usize = 256;

/// Per-thread LIFO buffer of recycled entries plus the intrusive list of
/// weak-order queues feeding it from foreign threads.
///
/// The queue list is appended to once per foreign thread; when the stack runs
/// out of items, its home thread walks the list to scavenge what those
/// threads recycled. This keeps thread synchronisation off the hot path while
/// still recycling across threads.
pub(crate) struct Stack<T> {
    recycler_id: u64,
    /// Claim id stamped on handles recycled on the home thread.
    own_thread_id: u64,
    /// Weak so a stack outliving its thread never pins the token.
    owner: Weak<ThreadToken>,
    max_capacity: usize,
    interval: u32,
    delayed_queue_interval: u32,
    max_delayed_queues: usize,
    shared_capacity: Arc<SharedCapacity>,
    /// Head of the queue list. Mutated only under this lock, so publications
    /// racing in from different foreign threads are serialized; the scavenger
    /// clones it under the same brief, uncontended lock.
    head: Mutex<Option<Arc<WeakOrderQueue<T>>>>,
    /// Home-thread-only state.
    inner: UnsafeCell<StackInner<T>>,
}

pub(crate) struct StackInner<T> {
    pub(crate) elements: Vec<Entry<T>>,
    /// Logical capacity; doubles up to `max_capacity`.
    pub(crate) capacity: usize,
    cursor: Option<Arc<WeakOrderQueue<T>>>,
    prev: Option<Arc<WeakOrderQueue<T>>>,
    handle_recycle_count: u32,
}

// SAFETY: `inner` is only reached on the owner thread: `Recycler::get` goes
// through the owner's thread-local registry and `push` takes the home path
// only after the thread-token comparison succeeds. Everything else is atomic
// or lock-protected.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T: Send + 'static> Stack<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        recycler_id: u64,
        owner: &Arc<ThreadToken>,
        max_capacity: usize,
        max_shared_capacity_factor: u32,
        interval: u32,
        max_delayed_queues: usize,
        delayed_queue_interval: u32,
        link_capacity: usize,
    ) -> Self {
        let initial = max_capacity.min(INITIAL_CAPACITY);
        let shared = (max_capacity / max_shared_capacity_factor as usize).max(link_capacity);
        Self {
            recycler_id,
            own_thread_id: crate::next_id(),
            owner: Arc::downgrade(owner),
            max_capacity,
            interval,
            delayed_queue_interval,
            max_delayed_queues,
            shared_capacity: Arc::new(SharedCapacity::new(shared, link_capacity)),
            head: Mutex::new(None),
            inner: UnsafeCell::new(StackInner {
                elements: Vec::with_capacity(initial),
                capacity: initial,
                cursor: None,
                prev: None,
                // Seeded at the interval so the first fresh handle is admitted.
                handle_recycle_count: interval,
            }),
        }
    }

    pub(crate) fn recycler_id(&self) -> u64 {
        self.recycler_id
    }

    pub(crate) fn shared_capacity(&self) -> &Arc<SharedCapacity> {
        &self.shared_capacity
    }

    pub(crate) fn delayed_queue_interval(&self) -> u32 {
        self.delayed_queue_interval
    }

    /// Home-thread only: takes the most recently recycled entry, scavenging
    /// the queue list when the stack itself is empty.
    pub(crate) fn pop(&self) -> Option<Entry<T>> {
        let mut discarded = Vec::new();
        let popped = {
            // SAFETY: only the owner thread reaches this stack through the
            // registry in `Recycler::get`.
            let inner = unsafe { &mut *self.inner.get() };
            self.pop_from(inner, &mut discarded)
        };
        // Rejected objects run arbitrary drop code, which may re-enter the
        // recycler; release them only after the home-side borrow is gone.
        drop(discarded);
        popped
    }

    fn pop_from(
        &self,
        inner: &mut StackInner<T>,
        discarded: &mut Vec<Entry<T>>,
    ) -> Option<Entry<T>> {
        if inner.elements.is_empty() {
            if !self.scavenge(inner, discarded) {
                return None;
            }
        }
        let entry = inner.elements.pop()?;
        let last = entry.handle.last_recycled_id.load(Ordering::Relaxed);
        let recycle = entry.handle.recycle_id.load(Ordering::Relaxed);
        if last != recycle {
            panic!("handle recycled multiple times");
        }
        // Re-arm the handle for its next recycle.
        entry.handle.recycle_id.store(0, Ordering::Relaxed);
        entry.handle.last_recycled_id.store(0, Ordering::Relaxed);
        Some(entry)
    }

    /// Routes a recycled entry by thread identity.
    pub(crate) fn push(self: &Arc<Self>, entry: Entry<T>) -> Result<(), RecycleError> {
        let home = self
            .owner
            .upgrade()
            .is_some_and(|owner| owner.id() == token::current_id());
        if home {
            let mut discarded = Vec::new();
            let result = {
                // SAFETY: the token comparison proves this is the owner thread.
                let inner = unsafe { &mut *self.inner.get() };
                self.push_now(inner, entry, &mut discarded)
            };
            drop(discarded);
            result
        } else {
            self.push_later(entry);
            Ok(())
        }
    }

    fn push_now(
        &self,
        inner: &mut StackInner<T>,
        entry: Entry<T>,
        discarded: &mut Vec<Entry<T>>,
    ) -> Result<(), RecycleError> {
        let handle = &entry.handle;
        if handle.recycle_id.load(Ordering::Relaxed) != 0 || !handle.claim(self.own_thread_id) {
            discarded.push(entry);
            return Err(RecycleError::AlreadyRecycled);
        }
        handle.recycle_id.store(self.own_thread_id, Ordering::Relaxed);

        if inner.elements.len() >= self.max_capacity || self.drop_handle(inner, handle) {
            // Hit the capacity limit or throttled; the youngest object goes.
            discarded.push(entry);
            return Ok(());
        }
        if inner.elements.len() == inner.capacity {
            inner.capacity = (inner.capacity * 2).min(self.max_capacity);
        }
        inner.elements.push(entry);
        Ok(())
    }

    fn push_later(self: &Arc<Self>, entry: Entry<T>) {
        if self.max_delayed_queues == 0 {
            // Cross-thread recycling is disabled; drop on the floor.
            return;
        }
        let Some(producer) = token::current() else {
            return;
        };
        let Some(queue) = self.delayed_queue_for(&producer) else {
            return;
        };
        if let Some(rejected) = queue.add(entry) {
            // Lost the claim race, throttled, or out of shared capacity.
            drop(rejected);
        }
    }

    /// Finds or creates the calling thread's queue toward this stack. `None`
    /// means the object must be dropped: the per-thread queue quota is spent,
    /// the shared capacity cannot cover a first link, or thread-local storage
    /// is being torn down.
    fn delayed_queue_for(
        self: &Arc<Self>,
        producer: &Arc<ThreadToken>,
    ) -> Option<Arc<WeakOrderQueue<T>>> {
        let key = Arc::as_ptr(self) as usize;
        DELAYED
            .try_with(|map| {
                let mut map = map.borrow_mut();
                if let Some(slot) = map.get(&key) {
                    // A live weak reference under our own address can only be
                    // this stack; a dead one is a leftover from a dead stack
                    // that used to occupy it.
                    if slot.stack.strong_count() > 0 {
                        return slot
                            .queue
                            .as_ref()
                            .and_then(|queue| queue.clone().downcast::<WeakOrderQueue<T>>().ok());
                    }
                    map.remove(&key);
                }
                map.retain(|_, slot| slot.stack.strong_count() > 0);
                let erased: Arc<dyn Any + Send + Sync> = self.clone();
                if map.len() >= self.max_delayed_queues {
                    // Mark the quota as spent so later recycles toward this
                    // stack fail fast.
                    map.insert(
                        key,
                        DelayedSlot {
                            stack: Arc::downgrade(&erased),
                            queue: None,
                        },
                    );
                    return None;
                }
                let queue = WeakOrderQueue::new(self, producer)?;
                self.set_head(queue.clone());
                map.insert(
                    key,
                    DelayedSlot {
                        stack: Arc::downgrade(&erased),
                        queue: Some(queue.clone()),
                    },
                );
                Some(queue)
            })
            .ok()
            .flatten()
    }

    /// Publishes a freshly created queue at the head of the list. The lock
    /// serializes publications racing in from different foreign threads.
    pub(crate) fn set_head(&self, queue: Arc<WeakOrderQueue<T>>) {
        let mut head = self.head.lock();
        queue.set_next(head.take());
        *head = Some(queue);
    }

    /// Admission filter: one fresh handle per `interval` recycles. Damps
    /// allocation bursts without penalizing handles that already survived a
    /// full cycle.
    pub(crate) fn drop_handle(&self, inner: &mut StackInner<T>, handle: &HandleState<T>) -> bool {
        if !handle.has_been_recycled.load(Ordering::Relaxed) {
            if inner.handle_recycle_count < self.interval {
                inner.handle_recycle_count += 1;
                return true;
            }
            inner.handle_recycle_count = 1;
            handle.has_been_recycled.store(true, Ordering::Relaxed);
        }
        false
    }

    /// Doubles the logical capacity until it covers `expected`, capped at
    /// `max_capacity`. Returns the resulting capacity.
    pub(crate) fn increase_capacity(&self, inner: &mut StackInner<T>, expected: usize) -> usize {
        let mut capacity = inner.capacity;
        loop {
            capacity <<= 1;
            if capacity >= expected || capacity >= self.max_capacity {
                break;
            }
        }
        capacity = capacity.min(self.max_capacity);
        if capacity != inner.capacity {
            inner.elements.reserve(capacity - inner.elements.len());
            inner.capacity = capacity;
        }
        capacity
    }

    fn scavenge(&self, inner: &mut StackInner<T>, discarded: &mut Vec<Entry<T>>) -> bool {
        if self.scavenge_some(inner, discarded) {
            return true;
        }
        // Nothing anywhere; restart the sweep from the current head next time.
        inner.prev = None;
        inner.cursor = self.head.lock().clone();
        false
    }

    fn scavenge_some(&self, inner: &mut StackInner<T>, discarded: &mut Vec<Entry<T>>) -> bool {
        let (mut prev, mut cursor) = match inner.cursor.take() {
            Some(cursor) => (inner.prev.take(), Some(cursor)),
            None => (None, self.head.lock().clone()),
        };

        let mut success = false;
        loop {
            let Some(current) = cursor.clone() else {
                break;
            };
            if current.transfer(self, inner, discarded) {
                success = true;
                break;
            }
            let next = current.next();
            if current.is_producer_dead() {
                // The producer thread is gone. Rescue what it managed to
                // publish, then splice the queue out. The list head is never
                // unlinked, to avoid synchronizing with concurrent set_head;
                // it still serves as the predecessor for unlinking the rest.
                if current.has_final_data() {
                    while current.transfer(self, inner, discarded) {
                        success = true;
                    }
                }
                match &prev {
                    Some(prev_queue) => {
                        current.reclaim_all_space_and_unlink(discarded);
                        prev_queue.set_next(next.clone());
                    }
                    None => prev = Some(current),
                }
            } else {
                prev = Some(current);
            }
            cursor = next;
            if success {
                break;
            }
        }

        inner.prev = prev;
        inner.cursor = cursor;
        success
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        // SAFETY: test runs on the owner thread.
        unsafe { &*self.inner.get() }.elements.len()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        // SAFETY: test runs on the owner thread.
        unsafe { &*self.inner.get() }.capacity
    }

    #[cfg(test)]
    pub(crate) fn queue_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.lock().clone();
        while let Some(queue) = cursor {
            count += 1;
            cursor = queue.next();
        }
        count
    }
}

thread_local! {
    /// Per-thread map from a foreign stack to the queue this thread feeds it
    /// through. Keys are weak: entries whose stack has died are purged before
    /// the quota check, which is what gives the map its weak-key semantics.
    static DELAYED: RefCell<HashMap<usize, DelayedSlot>> = RefCell::new(HashMap::new());
}

struct DelayedSlot {
    stack: Weak<dyn Any + Send + Sync>,
    /// `None` marks the per-thread queue quota as spent for this stack;
    /// everything recycled toward it afterwards is dropped.
    queue: Option<Arc<dyn Any + Send + Sync>>,
}
