//! Chunked storage behind a weak-order queue: fixed-capacity links chained
//! into a singly-linked buffer, plus the shared budget that bounds how many
//! links all queues targeting one stack may hold between them.

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use crossbeam_utils::CachePadded;

use crate::handle::Entry;

/// One fixed-capacity chunk of a weak-order queue's buffer.
///
/// The producer owns `write_index` and the slots above it; the consumer owns
/// `read_index` and everything below `write_index`. Hand-off happens through
/// the release store in [`Link::publish`] paired with the acquire load in
/// [`Link::published_pos`].
pub(crate) struct Link<T> {
    write_index: CachePadded<AtomicUsize>,
    /// Consumer-side cursor; only the target stack's home thread touches it.
    read_index: UnsafeCell<usize>,
    /// Set at most once, by the producer, when this link fills up.
    next: OnceLock<Arc<Link<T>>>,
    slots: Box<[UnsafeCell<Option<Entry<T>>>]>,
}

// SAFETY: slots transfer from the producer to the consumer through the
// release/acquire pair on `write_index`, and `read_index` is only accessed by
// the single consumer thread. The single-producer/single-consumer discipline
// is documented on `WeakOrderQueue`.
unsafe impl<T: Send> Send for Link<T> {}
unsafe impl<T: Send> Sync for Link<T> {}

impl<T> Link<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(None));
        Self {
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: UnsafeCell::new(0),
            next: OnceLock::new(),
            slots: slots.into_boxed_slice(),
        }
    }

    /// Producer-only: the next free slot index.
    #[inline(always)]
    pub(crate) fn writer_pos(&self) -> usize {
        self.write_index.load(Ordering::Relaxed)
    }

    /// Stores `entry` at `pos` and publishes it to the consumer.
    ///
    /// # Safety
    ///
    /// The caller must be the queue's single producer thread and `pos` must
    /// be the current [`Link::writer_pos`], below capacity.
    #[inline(always)]
    pub(crate) unsafe fn publish(&self, pos: usize, entry: Entry<T>) {
        unsafe { *self.slots[pos].get() = Some(entry) };
        self.write_index.store(pos + 1, Ordering::Release);
    }

    /// Index up to which slots are visible to the consumer.
    #[inline(always)]
    pub(crate) fn published_pos(&self) -> usize {
        self.write_index.load(Ordering::Acquire)
    }

    /// # Safety
    ///
    /// Consumer thread only.
    #[inline(always)]
    pub(crate) unsafe fn reader_pos(&self) -> usize {
        unsafe { *self.read_index.get() }
    }

    /// # Safety
    ///
    /// Consumer thread only.
    pub(crate) unsafe fn set_reader_pos(&self, pos: usize) {
        unsafe { *self.read_index.get() = pos };
    }

    /// Takes the entry published at `pos`.
    ///
    /// # Safety
    ///
    /// The caller must be the consumer thread and `pos` must be below a value
    /// previously returned by [`Link::published_pos`].
    pub(crate) unsafe fn take(&self, pos: usize) -> Option<Entry<T>> {
        unsafe { (*self.slots[pos].get()).take() }
    }

    pub(crate) fn next(&self) -> Option<&Arc<Link<T>>> {
        self.next.get()
    }

    /// Producer-only; each link gains at most one successor.
    pub(crate) fn append(&self, link: Arc<Link<T>>) {
        let _ = self.next.set(link);
    }
}

/// Budget of slots that all weak-order queues targeting one stack may
/// collectively allocate as links. Lives in its own allocation so a queue's
/// chain can hold the counter without keeping the stack itself alive.
pub(crate) struct SharedCapacity {
    available: CachePadded<AtomicUsize>,
    link_capacity: usize,
}

impl SharedCapacity {
    pub(crate) fn new(available: usize, link_capacity: usize) -> Self {
        Self {
            available: CachePadded::new(AtomicUsize::new(available)),
            link_capacity,
        }
    }

    pub(crate) fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    /// Reserves one link's worth of slots, refusing rather than
    /// oversubscribing the budget.
    pub(crate) fn reserve_link(&self) -> bool {
        let mut available = self.available.load(Ordering::Relaxed);
        loop {
            if available < self.link_capacity {
                return false;
            }
            match self.available.compare_exchange_weak(
                available,
                available - self.link_capacity,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => available = observed,
            }
        }
    }

    pub(crate) fn reclaim(&self, slots: usize) {
        self.available.fetch_add(slots, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }
}
