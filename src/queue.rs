//! Single-producer/single-consumer queues that carry recycled objects from a
//! foreign thread back to their home stack.

use std::{
    cell::UnsafeCell,
    sync::{atomic::Ordering, Arc, Weak},
};

use log::trace;
use parking_lot::Mutex;

use crate::{
    handle::Entry,
    link::{Link, SharedCapacity},
    next_id,
    stack::{Stack, StackInner},
    token::ThreadToken,
};

/// A queue that makes only moderate guarantees about visibility: within one
/// queue, items are observed in producer order, but an item is not guaranteed
/// to ever be observed at all, which keeps the queue cheap to maintain.
///
/// Each queue has exactly one producer (the foreign thread that created it,
/// which reaches it only through its thread-local delayed map) and exactly
/// one consumer (the home thread of the stack it targets, which reaches it
/// only through that stack's queue list). That discipline is what makes the
/// `prod` and `chain` cells sound.
pub(crate) struct WeakOrderQueue<T> {
    id: u64,
    interval: u32,
    /// Producer liveness; cleared when the producer thread exits.
    producer: Weak<ThreadToken>,
    /// The only piece of the target stack this queue retains, so a queue can
    /// never keep a dead stack alive.
    capacity: Arc<SharedCapacity>,
    /// Producer end of the link chain.
    prod: UnsafeCell<ProducerEnd<T>>,
    /// Consumer end of the link chain; `None` once reclaimed.
    chain: UnsafeCell<Option<Arc<Link<T>>>>,
    /// Intrusive list of queues targeting the same stack.
    next: Mutex<Option<Arc<WeakOrderQueue<T>>>>,
}

struct ProducerEnd<T> {
    tail: Arc<Link<T>>,
    recycle_count: u32,
}

// SAFETY: `prod` is only touched by the single producer thread and `chain`
// only by the target stack's home thread (see the type-level comment); the
// remaining state is atomic or lock-protected.
unsafe impl<T: Send> Send for WeakOrderQueue<T> {}
unsafe impl<T: Send> Sync for WeakOrderQueue<T> {}

impl<T: Send + 'static> WeakOrderQueue<T> {
    /// Allocates a queue carrying objects from `producer` back to `stack`,
    /// reserving the first link up front. Returns `None` when the stack's
    /// shared budget cannot cover that link.
    pub(crate) fn new(stack: &Stack<T>, producer: &Arc<ThreadToken>) -> Option<Arc<Self>> {
        let capacity = stack.shared_capacity().clone();
        if !capacity.reserve_link() {
            return None;
        }
        let first = Arc::new(Link::new(capacity.link_capacity()));
        let interval = stack.delayed_queue_interval();
        Some(Arc::new(Self {
            id: next_id(),
            interval,
            producer: Arc::downgrade(producer),
            capacity,
            prod: UnsafeCell::new(ProducerEnd {
                tail: first.clone(),
                // Seeded at the interval so the first fresh handle is admitted.
                recycle_count: interval,
            }),
            chain: UnsafeCell::new(Some(first)),
            next: Mutex::new(None),
        }))
    }

    pub(crate) fn is_producer_dead(&self) -> bool {
        self.producer.strong_count() == 0
    }

    pub(crate) fn next(&self) -> Option<Arc<Self>> {
        self.next.lock().clone()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Self>>) {
        *self.next.lock() = next;
    }

    /// Producer-side append. Claims the handle, applies the admission filter,
    /// then hands the entry to the link chain. Returns the entry back when it
    /// was not accepted; the caller drops it outside any queue-internal
    /// borrow, since the value's drop code may re-enter the recycler.
    pub(crate) fn add(&self, entry: Entry<T>) -> Option<Entry<T>> {
        if !entry.handle.try_claim(self.id) {
            // A racing recycler already claimed this handle.
            trace!("dropping handle that lost the recycle claim race");
            return Some(entry);
        }

        // SAFETY: this thread is the queue's single producer.
        let prod = unsafe { &mut *self.prod.get() };

        // Enforce the recycle ratio on this side as well as at transfer time,
        // or the queue could grow without control during an allocation burst.
        if !entry.handle.has_been_recycled.load(Ordering::Relaxed) {
            if prod.recycle_count < self.interval {
                prod.recycle_count += 1;
                return Some(entry);
            }
            prod.recycle_count = 1;
        }

        let link_capacity = self.capacity.link_capacity();
        let mut pos = prod.tail.writer_pos();
        if pos == link_capacity {
            match self.new_link() {
                Some(link) => {
                    prod.tail.append(link.clone());
                    prod.tail = link;
                    pos = 0;
                }
                // Shared capacity exhausted.
                None => return Some(entry),
            }
        }
        // SAFETY: `pos` is the tail's current producer position and this
        // thread is the single producer.
        unsafe { prod.tail.publish(pos, entry) };
        None
    }

    fn new_link(&self) -> Option<Arc<Link<T>>> {
        if self.capacity.reserve_link() {
            Some(Arc::new(Link::new(self.capacity.link_capacity())))
        } else {
            None
        }
    }

    /// Consumer-side check used to decide whether a dead producer's queue
    /// still holds undelivered entries.
    pub(crate) fn has_final_data(&self) -> bool {
        // SAFETY: called only by the target stack's home thread.
        let mut link = match unsafe { &*self.chain.get() } {
            Some(link) => link.clone(),
            None => return false,
        };
        loop {
            // SAFETY: reader position is consumer-side state.
            if unsafe { link.reader_pos() } != link.published_pos() {
                return true;
            }
            match link.next() {
                Some(next) => link = next.clone(),
                None => return false,
            }
        }
    }

    /// Consumer-side drain of at most one link into the destination stack.
    /// Returns true when at least one entry landed on the stack. Entries
    /// rejected by the destination's admission filter go into `discarded`.
    pub(crate) fn transfer(
        &self,
        dst: &Stack<T>,
        inner: &mut StackInner<T>,
        discarded: &mut Vec<Entry<T>>,
    ) -> bool {
        let link_capacity = self.capacity.link_capacity();
        // SAFETY: we are on `dst`'s home thread, the single consumer.
        let chain = unsafe { &mut *self.chain.get() };
        let Some(mut link) = chain.clone() else {
            return false;
        };
        // SAFETY: reader position is consumer-side state.
        if unsafe { link.reader_pos() } == link_capacity {
            let Some(next) = link.next().cloned() else {
                return false;
            };
            self.capacity.reclaim(link_capacity);
            *chain = Some(next.clone());
            link = next;
        }

        // SAFETY: as above.
        let src_start = unsafe { link.reader_pos() };
        let mut src_end = link.published_pos();
        if src_start == src_end {
            return false;
        }

        let dst_size = inner.elements.len();
        let expected = dst_size + (src_end - src_start);
        if expected > inner.capacity {
            let actual = dst.increase_capacity(inner, expected);
            src_end = src_end.min(src_start + actual - dst_size);
        }
        if src_start == src_end {
            // The destination stack is already full.
            return false;
        }

        let mut added = 0usize;
        for pos in src_start..src_end {
            // SAFETY: `pos` is below the acquired `published_pos` and this
            // thread is the single consumer.
            let Some(entry) = (unsafe { link.take(pos) }) else {
                continue;
            };
            let last = entry.handle.last_recycled_id.load(Ordering::Relaxed);
            let recycle = entry.handle.recycle_id.load(Ordering::Relaxed);
            if recycle == 0 {
                entry.handle.recycle_id.store(last, Ordering::Relaxed);
            } else if recycle != last {
                panic!("handle recycled multiple times");
            }
            if dst.drop_handle(inner, &entry.handle) {
                discarded.push(entry);
                continue;
            }
            inner.elements.push(entry);
            added += 1;
        }

        if src_end == link_capacity {
            if let Some(next) = link.next().cloned() {
                // This link is spent; give its slots back and move on.
                self.capacity.reclaim(link_capacity);
                *chain = Some(next);
            }
        }
        // SAFETY: consumer-side state.
        unsafe { link.set_reader_pos(src_end) };
        added > 0
    }

    /// Returns the whole chain's slots to the shared budget and severs this
    /// queue from its list. Consumer-side; called once the producer is dead
    /// and the queue has been drained as far as the stack could take it.
    /// Whatever entries remain go into `discarded`.
    pub(crate) fn reclaim_all_space_and_unlink(&self, discarded: &mut Vec<Entry<T>>) {
        // SAFETY: we are on the target stack's home thread.
        let chain = unsafe { &mut *self.chain.get() };
        let mut cursor = chain.take();
        let mut reclaimed = 0usize;
        while let Some(link) = cursor {
            let published = link.published_pos();
            // SAFETY: consumer-side state.
            let read = unsafe { link.reader_pos() };
            for pos in read..published {
                // SAFETY: `pos` is below the acquired `published_pos`.
                if let Some(entry) = unsafe { link.take(pos) } {
                    discarded.push(entry);
                }
            }
            reclaimed += self.capacity.link_capacity();
            cursor = link.next().cloned();
        }
        if reclaimed > 0 {
            self.capacity.reclaim(reclaimed);
        }
        self.set_next(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleState;
    use crate::token;

    fn stack(max_capacity: usize, ratio: u32, link_capacity: usize) -> Arc<Stack<u32>> {
        let token = token::current().unwrap();
        Arc::new(Stack::new(
            next_id(),
            &token,
            max_capacity,
            2,
            ratio,
            16,
            ratio,
            link_capacity,
        ))
    }

    fn entry(stack: &Arc<Stack<u32>>, value: u32) -> Entry<u32> {
        Entry {
            handle: Arc::new(HandleState::new(1, Arc::downgrade(stack))),
            value,
        }
    }

    #[test]
    fn claim_race_loser_is_rejected() {
        let stack = stack(64, 0, 16);
        let token = token::current().unwrap();
        let first = WeakOrderQueue::new(&stack, &token).unwrap();
        let second = WeakOrderQueue::new(&stack, &token).unwrap();

        let item = entry(&stack, 7);
        let handle = item.handle.clone();
        assert!(first.add(item).is_none());
        assert!(first.has_final_data());

        // The handle is already claimed by `first`, so `second` rejects it.
        let rejected = second
            .add(Entry {
                handle,
                value: 7,
            })
            .unwrap();
        assert_eq!(rejected.value, 7);
        assert!(!second.has_final_data());
    }

    #[test]
    fn add_rolls_over_into_new_links_until_budget_runs_out() {
        // Budget: max(16 / 2, 16) = 16 slots, exactly one link.
        let stack = stack(16, 0, 16);
        let token = token::current().unwrap();
        let queue = WeakOrderQueue::new(&stack, &token).unwrap();
        assert_eq!(stack.shared_capacity().available(), 0);

        let mut rejected = 0;
        for i in 0..24 {
            if queue.add(entry(&stack, i)).is_some() {
                rejected += 1;
            }
        }
        // One link of 16 filled, the rest could not get a second link.
        assert_eq!(rejected, 8);
    }

    #[test]
    fn reclaim_returns_every_link_to_the_budget() {
        // Budget: max(256 / 2, 16) = 128 slots.
        let stack = stack(256, 0, 16);
        let token = token::current().unwrap();
        let queue = WeakOrderQueue::new(&stack, &token).unwrap();
        for i in 0..40 {
            assert!(queue.add(entry(&stack, i)).is_none());
        }
        // Three links held: 128 - 48 left.
        assert_eq!(stack.shared_capacity().available(), 80);

        let mut discarded = Vec::new();
        queue.reclaim_all_space_and_unlink(&mut discarded);
        assert_eq!(discarded.len(), 40);
        assert_eq!(stack.shared_capacity().available(), 128);
        assert!(!queue.has_final_data());
    }
}
