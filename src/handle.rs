use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};

use crate::stack::Stack;

/// Lifecycle metadata for one pooled object.
///
/// The id pair is the whole state machine: both zero means the object is out
/// with user code and may be recycled; `last_recycled_id` alone set means the
/// object is in flight through a weak-order queue; both equal and non-zero
/// means it is resident on its home stack. `last_recycled_id` is the single
/// compare-and-set arbitration point between racing recyclers.
pub(crate) struct HandleState<T> {
    pub(crate) recycler_id: u64,
    /// Weak so that outstanding handles never pin a dead home thread's stack.
    pub(crate) home: Weak<Stack<T>>,
    pub(crate) last_recycled_id: AtomicU64,
    pub(crate) recycle_id: AtomicU64,
    pub(crate) has_been_recycled: AtomicBool,
}

impl<T> HandleState<T> {
    pub(crate) fn new(recycler_id: u64, home: Weak<Stack<T>>) -> Self {
        Self {
            recycler_id,
            home,
            last_recycled_id: AtomicU64::new(0),
            recycle_id: AtomicU64::new(0),
            has_been_recycled: AtomicBool::new(false),
        }
    }

    /// Claim used on the home path. A spurious failure here would surface as
    /// a bogus double-recycle error, so this is the strong variant.
    #[inline(always)]
    pub(crate) fn claim(&self, id: u64) -> bool {
        self.last_recycled_id
            .compare_exchange(0, id, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Claim used on the foreign path. Only atomicity matters there; a loss,
    /// spurious or real, just drops the handle.
    #[inline(always)]
    pub(crate) fn try_claim(&self, id: u64) -> bool {
        self.last_recycled_id
            .compare_exchange_weak(0, id, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// A pooled object travelling together with its lifecycle state. Stacks and
/// links store entries; `Recycler::get` splits the value back out.
pub(crate) struct Entry<T> {
    pub(crate) handle: Arc<HandleState<T>>,
    pub(crate) value: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let state: HandleState<u32> = HandleState::new(1, Weak::new());
        assert!(state.claim(7));
        assert!(!state.claim(8));
        assert_eq!(state.last_recycled_id.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn racing_claims_have_one_winner() {
        let state: Arc<HandleState<u32>> = Arc::new(HandleState::new(1, Weak::new()));
        let wins: usize = std::thread::scope(|scope| {
            (0..4u64)
                .map(|i| {
                    let state = state.clone();
                    scope.spawn(move || {
                        let mut won = false;
                        // The weak claim may fail spuriously, never succeed twice.
                        for _ in 0..1_000 {
                            won |= state.try_claim(10 + i);
                        }
                        usize::from(won)
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum()
        });
        assert_eq!(wins, 1);
    }
}
