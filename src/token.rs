use std::sync::Arc;

use crate::next_id;

/// Identity of a live thread. Stacks and weak-order queues hold a
/// `Weak<ThreadToken>` to the thread that owns them; once the thread exits,
/// its thread-local token is dropped and every weak reference clears, which
/// is how the scavenger notices dead producers.
pub(crate) struct ThreadToken {
    id: u64,
}

impl ThreadToken {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

thread_local! {
    static CURRENT: Arc<ThreadToken> = Arc::new(ThreadToken { id: next_id() });
}

/// Token of the calling thread, or `None` when thread-local storage is
/// already being torn down.
pub(crate) fn current() -> Option<Arc<ThreadToken>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Id of the calling thread's token. Returns 0 (never a valid token id)
/// during thread teardown, so comparisons against an owner id simply fail.
#[inline(always)]
pub(crate) fn current_id() -> u64 {
    CURRENT.try_with(|token| token.id).unwrap_or(0)
}
