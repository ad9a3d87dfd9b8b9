//! A shareable signal for cancelling requests that are waiting for bandwidth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use event_listener::{Event, EventListener};

/// A handle that can cancel every bandwidth request made on its behalf.
///
/// Clones share state: firing any clone fires them all. Once fired, an
/// `Interrupt` stays fired; every later request that would need to wait
/// fails with [`Error::Cancelled`](crate::Error::Cancelled).
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    /// The shared state.
    inner: Arc<InterruptInner>,
}

/// Shared state for an [`Interrupt`].
#[derive(Debug, Default)]
struct InterruptInner {
    /// True once we've been fired.
    fired: AtomicBool,
    /// Notified when we are fired.
    event: Event,
}

impl Interrupt {
    /// Create a new, unfired, interrupt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire this interrupt, waking every request that is waiting on it.
    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.event.notify(usize::MAX);
    }

    /// Return true if this interrupt has been fired.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Return a listener that becomes ready when this interrupt is next fired.
    ///
    /// Callers must check [`is_fired`](Self::is_fired) *after* creating the
    /// listener, or they can miss a wakeup.
    pub(crate) fn listen(&self) -> EventListener {
        self.inner.event.listen()
    }
}
