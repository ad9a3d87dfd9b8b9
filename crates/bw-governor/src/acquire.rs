//! Poll-driven acquisition of bandwidth from one or more budgets.
//!
//! The throttled streams can't hold an `async fn` future across calls to
//! `poll_read` or `poll_write`, so they keep one of these instead.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

use event_listener::EventListener;
use futures::ready;
use tor_rtcompat::SleepProvider;

use crate::budget::{Grant, RateBudget, Wait};
use crate::interrupt::Interrupt;
use crate::{Error, Result};

/// An in-progress request for permission to move some bytes.
///
/// Budgets are asked in order; each is asked only for the amount that the
/// ones before it granted, so the smallest grant wins.
pub(crate) struct Acquisition<R: SleepProvider> {
    /// How many bytes we're asking for now.
    amount: usize,
    /// Index of the next budget to ask.
    next: usize,
    /// What we're waiting for before asking `budgets[next]` again, if anything.
    waiting: Option<Wait<R>>,
    /// Listener for our interrupt, if we're waiting and have one.
    interrupt_listener: Option<EventListener>,
}

impl<R: SleepProvider> Acquisition<R> {
    /// Start a new request for `amount` bytes.
    pub(crate) fn new(amount: usize) -> Self {
        Acquisition {
            amount,
            next: 0,
            waiting: None,
            interrupt_listener: None,
        }
    }

    /// Try to make progress on this request.
    ///
    /// `budgets` must be the same on every call.
    ///
    /// Returns the number of bytes granted by every budget once we have
    /// permission from all of them.
    pub(crate) fn poll_acquire<B>(
        &mut self,
        cx: &mut Context<'_>,
        budgets: &[B],
        interrupt: Option<&Interrupt>,
    ) -> Poll<Result<usize>>
    where
        B: Deref<Target = RateBudget<R>>,
    {
        loop {
            if let Some(wait) = self.waiting.as_mut() {
                if let Some(interrupt) = interrupt {
                    if interrupt.is_fired() {
                        return Poll::Ready(Err(self.cancel()));
                    }
                    match self.interrupt_listener.as_mut() {
                        None => {
                            self.interrupt_listener = Some(interrupt.listen());
                            // Check again, now that we can't miss it.
                            continue;
                        }
                        Some(listener) => {
                            if Pin::new(listener).poll(cx).is_ready() {
                                self.interrupt_listener = None;
                                continue;
                            }
                        }
                    }
                }
                let () = ready!(Pin::new(wait).poll(cx));
                self.waiting = None;
            }

            let Some(budget) = budgets.get(self.next) else {
                self.interrupt_listener = None;
                return Poll::Ready(Ok(self.amount));
            };
            match budget.try_acquire(self.amount) {
                Grant::Ready(n) => {
                    self.amount = n;
                    self.next += 1;
                }
                Grant::Wait(_) if interrupt.is_some_and(Interrupt::is_fired) => {
                    return Poll::Ready(Err(self.cancel()));
                }
                Grant::Wait(wait) => self.waiting = Some(wait),
            }
        }
    }

    /// Give up on this request, and return the error to report.
    fn cancel(&mut self) -> Error {
        self.waiting = None;
        self.interrupt_listener = None;
        Error::Cancelled
    }
}
