//! The [`RateBudget`] itself: a bandwidth allowance shared by many streams.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use event_listener::{Event, EventListener};
use tor_error::bad_api_usage;
use tor_rtcompat::SleepProvider;
use tracing::{debug, trace};

use crate::acquire::Acquisition;
use crate::config::BudgetConfig;
use crate::interrupt::Interrupt;
use crate::io::{ThrottledReader, ThrottledWriter};
use crate::Result;

/// Number of nanoseconds in one second.
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Return how long it takes to move `bytes` at `bytes_per_sec`, rounded up to
/// the next nanosecond.
///
/// `bytes_per_sec` must be nonzero.
fn duration_for(bytes: u64, bytes_per_sec: u64) -> Duration {
    let nanos = (u128::from(bytes) * NANOS_PER_SEC).div_ceil(u128::from(bytes_per_sec));
    // Since bytes_per_sec >= 1, the number of seconds fits in a u64.
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    // Always < 1e9, so this can't fail.
    let subsec = u32::try_from(nanos % NANOS_PER_SEC).unwrap_or(0);
    Duration::new(secs, subsec)
}

/// Return how many whole bytes can be moved in `dur` at `bytes_per_sec`.
fn bytes_in(dur: Duration, bytes_per_sec: u64) -> u64 {
    let bytes = dur.as_nanos() * u128::from(bytes_per_sec) / NANOS_PER_SEC;
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// Convert a byte count to `usize`, saturating.
fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Convert a byte count to `u64`, saturating.
fn to_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// The mutable part of a [`RateBudget`], which is only ever touched with the
/// lock held.
#[derive(Debug)]
struct BudgetState {
    /// The limits currently in force.
    config: BudgetConfig,
    /// How long it takes to accumulate `max_chunk` bytes at the current rate.
    ///
    /// `None` if the rate is unlimited.
    window: Option<Duration>,
    /// The point (as an offset from the budget's epoch) up to which
    /// bandwidth has already been spent.
    ///
    /// Invariant: whenever the rate is limited, this is no further ahead
    /// of the present than `window`.
    consumed_until: Duration,
}

impl BudgetState {
    /// Replace the configuration, keeping the watermark within the new window.
    fn set_config(&mut self, config: BudgetConfig, now: Duration) {
        self.window = (!config.is_unlimited())
            .then(|| duration_for(config.max_chunk(), config.bytes_per_sec()));
        if let Some(window) = self.window {
            self.consumed_until = self.consumed_until.min(now.saturating_add(window));
        }
        self.config = config;
    }
}

/// The outcome of asking a budget for bandwidth once.
pub(crate) enum Grant<R: SleepProvider> {
    /// This many bytes (never more than requested, never zero for a nonzero
    /// request) may be moved now.
    Ready(usize),
    /// Nothing may be moved now; ask again once this completes.
    Wait(Wait<R>),
}

/// A future that becomes ready when it is worth asking a budget again:
/// either the needed time has passed, or the budget was reconfigured.
pub(crate) struct Wait<R: SleepProvider> {
    /// Sleep until enough bandwidth should be available.
    sleep: Pin<Box<R::SleepFuture>>,
    /// Ready when the budget is reconfigured.
    reconfigured: EventListener,
}

impl<R: SleepProvider> Future for Wait<R> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if Pin::new(&mut this.reconfigured).poll(cx).is_ready() {
            return Poll::Ready(());
        }
        this.sleep.as_mut().poll(cx)
    }
}

/// A bandwidth allowance that can be shared by any number of readers and
/// writers.
///
/// Each stream attached to a `RateBudget` asks it for permission before
/// moving bytes; all of them together are held to the budget's rate.
///
/// Internally the budget is a single timestamp: bandwidth is "spent" up to
/// some point in time, and a request for `n` bytes pushes that point forward
/// by the time it takes to send `n` bytes. The point may run ahead of the
/// present by at most the time to send `max_chunk` bytes; that bounds the
/// burst. There is no refill task: the passage of time does the refilling.
pub struct RateBudget<R: SleepProvider> {
    /// Source of time, and of sleeping.
    runtime: R,
    /// When this budget was created; offsets in the state are relative to this.
    epoch: Instant,
    /// The configuration and watermark.
    state: Mutex<BudgetState>,
    /// Notified, for all listeners, whenever the configuration changes.
    reconfigured: Event,
}

impl<R: SleepProvider> RateBudget<R> {
    /// Create a new, unlimited, budget.
    pub fn new(runtime: R) -> Arc<Self> {
        Self::with_config(runtime, &BudgetConfig::default())
    }

    /// Create a new budget with the limits in `config`.
    pub fn with_config(runtime: R, config: &BudgetConfig) -> Arc<Self> {
        let epoch = runtime.now();
        let mut state = BudgetState {
            config: config.clone(),
            window: None,
            consumed_until: Duration::ZERO,
        };
        state.set_config(config.clone(), Duration::ZERO);
        Arc::new(RateBudget {
            runtime,
            epoch,
            state: Mutex::new(state),
            reconfigured: Event::new(),
        })
    }

    /// Return a copy of the configuration currently in force.
    pub fn config(&self) -> BudgetConfig {
        self.state.lock().expect("poisoned lock").config.clone()
    }

    /// Replace this budget's limits.
    ///
    /// Every request currently waiting on this budget wakes up and
    /// recomputes its wait under the new limits.
    pub fn reconfigure(&self, config: &BudgetConfig) {
        {
            let now = self.now();
            let mut state = self.state.lock().expect("poisoned lock");
            state.set_config(config.clone(), now);
        }
        debug!(
            bytes_per_sec = config.bytes_per_sec(),
            wait_chunk = config.wait_chunk(),
            max_chunk = config.max_chunk(),
            "Reconfigured bandwidth budget"
        );
        self.reconfigured.notify(usize::MAX);
    }

    /// Replace this budget's limits with the given rate and chunk sizes.
    ///
    /// On failure, the previous limits stay in force.
    pub fn set_limits(&self, bytes_per_sec: u64, wait_chunk: u64, max_chunk: u64) -> Result<()> {
        let config = BudgetConfig::new(bytes_per_sec, wait_chunk, max_chunk)?;
        self.reconfigure(&config);
        Ok(())
    }

    /// Wait for permission to move up to `amount` bytes.
    ///
    /// Returns the number of bytes granted, which is between 1 and `amount`.
    /// Once this returns, the bytes count as spent whether or not the caller
    /// uses them.
    ///
    /// Dropping the returned future before it completes spends nothing.
    pub async fn acquire(&self, amount: usize) -> Result<usize> {
        self.acquire_inner(amount, None).await
    }

    /// As [`acquire`](Self::acquire), but fail with
    /// [`Error::Cancelled`](crate::Error::Cancelled) if `interrupt` is fired
    /// while we would be waiting.
    pub async fn acquire_interruptible(
        &self,
        amount: usize,
        interrupt: &Interrupt,
    ) -> Result<usize> {
        self.acquire_inner(amount, Some(interrupt)).await
    }

    /// Helper: implement `acquire` and `acquire_interruptible`.
    async fn acquire_inner(&self, amount: usize, interrupt: Option<&Interrupt>) -> Result<usize> {
        if amount == 0 {
            return Err(bad_api_usage!("Asked a bandwidth budget for zero bytes").into());
        }
        let budgets = [self];
        let mut acquisition = Acquisition::new(amount);
        futures::future::poll_fn(|cx| acquisition.poll_acquire(cx, &budgets, interrupt)).await
    }

    /// Wrap `io` so that every read it performs is charged to this budget.
    pub fn limit_read<T>(self: &Arc<Self>, io: T) -> ThrottledReader<T, R> {
        ThrottledReader::new(io, Arc::clone(self))
    }

    /// Wrap `io` so that every write it performs is charged to this budget.
    pub fn limit_write<T>(self: &Arc<Self>, io: T) -> ThrottledWriter<T, R> {
        ThrottledWriter::new(io, Arc::clone(self))
    }

    /// Return the current time as an offset from our epoch.
    fn now(&self) -> Duration {
        self.runtime.now().saturating_duration_since(self.epoch)
    }

    /// Ask once for permission to move `requested` bytes.
    ///
    /// Either grants some bytes immediately, or says what to wait for before
    /// asking again.
    pub(crate) fn try_acquire(&self, requested: usize) -> Grant<R> {
        let now = self.now();
        let mut state = self.state.lock().expect("poisoned lock");
        let Some(window) = state.window else {
            return Grant::Ready(requested);
        };
        let rate = state.config.bytes_per_sec();
        let wait_chunk = state.config.wait_chunk();
        let requested_bytes = to_u64(requested);

        // Credit that is already spent, and what's left of the window.
        let idle = state.consumed_until.saturating_sub(now);
        let usable = window.saturating_sub(idle);
        let immediate = bytes_in(usable, rate);
        let base = now.saturating_add(idle);

        if immediate >= requested_bytes {
            state.consumed_until = base.saturating_add(duration_for(requested_bytes, rate));
            Grant::Ready(requested)
        } else if immediate >= wait_chunk {
            // Partial grant: spend the whole window.
            state.consumed_until = base.saturating_add(usable);
            trace!(requested, granted = immediate, "Partial bandwidth grant");
            Grant::Ready(to_usize(immediate))
        } else {
            let needed = duration_for(wait_chunk.min(requested_bytes), rate);
            let delay = needed.saturating_sub(usable);
            // Listen before we drop the lock, so that we can't miss a
            // reconfiguration.
            let reconfigured = self.reconfigured.listen();
            drop(state);
            trace!(requested, ?delay, "Waiting for bandwidth");
            Grant::Wait(Wait {
                sleep: Box::pin(self.runtime.sleep(delay)),
                reconfigured,
            })
        }
    }

    /// Return how far the watermark currently runs ahead of the present,
    /// and the current window.
    #[cfg(test)]
    pub(crate) fn lookahead(&self) -> (Duration, Option<Duration>) {
        let now = self.now();
        let state = self.state.lock().expect("poisoned lock");
        (state.consumed_until.saturating_sub(now), state.window)
    }
}

impl<R: SleepProvider> fmt::Debug for RateBudget<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateBudget")
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
