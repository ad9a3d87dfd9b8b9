#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

/// Implementation notes
///
/// A [`RateBudget`] is a mutex-protected watermark plus an
/// [`event_listener::Event`]. Asking for bandwidth happens in
/// [`budget::RateBudget::try_acquire`], which either grants bytes at once or
/// hands back a `Wait`: a sleep for the computed delay, raced against a
/// listener that fires on reconfiguration. The listener is registered while
/// the lock is held, so a reconfiguration can't slip between "compute the
/// wait" and "start waiting".
///
/// The streams are poll-based, so they can't hold `async fn` futures
/// between calls. They keep an [`acquire::Acquisition`] instead: a small
/// state machine that walks the list of budgets, remembering how far it got
/// and what it is waiting for.
mod implementation_notes {}

mod acquire;
mod budget;
mod config;
mod err;
mod interrupt;
mod io;

use std::sync::Arc;

use tor_rtcompat::SleepProvider;

pub use budget::RateBudget;
pub use config::{
    BudgetConfig, BudgetConfigBuilder, LimiterConfig, LimiterConfigBuilder, DEFAULT_MAX_CHUNK,
    DEFAULT_WAIT_CHUNK,
};
pub use err::Error;
pub use interrupt::Interrupt;
pub use io::{ThrottledReader, ThrottledWriter};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A pair of budgets: one for everything we read, one for everything we
/// write.
///
/// All streams limited through the same `Limiter` share its quota, in each
/// direction.
pub struct Limiter<R: SleepProvider> {
    /// Budget for reads.
    download: Arc<RateBudget<R>>,
    /// Budget for writes.
    upload: Arc<RateBudget<R>>,
}

impl<R: SleepProvider> Limiter<R> {
    /// Create a new `Limiter` with the limits in `cfg`.
    pub fn new(runtime: R, cfg: &LimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            download: RateBudget::with_config(runtime.clone(), cfg.download()),
            upload: RateBudget::with_config(runtime, cfg.upload()),
        })
    }

    /// Replace the limits in both directions.
    pub fn reconfigure(&self, cfg: &LimiterConfig) {
        self.download.reconfigure(cfg.download());
        self.upload.reconfigure(cfg.upload());
    }

    /// Return the budget that reads are charged to.
    pub fn download(&self) -> &Arc<RateBudget<R>> {
        &self.download
    }

    /// Return the budget that writes are charged to.
    pub fn upload(&self) -> &Arc<RateBudget<R>> {
        &self.upload
    }

    /// Wrap `io` so that its reads share this limiter's download quota.
    pub fn limit_read<T>(&self, io: T) -> ThrottledReader<T, R> {
        self.download.limit_read(io)
    }

    /// Wrap `io` so that its writes share this limiter's upload quota.
    pub fn limit_write<T>(&self, io: T) -> ThrottledWriter<T, R> {
        self.upload.limit_write(io)
    }
}
