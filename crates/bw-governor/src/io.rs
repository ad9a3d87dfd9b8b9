//! Readers and writers that are throttled by one or more [`RateBudget`]s.

use futures::io::{AsyncRead, AsyncWrite};
use futures::ready;
use pin_project::pin_project;
use std::io::{self, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tor_rtcompat::SleepProvider;

use crate::acquire::Acquisition;
use crate::budget::RateBudget;
use crate::interrupt::Interrupt;

/// A reader whose reads are charged to one or more [`RateBudget`]s.
///
/// Each read asks the budgets for permission to read as many bytes as the
/// caller's buffer holds, and then makes a single read from the underlying
/// reader, limited to what was granted. It never retries: a short read is
/// returned as-is.
#[pin_project]
pub struct ThrottledReader<T, R: SleepProvider> {
    /// The budgets to charge, in the order we ask them.
    budgets: Vec<Arc<RateBudget<R>>>,
    /// If present, cancels reads that are waiting for bandwidth.
    interrupt: Option<Interrupt>,
    /// A request for bandwidth that hasn't been granted yet.
    acquiring: Option<Acquisition<R>>,
    /// Bandwidth that was granted, but not yet used, because the underlying
    /// reader wasn't ready.
    granted: Option<usize>,
    /// The underlying reader.
    #[pin]
    inner: T,
}

/// A writer whose writes are charged to one or more [`RateBudget`]s.
///
/// A write asks the budgets for permission for whatever remains of the
/// caller's buffer, writes that much, and repeats for as long as bandwidth
/// is available right away. Once some bytes have been written and the rest
/// would have to wait, the write returns that shorter count; nothing about
/// the caller's buffer is remembered across `Poll::Pending`. Use
/// [`write_all`](futures::io::AsyncWriteExt::write_all) to keep going until
/// every byte has been written.
///
/// If a step fails, earlier bytes of the same buffer may already have
/// reached the underlying writer.
#[pin_project]
pub struct ThrottledWriter<T, R: SleepProvider> {
    /// The budgets to charge, in the order we ask them.
    budgets: Vec<Arc<RateBudget<R>>>,
    /// If present, cancels writes that are waiting for bandwidth.
    interrupt: Option<Interrupt>,
    /// A request for bandwidth that hasn't been granted yet.
    acquiring: Option<Acquisition<R>>,
    /// How many more bytes we have permission to write.
    credit: usize,
    /// The underlying writer.
    #[pin]
    inner: T,
}

impl<T, R: SleepProvider> ThrottledReader<T, R> {
    /// Wrap `inner` so that its reads are charged to `budget`.
    pub fn new(inner: T, budget: Arc<RateBudget<R>>) -> Self {
        Self::with_budgets(inner, [budget])
    }

    /// Wrap `inner` so that its reads are charged to every budget in `budgets`.
    ///
    /// With no budgets at all, reads are not limited.
    pub fn with_budgets(
        inner: T,
        budgets: impl IntoIterator<Item = Arc<RateBudget<R>>>,
    ) -> Self {
        ThrottledReader {
            budgets: budgets.into_iter().collect(),
            interrupt: None,
            acquiring: None,
            granted: None,
            inner,
        }
    }

    /// Make reads that are waiting for bandwidth fail when `interrupt` fires.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Also charge this reader's reads to `budget`.
    pub fn add_budget(&mut self, budget: Arc<RateBudget<R>>) {
        self.budgets.push(budget);
    }

    /// Return a reference to the underlying reader.
    pub fn inner(&self) -> &T {
        &self.inner
    }
    /// Return a mutable reference to the underlying reader.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
    /// Return a pinned mutable reference to the underlying reader.
    pub fn inner_pinned(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }
    /// Consume this reader and return the underlying reader.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead, R: SleepProvider> AsyncRead for ThrottledReader<T, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();

        if buf.is_empty() {
            return this.inner.poll_read(cx, buf);
        }

        let allowed = match *this.granted {
            Some(n) => n,
            None => {
                let acquisition = this
                    .acquiring
                    .get_or_insert_with(|| Acquisition::new(buf.len()));
                let outcome = ready!(acquisition.poll_acquire(
                    cx,
                    this.budgets.as_slice(),
                    this.interrupt.as_ref()
                ));
                *this.acquiring = None;
                let n = outcome?;
                *this.granted = Some(n);
                n
            }
        };

        let limit = allowed.min(buf.len());
        let result = ready!(this.inner.poll_read(cx, &mut buf[..limit]));
        *this.granted = None;
        Poll::Ready(result)
    }
}

impl<T, R: SleepProvider> ThrottledWriter<T, R> {
    /// Wrap `inner` so that its writes are charged to `budget`.
    pub fn new(inner: T, budget: Arc<RateBudget<R>>) -> Self {
        Self::with_budgets(inner, [budget])
    }

    /// Wrap `inner` so that its writes are charged to every budget in `budgets`.
    ///
    /// With no budgets at all, writes are not limited.
    pub fn with_budgets(
        inner: T,
        budgets: impl IntoIterator<Item = Arc<RateBudget<R>>>,
    ) -> Self {
        ThrottledWriter {
            budgets: budgets.into_iter().collect(),
            interrupt: None,
            acquiring: None,
            credit: 0,
            inner,
        }
    }

    /// Make writes that are waiting for bandwidth fail when `interrupt` fires.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Also charge this writer's writes to `budget`.
    pub fn add_budget(&mut self, budget: Arc<RateBudget<R>>) {
        self.budgets.push(budget);
    }

    /// Return a reference to the underlying writer.
    pub fn inner(&self) -> &T {
        &self.inner
    }
    /// Return a mutable reference to the underlying writer.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
    /// Return a pinned mutable reference to the underlying writer.
    pub fn inner_pinned(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }
    /// Consume this writer and return the underlying writer.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite, R: SleepProvider> AsyncWrite for ThrottledWriter<T, R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let mut this = self.project();

        if buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        let mut written = 0;
        // Once we've written part of `buf`, we report that instead of waiting.
        let partial = |n: usize| -> Poll<IoResult<usize>> {
            if n == 0 {
                Poll::Pending
            } else {
                Poll::Ready(Ok(n))
            }
        };

        while written < buf.len() {
            let remaining = buf.len() - written;

            if *this.credit == 0 {
                let acquisition = this
                    .acquiring
                    .get_or_insert_with(|| Acquisition::new(remaining));
                let outcome = match acquisition.poll_acquire(
                    cx,
                    this.budgets.as_slice(),
                    this.interrupt.as_ref(),
                ) {
                    Poll::Ready(outcome) => outcome,
                    Poll::Pending => return partial(written),
                };
                *this.acquiring = None;
                *this.credit = outcome?;
            }

            let chunk = &buf[written..written + remaining.min(*this.credit)];
            match this.inner.as_mut().poll_write(cx, chunk) {
                Poll::Pending => return partial(written),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    written += n;
                    *this.credit = this.credit.saturating_sub(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            }
        }

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_close(cx)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]

    use super::*;
    use crate::{BudgetConfig, Error};
    use futures::future::poll_fn;
    use futures::io::{AsyncReadExt as _, AsyncWriteExt as _, Cursor};
    use futures::task::SpawnExt as _;
    use std::time::Duration;
    use tor_rtmock::MockRuntime;

    /// Return `n` bytes of recognizable data.
    fn data(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    /// Return a budget with the given limits.
    fn budget(rt: &MockRuntime, rate: u64, wait: u64, max: u64) -> Arc<RateBudget<MockRuntime>> {
        RateBudget::with_config(rt.clone(), &BudgetConfig::new(rate, wait, max).unwrap())
    }

    #[test]
    fn read_once_per_call() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let mut r = b.limit_read(Cursor::new(data(5000)));
            let mut buf = vec![0; 4096];

            // The burst caps the first read.
            assert_eq!(r.read(&mut buf).await.unwrap(), 1000);
            assert_eq!(&buf[..1000], &data(1000)[..]);

            // Small reads are charged only for what they ask for.
            rt.advance_by(Duration::from_secs(1)).await;
            assert_eq!(r.read(&mut buf[..300]).await.unwrap(), 300);
            assert_eq!(b.lookahead().0, Duration::from_millis(300));

            // Empty reads cost nothing.
            assert_eq!(r.read(&mut []).await.unwrap(), 0);
            assert_eq!(b.lookahead().0, Duration::from_millis(300));
        });
    }

    #[test]
    fn read_all_throttled() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let start = rt.now();
            let mut r = b.limit_read(Cursor::new(data(3500)));
            let handle = rt
                .spawn_with_handle(async move {
                    let mut out = Vec::new();
                    r.read_to_end(&mut out).await.unwrap();
                    out
                })
                .unwrap();
            rt.advance_until_stalled().await;
            let out = handle.await;
            assert_eq!(out, data(3500));
            assert!(rt.now() - start >= Duration::from_millis(2500));
        });
    }

    /// A reader that returns `Pending` once before every read it lets through.
    struct Hesitant {
        /// Where the data comes from.
        inner: Cursor<Vec<u8>>,
        /// True if the next read should go through.
        ready: bool,
        /// How many times we have returned `Pending`.
        stalls: usize,
    }

    impl AsyncRead for Hesitant {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<IoResult<usize>> {
            if !self.ready {
                self.ready = true;
                self.stalls += 1;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.ready = false;
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    #[test]
    fn read_keeps_grant_while_inner_pending() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let hesitant = Hesitant {
                inner: Cursor::new(data(1000)),
                ready: false,
                stalls: 0,
            };
            let mut r = b.limit_read(hesitant);
            let mut buf = vec![0; 300];

            assert_eq!(r.read(&mut buf).await.unwrap(), 300);
            assert_eq!(buf, data(300));
            // The inner reader stalled, but we only paid once.
            assert_eq!(r.inner().stalls, 1);
            assert_eq!(b.lookahead().0, Duration::from_millis(300));

            assert_eq!(r.read(&mut buf).await.unwrap(), 300);
            assert_eq!(r.inner().stalls, 2);
            assert_eq!(b.lookahead().0, Duration::from_millis(600));
        });
    }

    #[test]
    fn read_eof() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let mut r = ThrottledReader::new(Cursor::new(data(10)), b);
            let mut buf = [0; 64];
            assert_eq!(r.read(&mut buf).await.unwrap(), 10);
            assert_eq!(r.read(&mut buf).await.unwrap(), 0);
            assert_eq!(r.into_inner().position(), 10);
        });
    }

    #[test]
    fn read_two_budgets() {
        MockRuntime::test_with_various(|rt| async move {
            let shared = budget(&rt, 1000, 100, 1000);
            let strict = budget(&rt, 200, 100, 200);
            let mut r = ThrottledReader::with_budgets(
                Cursor::new(data(1000)),
                [shared.clone(), strict.clone()],
            );
            let mut buf = vec![0; 1000];
            // The stricter burst wins...
            assert_eq!(r.read(&mut buf).await.unwrap(), 200);
            // ... but the other budget paid for everything it granted.
            assert_eq!(shared.lookahead().0, Duration::from_secs(1));
            assert_eq!(strict.lookahead().0, Duration::from_secs(1));
        });
    }

    #[test]
    fn read_interrupted() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            assert_eq!(b.acquire(1000).await.unwrap(), 1000);
            let interrupt = Interrupt::new();
            let mut r = b
                .limit_read(Cursor::new(data(100)))
                .with_interrupt(interrupt.clone());
            let handle = rt
                .spawn_with_handle(async move {
                    let mut buf = [0; 100];
                    let e = r.read(&mut buf).await.unwrap_err();
                    (e, r.into_inner().position())
                })
                .unwrap();
            rt.progress_until_stalled().await;
            interrupt.fire();
            rt.progress_until_stalled().await;
            let (e, pos) = handle.await;
            let inner = e.get_ref().unwrap().downcast_ref::<Error>().unwrap();
            assert!(matches!(inner, Error::Cancelled));
            assert_eq!(pos, 0);
        });
    }

    #[test]
    fn write_everything_in_order() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let start = rt.now();
            let mut w = b.limit_write(Vec::new());
            let handle = rt
                .spawn_with_handle(async move {
                    w.write_all(&data(5000)).await.unwrap();
                    w.flush().await.unwrap();
                    w.into_inner()
                })
                .unwrap();
            rt.advance_until_stalled().await;
            let sink = handle.await;
            assert_eq!(sink, data(5000));
            assert!(rt.now() - start >= Duration::from_secs(4));
        });
    }

    #[test]
    fn write_unlimited() {
        MockRuntime::test_with_various(|rt| async move {
            let b = RateBudget::new(rt.clone());
            let mut w = ThrottledWriter::new(Vec::new(), b);
            w.write_all(&data(1 << 20)).await.unwrap();
            w.close().await.unwrap();
            assert_eq!(w.inner().len(), 1 << 20);
        });
    }

    #[test]
    fn write_interrupted() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let interrupt = Interrupt::new();
            let mut w = b.limit_write(Vec::new()).with_interrupt(interrupt.clone());
            let handle = rt
                .spawn_with_handle(async move {
                    let e = w.write_all(&data(3000)).await.unwrap_err();
                    (e, w.into_inner())
                })
                .unwrap();
            rt.progress_until_stalled().await;
            interrupt.fire();
            rt.progress_until_stalled().await;
            let (e, sink) = handle.await;
            let inner = e.get_ref().unwrap().downcast_ref::<Error>().unwrap();
            assert!(matches!(inner, Error::Cancelled));
            // The first burst got through before we were cancelled.
            assert_eq!(sink, data(1000));
        });
    }

    #[test]
    fn write_stops_short_instead_of_waiting() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let mut w = b.limit_write(Vec::new());
            // The burst goes out; the rest would have to wait.
            assert_eq!(w.write(&data(3000)).await.unwrap(), 1000);
            assert_eq!(w.inner(), &data(1000));
        });
    }

    #[test]
    fn abandoned_write_loses_nothing() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let mut w = b.limit_write(Vec::new());
            let handle = rt
                .spawn_with_handle(async move {
                    assert_eq!(w.write(&[b'a'; 3000]).await.unwrap(), 1000);
                    // Start another write, and give up on it while it waits.
                    let abandoned = poll_fn(|cx| {
                        Poll::Ready(Pin::new(&mut w).poll_write(cx, &[b'a'; 3000]))
                    })
                    .await;
                    assert!(abandoned.is_pending());

                    w.write_all(&[b'b'; 2000]).await.unwrap();
                    w.into_inner()
                })
                .unwrap();
            rt.advance_until_stalled().await;
            let sink = handle.await;
            assert_eq!(sink.len(), 3000);
            assert!(sink[..1000].iter().all(|&c| c == b'a'));
            assert!(sink[1000..].iter().all(|&c| c == b'b'));
        });
    }

    /// A writer that accepts at most `max` bytes per call.
    struct Trickle {
        /// Everything written so far.
        out: Vec<u8>,
        /// Most bytes to accept per call.
        max: usize,
        /// Number of calls to `poll_write`.
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<IoResult<usize>> {
            let n = buf.len().min(self.max);
            self.out.extend_from_slice(&buf[..n]);
            self.calls += 1;
            Poll::Ready(Ok(n))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn write_short_inner_writes() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let trickle = Trickle {
                out: Vec::new(),
                max: 64,
                calls: 0,
            };
            let mut w = b.limit_write(trickle);
            // Fits in the burst: one grant, many short inner writes.
            assert_eq!(w.write(&data(640)).await.unwrap(), 640);
            let trickle = w.into_inner();
            assert_eq!(trickle.out, data(640));
            assert_eq!(trickle.calls, 10);
            assert_eq!(b.lookahead().0, Duration::from_millis(640));
        });
    }

    /// A writer that always fails.
    struct Broken;

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<IoResult<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn write_errors_pass_through() {
        MockRuntime::test_with_various(|rt| async move {
            let b = budget(&rt, 1000, 100, 1000);
            let mut w = b.limit_write(Broken);
            let e = w.write(&data(10)).await.unwrap_err();
            assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
        });
    }
}
