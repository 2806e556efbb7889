//! Active connection accounting and I/O deadlines
//!
//! Every stream handed to a front end carries an [`ActiveSlot`]. The slot
//! is reserved before any transport is touched and released exactly once,
//! whichever of explicit close or drop happens first.

use crate::logsink::DiagnosticLog;
use ssh2proxy_transport::{BoxedStream, SharedTransport};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tracing::debug;

/// Counter of open tracked streams with a hard ceiling
#[derive(Debug)]
pub struct ConnectionAccounting {
    active: AtomicUsize,
    ceiling: usize,
}

impl ConnectionAccounting {
    pub fn new(ceiling: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            ceiling,
        })
    }

    /// Reserve one slot, or `None` when the ceiling is reached
    ///
    /// Check and increment are a single compare-exchange, so concurrent
    /// callers can never push the count past the ceiling.
    pub fn try_reserve(self: &Arc<Self>) -> Option<ActiveSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.ceiling).then_some(current + 1)
            })
            .ok()?;

        Some(ActiveSlot {
            accounting: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn has_capacity(&self) -> bool {
        self.active() < self.ceiling
    }
}

/// One reserved unit of the active count
#[derive(Debug)]
pub struct ActiveSlot {
    accounting: Arc<ConnectionAccounting>,
    released: AtomicBool,
}

impl ActiveSlot {
    /// Give the slot back. Returns `true` only for the call that actually
    /// decremented the count.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.accounting.active.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Count after this slot was taken (or released)
    pub fn active(&self) -> usize {
        self.accounting.active()
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Fails a read or write with `TimedOut` when it makes no progress within
/// its deadline. Each operation that has to wait starts a fresh timer.
pub struct DeadlineStream<S> {
    inner: S,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            inner,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
    what: &str,
) -> Poll<io::Error> {
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", what, timeout),
            ))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read").map(Err)
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write").map(Err)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "flush").map(Err)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_shutdown(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "shutdown")
                    .map(Err)
            }
        }
    }
}

/// A channel to a target with deadlines, a reserved slot and a close hook
///
/// Dropping the stream (or calling [`TrackedStream::close`]) releases the
/// slot and logs the closure once. A pooled transport taken for this
/// stream alone is closed along with it.
pub struct TrackedStream {
    inner: DeadlineStream<BoxedStream>,
    slot: ActiveSlot,
    target: String,
    log: DiagnosticLog,
    owned_transport: Option<SharedTransport>,
}

impl TrackedStream {
    pub fn new(
        inner: DeadlineStream<BoxedStream>,
        slot: ActiveSlot,
        target: String,
        log: DiagnosticLog,
    ) -> Self {
        Self {
            inner,
            slot,
            target,
            log,
            owned_transport: None,
        }
    }

    /// Close `transport` when this stream goes away
    pub fn owning(mut self, transport: SharedTransport) -> Self {
        self.owned_transport = Some(transport);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run the close hook now. Later calls (and the drop) do nothing.
    pub fn close(&self) {
        if self.slot.release() {
            self.log.debug(format!(
                "Connection to {} closed (active: {})",
                self.target,
                self.slot.active()
            ));
        }
    }
}

impl std::fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedStream")
            .field("target", &self.target)
            .field("released", &self.slot.is_released())
            .finish()
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.close();
        if let Some(transport) = self.owned_transport.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { transport.close().await });
                }
                Err(_) => {
                    debug!(
                        connection_id = %transport.connection_id(),
                        "No runtime to close pooled transport"
                    );
                }
            }
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
