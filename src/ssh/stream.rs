//! Transport stream that can be cut from outside the SSH session task.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Wraps the accepted socket handed to the session task. Once `cancel` fires,
/// every pending and future read or write fails, so the session loop ends
/// even when the peer has stopped reading and a write is stuck.
pub struct AbortableStream<S> {
    inner: S,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    aborted: bool,
}

impl<S> AbortableStream<S> {
    pub fn new(inner: S, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
            aborted: false,
        }
    }

    /// Registers the waker with the token, so a parked read or write is
    /// woken by cancellation.
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.aborted && self.cancelled.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        self.aborted
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by server")
}

impl<S: AsyncRead + Unpin> AsyncRead for AbortableStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AbortableStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
