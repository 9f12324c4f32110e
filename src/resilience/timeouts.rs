//! Timeout enforcement.
//!
//! # Responsibilities
//! - Bound how long a stream may sit without making progress
//! - Bound single operations (header read, origin connect)
//!
//! # Design Decisions
//! - Uses Tokio's timer facilities
//! - Expiry surfaces as an `io::ErrorKind::TimedOut` error, so callers
//!   handle it like any other I/O failure
//! - Read and write directions have separate timers; a stalled reader does
//!   not fail a writer that is still making progress

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Run `future` with a deadline, mapping expiry to `TimedOut`.
pub async fn with_deadline<F, T>(limit: Duration, what: &'static str, future: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", what, limit),
        )),
    }
}

/// One direction's inactivity timer.
#[derive(Debug)]
struct IdleTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl IdleTimer {
    fn new(limit: Duration) -> Self {
        Self {
            sleep: Box::pin(tokio::time::sleep(limit)),
            armed: false,
        }
    }

    /// Called when the inner stream is pending. Starts the countdown on the
    /// first stall and reports whether it has run out.
    fn poll_expired(&mut self, limit: Duration, cx: &mut Context<'_>) -> bool {
        if !self.armed {
            self.sleep.as_mut().reset(Instant::now() + limit);
            self.armed = true;
        }
        self.sleep.as_mut().poll(cx).is_ready()
    }

    fn progress(&mut self) {
        self.armed = false;
    }
}

/// Stream wrapper that fails reads and writes stalled for longer than
/// `limit`.
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    limit: Duration,
    read: IdleTimer,
    write: IdleTimer,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            read: IdleTimer::new(limit),
            write: IdleTimer::new(limit),
        }
    }
}

fn idle_error(limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no progress for {:?}", limit),
    )
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read.progress();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.read.poll_expired(this.limit, cx) {
                    this.read.progress();
                    Poll::Ready(Err(idle_error(this.limit)))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write.progress();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.write.poll_expired(this.limit, cx) {
                    this.write.progress();
                    Poll::Ready(Err(idle_error(this.limit)))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write.progress();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.write.poll_expired(this.limit, cx) {
                    this.write.progress();
                    Poll::Ready(Err(idle_error(this.limit)))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn stalled_read_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut guarded = IdleTimeout::new(server, Duration::from_secs(5));

        let mut buf = [0u8; 8];
        let err = guarded.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_timer() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut guarded = IdleTimeout::new(server, Duration::from_secs(5));

        let feeder = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_secs(3)).await;
                client.write_all(b"x").await.unwrap();
            }
        });

        let mut buf = [0u8; 1];
        for _ in 0..4 {
            guarded.read_exact(&mut buf).await.unwrap();
        }
        feeder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let (_client, server) = tokio::io::duplex(4);
        let mut guarded = IdleTimeout::new(server, Duration::from_secs(5));

        let err = guarded.write_all(b"more than four bytes").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_maps_to_timed_out() {
        let err = with_deadline(Duration::from_secs(1), "connect", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, io::Error>(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("connect"));
    }
}
