//! Single-flight guard shared by generation adapters.
//!
//! Starting a stream cancels the one in flight, counts it as a stale drop
//! and waits a bounded time for it to wind down before proceeding.

use futures_util::stream::{Stream, StreamExt};
use log::{debug, warn};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{ChunkStream, GenerationStats};
use crate::error::Result;

struct InFlight {
    id: u64,
    token: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Held by the live stream; dropping it acknowledges the abort.
pub struct StreamLease {
    id: u64,
    token: CancellationToken,
    finished: watch::Sender<bool>,
}

impl StreamLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let _ = self.finished.send(true);
    }
}

pub struct StreamGuard {
    current: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
    runs: AtomicU64,
    stale_drops: AtomicU64,
    abort_ack_timeout: Duration,
}

impl StreamGuard {
    pub fn new(abort_ack_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            runs: AtomicU64::new(0),
            stale_drops: AtomicU64::new(0),
            abort_ack_timeout,
        }
    }

    /// Claim the single flight slot for a new stream.
    ///
    /// The returned lease's token is a child of `cancel`, so either the
    /// caller or a newer stream can stop it.
    pub async fn begin(&self, cancel: &CancellationToken) -> StreamLease {
        let previous = self.take_current();

        if let Some(prev) = previous {
            let mut finished = prev.finished;
            if !*finished.borrow() {
                prev.token.cancel();
                self.stale_drops.fetch_add(1, Ordering::Relaxed);
                debug!("Cancelled in-flight stream {} for a newer one", prev.id);

                let acked =
                    tokio::time::timeout(self.abort_ack_timeout, finished.wait_for(|done| *done))
                        .await;
                if acked.is_err() {
                    warn!(
                        "Stream {} did not acknowledge abort within {}ms, proceeding",
                        prev.id,
                        self.abort_ack_timeout.as_millis()
                    );
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();
        let (tx, rx) = watch::channel(false);
        self.runs.fetch_add(1, Ordering::Relaxed);

        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        // Another begin may have raced in while we waited for the ack.
        if let Some(raced) = current.replace(InFlight {
            id,
            token: token.clone(),
            finished: rx,
        }) {
            if !*raced.finished.borrow() {
                raced.token.cancel();
                self.stale_drops.fetch_add(1, Ordering::Relaxed);
            }
        }

        StreamLease {
            id,
            token,
            finished: tx,
        }
    }

    /// Cancel the in-flight stream, if any. Does not count as a stale drop.
    pub fn abort(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(in_flight) = current.as_ref() {
            debug!("Aborting stream {}", in_flight.id);
            in_flight.token.cancel();
        }
    }

    pub fn stats(&self) -> GenerationStats {
        GenerationStats {
            runs: self.runs.load(Ordering::Relaxed),
            stale_drops: self.stale_drops.load(Ordering::Relaxed),
        }
    }

    fn take_current(&self) -> Option<InFlight> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Tie `inner` to `lease`: the stream stops yielding once the lease is
/// cancelled and releases the lease when dropped.
pub fn guarded<S>(inner: S, lease: StreamLease) -> ChunkStream
where
    S: Stream<Item = Result<String>> + Send + 'static,
{
    let stop = lease.token().clone().cancelled_owned();
    GuardedStream {
        inner: inner.take_until(stop).boxed(),
        _lease: lease,
    }
    .boxed()
}

struct GuardedStream {
    inner: ChunkStream,
    _lease: StreamLease,
}

impl Stream for GuardedStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
