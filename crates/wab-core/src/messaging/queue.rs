//! Single global outbound queue.
//!
//! Every send in the process goes through one FIFO drained by one worker. The
//! worker spaces consecutive sends by at least `min_interval`, measured from the
//! *start* of the previous send, so a slow send does not push later ones back
//! further than the rate cap requires.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::Jid,
    errors::Error,
    messaging::{port::MessageSender, types::OutboundPayload},
    supervisor::ConnectionState,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Minimum spacing between the starts of two consecutive sends.
    pub min_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// An outgoing message owned by the queue until it is sent or fails.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub destination: Jid,
    pub payload: OutboundPayload,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Cheap-to-clone producer handle for the outbound queue.
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    tx: mpsc::UnboundedSender<QueueItem>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    stats: Arc<QueueStats>,
}

impl OutboundQueue {
    /// Create the queue and spawn its worker.
    ///
    /// With `ready`, the worker holds items while the connection is not `Open`
    /// (in-memory buffering across reconnects).
    pub fn spawn(
        sender: Arc<dyn MessageSender>,
        cfg: QueueConfig,
        ready: Option<watch::Receiver<ConnectionState>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let stats = Arc::new(QueueStats::default());

        let worker = Worker {
            rx,
            sender,
            limiter: IntervalLimiter::new(cfg.min_interval),
            ready,
            shutdown: shutdown.clone(),
            stats: stats.clone(),
        };
        let handle = tokio::spawn(worker.run());

        let queue = Self {
            inner: Arc::new(QueueInner {
                tx,
                closed: AtomicBool::new(false),
                shutdown,
                stats,
            }),
        };
        (queue, handle)
    }

    /// Accept an item for delivery. Never blocks; fails only after shutdown.
    pub fn enqueue(&self, destination: Jid, payload: OutboundPayload) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed);
        }
        let item = QueueItem {
            destination,
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
        };
        self.inner.tx.send(item).map_err(|_| Error::QueueClosed)?;
        self.inner.stats.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn send_text(&self, destination: &Jid, text: impl Into<String>) -> Result<()> {
        self.enqueue(destination.clone(), OutboundPayload::text(text))
    }

    /// Stop the worker: nothing further is sent and new items are rejected.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> QueueCounters {
        let s = &self.inner.stats;
        QueueCounters {
            enqueued: s.enqueued.load(Ordering::SeqCst),
            sent: s.sent.load(Ordering::SeqCst),
            failed: s.failed.load(Ordering::SeqCst),
        }
    }
}

struct Worker {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    sender: Arc<dyn MessageSender>,
    limiter: IntervalLimiter,
    ready: Option<watch::Receiver<ConnectionState>>,
    shutdown: CancellationToken,
    stats: Arc<QueueStats>,
}

impl Worker {
    async fn run(mut self) {
        debug!(
            interval_ms = self.limiter.interval.as_millis() as u64,
            "outbound queue worker started"
        );

        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if !self.wait_until_ready().await {
                break;
            }

            let wait = self.limiter.reserve();
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = sleep(wait) => {}
                }
            }

            self.deliver(item).await;
        }

        self.rx.close();
        let mut dropped = 0usize;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(dropped, "outbound queue stopped");
    }

    /// Returns `false` if shutdown was requested while waiting.
    async fn wait_until_ready(&mut self) -> bool {
        let Some(ready) = self.ready.as_mut() else {
            return true;
        };
        if *ready.borrow() == ConnectionState::Open {
            return true;
        }

        debug!("holding outbound items until the connection is open");
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            res = ready.wait_for(|s| *s == ConnectionState::Open) => Some(res.is_ok()),
        };

        match outcome {
            None => false,
            Some(true) => true,
            Some(false) => {
                // Status publisher is gone; stop gating rather than stall forever.
                self.ready = None;
                true
            }
        }
    }

    async fn deliver(&self, mut item: QueueItem) {
        item.attempts += 1;
        let queued_ms = item.enqueued_at.elapsed().as_millis() as u64;

        match self.sender.send(&item.destination, &item.payload).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::SeqCst);
                debug!(
                    to = %item.destination,
                    kind = item.payload.kind(),
                    queued_ms,
                    "outbound message sent"
                );
            }
            Err(e) => {
                // At-most-once: callers decide whether to enqueue again.
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    to = %item.destination,
                    kind = item.payload.kind(),
                    attempts = item.attempts,
                    "outbound send failed: {e}"
                );
            }
        }
    }
}
