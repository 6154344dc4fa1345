//! Outbound message batching.
//!
//! Messages queued within one window leave as a single bundle, in the order
//! they were added. The flush timer is armed only when the queue goes from
//! empty to non-empty, so a steady stream of adds cannot postpone a flush
//! forever.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use avaproto::{Bundle, Message};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::transport::Outbound;

#[derive(Default)]
struct Pending {
    queue: Vec<Message>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    out: Arc<dyn Outbound>,
    window: Duration,
    pending: Mutex<Pending>,
    /// Held across take + send so bundles leave in queue order.
    sending: Mutex<()>,
    timetag: AtomicU64,
    flushes: AtomicU64,
}

#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<Inner>,
}

impl MessageBatcher {
    pub fn new(out: Arc<dyn Outbound>, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                out,
                window,
                pending: Mutex::new(Pending::default()),
                sending: Mutex::new(()),
                timetag: AtomicU64::new(1),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    pub async fn add(&self, message: Message) {
        let mut pending = self.inner.pending.lock().await;
        let arm = pending.queue.is_empty();
        pending.queue.push(message);

        if arm {
            let inner = Arc::clone(&self.inner);
            pending.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.window).await;
                inner.flush(true).await;
            }));
        }
    }

    /// Send everything queued as one bundle. Returns false only if a
    /// non-empty bundle failed to send.
    pub async fn flush(&self) -> bool {
        self.inner.flush(false).await
    }

    /// Drop queued messages without sending.
    pub async fn clear(&self) {
        let mut pending = self.inner.pending.lock().await;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        let dropped = pending.queue.len();
        pending.queue.clear();
        if dropped > 0 {
            debug!(dropped, "batch cleared");
        }
    }

    pub async fn pending(&self) -> usize {
        self.inner.pending.lock().await.queue.len()
    }

    /// Bundles sent so far.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }
}

impl Inner {
    async fn flush(&self, from_timer: bool) -> bool {
        let _sending = self.sending.lock().await;

        let messages = {
            let mut pending = self.pending.lock().await;
            if let Some(timer) = pending.timer.take() {
                // The timer task is the caller here; aborting it would cancel
                // this flush at the next await.
                if !from_timer {
                    timer.abort();
                }
            }
            std::mem::take(&mut pending.queue)
        };

        if messages.is_empty() {
            return true;
        }

        let bundle = Bundle::new(self.timetag.fetch_add(1, Ordering::Relaxed), messages);
        trace!(messages = bundle.len(), timetag = bundle.timetag, "flushing batch");
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.out.send_bundle(&bundle).await
    }
}
