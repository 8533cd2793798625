//! Facade over the async runtime. Only a tokio multi-thread runtime is
//! wired up here; see `DESIGN.md` for the reasoning behind that
//! choice.

pub type JoinHandle<T> = tokio::task::JoinHandle<T>;
pub type Runtime = tokio::runtime::Runtime;

/// Builds a multi-thread tokio runtime with `num_threads` worker
/// threads.
pub fn init(num_threads: usize) -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads.max(1))
        .thread_name("transit-core-worker")
        .enable_all()
        .build()
}

/// Spawns `future` onto the ambient tokio runtime. Must be called from
/// within a runtime context (a `#[tokio::main]`/`#[tokio::test]`
/// function, or inside `Runtime::block_on`).
#[inline]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// A cooperative cancellation signal shared by every long-running task
/// owned by a connection, the retransmission ticker, and the relay
/// watchdog. Cloning is cheap; all clones observe the same signal.
///
/// Built on `watch` rather than `Notify`: `Notify::notify_waiters`
/// only wakes waiters already registered by a prior poll, so a
/// `cancel()` landing between a waiter's flag check and its first
/// poll is lost and the waiter never wakes. A `watch` receiver always
/// observes the latest value once `changed()` is polled, regardless of
/// when the send happened relative to that poll.
#[derive(Clone)]
pub struct CancellationToken {
    tx: std::sync::Arc<tokio::sync::watch::Sender<bool>>,
    rx: tokio::sync::watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = tokio::sync::watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspends until `cancel()` is called. Returns immediately if
    /// already cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
