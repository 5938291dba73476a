//! Progress observation.
//!
//! Both the client and the server can surface live byte counts to a caller
//! callback. The callback runs on its own task, polling shared counters at a
//! fixed interval; the driver only touches atomics on the hot path. One final
//! invocation fires when a transfer completes; a failed transfer stops the
//! task without a further call.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Which way the payload flows, from the requesting client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The peer reads from us (RRQ serving, or a client download).
    Read,
    /// The peer writes to us (WRQ serving, or a client upload).
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "Read"),
            Self::Write => write!(f, "Write"),
        }
    }
}

/// Byte counters handed to a progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Expected transfer size; 0 when the peer never told us.
    pub total_bytes: u64,
    /// Bytes acknowledged so far.
    pub transferred_bytes: u64,
}

impl Progress {
    /// Whether more data is still expected.
    pub fn transfer_active(&self) -> bool {
        self.transferred_bytes < self.total_bytes
    }
}

/// Invoked with a live [`Progress`] snapshot. Must not panic.
pub type ProgressCallback = Box<dyn FnMut(&mut Progress) + Send>;

/// One observable transfer, as reported to a server transfer callback.
///
/// Two values compare equal (and hash equal) iff their peer endpoint and
/// filename match, so a fleet supervisor can key a map by session.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub direction: Direction,
    pub peer: SocketAddr,
    pub filename: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
}

impl PartialEq for TransferInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.filename == other.filename
    }
}

impl Eq for TransferInfo {}

impl Hash for TransferInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        self.filename.hash(state);
    }
}

impl fmt::Display for TransferInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferInfo {{ direction: {}, peer: {}, filename: {}, transferred_bytes: {}, total_bytes: {} }}",
            self.direction, self.peer, self.filename, self.transferred_bytes, self.total_bytes
        )
    }
}

/// Invoked with a live [`TransferInfo`] snapshot. Must not panic.
pub type TransferCallback = Box<dyn FnMut(&mut TransferInfo) + Send>;

/// Counters written by the driver, read by the watcher task.
///
/// Plain relaxed atomics: the display side tolerates slightly stale values.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    total: AtomicU64,
    transferred: AtomicU64,
    done: AtomicBool,
}

impl Counters {
    pub fn new(total: u64) -> Arc<Self> {
        let counters = Self::default();
        counters.total.store(total, Ordering::Relaxed);
        Arc::new(counters)
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            total_bytes: self.total.load(Ordering::Relaxed),
            transferred_bytes: self.transferred.load(Ordering::Relaxed),
        }
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }
}

/// Handle to a spawned watcher task. The driver signals it on every terminal
/// transition and then joins it; the join is unconditional on all exit paths.
pub(crate) struct Watcher {
    counters: Arc<Counters>,
    cancel: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    /// A watcher that does nothing, for callers without a callback.
    pub fn disabled(counters: Arc<Counters>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            counters,
            cancel,
            wake: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Spawn a task that invokes `callback` with a counter snapshot every
    /// `interval` until the transfer finishes or is cancelled.
    pub fn progress(
        counters: Arc<Counters>,
        cancel: Arc<AtomicBool>,
        mut callback: ProgressCallback,
        interval: Duration,
    ) -> Self {
        Self::spawn(counters, cancel, interval, move |snapshot| {
            let mut progress = snapshot;
            callback(&mut progress);
        })
    }

    /// Spawn a task that invokes a server transfer callback with a
    /// [`TransferInfo`] snapshot built around the counters.
    pub fn transfer(
        counters: Arc<Counters>,
        cancel: Arc<AtomicBool>,
        mut callback: TransferCallback,
        interval: Duration,
        template: TransferInfo,
    ) -> Self {
        Self::spawn(counters, cancel, interval, move |snapshot| {
            let mut info = template.clone();
            info.transferred_bytes = snapshot.transferred_bytes;
            info.total_bytes = snapshot.total_bytes;
            callback(&mut info);
        })
    }

    fn spawn(
        counters: Arc<Counters>,
        cancel: Arc<AtomicBool>,
        interval: Duration,
        mut invoke: impl FnMut(Progress) + Send + 'static,
    ) -> Self {
        let wake = Arc::new(Notify::new());
        let task_counters = Arc::clone(&counters);
        let task_cancel = Arc::clone(&cancel);
        let task_wake = Arc::clone(&wake);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = task_wake.notified() => {}
                }
                if task_cancel.load(Ordering::Relaxed) {
                    break;
                }
                let snapshot = task_counters.snapshot();
                invoke(snapshot);
                if task_counters.is_done() {
                    break;
                }
            }
        });

        Self {
            counters,
            cancel,
            wake,
            handle: Some(handle),
        }
    }

    /// Mark the transfer complete, deliver the final callback, and join.
    pub async fn finish(mut self) {
        self.counters.mark_done();
        self.wake.notify_one();
        self.join().await;
    }

    /// Raise the cancel flag and join without a further callback.
    pub async fn abort(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.wake.notify_one();
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_transfer_info_identity_is_peer_and_filename() {
        let a = TransferInfo {
            direction: Direction::Read,
            peer: "127.0.0.1:5000".parse().unwrap(),
            filename: "a.bin".to_string(),
            transferred_bytes: 10,
            total_bytes: 100,
        };
        let mut b = a.clone();
        b.transferred_bytes = 90;
        b.direction = Direction::Write;
        assert_eq!(a, b);

        b.filename = "b.bin".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn test_progress_active() {
        let progress = Progress {
            total_bytes: 10,
            transferred_bytes: 4,
        };
        assert!(progress.transfer_active());

        let done = Progress {
            total_bytes: 10,
            transferred_bytes: 10,
        };
        assert!(!done.transfer_active());
    }

    #[tokio::test]
    async fn test_watcher_fires_final_callback_on_finish() {
        let counters = Counters::new(100);
        let cancel = Arc::new(AtomicBool::new(false));
        let seen: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let watcher = Watcher::progress(
            Arc::clone(&counters),
            cancel,
            Box::new(move |p| sink.lock().unwrap().push(*p)),
            Duration::from_secs(60),
        );

        counters.add_transferred(100);
        watcher.finish().await;

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].transferred_bytes, 100);
    }

    #[tokio::test]
    async fn test_watcher_silent_after_abort() {
        let counters = Counters::new(100);
        let cancel = Arc::new(AtomicBool::new(false));
        let seen: Arc<Mutex<Vec<Progress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let watcher = Watcher::progress(
            counters,
            cancel,
            Box::new(move |p| sink.lock().unwrap().push(*p)),
            Duration::from_secs(60),
        );

        watcher.abort().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
