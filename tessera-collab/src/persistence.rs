//! FIFO persistence worker.
//!
//! Storage calls block, so they run on one dedicated thread fed by an
//! unbounded channel. Jobs execute strictly in submission order: an append
//! enqueued before a load is visible to that load, and appends for one
//! document are stored in the order the relay received them.
//!
//! ```text
//!  connection tasks ──► PersistenceHandle ──(mpsc, FIFO)──► worker thread
//!         ▲                                                     │
//!         └──────────────── oneshot replies ◄───────────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::storage::{PersistedDocument, Persistence, StoreError};

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum Job {
    Load { doc_id: String, reply: Reply<PersistedDocument> },
    Append { doc_id: String, update: Vec<u8>, reply: Reply<u64> },
    Compact { doc_id: String, reply: Reply<u64> },
    PendingUpdates { doc_id: String, reply: Reply<u64> },
    ListDocuments { prefix: String, reply: Reply<Vec<String>> },
    Flush { reply: Reply<()> },
    Shutdown { reply: Reply<()> },
}

/// Resolves once the worker has stored (or failed to store) one append.
#[derive(Debug)]
pub struct AppendReceipt(oneshot::Receiver<Result<u64, StoreError>>);

impl AppendReceipt {
    /// Sequence number assigned by the store.
    pub async fn wait(self) -> Result<u64, StoreError> {
        self.0.await.map_err(|_| StoreError::WorkerStopped)?
    }
}

/// Cloneable handle to the worker thread.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<Job>,
    queued: Arc<AtomicUsize>,
}

impl PersistenceHandle {
    /// Start the worker thread over `store`.
    pub fn spawn(store: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        std::thread::Builder::new()
            .name("tessera-persistence".to_owned())
            .spawn({
                let queued = queued.clone();
                move || run_worker(store, rx, queued)
            })
            .map_err(|e| StoreError::Database(format!("Failed to start persistence worker: {e}")))?;

        Ok(Self { tx, queued })
    }

    /// Queue an append. Ordering is fixed at the moment of this call.
    pub fn append(&self, doc_id: &str, update: Vec<u8>) -> Result<AppendReceipt, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Append {
            doc_id: doc_id.to_owned(),
            update,
            reply,
        })?;
        Ok(AppendReceipt(rx))
    }

    pub async fn load(&self, doc_id: &str) -> Result<PersistedDocument, StoreError> {
        let doc_id = doc_id.to_owned();
        self.call(|reply| Job::Load { doc_id, reply }).await
    }

    pub async fn compact(&self, doc_id: &str) -> Result<u64, StoreError> {
        let doc_id = doc_id.to_owned();
        self.call(|reply| Job::Compact { doc_id, reply }).await
    }

    pub async fn pending_updates(&self, doc_id: &str) -> Result<u64, StoreError> {
        let doc_id = doc_id.to_owned();
        self.call(|reply| Job::PendingUpdates { doc_id, reply }).await
    }

    pub async fn list_documents(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_owned();
        self.call(|reply| Job::ListDocuments { prefix, reply }).await
    }

    /// Resolves after every job queued before it has run and the store is flushed.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.call(|reply| Job::Flush { reply }).await
    }

    /// Drain the queue, flush, and stop the worker. Later calls fail with
    /// [`StoreError::WorkerStopped`].
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.call(|reply| Job::Shutdown { reply }).await
    }

    /// Jobs submitted but not yet picked up by the worker.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    fn submit(&self, job: Job) -> Result<(), StoreError> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.tx.send(job).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            StoreError::WorkerStopped
        })
    }

    async fn call<T>(&self, job: impl FnOnce(Reply<T>) -> Job) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.submit(job(reply))?;
        rx.await.map_err(|_| StoreError::WorkerStopped)?
    }
}

fn run_worker(store: Arc<dyn Persistence>, mut rx: mpsc::UnboundedReceiver<Job>, queued: Arc<AtomicUsize>) {
    log::debug!("Persistence worker started");
    let mut shutdown_reply = None;

    while let Some(job) = rx.blocking_recv() {
        queued.fetch_sub(1, Ordering::Relaxed);
        match job {
            Job::Load { doc_id, reply } => {
                let _ = reply.send(store.load(&doc_id));
            }
            Job::Append { doc_id, update, reply } => {
                let result = store.append(&doc_id, &update);
                if let Err(e) = &result {
                    log::error!("Append to {doc_id} failed: {e}");
                }
                let _ = reply.send(result);
            }
            Job::Compact { doc_id, reply } => {
                let _ = reply.send(store.compact(&doc_id));
            }
            Job::PendingUpdates { doc_id, reply } => {
                let _ = reply.send(store.pending_updates(&doc_id));
            }
            Job::ListDocuments { prefix, reply } => {
                let _ = reply.send(store.list_documents(&prefix));
            }
            Job::Flush { reply } => {
                let _ = reply.send(store.flush());
            }
            Job::Shutdown { reply } => {
                rx.close();
                // Jobs that slipped in before the close still run.
                while let Ok(job) = rx.try_recv() {
                    queued.fetch_sub(1, Ordering::Relaxed);
                    drain_late(&*store, job);
                }
                shutdown_reply = Some(reply);
                break;
            }
        }
    }

    let flushed = store.flush();
    if let Err(e) = &flushed {
        log::warn!("Final flush failed: {e}");
    }
    // Release the store (and its file locks) before anyone hears we stopped.
    drop(store);
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(flushed);
    }
    log::debug!("Persistence worker stopped");
}

fn drain_late(store: &dyn Persistence, job: Job) {
    match job {
        Job::Append { doc_id, update, reply } => {
            let _ = reply.send(store.append(&doc_id, &update));
        }
        Job::Load { reply, .. } => {
            let _ = reply.send(Err(StoreError::WorkerStopped));
        }
        Job::Compact { reply, .. } | Job::PendingUpdates { reply, .. } => {
            let _ = reply.send(Err(StoreError::WorkerStopped));
        }
        Job::ListDocuments { reply, .. } => {
            let _ = reply.send(Err(StoreError::WorkerStopped));
        }
        Job::Flush { reply } | Job::Shutdown { reply } => {
            let _ = reply.send(Err(StoreError::WorkerStopped));
        }
    }
}
