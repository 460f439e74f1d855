//! Single-writer queue in front of the staging store.
//!
//! Every mutation goes through one worker thread, in the order it was enqueued.
//! Reads go straight to the store.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
};

use tallybridge_core::{StorageError, Store};
use tokio::sync::{mpsc, oneshot};

use crate::error::BridgeError;

type Job = Box<dyn FnOnce(&dyn Store) + Send>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub struct WriteSerializer {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

/// Handle to an enqueued write.
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

impl<T> Pending<T> {
    /// Blocks until the worker has run the op. Call from a blocking context.
    pub fn wait(self) -> Result<T, BridgeError> {
        self.rx.blocking_recv().map_err(|_| BridgeError::WriterClosed)?
    }
}

impl WriteSerializer {
    pub fn start(store: Arc<dyn Store>, capacity: usize) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("store-writer".to_string())
            .spawn(move || {
                let mut completed: u64 = 0;
                while let Some(job) = rx.blocking_recv() {
                    job(store.as_ref());
                    completed += 1;
                }
                tracing::info!(completed, "Write serializer drained and stopped");
            })?;
        tracing::debug!(capacity, "Write serializer started");
        Ok(Self {
            sender: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn enqueue<T, F>(&self, op: F) -> Result<Pending<T>, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, BridgeError> + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(BridgeError::WriterClosed)?;
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move |store| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| op(store))).unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "Write op panicked");
                Err(BridgeError::Storage(StorageError::Other(format!(
                    "write op panicked: {}",
                    message
                ))))
            });
            // The caller may have gone away; the write itself still happened.
            let _ = done_tx.send(result);
        });
        sender.blocking_send(job).map_err(|_| BridgeError::WriterClosed)?;
        Ok(Pending { rx: done_rx })
    }

    /// Runs `op` on the writer thread and waits for its result.
    pub fn submit<T, F>(&self, op: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, BridgeError> + Send + 'static,
    {
        self.enqueue(op)?.wait()
    }
}

impl Drop for WriteSerializer {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Write serializer worker exited abnormally");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallybridge_core::CompanyDirectory;
    use tallybridge_memory::InMemoryStore;

    #[test]
    fn panicking_op_does_not_stop_the_worker() {
        let serializer = WriteSerializer::start(Arc::new(InMemoryStore::new()), 4).unwrap();
        let failed = serializer.submit::<(), _>(|_| panic!("boom"));
        assert!(matches!(failed, Err(BridgeError::Storage(_))));

        let id = serializer
            .submit(|store| Ok(store.get_or_create("ana", "Acme Traders")?))
            .unwrap();
        assert_eq!(id, "acme_traders");
    }
}
