//! Bounded worker pool for user-supplied callbacks.
//!
//! Request and rework callbacks are opaque user code; running them on the
//! connection loop would let a slow handler stall the socket. The pool keeps
//! a small fixed number of worker tasks draining a bounded queue, so the
//! loop only ever awaits queue admission.
//!
//! Shutdown discards queued-but-unstarted jobs; a job already picked up by a
//! worker runs to completion.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{constants, ProtocolError, Result};

/// A unit of callback work
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Default number of workers when the configuration does not say otherwise
pub const DEFAULT_WORKERS: usize = 2;

/// Depth of the job queue; `execute` backpressures once it is full
const QUEUE_DEPTH: usize = 64;

/// Fixed-size pool of worker tasks executing jobs in submission order
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks draining a shared bounded queue
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = shutdown.changed() => {
                                trace!(worker_id, "worker stopping");
                                return;
                            }
                            job = rx.recv() => job,
                        }
                    };
                    match job {
                        Some(job) => job(),
                        None => return,
                    }
                }
            }));
        }

        Self {
            tx,
            shutdown_tx,
            handles,
        }
    }

    /// Queue a job for execution, waiting if the queue is full.
    ///
    /// # Errors
    /// Returns `ProtocolError::Custom` if the pool has been shut down.
    pub async fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Box::new(job))
            .await
            .map_err(|_| ProtocolError::Custom(constants::ERR_WORKERS_STOPPED.into()))
    }

    /// Stop all workers, discarding jobs that have not started yet.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            debug!(workers = self.handles.len(), "worker pool shutting down");
        }
    }

    /// Number of worker tasks in the pool
    pub fn workers(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
