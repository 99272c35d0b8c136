//! Bounded worker pool for one run phase.
//!
//! Workers pull row ids from a shared queue until it drains or the run is
//! cancelled. Each unit returns `Result<T, RowFailure>`; a failure (or a panic,
//! reported as `TransferIo`) is recorded and the worker moves on.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use ingest_core::error::RowFailure;
use ingest_core::id::RowId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span};

/// Collected results of one phase, ordered by row id.
#[derive(Debug)]
pub struct PhaseReport<T> {
    pub completed: Vec<(RowId, T)>,
    pub failed: Vec<(RowId, RowFailure)>,
    /// Rows never started because the run was cancelled.
    pub not_started: usize,
}

impl<T> PhaseReport<T> {
    pub fn attempted(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, cancel: CancellationToken) -> Self {
        Self {
            name,
            workers: workers.max(1),
            cancel,
        }
    }

    pub fn run<T, F>(&self, ids: Vec<RowId>, work: F) -> PhaseReport<T>
    where
        T: Send,
        F: Fn(RowId) -> Result<T, RowFailure> + Sync,
    {
        let total = ids.len();
        let workers = self.workers.min(total.max(1));
        let queue = Mutex::new(VecDeque::from(ids));
        let (tx, rx) = mpsc::channel();
        let span = info_span!("phase", name = self.name);

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let work = &work;
                let span = span.clone();
                let cancel = &self.cancel;
                scope.spawn(move || {
                    let _entered = span.enter();
                    loop {
                        if cancel.is_cancelled() {
                            debug!(worker, "cancelled, leaving queue");
                            break;
                        }
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                        let Some(id) = next else { break };
                        let result = panic::catch_unwind(AssertUnwindSafe(|| work(id)))
                            .unwrap_or_else(|payload| {
                                Err(RowFailure::TransferIo(format!(
                                    "worker panicked: {}",
                                    panic_message(payload.as_ref())
                                )))
                            });
                        if tx.send((id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for (id, result) in rx {
            match result {
                Ok(value) => completed.push((id, value)),
                Err(failure) => failed.push((id, failure)),
            }
        }
        completed.sort_by_key(|(id, _)| *id);
        failed.sort_by_key(|(id, _)| *id);

        let not_started = queue.lock().unwrap_or_else(PoisonError::into_inner).len();
        debug!(
            phase = self.name,
            total,
            completed = completed.len(),
            failed = failed.len(),
            not_started,
            "phase drained"
        );
        PhaseReport {
            completed,
            failed,
            not_started,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
