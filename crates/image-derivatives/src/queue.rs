//! Background thumbnail builds for the working set
//!
//! One worker thread owns the drain loop: callers push handles and the worker
//! builds them strictly in enqueue order until the queue is empty, then goes
//! back to sleep. A failed or panicking item is reported to the working set and
//! the worker moves on to the next one.

use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

use crate::builder::DerivativeBuilder;
use crate::error::DeriveError;
use crate::handle::ImageHandle;
use crate::working_set::WorkingSet;

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Idle,
    Draining,
}

/// Build counters since the queue started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProgress {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl QueueProgress {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.pending
    }

    pub fn completion_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            100.0
        } else {
            ((self.completed + self.failed) as f64 / total as f64) * 100.0
        }
    }
}

struct QueueState {
    pending: VecDeque<ImageHandle>,
    status: QueueStatus,
    completed: usize,
    failed: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    drained: Condvar,
}

/// FIFO of handles awaiting a thumbnail, drained by a single worker thread
pub struct BuildQueue {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BuildQueue {
    /// Spawn the worker. Builds go through `builder`; outcomes are reported to `working_set`.
    pub fn start(builder: Arc<DerivativeBuilder>, working_set: Arc<WorkingSet>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                status: QueueStatus::Idle,
                completed: 0,
                failed: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || Self::run_worker(worker_shared, builder, working_set));

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Append `handle` to the tail of the queue
    pub fn enqueue(&self, handle: ImageHandle) {
        let mut state = self.shared.state.lock();
        debug!(path = %handle.path().display(), "queued thumbnail build");
        state.pending.push_back(handle);
        self.shared.work_ready.notify_one();
    }

    /// Block until every queued handle has been built and the worker is idle
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        while !(state.pending.is_empty() && state.status == QueueStatus::Idle) {
            self.shared.drained.wait(&mut state);
        }
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.state.lock().status
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn progress(&self) -> QueueProgress {
        let state = self.shared.state.lock();
        QueueProgress {
            completed: state.completed,
            failed: state.failed,
            pending: state.pending.len(),
        }
    }

    fn run_worker(shared: Arc<Shared>, builder: Arc<DerivativeBuilder>, working_set: Arc<WorkingSet>) {
        while let Some(handle) = Self::next_job(&shared) {
            // Removed while waiting in the queue
            if !working_set.contains(&handle) {
                debug!(path = %handle.path().display(), "skipping build for removed image");
                continue;
            }

            // A panicking decoder fails the item; the worker keeps draining
            let build = AssertUnwindSafe(|| builder.build_thumbnail(handle.path()));
            let outcome = panic::catch_unwind(build).unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                error!(path = %handle.path().display(), reason = %reason, "thumbnail build panicked");
                Err(DeriveError::unreadable(
                    handle.path(),
                    format!("build panicked: {}", reason),
                ))
            });

            // The queue lock is not held here: the working set takes its own lock
            let succeeded = match outcome {
                Ok(_) => {
                    working_set.report_completed(&handle);
                    true
                }
                Err(e) => {
                    working_set.report_failed(&handle, &e);
                    false
                }
            };

            let mut state = shared.state.lock();
            if succeeded {
                state.completed += 1;
            } else {
                state.failed += 1;
            }
        }
    }

    /// Wait for the next handle; `None` once shut down.
    fn next_job(shared: &Shared) -> Option<ImageHandle> {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(handle) = state.pending.pop_front() {
                state.status = QueueStatus::Draining;
                return Some(handle);
            }
            if state.status == QueueStatus::Draining {
                state.status = QueueStatus::Idle;
                info!(
                    completed = state.completed,
                    failed = state.failed,
                    "build queue drained"
                );
                shared.drained.notify_all();
            }
            shared.work_ready.wait(&mut state);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for BuildQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending.clear();
            self.shared.work_ready.notify_all();
        }
        // Finishes the in-flight build, if any
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
