//! Interactive session facade.
//!
//! A [`Session`] is what a front end holds: the store has been reconciled by
//! the time one exists, and adding a file both records it in the working set
//! and queues its thumbnail build.

use std::path::Path;
use std::sync::Arc;

use crate::builder::{Derivative, DerivativeBuilder};
use crate::error::DeriveResult;
use crate::handle::ImageHandle;
use crate::queue::{BuildQueue, QueueProgress};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::working_set::{WorkingSet, WorkingSetObserver};

pub struct Session {
    builder: Arc<DerivativeBuilder>,
    working_set: Arc<WorkingSet>,
    queue: BuildQueue,
    reconcile_report: ReconcileReport,
}

impl Session {
    /// Reconcile the store, then start the background worker.
    pub fn start(builder: Arc<DerivativeBuilder>) -> DeriveResult<Self> {
        let reconcile_report = Reconciler::new(&builder).run()?;

        let working_set = Arc::new(WorkingSet::new());
        let queue = BuildQueue::start(Arc::clone(&builder), Arc::clone(&working_set));

        Ok(Self {
            builder,
            working_set,
            queue,
            reconcile_report,
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn WorkingSetObserver>) {
        self.working_set.subscribe(observer);
    }

    /// Add `path` to the working set and queue its thumbnail.
    pub fn add_to_working_set(&self, path: impl AsRef<Path>) -> DeriveResult<ImageHandle> {
        let handle = self.working_set.add(path)?;
        self.queue.enqueue(handle.clone());
        Ok(handle)
    }

    pub fn add_named(&self, path: impl AsRef<Path>, name: &str) -> DeriveResult<ImageHandle> {
        let handle = self.working_set.add_named(path, name)?;
        self.queue.enqueue(handle.clone());
        Ok(handle)
    }

    pub fn rename(&self, handle: &ImageHandle, name: &str) -> DeriveResult<()> {
        self.working_set.rename(handle, name)
    }

    pub fn remove(&self, handle: &ImageHandle) -> bool {
        self.working_set.remove(handle)
    }

    pub fn rotate_left(&self, handle: &ImageHandle) -> bool {
        handle.rotate_left()
    }

    pub fn rotate_right(&self, handle: &ImageHandle) -> bool {
        handle.rotate_right()
    }

    pub fn rotated_image(&self, handle: &ImageHandle) -> DeriveResult<Derivative> {
        self.builder.rotated_image(handle)
    }

    pub fn rotated_thumbnail(&self, handle: &ImageHandle) -> DeriveResult<Derivative> {
        self.builder.rotated_thumbnail(handle)
    }

    pub fn export_bytes(&self, handle: &ImageHandle) -> DeriveResult<Vec<u8>> {
        self.builder.export_bytes(handle)
    }

    /// Block until all queued thumbnail builds have run.
    pub fn wait_for_builds(&self) {
        self.queue.drain();
    }

    pub fn progress(&self) -> QueueProgress {
        self.queue.progress()
    }

    /// Result of the reconciliation pass that ran at startup.
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.reconcile_report
    }

    pub fn working_set(&self) -> &Arc<WorkingSet> {
        &self.working_set
    }

    pub fn builder(&self) -> &Arc<DerivativeBuilder> {
        &self.builder
    }
}
