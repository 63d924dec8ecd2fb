//! The user's collection of images pending export.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DeriveError, DeriveResult};
use crate::handle::{ImageHandle, SourceImage};
use crate::source::RasterFormat;

/// Notifications about working-set entries.
///
/// Callbacks run while the working set is locked: implementations must not
/// call back into the [`WorkingSet`] that notified them.
pub trait WorkingSetObserver: Send + Sync {
    fn on_build_completed(&self, _handle: &ImageHandle) {}

    fn on_build_failed(&self, _handle: &ImageHandle, _error: &DeriveError) {}

    fn on_removed(&self, _handle: &ImageHandle) {}
}

/// Insertion-ordered set of [`ImageHandle`]s with unique display names.
#[derive(Default)]
pub struct WorkingSet {
    handles: Mutex<Vec<ImageHandle>>,
    observers: RwLock<Vec<Arc<dyn WorkingSetObserver>>>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn WorkingSetObserver>) {
        self.observers.write().push(observer);
    }

    /// Add `path` under its file name.
    pub fn add(&self, path: impl AsRef<Path>) -> DeriveResult<ImageHandle> {
        let source = SourceImage::new(absolutize(path.as_ref()));
        let name = source.file_name();
        self.insert(source, name)
    }

    /// Add `path` under a caller-chosen display name, e.g. after `add`
    /// reported a name conflict. The name must end in a supported extension.
    pub fn add_named(&self, path: impl AsRef<Path>, name: &str) -> DeriveResult<ImageHandle> {
        if !RasterFormat::is_supported(Path::new(name)) {
            return Err(DeriveError::UnsupportedFormat(PathBuf::from(name)));
        }
        self.insert(SourceImage::new(absolutize(path.as_ref())), name.to_string())
    }

    fn insert(&self, source: SourceImage, name: String) -> DeriveResult<ImageHandle> {
        if source.key().is_none() {
            return Err(DeriveError::NonUtf8Path(source.path().to_path_buf()));
        }
        if !RasterFormat::is_supported(source.path()) {
            return Err(DeriveError::UnsupportedFormat(source.path().to_path_buf()));
        }

        let mut handles = self.handles.lock();
        if handles.iter().any(|h| h.display_name() == name) {
            return Err(DeriveError::DuplicateName(name));
        }

        let handle = ImageHandle::with_name(source, name);
        handles.push(handle.clone());
        debug!(path = %handle.path().display(), name = %handle.display_name(), "added to working set");
        Ok(handle)
    }

    /// Change the name `handle` will carry in an export.
    ///
    /// The name must be unique within the set and end in a supported extension.
    pub fn rename(&self, handle: &ImageHandle, name: &str) -> DeriveResult<()> {
        if !RasterFormat::is_supported(Path::new(name)) {
            return Err(DeriveError::UnsupportedFormat(PathBuf::from(name)));
        }

        let handles = self.handles.lock();
        if handles
            .iter()
            .any(|h| h != handle && h.display_name() == name)
        {
            return Err(DeriveError::DuplicateName(name.to_string()));
        }

        handle.set_display_name(name);
        Ok(())
    }

    /// Drop `handle` from the set. Its cached derivatives stay in the store.
    pub fn remove(&self, handle: &ImageHandle) -> bool {
        let mut handles = self.handles.lock();
        let removed = Self::take(&mut handles, handle);
        if removed {
            self.notify(|o| o.on_removed(handle));
        }
        removed
    }

    pub fn sort_by_name(&self) {
        self.handles
            .lock()
            .sort_by_cached_key(|h| h.display_name().to_lowercase());
    }

    /// Snapshot of the current handles in order.
    pub fn handles(&self) -> Vec<ImageHandle> {
        self.handles.lock().clone()
    }

    pub fn find_by_name(&self, name: &str) -> Option<ImageHandle> {
        self.handles
            .lock()
            .iter()
            .find(|h| h.display_name() == name)
            .cloned()
    }

    pub fn contains(&self, handle: &ImageHandle) -> bool {
        self.handles.lock().contains(handle)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// A background build for `handle` finished.
    pub(crate) fn report_completed(&self, handle: &ImageHandle) {
        let handles = self.handles.lock();
        if handles.contains(handle) {
            self.notify(|o| o.on_build_completed(handle));
        }
    }

    /// A background build for `handle` failed. Source failures drop the
    /// handle; anything else leaves it in place for a later retry.
    pub(crate) fn report_failed(&self, handle: &ImageHandle, error: &DeriveError) {
        let mut handles = self.handles.lock();
        self.notify(|o| o.on_build_failed(handle, error));

        if error.is_source_failure() {
            if Self::take(&mut handles, handle) {
                warn!(path = %handle.path().display(), error = %error, "dropped unreadable image from working set");
                self.notify(|o| o.on_removed(handle));
            }
        } else {
            warn!(path = %handle.path().display(), error = %error, "build failed, keeping image in working set");
        }
    }

    fn take(handles: &mut Vec<ImageHandle>, handle: &ImageHandle) -> bool {
        match handles.iter().position(|h| h == handle) {
            Some(index) => {
                handles.remove(index);
                true
            }
            None => false,
        }
    }

    fn notify(&self, f: impl Fn(&dyn WorkingSetObserver)) {
        for observer in self.observers.read().iter() {
            f(observer.as_ref());
        }
    }
}

/// Store keys are absolute paths; relative ones resolve against the current directory.
fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
