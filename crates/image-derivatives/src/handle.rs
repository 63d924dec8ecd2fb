//! Working-set entries.
//!
//! An [`ImageHandle`] pairs an immutable [`SourceImage`] (which file, and the
//! cache key derived from it) with a mutable per-session view: the name the
//! file will carry in an export and the rotation the user picked. The view
//! is never persisted.

use image::DynamicImage;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::transform::Rotation;

/// Unique identifier for a handle within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        HandleId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

/// Filesystem identity of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceImage {
    path: PathBuf,
}

impl SourceImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Derivative store key; `None` if the path is not valid UTF-8.
    pub fn key(&self) -> Option<&str> {
        crate::builder::cache_key(&self.path).ok()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

struct ViewState {
    display_name: String,
    rotation: Rotation,
    /// Last rotation materialised; `None` until the first rotate.
    applied: Option<Rotation>,
    /// Rotated thumbnail for `applied`, rendered on demand.
    preview: Option<DynamicImage>,
}

struct HandleInner {
    id: HandleId,
    source: SourceImage,
    view: Mutex<ViewState>,
}

/// Shared reference to one file in the working set.
///
/// Cloning is cheap and clones refer to the same entry. Rotation changes on
/// one handle are serialized by its view lock.
#[derive(Clone)]
pub struct ImageHandle {
    inner: Arc<HandleInner>,
}

impl ImageHandle {
    /// Create a handle whose display name is the file name.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let source = SourceImage::new(path);
        let name = source.file_name();
        Self::with_name(source, name)
    }

    pub fn with_name(source: SourceImage, display_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: HandleId::next(),
                source,
                view: Mutex::new(ViewState {
                    display_name: display_name.into(),
                    rotation: Rotation::Deg0,
                    applied: None,
                    preview: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn source(&self) -> &SourceImage {
        &self.inner.source
    }

    pub fn path(&self) -> &Path {
        self.inner.source.path()
    }

    pub fn display_name(&self) -> String {
        self.inner.view.lock().display_name.clone()
    }

    /// Renames go through [`crate::WorkingSet::rename`], which enforces uniqueness.
    pub(crate) fn set_display_name(&self, name: &str) {
        self.inner.view.lock().display_name = name.to_string();
    }

    pub fn rotation(&self) -> Rotation {
        self.inner.view.lock().rotation
    }

    pub fn applied_rotation(&self) -> Option<Rotation> {
        self.inner.view.lock().applied
    }

    /// Set the rotation. Returns `false` without touching anything when
    /// `rotation` is already the applied one; otherwise drops the cached
    /// preview so the next read re-renders.
    pub fn rotate_to(&self, rotation: Rotation) -> bool {
        let mut view = self.inner.view.lock();
        Self::apply(&mut view, rotation)
    }

    pub fn rotate_left(&self) -> bool {
        let mut view = self.inner.view.lock();
        let next = view.rotation.left();
        Self::apply(&mut view, next)
    }

    pub fn rotate_right(&self) -> bool {
        let mut view = self.inner.view.lock();
        let next = view.rotation.right();
        Self::apply(&mut view, next)
    }

    fn apply(view: &mut ViewState, rotation: Rotation) -> bool {
        if view.applied == Some(rotation) {
            return false;
        }
        view.rotation = rotation;
        view.applied = Some(rotation);
        view.preview = None;
        true
    }

    pub(crate) fn cached_preview(&self) -> Option<DynamicImage> {
        self.inner.view.lock().preview.clone()
    }

    /// Keep a rendered preview unless the rotation moved on while it was rendering.
    pub(crate) fn store_preview(&self, rendered_for: Rotation, preview: DynamicImage) {
        let mut view = self.inner.view.lock();
        if view.rotation == rendered_for {
            view.preview = Some(preview);
        }
    }
}

impl PartialEq for ImageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ImageHandle {}

impl std::fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.inner.view.lock();
        f.debug_struct("ImageHandle")
            .field("id", &self.inner.id)
            .field("path", &self.inner.source.path)
            .field("display_name", &view.display_name)
            .field("rotation", &view.rotation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_path() {
        let handle = ImageHandle::new("/photos/beach.JPG");
        assert_eq!(handle.display_name(), "beach.JPG");
        assert_eq!(handle.rotation(), Rotation::Deg0);
        assert_eq!(handle.applied_rotation(), None);
        assert_eq!(handle.source().key(), Some("/photos/beach.JPG"));
    }

    #[test]
    fn test_clones_share_state() {
        let handle = ImageHandle::new("/photos/a.png");
        let other = handle.clone();
        other.rotate_right();
        assert_eq!(handle.rotation(), Rotation::Deg90);
        assert_eq!(handle, other);
        assert_ne!(handle, ImageHandle::new("/photos/a.png"));
    }

    #[test]
    fn test_first_rotate_always_applies() {
        let handle = ImageHandle::new("/photos/a.png");
        assert!(handle.rotate_to(Rotation::Deg0));
        assert_eq!(handle.applied_rotation(), Some(Rotation::Deg0));
        assert!(!handle.rotate_to(Rotation::Deg0));
    }

    #[test]
    fn test_rotate_left_four_times_returns_home() {
        let handle = ImageHandle::new("/photos/a.png");
        handle.rotate_to(Rotation::Deg90);
        for _ in 0..4 {
            assert!(handle.rotate_left());
        }
        assert_eq!(handle.rotation(), Rotation::Deg90);
    }

    #[test]
    fn test_rotate_left_wraps() {
        let handle = ImageHandle::new("/photos/a.png");
        handle.rotate_left();
        assert_eq!(handle.rotation(), Rotation::Deg270);
        handle.rotate_right();
        assert_eq!(handle.rotation(), Rotation::Deg0);
    }

    #[test]
    fn test_rotate_drops_preview() {
        let handle = ImageHandle::new("/photos/a.png");
        handle.store_preview(Rotation::Deg0, DynamicImage::new_rgb8(2, 2));
        assert!(handle.cached_preview().is_some());

        handle.rotate_right();
        assert!(handle.cached_preview().is_none());

        // A render for a stale rotation is discarded
        handle.store_preview(Rotation::Deg0, DynamicImage::new_rgb8(2, 2));
        assert!(handle.cached_preview().is_none());
    }

    #[test]
    fn test_concurrent_rotations_serialize() {
        let handle = ImageHandle::new("/photos/a.png");
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        handle.rotate_right();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        // 800 quarter turns is a whole number of revolutions
        assert_eq!(handle.rotation(), Rotation::Deg0);
    }
}
