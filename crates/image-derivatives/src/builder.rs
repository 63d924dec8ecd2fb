//! Derivative generation on top of the persistent store
//!
//! Thumbnails are built once per source and reused; the export working copy
//! is built the first time something asks for it. Rotation is applied on
//! every read from the cached working copy and never written back.

use chrono::{DateTime, Utc};
use derivative_store::{CacheEntry, DerivativeStore, EntryUpdate, StoreError};
use image::{DynamicImage, GenericImageView};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DeriveError, DeriveResult};
use crate::handle::ImageHandle;
use crate::source::{ImageCodec, ImageCrateCodec, LocalFs, RasterFormat, SourceFs};
use crate::transform::{render_rotated, scale_to_fit};
use crate::DerivativeConfig;

/// Thumbnails are stored losslessly regardless of the source format.
const THUMBNAIL_FORMAT: RasterFormat = RasterFormat::Png;

/// Store key for a source path.
///
/// Keys are the path itself, so a path that is not valid UTF-8 has none.
pub fn cache_key(path: &Path) -> DeriveResult<&str> {
    path.to_str()
        .ok_or_else(|| DeriveError::NonUtf8Path(path.to_path_buf()))
}

/// A generated raster.
#[derive(Debug, Clone)]
pub struct Derivative {
    image: DynamicImage,
}

impl Derivative {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

/// A decoded source file.
struct Source {
    image: DynamicImage,
    format: RasterFormat,
    modified: DateTime<Utc>,
}

/// Builds and caches derivatives for source files.
pub struct DerivativeBuilder {
    store: Arc<DerivativeStore>,
    fs: Arc<dyn SourceFs>,
    codec: Arc<dyn ImageCodec>,
    config: DerivativeConfig,
}

impl DerivativeBuilder {
    /// Builder reading the local filesystem through the `image` crate.
    pub fn new(store: Arc<DerivativeStore>, config: DerivativeConfig) -> Self {
        let codec = ImageCrateCodec::new(config.jpeg_quality);
        Self::with_collaborators(store, Arc::new(LocalFs), Arc::new(codec), config)
    }

    pub fn with_collaborators(
        store: Arc<DerivativeStore>,
        fs: Arc<dyn SourceFs>,
        codec: Arc<dyn ImageCodec>,
        config: DerivativeConfig,
    ) -> Self {
        Self {
            store,
            fs,
            codec,
            config,
        }
    }

    pub fn store(&self) -> &Arc<DerivativeStore> {
        &self.store
    }

    pub fn source_fs(&self) -> &Arc<dyn SourceFs> {
        &self.fs
    }

    pub fn config(&self) -> &DerivativeConfig {
        &self.config
    }

    /// Get the thumbnail for `path`, building and persisting it on first access.
    ///
    /// A cached thumbnail is returned as is; the source is not read again.
    pub fn build_thumbnail(&self, path: &Path) -> DeriveResult<Derivative> {
        let key = cache_key(path)?;

        let cached = self.store.thumbnail(key)?;
        if let Some(bytes) = &cached {
            match self.codec.decode(bytes) {
                Ok(image) => {
                    debug!(path = %path.display(), "thumbnail cache hit");
                    return Ok(Derivative::new(image));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cached thumbnail is corrupt, rebuilding"),
            }
        }

        let source = self.load_source(path)?;
        let thumbnail = self.thumbnail_from(&source.image);
        let (width, height) = source.image.dimensions();
        let thumbnail_bytes = self.encode(&thumbnail, THUMBNAIL_FORMAT)?;

        // A corrupt thumbnail is replaced alone; the working copy and the
        // stored modification time still describe the source they came from.
        let replaced = if cached.is_some() {
            let update = EntryUpdate {
                thumbnail: Some(thumbnail_bytes.clone()),
                ..Default::default()
            };
            match self.store.update(key, &update) {
                Ok(()) => true,
                Err(StoreError::NotFound(_)) => false,
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };

        if !replaced {
            self.store.put(&CacheEntry {
                path: key.to_string(),
                mod_time: source.modified,
                original_width: width,
                original_height: height,
                thumbnail: thumbnail_bytes,
                resized: None,
            })?;
        }
        debug!(path = %path.display(), width, height, "built thumbnail");

        Ok(Derivative::new(thumbnail))
    }

    /// Get the size-bounded working copy for `path`, building and persisting it
    /// on first access. An existing entry keeps its thumbnail and dimensions.
    pub fn resized_image(&self, path: &Path) -> DeriveResult<Derivative> {
        let key = cache_key(path)?;

        if let Some(bytes) = self.store.resized(key)? {
            match self.codec.decode(&bytes) {
                Ok(image) => {
                    debug!(path = %path.display(), "resized cache hit");
                    return Ok(Derivative::new(image));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cached resized image is corrupt, rebuilding"),
            }
        }

        let source = self.load_source(path)?;
        let resized = self.resized_from(&source.image);
        let resized_bytes = self.encode(&resized, source.format)?;

        let update = EntryUpdate {
            resized: Some(resized_bytes.clone()),
            ..Default::default()
        };
        match self.store.update(key, &update) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                // Never thumbnailed: create the whole entry in one write
                let (width, height) = source.image.dimensions();
                let thumbnail = self.thumbnail_from(&source.image);
                self.store.put(&CacheEntry {
                    path: key.to_string(),
                    mod_time: source.modified,
                    original_width: width,
                    original_height: height,
                    thumbnail: self.encode(&thumbnail, THUMBNAIL_FORMAT)?,
                    resized: Some(resized_bytes),
                })?;
            }
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), "built resized image");

        Ok(Derivative::new(resized))
    }

    /// The working copy rendered at the handle's current rotation.
    pub fn rotated_image(&self, handle: &ImageHandle) -> DeriveResult<Derivative> {
        let base = self.resized_image(handle.path())?;
        let (width, height) = base.dimensions();
        Ok(Derivative::new(render_rotated(
            base.image(),
            width,
            height,
            handle.rotation(),
        )))
    }

    /// The thumbnail at the handle's current rotation, kept on the handle
    /// until the rotation changes.
    pub fn rotated_thumbnail(&self, handle: &ImageHandle) -> DeriveResult<Derivative> {
        if let Some(preview) = handle.cached_preview() {
            return Ok(Derivative::new(preview));
        }

        let rotation = handle.rotation();
        let base = self.build_thumbnail(handle.path())?;
        let (width, height) = base.dimensions();
        let rendered = render_rotated(base.image(), width, height, rotation);
        handle.store_preview(rotation, rendered.clone());
        Ok(Derivative::new(rendered))
    }

    /// Encoded bytes of the rotated working copy, in the format named by the
    /// handle's display name (or the source's format if the name has none).
    pub fn export_bytes(&self, handle: &ImageHandle) -> DeriveResult<Vec<u8>> {
        let format = RasterFormat::from_path(Path::new(&handle.display_name()))
            .or_else(|| RasterFormat::from_path(handle.path()))
            .ok_or_else(|| DeriveError::UnsupportedFormat(handle.path().to_path_buf()))?;
        let rotated = self.rotated_image(handle)?;
        self.encode(rotated.image(), format)
    }

    /// Regenerate the derivatives of an existing entry from the current source.
    ///
    /// The thumbnail and dimensions are always rewritten; the working copy only
    /// when `include_resized` is set. Returns the new modification time.
    pub fn refresh(&self, path: &Path, include_resized: bool) -> DeriveResult<DateTime<Utc>> {
        let key = cache_key(path)?;
        let source = self.load_source(path)?;
        let thumbnail = self.thumbnail_from(&source.image);

        let resized = if include_resized {
            let resized = self.resized_from(&source.image);
            Some(self.encode(&resized, source.format)?)
        } else {
            None
        };

        self.store.update(
            key,
            &EntryUpdate {
                mod_time: Some(source.modified),
                dimensions: Some(source.image.dimensions()),
                thumbnail: Some(self.encode(&thumbnail, THUMBNAIL_FORMAT)?),
                resized,
            },
        )?;
        debug!(path = %path.display(), include_resized, "refreshed derivatives");

        Ok(source.modified)
    }

    fn thumbnail_from(&self, image: &DynamicImage) -> DynamicImage {
        let size = self.config.thumbnail_size;
        scale_to_fit(image, size, size)
    }

    fn resized_from(&self, image: &DynamicImage) -> DynamicImage {
        let size = self.config.resize_size;
        scale_to_fit(image, size, size)
    }

    fn load_source(&self, path: &Path) -> DeriveResult<Source> {
        let format = RasterFormat::from_path(path)
            .ok_or_else(|| DeriveError::UnsupportedFormat(path.to_path_buf()))?;

        // Taken before reading so a write racing the read makes the entry look stale
        let modified = self
            .fs
            .modified(path)
            .map_err(|e| DeriveError::unreadable(path, e))?;
        let bytes = self
            .fs
            .read(path)
            .map_err(|e| DeriveError::unreadable(path, e))?;
        let image = self
            .codec
            .decode(&bytes)
            .map_err(|e| DeriveError::unreadable(path, e))?;

        Ok(Source {
            image,
            format,
            modified,
        })
    }

    fn encode(&self, image: &DynamicImage, format: RasterFormat) -> DeriveResult<Vec<u8>> {
        self.codec
            .encode(image, format)
            .map_err(|source| DeriveError::Encode { format, source })
    }
}
