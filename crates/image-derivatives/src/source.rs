//! Collaborators the pipeline reads sources through.
//!
//! Filesystem access and image coding are injected into the builder so tests
//! can count reads or serve sources from memory. [`LocalFs`] and
//! [`ImageCrateCodec`] are the production implementations.

use anyhow::bail;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, ImageResult};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::path::Path;

/// The raster formats photozip accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RasterFormat {
    Gif,
    Jpeg,
    Png,
}

impl RasterFormat {
    /// Match a file extension, case-insensitively.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "gif" => Some(RasterFormat::Gif),
            "jpg" | "jpeg" => Some(RasterFormat::Jpeg),
            "png" => Some(RasterFormat::Png),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn is_supported(path: &Path) -> bool {
        Self::from_path(path).is_some()
    }

    pub fn image_format(&self) -> ImageFormat {
        match self {
            RasterFormat::Gif => ImageFormat::Gif,
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Png => ImageFormat::Png,
        }
    }
}

impl std::fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RasterFormat::Gif => write!(f, "gif"),
            RasterFormat::Jpeg => write!(f, "jpeg"),
            RasterFormat::Png => write!(f, "png"),
        }
    }
}

impl std::str::FromStr for RasterFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match Self::from_extension(s) {
            Some(format) => Ok(format),
            None => bail!("Unsupported image format: {}. Valid options: gif, jpg, jpeg, png", s),
        }
    }
}

/// Read access to source files.
pub trait SourceFs: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn modified(&self, path: &Path) -> io::Result<DateTime<Utc>>;

    /// `Err` means existence could not be determined (e.g. permission denied).
    fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// [`SourceFs`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl SourceFs for LocalFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn modified(&self, path: &Path) -> io::Result<DateTime<Utc>> {
        Ok(std::fs::metadata(path)?.modified()?.into())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        path.try_exists()
    }
}

/// Decodes source bytes and encodes derivatives.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> ImageResult<DynamicImage>;

    fn encode(&self, image: &DynamicImage, format: RasterFormat) -> ImageResult<Vec<u8>>;
}

/// [`ImageCodec`] backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    jpeg_quality: u8,
}

impl ImageCrateCodec {
    pub fn new(jpeg_quality: u8) -> Self {
        Self { jpeg_quality }
    }
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new(90)
    }
}

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> ImageResult<DynamicImage> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()
    }

    fn encode(&self, image: &DynamicImage, format: RasterFormat) -> ImageResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);

        match format {
            // JPEG has no alpha channel
            RasterFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(
                JpegEncoder::new_with_quality(&mut cursor, self.jpeg_quality),
            )?,
            RasterFormat::Png => {
                DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut cursor, ImageFormat::Png)?
            }
            RasterFormat::Gif => {
                DynamicImage::ImageRgba8(image.to_rgba8()).write_to(&mut cursor, ImageFormat::Gif)?
            }
        }

        Ok(buffer)
    }
}
