//! Thumbnail and resized-image pipeline for photozip
//!
//! This crate turns source photos into the two cached derivatives photozip
//! works with: a list thumbnail (fitted into 100x100) and a working copy
//! (fitted into 800x800) that exports are rendered from. Both are persisted
//! through `derivative-store`, keyed by absolute source path.
//!
//! # Features
//!
//! - **Lazy derivatives**: thumbnails are built on first access, working copies on first export
//! - **Staleness reconciliation**: a startup pass drops entries whose source vanished
//!   and regenerates entries whose source changed
//! - **Background builds**: a single worker drains a FIFO of pending thumbnail builds,
//!   dropping unreadable files from the working set without stopping the batch
//! - **In-memory rotation**: rotation is a per-session view preference re-rendered
//!   from the cached working copy, never persisted
//! - **Injected I/O**: filesystem access and image codecs sit behind traits so tests
//!   can substitute them

pub mod builder;
pub mod error;
pub mod handle;
pub mod queue;
pub mod reconcile;
pub mod session;
pub mod source;
pub mod transform;
pub mod working_set;

pub use builder::{cache_key, Derivative, DerivativeBuilder};
pub use error::{DeriveError, DeriveResult};
pub use handle::{HandleId, ImageHandle, SourceImage};
pub use queue::{BuildQueue, QueueProgress, QueueStatus};
pub use reconcile::{ReconcileReport, Reconciler};
pub use session::Session;
pub use source::{ImageCodec, ImageCrateCodec, LocalFs, RasterFormat, SourceFs};
pub use transform::{fit_within_box, render_rotated, Rotation};
pub use working_set::{WorkingSet, WorkingSetObserver};

use serde::{Deserialize, Serialize};

/// Bounding boxes and encoding settings for generated derivatives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeConfig {
    /// Square box list thumbnails are fitted into
    pub thumbnail_size: u32,
    /// Square box the export working copy is fitted into
    pub resize_size: u32,
    pub jpeg_quality: u8,
}

impl Default for DerivativeConfig {
    fn default() -> Self {
        Self {
            thumbnail_size: 100,
            resize_size: 800,
            jpeg_quality: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DerivativeConfig::default();
        assert_eq!(config.thumbnail_size, 100);
        assert_eq!(config.resize_size, 800);
    }
}
