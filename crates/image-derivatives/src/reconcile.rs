//! Startup pass bringing the derivative store in line with the filesystem
//!
//! Every entry is checked against its source: vanished sources are dropped,
//! sources modified after the entry was built are re-derived. An entry that
//! cannot be checked is reported and left alone.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::builder::DerivativeBuilder;
use crate::error::{DeriveError, DeriveResult};

/// What a reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub removed: usize,
    pub refreshed: usize,
    /// Entries whose source could not be checked or re-derived, sorted
    pub unverified: Vec<String>,
}

impl ReconcileReport {
    pub fn unchanged(&self) -> usize {
        self.checked - self.removed - self.refreshed - self.unverified.len()
    }

    pub fn is_clean(&self) -> bool {
        self.unverified.is_empty()
    }
}

enum Outcome {
    Fresh,
    Removed,
    Refreshed,
}

pub struct Reconciler<'a> {
    builder: &'a DerivativeBuilder,
}

impl<'a> Reconciler<'a> {
    pub fn new(builder: &'a DerivativeBuilder) -> Self {
        Self { builder }
    }

    /// Check every entry once.
    ///
    /// Fails only if the store cannot be scanned at all; per-entry problems
    /// end up in [`ReconcileReport::unverified`].
    pub fn run(&self) -> DeriveResult<ReconcileReport> {
        let started = Instant::now();
        let stamps = self.builder.store().stamps()?;

        let outcomes: Vec<(String, DeriveResult<Outcome>)> = stamps
            .into_par_iter()
            .map(|(path, stamp)| {
                let outcome = self.check(&path, stamp);
                (path, outcome)
            })
            .collect();

        let mut report = ReconcileReport {
            checked: outcomes.len(),
            ..Default::default()
        };
        for (path, outcome) in outcomes {
            match outcome {
                Ok(Outcome::Fresh) => {}
                Ok(Outcome::Removed) => report.removed += 1,
                Ok(Outcome::Refreshed) => report.refreshed += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "could not verify cached entry, leaving it untouched");
                    report.unverified.push(path);
                }
            }
        }
        report.unverified.sort();

        info!(
            checked = report.checked,
            removed = report.removed,
            refreshed = report.refreshed,
            unverified = report.unverified.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciled derivative store"
        );
        Ok(report)
    }

    fn check(&self, key: &str, stamp: DateTime<Utc>) -> DeriveResult<Outcome> {
        let fs = self.builder.source_fs();
        let store = self.builder.store();
        let path = Path::new(key);

        if !fs.exists(path).map_err(|e| DeriveError::unreadable(path, e))? {
            store.delete(key)?;
            debug!(path = %key, "source gone, dropped entry");
            return Ok(Outcome::Removed);
        }

        let modified = fs
            .modified(path)
            .map_err(|e| DeriveError::unreadable(path, e))?;
        // Stamps are persisted at millisecond precision
        if modified.timestamp_millis() <= stamp.timestamp_millis() {
            return Ok(Outcome::Fresh);
        }

        // Only working copies that already exist are rebuilt
        let include_resized = store.has_resized(key)?;
        self.builder.refresh(path, include_resized)?;
        debug!(path = %key, include_resized, "source changed, refreshed entry");
        Ok(Outcome::Refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::cache_key;
    use crate::builder::test_support::{memory_builder, png};
    use crate::DerivativeConfig;
    use anyhow::Result;
    use derivative_store::DerivativeStore;
    use filetime::{set_file_mtime, FileTime};
    use image::{DynamicImage, Rgb, RgbImage};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn write_png(dir: &TempDir, name: &str, width: u32, height: u32, color: [u8; 3]) -> Result<PathBuf> {
        let path = dir.path().join(name);
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color))).save(&path)?;
        Ok(path)
    }

    fn disk_builder(dir: &TempDir) -> Result<DerivativeBuilder> {
        let store = DerivativeStore::open_at(&dir.path().join("cache/derivatives.db"))?;
        Ok(DerivativeBuilder::new(Arc::new(store), DerivativeConfig::default()))
    }

    fn one_second_after(time: DateTime<Utc>) -> FileTime {
        FileTime::from_unix_time(time.timestamp() + 1, time.timestamp_subsec_nanos())
    }

    #[test]
    fn test_newer_source_is_rederived() -> Result<()> {
        let dir = tempdir()?;
        let builder = disk_builder(&dir)?;
        let path = write_png(&dir, "a.png", 1024, 768, [255, 0, 0])?;
        let key = cache_key(&path)?.to_string();

        builder.resized_image(&path)?;
        let before = builder.store().get(&key)?.unwrap();

        write_png(&dir, "a.png", 768, 1024, [0, 0, 255])?;
        set_file_mtime(&path, one_second_after(before.mod_time))?;

        let report = Reconciler::new(&builder).run()?;
        assert_eq!(report.refreshed, 1);
        assert!(report.is_clean());

        let after = builder.store().get(&key)?.unwrap();
        assert_ne!(after.resized, before.resized);
        assert!(after.resized.is_some());
        assert_ne!(after.thumbnail, before.thumbnail);
        assert!(after.mod_time > before.mod_time);
        assert_eq!(after.dimensions(), (768, 1024));
        Ok(())
    }

    #[test]
    fn test_refresh_does_not_create_working_copy() -> Result<()> {
        let dir = tempdir()?;
        let builder = disk_builder(&dir)?;
        let path = write_png(&dir, "a.png", 300, 200, [1, 2, 3])?;
        let key = cache_key(&path)?.to_string();

        builder.build_thumbnail(&path)?;
        let stamp = builder.store().mod_time(&key)?.unwrap();
        set_file_mtime(&path, one_second_after(stamp))?;

        let report = Reconciler::new(&builder).run()?;
        assert_eq!(report.refreshed, 1);
        assert!(!builder.store().has_resized(&key)?);
        assert!(builder.store().mod_time(&key)?.unwrap() > stamp);
        Ok(())
    }

    #[test]
    fn test_deleted_source_drops_entry() -> Result<()> {
        let dir = tempdir()?;
        let builder = disk_builder(&dir)?;
        let kept = write_png(&dir, "kept.png", 20, 20, [0, 0, 0])?;
        let gone = write_png(&dir, "gone.png", 20, 20, [0, 0, 0])?;
        builder.build_thumbnail(&kept)?;
        builder.build_thumbnail(&gone)?;

        std::fs::remove_file(&gone)?;
        let report = Reconciler::new(&builder).run()?;

        assert_eq!(report.checked, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(report.unchanged(), 1);
        assert!(!builder.store().exists(cache_key(&gone)?)?);
        assert!(builder.store().exists(cache_key(&kept)?)?);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_sources_never_reach_the_store() -> Result<()> {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir()?;
        let builder = disk_builder(&dir)?;
        let plain = write_png(&dir, "cafe.png", 20, 20, [0, 0, 0])?;
        builder.build_thumbnail(&plain)?;

        // Both names decode lossily to the same string
        for raw in [&b"caf\xe9.png"[..], &b"caf\xe8.png"[..]] {
            let odd = dir.path().join(OsStr::from_bytes(raw));
            std::fs::copy(&plain, &odd)?;
            let err = builder.build_thumbnail(&odd).unwrap_err();
            assert!(matches!(err, DeriveError::NonUtf8Path(_)));
        }
        assert_eq!(builder.store().count()?, 1);

        let report = Reconciler::new(&builder).run()?;
        assert_eq!(report.checked, 1);
        assert_eq!(report.removed, 0);
        assert!(builder.store().exists(cache_key(&plain)?)?);
        Ok(())
    }

    #[test]
    fn test_unchanged_entry_is_untouched() -> Result<()> {
        let dir = tempdir()?;
        let builder = disk_builder(&dir)?;
        let path = write_png(&dir, "a.png", 900, 900, [7, 7, 7])?;
        let key = cache_key(&path)?.to_string();
        builder.resized_image(&path)?;
        let before = builder.store().get(&key)?.unwrap();

        let report = Reconciler::new(&builder).run()?;
        assert_eq!(report.unchanged(), 1);
        assert_eq!(builder.store().get(&key)?.unwrap(), before);
        Ok(())
    }

    #[test]
    fn test_unreadable_newer_source_is_left_alone() {
        let (builder, fs) = memory_builder();
        fs.insert("/photos/a.png", png(64, 64, [9, 9, 9]), 100);
        builder.resized_image(Path::new("/photos/a.png")).unwrap();
        let before = builder.store().get("/photos/a.png").unwrap().unwrap();

        fs.insert("/photos/a.png", b"not a png anymore".to_vec(), 200);
        let report = Reconciler::new(&builder).run().unwrap();

        assert_eq!(report.unverified, vec!["/photos/a.png".to_string()]);
        assert_eq!(builder.store().get("/photos/a.png").unwrap().unwrap(), before);
    }

    #[test]
    fn test_many_entries() {
        let (builder, fs) = memory_builder();
        for i in 0..16 {
            let path = format!("/photos/{}.png", i);
            fs.insert(&path, png(30, 30, [i as u8, 0, 0]), 100);
            builder.build_thumbnail(Path::new(&path)).unwrap();
        }
        for i in 0..4 {
            fs.remove(&format!("/photos/{}.png", i));
        }
        for i in 4..8 {
            fs.insert(&format!("/photos/{}.png", i), png(30, 30, [0, i as u8, 0]), 300);
        }

        let report = Reconciler::new(&builder).run().unwrap();
        assert_eq!(report.checked, 16);
        assert_eq!(report.removed, 4);
        assert_eq!(report.refreshed, 4);
        assert_eq!(report.unchanged(), 8);
        assert_eq!(builder.store().count().unwrap(), 12);
    }

    #[test]
    fn test_empty_store() {
        let (builder, _fs) = memory_builder();
        assert_eq!(Reconciler::new(&builder).run().unwrap(), ReconcileReport::default());
    }
}
