use anyhow::Result;
use image_derivatives::RasterFormat;
use std::path::PathBuf;
use walkdir::WalkDir;

/// Expand command-line paths into image files.
///
/// Directories are searched `depth` levels deep for supported images, sorted
/// by path. Anything else is passed through so the working set can report it.
pub fn discover_images(paths: &[PathBuf], depth: usize) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();

    for path in paths {
        if !path.is_dir() {
            images.push(path.clone());
            continue;
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(path)
            .min_depth(1)
            .max_depth(depth.max(1))
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let entry_path = entry.path();
            if entry.file_type().is_file() && RasterFormat::is_supported(entry_path) {
                found.push(entry_path.to_path_buf());
            }
        }

        // Sort by path for consistent ordering
        found.sort();
        images.extend(found);
    }

    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("b.png")).unwrap();
        File::create(dir.path().join("a.JPG")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub/c.gif")).unwrap();

        let shallow = discover_images(&[dir.path().to_path_buf()], 1).unwrap();
        assert_eq!(
            shallow,
            vec![dir.path().join("a.JPG"), dir.path().join("b.png")]
        );

        let deep = discover_images(&[dir.path().to_path_buf()], 2).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("sub/c.gif")));
    }

    #[test]
    fn test_files_pass_through() {
        let dir = tempdir().unwrap();
        let explicit = vec![dir.path().join("missing.jpg"), dir.path().join("notes.txt")];
        assert_eq!(discover_images(&explicit, 1).unwrap(), explicit);
    }
}
