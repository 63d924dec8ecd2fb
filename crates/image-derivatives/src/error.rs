use derivative_store::StoreError;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::source::RasterFormat;

#[derive(Debug, Error)]
pub enum DeriveError {
    /// Missing, truncated, undecodable or unreadable source file.
    #[error("unable to read image {}: {reason}", path.display())]
    SourceUnreadable { path: PathBuf, reason: String },

    #[error("unsupported image type: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// Store keys are UTF-8; a lossy key would name a different file.
    #[error("path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("an image named '{0}' is already in the working set")]
    DuplicateName(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode {format} derivative: {source}")]
    Encode {
        format: RasterFormat,
        #[source]
        source: image::ImageError,
    },
}

pub type DeriveResult<T> = Result<T, DeriveError>;

impl DeriveError {
    pub(crate) fn unreadable(path: &Path, reason: impl Display) -> Self {
        Self::SourceUnreadable {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Failures tied to one source file. The build queue recovers from these by
    /// dropping the file from the working set; anything else is a storage or
    /// encoding failure that aborts only the operation that hit it.
    pub fn is_source_failure(&self) -> bool {
        matches!(
            self,
            DeriveError::SourceUnreadable { .. }
                | DeriveError::UnsupportedFormat(_)
                | DeriveError::NonUtf8Path(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failure_classification() {
        assert!(DeriveError::unreadable(Path::new("/a.jpg"), "gone").is_source_failure());
        assert!(DeriveError::UnsupportedFormat(PathBuf::from("/a.bmp")).is_source_failure());
        assert!(DeriveError::NonUtf8Path(PathBuf::from("/a.png")).is_source_failure());
        assert!(!DeriveError::DuplicateName("a.jpg".into()).is_source_failure());
        assert!(!DeriveError::Store(StoreError::NotFound("/a.jpg".into())).is_source_failure());
    }

    #[test]
    fn test_messages_name_the_file() {
        let err = DeriveError::unreadable(Path::new("/photos/a.jpg"), "truncated");
        assert_eq!(err.to_string(), "unable to read image /photos/a.jpg: truncated");
    }
}
