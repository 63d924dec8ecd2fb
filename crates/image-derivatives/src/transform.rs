//! Pure geometry and resampling for derivatives
//!
//! Nothing here touches the store or the filesystem: given a raster and a
//! target box or rotation, produce the new raster.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

/// Clockwise quarter-turn rotation applied when viewing or exporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    /// Rotate a quarter turn counter-clockwise (0 wraps to 270)
    pub fn left(self) -> Self {
        match self {
            Rotation::Deg0 => Rotation::Deg270,
            Rotation::Deg90 => Rotation::Deg0,
            Rotation::Deg180 => Rotation::Deg90,
            Rotation::Deg270 => Rotation::Deg180,
        }
    }

    /// Rotate a quarter turn clockwise
    pub fn right(self) -> Self {
        match self {
            Rotation::Deg0 => Rotation::Deg90,
            Rotation::Deg90 => Rotation::Deg180,
            Rotation::Deg180 => Rotation::Deg270,
            Rotation::Deg270 => Rotation::Deg0,
        }
    }

    /// Whether the rotated raster swaps width and height
    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl std::fmt::Display for Rotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

impl std::str::FromStr for Rotation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let degrees: u16 = s.trim().trim_end_matches('°').parse()?;
        Rotation::from_degrees(degrees)
            .ok_or_else(|| anyhow::anyhow!("Invalid rotation: {}. Valid options: 0, 90, 180, 270", s))
    }
}

/// Fit `width`x`height` into `max_width`x`max_height`, preserving aspect ratio.
///
/// Sources that already fit are returned unchanged; images are never upscaled.
/// Otherwise the bound side is clamped to its max and the other side scaled
/// proportionally, truncated toward zero (but never below one pixel).
pub fn fit_within_box(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let (w, h) = (width as u64, height as u64);
    let (max_w, max_h) = (max_width as u64, max_height as u64);

    // Width is the binding side when w/h >= max_w/max_h
    if w * max_h >= h * max_w {
        let new_height = (h * max_w / w).max(1);
        (max_width, new_height as u32)
    } else {
        let new_width = (w * max_h / h).max(1);
        (new_width as u32, max_height)
    }
}

/// Scale `image` to `width`x`height` and rotate it clockwise by `rotation`.
///
/// For 90 and 270 degrees the output is `height`x`width`.
pub fn render_rotated(
    image: &DynamicImage,
    width: u32,
    height: u32,
    rotation: Rotation,
) -> DynamicImage {
    let scaled = if image.dimensions() == (width, height) {
        image.clone()
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    };

    match rotation {
        Rotation::Deg0 => scaled,
        Rotation::Deg90 => scaled.rotate90(),
        Rotation::Deg180 => scaled.rotate180(),
        Rotation::Deg270 => scaled.rotate270(),
    }
}

/// Downscale `image` to fit a `max_width`x`max_height` box.
pub fn scale_to_fit(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = fit_within_box(width, height, max_width, max_height);
    render_rotated(image, new_width, new_height, Rotation::Deg0)
}
