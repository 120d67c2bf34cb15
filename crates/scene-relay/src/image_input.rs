//! Image loading for the caption stage.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView};

use crate::types::{RelayError, RelayResult};

/// A decoded RGB image and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub path: PathBuf,
    pub image: DynamicImage,
}

impl LoadedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Load and decode an image file, converting it to 8-bit RGB.
pub fn load_image(path: impl AsRef<Path>) -> RelayResult<LoadedImage> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(RelayError::InvalidInput("image path is empty".to_string()));
    }
    if !path.is_file() {
        return Err(RelayError::ImageNotFound(path.to_path_buf()));
    }
    if !is_supported_format(path) {
        tracing::warn!(
            "{} has an unrecognized extension; trying to decode anyway",
            path.display()
        );
    }

    let img = image::open(path)?;
    let (w, h) = img.dimensions();
    tracing::debug!("Loaded {} ({w}x{h})", path.display());

    Ok(LoadedImage {
        path: path.to_path_buf(),
        image: DynamicImage::ImageRgb8(img.to_rgb8()),
    })
}

/// Check if a file path points to a supported image format.
pub fn is_supported_format(path: impl AsRef<Path>) -> bool {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    matches!(
        ext.as_str(),
        "png" | "jpg" | "jpeg" | "webp" | "gif" | "bmp" | "tiff" | "tif" | "ico"
    )
}
