//! Produces thumbnail images from preview files.

use image::DynamicImage;
use std::path::Path;

use super::error::ThumbnailError;

/// Opaque "make a thumbnail from this file" collaborator.
pub trait Thumbnailer: Send + Sync + 'static {
    fn generate(&self, path: &Path, width: u32, height: u32) -> Result<DynamicImage, ThumbnailError>;
}

/// Decodes with the `image` crate and scales to fit inside `width`x`height`,
/// keeping the aspect ratio.
#[derive(Debug, Clone, Default)]
pub struct ImageThumbnailer;

impl Thumbnailer for ImageThumbnailer {
    fn generate(&self, path: &Path, width: u32, height: u32) -> Result<DynamicImage, ThumbnailError> {
        if width == 0 || height == 0 {
            return Err(ThumbnailError::InvalidSize { width, height });
        }
        let img = image::open(path).map_err(|e| ThumbnailError::Decode(e, path.to_path_buf()))?;
        Ok(img.thumbnail(width, height))
    }
}
