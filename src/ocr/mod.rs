//! OCR engine interface.

use image::RgbImage;

use crate::{model::Detection, prelude::*};

pub mod tesseract;

/// Something that can find text in a page image.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize text in `page`. Detections are returned in reading order,
    /// which determines block ids.
    async fn recognize(&self, page: &RgbImage) -> Result<Vec<Detection>>;
}
