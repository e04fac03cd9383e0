//! Records exchanged with callers: extraction results and edit requests.

use schemars::JsonSchema;
use serde::Deserializer;

use crate::{
    color::BlockColors,
    geometry::{PixelRect, Polygon},
    prelude::*,
};

/// Default font size for replacement text, in pixels.
pub const DEFAULT_FONT_SIZE: f32 = 20.0;

/// A raw detection returned by an OCR engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Four corner points, in pixels.
    pub polygon: Polygon,
    /// The recognized text.
    pub text: String,
    /// Recognition confidence, from 0 to 1.
    pub confidence: f32,
}

/// One OCR-detected span of text on a page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct TextBlock {
    /// Identifier, unique within the document.
    pub id: String,

    /// The recognized text. May be empty.
    pub text: String,

    /// Recognition confidence, from 0 to 1. Low-confidence blocks are kept.
    pub confidence: f32,

    /// The four corner points reported by OCR.
    pub bbox: Polygon,

    /// Axis-aligned bounding box of `bbox`.
    pub rect: PixelRect,

    /// Text color, as `#rrggbb`.
    pub fg_color: String,

    /// Background color, as `#rrggbb`.
    pub bg_color: String,
}

impl TextBlock {
    /// Build a block from an OCR detection.
    ///
    /// `page_idx` is 0-based and `order` is the position of this detection in
    /// the OCR output, so ids are stable for a given page and engine.
    pub fn from_detection(
        page_idx: usize,
        order: usize,
        detection: Detection,
        colors: BlockColors,
    ) -> Self {
        let rect = PixelRect::bounding(&detection.polygon);
        Self {
            id: format!("page{}_block{}", page_idx + 1, order),
            text: detection.text,
            confidence: detection.confidence,
            bbox: detection.polygon,
            rect,
            fg_color: colors.foreground_hex(),
            bg_color: colors.background_hex(),
        }
    }
}

/// One page of an extraction result.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct Page {
    /// 1-based page number.
    pub page_number: usize,

    /// Width of the rasterized page, in pixels.
    pub width: u32,

    /// Height of the rasterized page, in pixels.
    pub height: u32,

    /// Width of the original page, in points, if it has a vector form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_width: Option<f64>,

    /// Height of the original page, in points, if it has a vector form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_height: Option<f64>,

    /// Text blocks, in OCR order.
    pub text_blocks: Vec<TextBlock>,
}

/// The result of extracting text from a document.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct ExtractionResult {
    /// Number of pages in the document.
    pub page_count: usize,

    /// The resolution the pages were rasterized at. Edits must be applied at
    /// the same resolution.
    pub dpi: u32,

    /// Per-page results.
    pub pages: Vec<Page>,
}

/// A caller-supplied change to one region of one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct EditRequest {
    /// 1-based page number.
    pub page: usize,

    /// Left edge of the replacement box, in pixels.
    #[serde(default, deserialize_with = "number_or_zero")]
    #[schemars(with = "f64")]
    pub x: f64,

    /// Top edge of the replacement box, in pixels.
    #[serde(default, deserialize_with = "number_or_zero")]
    #[schemars(with = "f64")]
    pub y: f64,

    /// Width of the replacement box, in pixels.
    #[serde(default, deserialize_with = "number_or_zero")]
    #[schemars(with = "f64")]
    pub w: f64,

    /// Height of the replacement box, in pixels.
    #[serde(default, deserialize_with = "number_or_zero")]
    #[schemars(with = "f64")]
    pub h: f64,

    /// Replacement text.
    #[serde(default)]
    pub text: String,

    /// Font size, in pixels.
    #[serde(default = "default_font_size")]
    pub font_size: f32,

    /// The box as it was extracted, `[x, y, w, h]`. If the caller resized the
    /// replacement box, this is the region that still holds the old glyphs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_box: Option<[f64; 4]>,

    /// Text color as `#rrggbb`, usually the block's `fg_color`. Defaults to
    /// black.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl EditRequest {
    /// The 0-based page index, or `None` for page 0.
    pub fn page_index(&self) -> Option<usize> {
        self.page.checked_sub(1)
    }

    /// The replacement box.
    pub fn target_rect(&self) -> PixelRect {
        PixelRect::from_xywh(trunc(self.x), trunc(self.y), trunc(self.w), trunc(self.h))
    }

    /// The region to erase. Always the original box when we have one, so we
    /// never erase a shrunken box and leave stray glyphs behind.
    pub fn erase_rect(&self) -> PixelRect {
        match self.original_box {
            Some([x, y, w, h]) => PixelRect::from_xywh(trunc(x), trunc(y), trunc(w), trunc(h)),
            None => self.target_rect(),
        }
    }
}

/// The result of applying edits to a document.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct ApplyResult {
    /// Where the edited document was written.
    pub output_path: PathBuf,

    /// The file name of `output_path`.
    pub filename: String,

    /// How many pages had at least one edit.
    pub pages_edited: usize,

    /// How many edits pointed at pages that don't exist.
    pub skipped_edits: usize,
}

fn default_font_size() -> f32 {
    DEFAULT_FONT_SIZE
}

/// Truncate toward zero, the way callers' coordinates have always been
/// interpreted.
fn trunc(value: f64) -> i64 {
    if value.is_finite() { value.trunc() as i64 } else { 0 }
}

/// Accept integers, floats, or `null` (as 0).
fn number_or_zero<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_block_derives_rect_and_id() {
        let detection = Detection {
            polygon: [[30, 12], [90, 10], [92, 28], [31, 30]],
            text: "Invoice".to_owned(),
            confidence: 0.12,
        };
        let block = TextBlock::from_detection(2, 4, detection, BlockColors::default());
        assert_eq!(block.id, "page3_block4");
        assert_eq!(block.rect, PixelRect::new(30, 10, 62, 20));
        assert_eq!(block.fg_color, "#000000");
        assert_eq!(block.bg_color, "#ffffff");
        // Low confidence blocks are still reported.
        assert_eq!(block.confidence, 0.12);
    }

    #[test]
    fn text_block_serializes_expected_fields() {
        let detection = Detection {
            polygon: [[0, 0], [10, 0], [10, 5], [0, 5]],
            text: String::new(),
            confidence: 1.0,
        };
        let block = TextBlock::from_detection(0, 0, detection, BlockColors::default());
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "page1_block0",
                "text": "",
                "confidence": 1.0,
                "bbox": [[0, 0], [10, 0], [10, 5], [0, 5]],
                "rect": { "x": 0, "y": 0, "width": 10, "height": 5 },
                "fg_color": "#000000",
                "bg_color": "#ffffff",
            })
        );
    }

    #[test]
    fn edit_request_fills_in_defaults() {
        let edit: EditRequest = serde_json::from_value(json!({ "page": 1 })).unwrap();
        assert_eq!(edit.target_rect(), PixelRect::new(0, 0, 0, 0));
        assert_eq!(edit.text, "");
        assert_eq!(edit.font_size, DEFAULT_FONT_SIZE);
        assert_eq!(edit.page_index(), Some(0));
    }

    #[test]
    fn edit_request_truncates_fractional_coordinates() {
        let edit: EditRequest = serde_json::from_value(json!({
            "page": 2, "x": 10.9, "y": 20.2, "w": 100.5, "h": null,
            "text": "Hello", "font_size": 14,
        }))
        .unwrap();
        assert_eq!(edit.target_rect(), PixelRect::new(10, 20, 100, 0));
        assert_eq!(edit.font_size, 14.0);
        assert_eq!(edit.page_index(), Some(1));
    }

    #[test]
    fn erase_rect_prefers_original_box() {
        let edit: EditRequest = serde_json::from_value(json!({
            "page": 1, "x": 10, "y": 10, "w": 40, "h": 10,
            "original_box": [8, 9, 120, 22],
        }))
        .unwrap();
        assert_eq!(edit.target_rect(), PixelRect::new(10, 10, 40, 10));
        assert_eq!(edit.erase_rect(), PixelRect::new(8, 9, 120, 22));
    }

    #[test]
    fn page_zero_has_no_index() {
        let edit: EditRequest = serde_json::from_value(json!({ "page": 0 })).unwrap();
        assert_eq!(edit.page_index(), None);
    }
}
