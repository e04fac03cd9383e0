//! Guessing the colors of a text block from the original vector page.
//!
//! We never sample pixels. Instead, we look for the vector text runs that lie
//! under an OCR block and use the color of the first one we find. This is a
//! heuristic: a block spanning a color change is reported as one color.

use crate::{
    error::{JobError, JobResult},
    geometry::{CoordinateMapper, PageGeometry, PixelRect, VectorRect},
    prelude::*,
    vector::{TextRun, VectorPage},
};

/// An RGB color with components from 0 to 1.
pub type Rgb01 = [f32; 3];

/// Default background color.
pub const WHITE: Rgb01 = [1.0, 1.0, 1.0];

/// Default foreground color.
pub const BLACK: Rgb01 = [0.0, 0.0, 0.0];

/// The inferred colors of a text block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockColors {
    pub background: Rgb01,
    pub foreground: Rgb01,
}

impl Default for BlockColors {
    fn default() -> Self {
        Self {
            background: WHITE,
            foreground: BLACK,
        }
    }
}

impl BlockColors {
    /// The foreground as `#rrggbb`.
    pub fn foreground_hex(&self) -> String {
        to_hex(self.foreground)
    }

    /// The background as `#rrggbb`.
    pub fn background_hex(&self) -> String {
        to_hex(self.background)
    }
}

/// Infer colors for a vector-space rectangle.
///
/// The first run (in document order) that intersects `rect` supplies the
/// foreground color. The background is always white.
pub fn inspect(rect: &VectorRect, runs: &[TextRun]) -> BlockColors {
    match try_inspect(rect, runs) {
        Ok(colors) => colors,
        Err(err) => {
            warn!("using default colors: {}", err);
            BlockColors::default()
        }
    }
}

/// Like [`inspect`], but report why we fell back to defaults.
fn try_inspect(rect: &VectorRect, runs: &[TextRun]) -> JobResult<BlockColors> {
    let Some(run) = runs.iter().find(|run| run.bbox.intersects(rect)) else {
        return Ok(BlockColors::default());
    };
    let foreground = decode_color(&run.color).ok_or_else(|| {
        JobError::ColorInspectionFailure(format!("malformed color {:?}", run.color))
    })?;
    Ok(BlockColors {
        background: WHITE,
        foreground,
    })
}

/// Infer colors for an OCR block on a page, if we have the page's vector form.
///
/// Any failure, including a zero-sized raster page, degrades to the default
/// colors so that one bad block never aborts an extraction.
pub fn inspect_block(
    rect: &PixelRect,
    pixel_size: (u32, u32),
    vector_page: Option<&VectorPage>,
) -> BlockColors {
    let Some(vector_page) = vector_page else {
        return BlockColors::default();
    };
    let geometry = PageGeometry {
        pixel_width: pixel_size.0,
        pixel_height: pixel_size.1,
        vector_width: vector_page.width,
        vector_height: vector_page.height,
    };
    match CoordinateMapper::new(&geometry) {
        Ok(mapper) => inspect(&mapper.to_vector(rect), &vector_page.runs),
        Err(err) => {
            warn!("using default colors: {}", err);
            BlockColors::default()
        }
    }
}

/// Decode an encoded run color.
///
/// We accept `#rrggbb` (as written by `mutool`) and packed sRGB integers (as
/// used by some other PDF libraries).
pub fn decode_color(encoded: &str) -> Option<Rgb01> {
    let encoded = encoded.trim();
    let packed = if let Some(hex) = encoded.strip_prefix('#') {
        if hex.len() != 6 {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()?
    } else {
        let value = encoded.parse::<u32>().ok()?;
        if value > 0xff_ffff {
            return None;
        }
        value
    };
    let channel = |shift: u32| ((packed >> shift) & 0xff) as f32 / 255.0;
    Some([channel(16), channel(8), channel(0)])
}

/// Convert a color to `#rrggbb`.
pub fn to_hex(color: Rgb01) -> String {
    let [r, g, b] = color.map(to_byte);
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

/// Parse `#rrggbb` into 8-bit RGB.
pub fn parse_hex(hex: &str) -> Option<[u8; 3]> {
    if !hex.trim().starts_with('#') {
        return None;
    }
    decode_color(hex).map(|color| color.map(to_byte))
}

fn to_byte(component: f32) -> u8 {
    (component.clamp(0.0, 1.0) * 255.0).round() as u8
}
