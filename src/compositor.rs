//! Drawing replacement text onto page images.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;

use crate::{error::JobError, model::DEFAULT_FONT_SIZE, prelude::*};

/// Fonts we try when the primary font is missing or unusable.
const FALLBACK_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/System/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Draws text onto page images using a primary font, with a fallback.
pub struct TextCompositor {
    primary: Option<FontVec>,
    fallback: Option<FontVec>,
}

impl TextCompositor {
    /// Load the primary font from `primary_path` (if any) and the first
    /// fallback font we can find.
    ///
    /// Missing fonts are not an error here. We log them and degrade at draw
    /// time instead.
    #[instrument(level = "debug", skip_all, fields(primary = ?primary_path))]
    pub fn load(primary_path: Option<&Path>) -> Self {
        let primary = primary_path.and_then(|path| match load_font(path) {
            Ok(font) => Some(font),
            Err(err) => {
                warn!("cannot load font {}: {:#}", path.display(), err);
                None
            }
        });
        let fallback = FALLBACK_FONT_PATHS
            .iter()
            .find_map(|path| load_font(Path::new(path)).ok());
        if primary.is_none() && fallback.is_none() {
            warn!(
                "{}",
                JobError::FontResourceUnavailable(
                    "no primary font and no system fallback font".to_owned()
                )
            );
        }
        Self::from_fonts(primary, fallback)
    }

    /// Build a compositor from already-loaded fonts.
    pub fn from_fonts(primary: Option<FontVec>, fallback: Option<FontVec>) -> Self {
        Self { primary, fallback }
    }

    /// Do we have any font at all?
    pub fn has_font(&self) -> bool {
        self.primary.is_some() || self.fallback.is_some()
    }

    /// Pick a font and scale for `font_size`.
    ///
    /// Unusable sizes switch to the fallback font at the default size, just
    /// like a missing primary font does.
    fn resolve(&self, font_size: f32) -> Option<(&FontVec, PxScale)> {
        let usable = font_size.is_finite() && font_size > 0.0;
        match (&self.primary, &self.fallback) {
            (Some(primary), _) if usable => Some((primary, PxScale::from(font_size))),
            (_, Some(fallback)) => {
                let size = if usable { font_size } else { DEFAULT_FONT_SIZE };
                Some((fallback, PxScale::from(size)))
            }
            (Some(primary), None) => Some((primary, PxScale::from(DEFAULT_FONT_SIZE))),
            (None, None) => None,
        }
    }

    /// Draw `text` with its top-left corner at `origin`. Text is neither
    /// wrapped nor clipped to any box.
    pub fn draw(
        &self,
        mut image: RgbImage,
        origin: (i32, i32),
        text: &str,
        font_size: f32,
        color: Rgb<u8>,
    ) -> RgbImage {
        if text.is_empty() {
            return image;
        }
        let Some((font, scale)) = self.resolve(font_size) else {
            warn!("not drawing {:?}: no usable font", text);
            return image;
        };
        if scale.y != font_size {
            debug!("font size {} unusable, drawing at {}", font_size, scale.y);
        }
        draw_text_mut(&mut image, color, origin.0, origin.1, scale, font, text);
        image
    }
}

fn load_font(path: &Path) -> Result<FontVec> {
    let data =
        std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    FontVec::try_from_vec(data).with_context(|| format!("cannot parse {}", path.display()))
}
