//! Applying a page's edits: erase everything first, then draw everything.
//!
//! The two passes are separate types so they can't be interleaved. If we drew
//! each edit right after erasing it, a later edit whose box overlaps an
//! earlier one would erase the earlier edit's new text.

use image::{Rgb, RgbImage};

use crate::{color::parse_hex, compositor::TextCompositor, model::EditRequest, prelude::*};

/// Color used for replacement text when an edit doesn't specify one.
const DEFAULT_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// A page image with every edit region erased, ready for text overlay.
#[derive(Debug)]
pub struct ErasedPage(RgbImage);

/// Erase every edit's region, in order.
///
/// Later erasures may fill from pixels an earlier erasure produced.
pub fn erase_pass(image: RgbImage, edits: &[EditRequest]) -> ErasedPage {
    let image = edits.iter().fold(image, |image, edit| {
        crate::eraser::erase(image, &edit.erase_rect())
    });
    ErasedPage(image)
}

/// Draw every edit's text, in order. Later text is drawn over earlier text.
pub fn overlay_pass(
    page: ErasedPage,
    edits: &[EditRequest],
    compositor: &TextCompositor,
) -> RgbImage {
    edits.iter().fold(page.0, |image, edit| {
        let rect = edit.target_rect();
        compositor.draw(
            image,
            (rect.x, rect.y),
            &edit.text,
            edit.font_size,
            text_color(edit),
        )
    })
}

/// Apply all of a page's edits. A page with no edits is returned unchanged.
#[instrument(level = "debug", skip_all, fields(edits = edits.len()))]
pub fn apply_page_edits(
    image: RgbImage,
    edits: &[EditRequest],
    compositor: &TextCompositor,
) -> RgbImage {
    if edits.is_empty() {
        return image;
    }
    overlay_pass(erase_pass(image, edits), edits, compositor)
}

fn text_color(edit: &EditRequest) -> Rgb<u8> {
    match &edit.color {
        None => DEFAULT_TEXT_COLOR,
        Some(hex) => match parse_hex(hex) {
            Some(rgb) => Rgb(rgb),
            None => {
                warn!("ignoring malformed text color {:?}", hex);
                DEFAULT_TEXT_COLOR
            }
        },
    }
}
