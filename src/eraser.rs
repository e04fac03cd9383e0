//! Removing the original glyphs from a region of a page image.
//!
//! We fill the masked region from its surroundings with a small diffusion
//! inpainter. First we peel the mask from the outside in, filling each layer
//! with a distance-weighted average of the known pixels within
//! [`INPAINT_RADIUS`]. Then we relax the filled pixels with a few rounds of
//! neighbour averaging to soften the seams between layers.
//!
//! Every filled value is a convex combination of original pixel values, so a
//! flat background stays flat and nothing outside the mask is touched.

use image::{Rgb, RgbImage};

use crate::geometry::PixelRect;

/// How far past the requested rectangle we erase, in pixels. This catches
/// anti-aliased glyph edges that OCR boxes tend to clip.
pub const ERASE_PADDING: u32 = 3;

/// How far away a known pixel may be and still contribute to a fill.
pub const INPAINT_RADIUS: u32 = 3;

/// Rounds of neighbour averaging after the initial fill.
const SMOOTHING_PASSES: usize = 8;

/// Erase `rect` (plus padding) from `image`.
///
/// A zero-width or zero-height rectangle still erases its padding. A fully
/// off-image rectangle returns the image unchanged, as does a mask covering the
/// entire image, since there is nothing to fill from.
pub fn erase(mut image: RgbImage, rect: &PixelRect) -> RgbImage {
    let (width, height) = image.dimensions();
    let Some(mask) = rect.padded_within(ERASE_PADDING, width, height) else {
        return image;
    };
    let mut window = Window::around(&image, mask);
    if !window.fill() {
        return image;
    }
    window.smooth();
    window.write_back(&mut image);
    image
}

/// The masked region plus a border of [`INPAINT_RADIUS`] pixels, copied into
/// floating point so repeated averaging doesn't accumulate rounding error.
struct Window {
    /// Left edge of the window in image coordinates.
    left: u32,
    /// Top edge of the window in image coordinates.
    top: u32,
    width: usize,
    height: usize,
    pixels: Vec<[f32; 3]>,
    masked: Vec<bool>,
    known: Vec<bool>,
}

impl Window {
    fn around(image: &RgbImage, (x1, y1, x2, y2): (u32, u32, u32, u32)) -> Self {
        let (image_width, image_height) = image.dimensions();
        let left = x1.saturating_sub(INPAINT_RADIUS);
        let top = y1.saturating_sub(INPAINT_RADIUS);
        let right = (x2 + INPAINT_RADIUS).min(image_width);
        let bottom = (y2 + INPAINT_RADIUS).min(image_height);
        let width = (right - left) as usize;
        let height = (bottom - top) as usize;

        let mut pixels = Vec::with_capacity(width * height);
        let mut masked = Vec::with_capacity(width * height);
        for y in top..bottom {
            for x in left..right {
                let Rgb([r, g, b]) = *image.get_pixel(x, y);
                pixels.push([f32::from(r), f32::from(g), f32::from(b)]);
                masked.push(x >= x1 && x < x2 && y >= y1 && y < y2);
            }
        }
        let known = masked.iter().map(|m| !m).collect();
        Self {
            left,
            top,
            width,
            height,
            pixels,
            masked,
            known,
        }
    }

    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    /// Offsets of the in-window neighbours of `(x, y)` within `radius`,
    /// including diagonals, paired with their squared distance.
    fn neighbours(
        &self,
        x: usize,
        y: usize,
        radius: i64,
    ) -> impl Iterator<Item = (usize, i64)> + '_ {
        let (x, y) = (x as i64, y as i64);
        (-radius..=radius).flat_map(move |dy| {
            (-radius..=radius).filter_map(move |dx| {
                let dist2 = dx * dx + dy * dy;
                if dist2 == 0 || dist2 > radius * radius {
                    return None;
                }
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                    return None;
                }
                Some((self.index(nx as usize, ny as usize), dist2))
            })
        })
    }

    /// Fill masked pixels layer by layer. Returns `false` if there were no
    /// known pixels to start from.
    fn fill(&mut self) -> bool {
        if !self.known.iter().any(|&k| k) {
            return false;
        }
        let radius = i64::from(INPAINT_RADIUS);
        loop {
            // The next layer is every unknown pixel touching a known one.
            let mut layer = vec![];
            for y in 0..self.height {
                for x in 0..self.width {
                    let idx = self.index(x, y);
                    if !self.known[idx]
                        && self.neighbours(x, y, 1).any(|(n, _)| self.known[n])
                    {
                        layer.push((x, y));
                    }
                }
            }
            if layer.is_empty() {
                return true;
            }

            // Compute the whole layer before marking any of it known, so the
            // result doesn't depend on scan order.
            let values = layer
                .iter()
                .map(|&(x, y)| {
                    let mut sum = [0.0f32; 3];
                    let mut total = 0.0f32;
                    for (n, dist2) in self.neighbours(x, y, radius) {
                        if self.known[n] {
                            let weight = 1.0 / dist2 as f32;
                            for (s, v) in sum.iter_mut().zip(self.pixels[n]) {
                                *s += weight * v;
                            }
                            total += weight;
                        }
                    }
                    sum.map(|s| s / total)
                })
                .collect::<Vec<_>>();
            for (&(x, y), value) in layer.iter().zip(values) {
                let idx = self.index(x, y);
                self.pixels[idx] = value;
                self.known[idx] = true;
            }
        }
    }

    /// Relax masked pixels towards the mean of their 4-neighbours.
    fn smooth(&mut self) {
        for _ in 0..SMOOTHING_PASSES {
            let mut next = self.pixels.clone();
            for y in 0..self.height {
                for x in 0..self.width {
                    let idx = self.index(x, y);
                    if !self.masked[idx] {
                        continue;
                    }
                    let mut sum = [0.0f32; 3];
                    let mut count = 0.0f32;
                    for (n, dist2) in self.neighbours(x, y, 1) {
                        if dist2 == 1 {
                            for (s, v) in sum.iter_mut().zip(self.pixels[n]) {
                                *s += v;
                            }
                            count += 1.0;
                        }
                    }
                    if count > 0.0 {
                        next[idx] = sum.map(|s| s / count);
                    }
                }
            }
            self.pixels = next;
        }
    }

    fn write_back(&self, image: &mut RgbImage) {
        for y in 0..self.height {
            for x in 0..self.width {
                let idx = self.index(x, y);
                if self.masked[idx] {
                    let value = self.pixels[idx].map(|v| v.round().clamp(0.0, 255.0) as u8);
                    image.put_pixel(self.left + x as u32, self.top + y as u32, Rgb(value));
                }
            }
        }
    }
}
