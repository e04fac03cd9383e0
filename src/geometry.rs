//! Shared geometry: pixel space, vector space, and mapping between them.
//!
//! Pixel space is the coordinate system of a rasterized page, with the origin
//! at the top left and integer coordinates. Vector space is the PDF's own
//! coordinate system, measured in points. Both use a top-left origin here,
//! because that's what our vector text reader reports.

use schemars::JsonSchema;

use crate::{
    error::{JobError, JobResult},
    prelude::*,
};

/// A single integer point in pixel space.
pub type PixelPoint = [i32; 2];

/// A four-point polygon, as returned by OCR engines. The points are not
/// necessarily axis-aligned.
pub type Polygon = [PixelPoint; 4];

/// An axis-aligned rectangle in pixel space.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    /// Create a new rectangle.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build a rectangle from possibly-negative caller dimensions. Negative
    /// sizes are treated as empty.
    pub fn from_xywh(x: i64, y: i64, w: i64, h: i64) -> Self {
        let clamp_coord = |v: i64| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        let clamp_size = |v: i64| v.clamp(0, i64::from(u32::MAX)) as u32;
        Self::new(clamp_coord(x), clamp_coord(y), clamp_size(w), clamp_size(h))
    }

    /// The smallest axis-aligned rectangle containing every point of
    /// `polygon`.
    pub fn bounding(polygon: &Polygon) -> Self {
        let min_x = polygon.iter().map(|p| p[0]).min().unwrap_or(0);
        let max_x = polygon.iter().map(|p| p[0]).max().unwrap_or(0);
        let min_y = polygon.iter().map(|p| p[1]).min().unwrap_or(0);
        let max_y = polygon.iter().map(|p| p[1]).max().unwrap_or(0);
        Self::new(
            min_x,
            min_y,
            max_x.abs_diff(min_x),
            max_y.abs_diff(min_y),
        )
    }

    /// Grow the rectangle by `pad` pixels on every side, and clamp it to an
    /// image of the given size. Returns `(x1, y1, x2, y2)` with exclusive
    /// upper bounds, or `None` if nothing is left after clamping.
    pub fn padded_within(&self, pad: u32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let pad = i64::from(pad);
        let x1 = (i64::from(self.x) - pad).max(0);
        let y1 = (i64::from(self.y) - pad).max(0);
        let x2 = (i64::from(self.x) + i64::from(self.width) + pad).min(i64::from(width));
        let y2 = (i64::from(self.y) + i64::from(self.height) + pad).min(i64::from(height));
        if x1 >= x2 || y1 >= y2 {
            None
        } else {
            Some((x1 as u32, y1 as u32, x2 as u32, y2 as u32))
        }
    }
}

/// An axis-aligned rectangle in vector space, in points.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VectorRect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl VectorRect {
    /// Do these rectangles share some area? Touching edges don't count.
    pub fn intersects(&self, other: &VectorRect) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }

    /// Extend this rectangle to cover `other`.
    pub fn union(&self, other: &VectorRect) -> VectorRect {
        VectorRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

/// The dimensions of one page in both coordinate systems.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub vector_width: f64,
    pub vector_height: f64,
}

/// Converts rectangles between pixel space and vector space.
///
/// The two axes are scaled independently. Rasterizers round page sizes to
/// whole pixels, so the x and y ratios are rarely identical.
#[derive(Clone, Copy, Debug)]
pub struct CoordinateMapper {
    scale_x: f64,
    scale_y: f64,
}

impl CoordinateMapper {
    /// Create a mapper for a page.
    pub fn new(geometry: &PageGeometry) -> JobResult<Self> {
        if geometry.pixel_width == 0 || geometry.pixel_height == 0 {
            return Err(JobError::InvalidPageGeometry {
                pixel_width: geometry.pixel_width,
                pixel_height: geometry.pixel_height,
            });
        }
        Ok(Self {
            scale_x: geometry.vector_width / f64::from(geometry.pixel_width),
            scale_y: geometry.vector_height / f64::from(geometry.pixel_height),
        })
    }

    /// Map a pixel rectangle into vector space.
    pub fn to_vector(&self, rect: &PixelRect) -> VectorRect {
        let x0 = f64::from(rect.x) * self.scale_x;
        let y0 = f64::from(rect.y) * self.scale_y;
        VectorRect {
            x0,
            y0,
            x1: x0 + f64::from(rect.width) * self.scale_x,
            y1: y0 + f64::from(rect.height) * self.scale_y,
        }
    }

    /// Map a vector rectangle back into pixel space, rounding to the nearest
    /// pixel.
    #[cfg(test)]
    pub fn to_pixel(&self, rect: &VectorRect) -> PixelRect {
        let x0 = (rect.x0 / self.scale_x).round();
        let y0 = (rect.y0 / self.scale_y).round();
        let x1 = (rect.x1 / self.scale_x).round();
        let y1 = (rect.y1 / self.scale_y).round();
        PixelRect::from_xywh(x0 as i64, y0 as i64, (x1 - x0) as i64, (y1 - y0) as i64)
    }
}
