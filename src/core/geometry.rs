//! Coordinate conversion between page space and layout space.
//!
//! Page space is PDF native: points at 72dpi, origin at the bottom-left of the
//! unrotated page. Layout space is what a viewer arranges pages in: origin at
//! the top-left of the rotated page, optionally scaled.
//!
//! All functions here are pure.

use super::backend::PageRotation;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PdfPoint {
    pub x: f32,
    pub y: f32,
}

impl PdfPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Rotates a point of an unrotated `width` x `height` page.
    ///
    /// The result is in the bottom-left based space of the rotated page.
    pub fn rotate(self, rotation: PageRotation, width: f32, height: f32) -> Self {
        let (x, y) = (self.x, self.y);
        match rotation {
            PageRotation::Deg0 => self,
            PageRotation::Deg90 => Self::new(height - y, x),
            PageRotation::Deg180 => Self::new(width - x, height - y),
            PageRotation::Deg270 => Self::new(y, width - x),
        }
    }

    /// Inverse of [`rotate`](Self::rotate); `width`/`height` are still the
    /// unrotated page size.
    pub fn rotate_reverse(self, rotation: PageRotation, width: f32, height: f32) -> Self {
        let (x, y) = (self.x, self.y);
        match rotation {
            PageRotation::Deg0 => self,
            PageRotation::Deg90 => Self::new(y, height - x),
            PageRotation::Deg180 => Self::new(width - x, height - y),
            PageRotation::Deg270 => Self::new(width - y, x),
        }
    }
}

/// Rectangle in page space; `top >= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PdfRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl PdfRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    fn from_corners(a: PdfPoint, b: PdfPoint) -> Self {
        Self {
            left: a.x.min(b.x),
            top: a.y.max(b.y),
            right: a.x.max(b.x),
            bottom: a.y.min(b.y),
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.top - self.bottom
    }

    pub fn rotate(self, rotation: PageRotation, width: f32, height: f32) -> Self {
        let a = PdfPoint::new(self.left, self.top).rotate(rotation, width, height);
        let b = PdfPoint::new(self.right, self.bottom).rotate(rotation, width, height);
        Self::from_corners(a, b)
    }

    pub fn rotate_reverse(self, rotation: PageRotation, width: f32, height: f32) -> Self {
        let a = PdfPoint::new(self.left, self.top).rotate_reverse(rotation, width, height);
        let b = PdfPoint::new(self.right, self.bottom).rotate_reverse(rotation, width, height);
        Self::from_corners(a, b)
    }
}

/// Point in layout space, relative to the page's top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offset {
    pub dx: f32,
    pub dy: f32,
}

impl Offset {
    pub fn new(dx: f32, dy: f32) -> Self {
        Self { dx, dy }
    }

    pub fn distance(self, other: Offset) -> f32 {
        ((self.dx - other.dx).powi(2) + (self.dy - other.dy).powi(2)).sqrt()
    }
}

/// Rectangle in layout space; `top <= bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LayoutRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl LayoutRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self::new(left, top, left + width, top + height)
    }

    pub fn center(&self) -> Offset {
        Offset::new(
            (self.left + self.right) / 2.0,
            (self.top + self.bottom) / 2.0,
        )
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Displayed size and rotation of one page.
///
/// `width`/`height` are post-rotation, as reported by a page handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageFrame {
    pub width: f32,
    pub height: f32,
    pub rotation: PageRotation,
}

impl PageFrame {
    pub fn new(width: f32, height: f32, rotation: PageRotation) -> Self {
        Self {
            width,
            height,
            rotation,
        }
    }

    /// Size of the page before rotation.
    pub fn unrotated_size(&self) -> (f32, f32) {
        if self.rotation.is_odd() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Layout units per point for a page displayed `scaled_height` tall.
    fn scale(&self, scaled_height: Option<f32>) -> f32 {
        match scaled_height {
            Some(h) if self.height > 0.0 && h > 0.0 => h / self.height,
            _ => 1.0,
        }
    }
}

/// Converts a page-space point to a layout offset.
pub fn point_to_offset(point: PdfPoint, frame: &PageFrame, scaled_height: Option<f32>) -> Offset {
    let (w, h) = frame.unrotated_size();
    let rotated = point.rotate(frame.rotation, w, h);
    let scale = frame.scale(scaled_height);
    Offset::new(rotated.x * scale, (frame.height - rotated.y) * scale)
}

/// Converts a layout offset back to a page-space point.
pub fn offset_to_point(offset: Offset, frame: &PageFrame, scaled_height: Option<f32>) -> PdfPoint {
    let (w, h) = frame.unrotated_size();
    let scale = frame.scale(scaled_height);
    let rotated = PdfPoint::new(offset.dx / scale, frame.height - offset.dy / scale);
    rotated.rotate_reverse(frame.rotation, w, h)
}

pub fn rect_to_layout(rect: PdfRect, frame: &PageFrame, scaled_height: Option<f32>) -> LayoutRect {
    let a = point_to_offset(PdfPoint::new(rect.left, rect.top), frame, scaled_height);
    let b = point_to_offset(PdfPoint::new(rect.right, rect.bottom), frame, scaled_height);
    LayoutRect::new(a.dx.min(b.dx), a.dy.min(b.dy), a.dx.max(b.dx), a.dy.max(b.dy))
}

pub fn layout_to_rect(rect: LayoutRect, frame: &PageFrame, scaled_height: Option<f32>) -> PdfRect {
    let a = offset_to_point(Offset::new(rect.left, rect.top), frame, scaled_height);
    let b = offset_to_point(Offset::new(rect.right, rect.bottom), frame, scaled_height);
    PdfRect::from_corners(a, b)
}
