use image::{imageops, RgbImage};

use crate::config::{Point, RegionConfig};
use crate::error::LprError;

/// Axis-aligned pixel rectangle, `right`/`bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl PixelRect {
    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn translate(&self, dx: i64, dy: i64) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    /// Intersection with the `width` x `height` image rectangle.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as i64, height as i64);
        Self {
            left: self.left.clamp(0, w),
            top: self.top.clamp(0, h),
            right: self.right.clamp(0, w),
            bottom: self.bottom.clamp(0, h),
        }
    }
}

/// Sub-image cut out of a frame, with its place in the frame.
pub struct RegionCrop {
    pub image: RgbImage,
    pub origin: (i64, i64),
}

/// Rectangle spanned by corner 0 (top-left) and corner 2 (bottom-right).
pub fn region_rect(region: &RegionConfig) -> Result<PixelRect, LprError> {
    let corner = |i: usize| -> Result<Point, LprError> {
        region.coordinates.get(i).copied().ok_or_else(|| {
            LprError::region_bounds(&region.name, format!("expected at least 4 points, got {}", region.coordinates.len()))
        })
    };
    let top_left = corner(0)?;
    let bottom_right = corner(2)?;
    Ok(PixelRect { left: top_left.x, top: top_left.y, right: bottom_right.x, bottom: bottom_right.y })
}

/// Slice `region` out of `frame`, clamped to the frame.
pub fn extract(frame: &RgbImage, region: &RegionConfig) -> Result<RegionCrop, LprError> {
    let requested = region_rect(region)?;
    let rect = requested.clamp_to(frame.width(), frame.height());
    if rect.is_empty() {
        return Err(LprError::region_bounds(
            &region.name,
            format!("{:?} is empty or outside the {}x{} frame", requested, frame.width(), frame.height()),
        ));
    }
    let image = crop(frame, &rect);
    Ok(RegionCrop { image, origin: (rect.left, rect.top) })
}

/// Copy a non-empty, in-bounds rectangle out of `img`.
pub(crate) fn crop(img: &RgbImage, rect: &PixelRect) -> RgbImage {
    imageops::crop_imm(img, rect.left as u32, rect.top as u32, rect.width() as u32, rect.height() as u32).to_image()
}
