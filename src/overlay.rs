//! Detection boxes and plate labels drawn onto the frame.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::debug;

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::OverlayConfig;
use crate::error::LprError;
use crate::region::PixelRect;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: i64 = 2;
const TEXT_GAP: i32 = 10;

const DEFAULT_FONT: &[u8] = include_bytes!("../fonts/DejaVuSans.ttf");

pub struct Overlay {
    font: Option<FontVec>,
    scale: PxScale,
    output: Option<PathBuf>,
    draw_after_regions: bool,
}

impl Overlay {
    pub fn new(config: &OverlayConfig) -> Result<Self, LprError> {
        let data = match &config.font {
            Some(path) => fs::read(path)?,
            None => DEFAULT_FONT.to_vec(),
        };
        Ok(Self {
            font: Some(FontVec::try_from_vec(data)?),
            scale: PxScale::from(20.0),
            output: config.output.clone(),
            draw_after_regions: config.draw_after_regions,
        })
    }

    /// Boxes only, nothing written to disk.
    pub fn boxes_only() -> Self {
        Self { font: None, scale: PxScale::from(20.0), output: None, draw_after_regions: false }
    }

    pub fn with_draw_after_regions(mut self, deferred: bool) -> Self {
        self.draw_after_regions = deferred;
        self
    }

    /// Whether boxes wait until every region of the frame has been read.
    pub fn draws_after_regions(&self) -> bool {
        self.draw_after_regions
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Green box around `rect`, with `text` in red just above it.
    pub fn annotate(&self, img: &mut RgbImage, rect: &PixelRect, text: &str) {
        let rect = rect.clamp_to(img.width(), img.height());
        for inset in 0..BOX_THICKNESS {
            let w = rect.width() - 2 * inset;
            let h = rect.height() - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let r = Rect::at((rect.left + inset) as i32, (rect.top + inset) as i32).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(img, r, BOX_COLOR);
        }

        if let Some(font) = &self.font {
            let y = rect.top as i32 - TEXT_GAP - self.scale.y as i32;
            draw_text_mut(img, TEXT_COLOR, rect.left as i32, y, self.scale, font, text);
        }
    }

    /// Write the annotated frame to the configured output, if any.
    pub fn save(&self, img: &RgbImage) -> Result<(), LprError> {
        if let Some(path) = &self.output {
            img.save(path)?;
            debug!(path = %path.display(), "annotated frame written");
        }
        Ok(())
    }
}
