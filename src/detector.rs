//! Plate localisation: model pre/post-processing around an opaque detection model.

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array2, Array4, ArrayD, Axis, Ix2};
use tracing::debug;

use crate::config::{ChannelOrder, DetectorConfig};
use crate::error::LprError;
use crate::inference::{take_output, Model};
use crate::region::PixelRect;
use crate::utils;

/// Model output for one candidate, before any filtering.
///
/// Box components are relative to the preprocessed (resized) input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    /// `[background, plate]`
    pub scores: [f32; 2],
    /// `[x_min, y_min, x_max, y_max]`
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn confidence(&self) -> f32 {
        self.scores[1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub confidence: f32,
}

impl From<&RawDetection> for Detection {
    fn from(raw: &RawDetection) -> Self {
        let [left, top, right, bottom] = raw.bbox;
        Self { left, top, right, bottom, confidence: raw.confidence() }
    }
}

impl Detection {
    /// Intersection over union using inclusive-pixel areas, `(x2 - x1 + 1) * (y2 - y1 + 1)`.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.left.max(other.left);
        let iy1 = self.top.max(other.top);
        let ix2 = self.right.min(other.right);
        let iy2 = self.bottom.min(other.bottom);
        let inter = (ix2 - ix1 + 1.0).max(0.0) * (iy2 - iy1 + 1.0).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    fn area(&self) -> f32 {
        (self.right - self.left + 1.0) * (self.bottom - self.top + 1.0)
    }

    /// Scale normalised box components to a `width` x `height` image, truncating.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let (w, h) = (width as f32, height as f32);
        PixelRect {
            left: (self.left * w) as i64,
            top: (self.top * h) as i64,
            right: (self.right * w) as i64,
            bottom: (self.bottom * h) as i64,
        }
    }
}

/// Threshold, keep the `top_n` most confident, then greedy NMS over what is left.
///
/// Suppression only sees the truncated set, so a well separated box can lose
/// its slot to a near-duplicate of a stronger one.
pub fn postprocess(raw: &[RawDetection], threshold: f32, top_n: usize, iou_threshold: f32) -> Vec<Detection> {
    let mut candidates = filter_sorted(raw, threshold);
    candidates.truncate(top_n);
    nms(candidates, iou_threshold)
}

/// Same filters, but suppression runs before truncation.
pub fn postprocess_nms_first(raw: &[RawDetection], threshold: f32, top_n: usize, iou_threshold: f32) -> Vec<Detection> {
    let mut kept = nms(filter_sorted(raw, threshold), iou_threshold);
    kept.truncate(top_n);
    kept
}

fn filter_sorted(raw: &[RawDetection], threshold: f32) -> Vec<Detection> {
    let mut candidates: Vec<Detection> =
        raw.iter().filter(|r| r.confidence() > threshold).map(Detection::from).collect();
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates
}

/// Greedy NMS: take the most confident box, drop everything overlapping it
/// by more than `iou_threshold`, repeat.
pub fn nms(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if !suppressed[j] && boxes[i].iou(&boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    kept
}

pub struct Detector {
    model: Box<dyn Model>,
    input_width: u32,
    input_height: u32,
    channel_order: ChannelOrder,
    threshold: f32,
    top_n: usize,
    iou_threshold: f32,
    nms_before_top_n: bool,
}

impl Detector {
    pub fn new(model: Box<dyn Model>, config: &DetectorConfig) -> Self {
        Self {
            model,
            input_width: config.input_width,
            input_height: config.input_height,
            channel_order: config.channel_order,
            threshold: config.threshold,
            top_n: config.top_n,
            iou_threshold: config.iou_threshold,
            nms_before_top_n: config.nms_before_top_n,
        }
    }

    /// Resize to the model input and lay out as `[1, 3, H, W]` in the configured
    /// channel order, raw 0-255 values.
    pub fn preprocess(&self, image: &RgbImage) -> ArrayD<f32> {
        let resized = imageops::resize(image, self.input_width, self.input_height, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height as usize, self.input_width as usize));
        utils::write_chw(&resized, tensor.index_axis_mut(Axis(0), 0), self.channel_order, |v| v as f32);
        tensor.into_dyn()
    }

    /// Run the model; expects `scores [1, N, 2]` and `boxes [1, N, 4]`.
    pub fn predict(&self, tensor: &ArrayD<f32>) -> Result<Vec<RawDetection>, LprError> {
        let mut outputs = self.model.run(tensor)?;
        let scores = squeeze_batch(take_output(&mut outputs, 0, "scores")?, 2, "scores")?;
        let boxes = squeeze_batch(take_output(&mut outputs, 1, "boxes")?, 4, "boxes")?;
        if scores.nrows() != boxes.nrows() {
            return Err(LprError::inference(format!(
                "{} score rows but {} box rows",
                scores.nrows(),
                boxes.nrows()
            )));
        }
        Ok(scores
            .outer_iter()
            .zip(boxes.outer_iter())
            .map(|(s, b)| RawDetection { scores: [s[0], s[1]], bbox: [b[0], b[1], b[2], b[3]] })
            .collect())
    }

    pub fn postprocess(&self, raw: &[RawDetection]) -> Vec<Detection> {
        if self.nms_before_top_n {
            postprocess_nms_first(raw, self.threshold, self.top_n, self.iou_threshold)
        } else {
            postprocess(raw, self.threshold, self.top_n, self.iou_threshold)
        }
    }

    /// preprocess, predict, postprocess
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>, LprError> {
        let tensor = self.preprocess(image);
        let raw = self.predict(&tensor)?;
        let detections = self.postprocess(&raw);
        debug!(candidates = raw.len(), kept = detections.len(), "detector postprocess");
        Ok(detections)
    }
}

/// Drop a leading batch axis of 1 and check the row width.
fn squeeze_batch(arr: ArrayD<f32>, width: usize, what: &str) -> Result<Array2<f32>, LprError> {
    let arr = if arr.ndim() == 3 {
        if arr.shape()[0] != 1 {
            return Err(LprError::inference(format!("{} output has batch {}, expected 1", what, arr.shape()[0])));
        }
        arr.index_axis_move(Axis(0), 0)
    } else {
        arr
    };
    let shape = arr.shape().to_vec();
    let arr = arr
        .into_dimensionality::<Ix2>()
        .map_err(|_| LprError::inference(format!("{} output has shape {:?}", what, shape)))?;
    if arr.ncols() != width {
        return Err(LprError::inference(format!("{} output rows have {} values, expected {}", what, arr.ncols(), width)));
    }
    Ok(arr)
}
