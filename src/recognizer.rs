//! Plate text recognition with greedy CTC decoding.

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array4, ArrayD, ArrayView2, Axis, Ix2};
use tracing::warn;

use crate::config::{ChannelOrder, OutputLayout, RecognizerConfig};
use crate::error::LprError;
use crate::inference::{take_output, Model};
use crate::utils;

/// Class index meaning "nothing emitted at this timestep".
pub const BLANK: usize = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Mean probability of the emitted tokens, 0 when nothing was emitted.
    pub confidence: f32,
}

/// Collapse runs, drop blanks, map token `t` to `alphabet[t - 1]`, upper-case.
pub fn decode_tokens(tokens: &[usize], alphabet: &[char]) -> String {
    emitted(tokens)
        .filter_map(|(_, t)| alphabet.get(t - 1))
        .collect::<String>()
        .to_uppercase()
}

/// Positions and values of the tokens that survive run collapse and blank removal.
fn emitted(tokens: &[usize]) -> impl Iterator<Item = (usize, usize)> + '_ {
    tokens
        .iter()
        .enumerate()
        .filter(move |(i, t)| *i == 0 || tokens[i - 1] != **t)
        .filter(|(_, t)| **t != BLANK)
        .map(|(i, t)| (i, *t))
}

/// Best-path decode of one `[timesteps, alphabet + 1]` logits matrix.
pub fn decode_logits(logits: ArrayView2<f32>, alphabet: &[char]) -> Recognition {
    let (tokens, probs): (Vec<usize>, Vec<f32>) = logits
        .outer_iter()
        .map(|row| {
            let probs = utils::softmax(&row.to_vec());
            let token = utils::argmax(&probs);
            (token, probs[token])
        })
        .unzip();

    let kept: Vec<f32> = emitted(&tokens)
        .filter(|(_, t)| *t <= alphabet.len())
        .map(|(i, _)| probs[i])
        .collect();
    let confidence = if kept.is_empty() { 0.0 } else { kept.iter().sum::<f32>() / kept.len() as f32 };
    Recognition { text: decode_tokens(&tokens, alphabet), confidence }
}

pub struct Recognizer {
    model: Box<dyn Model>,
    alphabet: Vec<char>,
    max_text_len: usize,
    input_width: u32,
    input_height: u32,
    layout: OutputLayout,
}

impl Recognizer {
    pub fn new(model: Box<dyn Model>, config: &RecognizerConfig) -> Self {
        Self {
            model,
            alphabet: config.alphabet.chars().collect(),
            max_text_len: config.max_text_len,
            input_width: config.input_width,
            input_height: config.input_height,
            layout: config.output_layout,
        }
    }

    pub fn alphabet(&self) -> &[char] {
        &self.alphabet
    }

    /// Resize each crop, stretch its values to [0, 1] and stack as RGB `[B, 3, H, W]`.
    pub fn preprocess(&self, crops: &[RgbImage]) -> ArrayD<f32> {
        let (w, h) = (self.input_width, self.input_height);
        let mut batch = Array4::<f32>::zeros((crops.len(), 3, h as usize, w as usize));
        for (crop, out) in crops.iter().zip(batch.outer_iter_mut()) {
            let resized = imageops::resize(crop, w, h, FilterType::Triangle);
            let (lo, hi) = utils::sample_range(&resized);
            let range = (hi - lo) as f32;
            utils::write_chw(&resized, out, ChannelOrder::Rgb, |v| if range > 0.0 { (v - lo) as f32 / range } else { 0.0 });
        }
        batch.into_dyn()
    }

    /// Run the model and decode every sample of the batch independently.
    pub fn predict(&self, tensor: &ArrayD<f32>) -> Result<Vec<Recognition>, LprError> {
        let batch = tensor.shape().first().copied().unwrap_or(0);
        let mut outputs = self.model.run(tensor)?;
        let logits = take_output(&mut outputs, 0, "logits")?;
        let classes = self.alphabet.len() + 1;
        if logits.shape().last() != Some(&classes) {
            return Err(LprError::inference(format!(
                "logits shape {:?} does not end in {} classes",
                logits.shape(),
                classes
            )));
        }

        let samples: Vec<ArrayView2<f32>> = match logits.ndim() {
            2 => vec![logits.view().into_dimensionality::<Ix2>().map_err(LprError::inference)?],
            3 => {
                let axis = match self.layout {
                    OutputLayout::TimeMajor => Axis(1),
                    OutputLayout::BatchMajor => Axis(0),
                };
                logits
                    .axis_iter(axis)
                    .map(|sample| sample.into_dimensionality::<Ix2>().map_err(LprError::inference))
                    .collect::<Result<_, _>>()?
            }
            n => return Err(LprError::inference(format!("logits must have 2 or 3 axes, got {}", n))),
        };
        if samples.len() != batch {
            return Err(LprError::inference(format!("{} inputs but {} decoded samples", batch, samples.len())));
        }

        Ok(samples
            .into_iter()
            .map(|sample| {
                let recognition = decode_logits(sample, &self.alphabet);
                if recognition.text.chars().count() > self.max_text_len {
                    warn!(text = %recognition.text, max = self.max_text_len, "decoded text longer than expected");
                }
                recognition
            })
            .collect())
    }

    pub fn recognize(&self, crop: &RgbImage) -> Result<Recognition, LprError> {
        let tensor = self.preprocess(std::slice::from_ref(crop));
        let mut results = self.predict(&tensor)?;
        results.pop().ok_or_else(|| LprError::inference("recognizer returned no result"))
    }
}
