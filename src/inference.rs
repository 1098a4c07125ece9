//! Opaque inference capability.
//!
//! Detector and recognizer only ever see [`Model`]; which runtime executes the
//! graph is decided by the [`InferenceBackend`] that loaded it.

use ndarray::ArrayD;
use parking_lot::Mutex;

use std::sync::Arc;

use crate::config::ModelConfig;
use crate::error::LprError;

/// A loaded model: one input tensor in, the configured outputs out.
pub trait Model {
    fn run(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, LprError>;
}

pub trait InferenceBackend {
    fn load(&self, model: &ModelConfig) -> Result<Box<dyn Model>, LprError>;
}

impl<F> Model for F
where F: Fn(&ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, LprError>
{
    fn run(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, LprError> {
        self(input)
    }
}

/// Accelerator context shared with the rest of the host process.
///
/// Held only for the duration of a single inference call.
#[derive(Clone, Default)]
pub struct Accelerator {
    lock: Arc<Mutex<()>>,
}

impl Accelerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `model` so every `run` holds the accelerator.
    pub fn guard(&self, model: Box<dyn Model>) -> Box<dyn Model> {
        Box::new(Guarded { model, accelerator: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }
}

struct Guarded {
    model: Box<dyn Model>,
    accelerator: Accelerator,
}

impl Model for Guarded {
    fn run(&self, input: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>, LprError> {
        let _held = self.accelerator.lock.lock();
        self.model.run(input)
    }
}

/// Take output `index` or fail with an inference error naming what is missing.
pub(crate) fn take_output(outputs: &mut Vec<ArrayD<f32>>, index: usize, what: &str) -> Result<ArrayD<f32>, LprError> {
    if index >= outputs.len() {
        return Err(LprError::inference(format!(
            "model returned {} outputs, {} expected at position {}",
            outputs.len(),
            what,
            index
        )));
    }
    Ok(std::mem::take(&mut outputs[index]))
}
