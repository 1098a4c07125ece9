use ab_glyph::InvalidFont;
use image::ImageError;
use ndarray::ShapeError;
use thiserror::Error;

use std::io::Error as IOError;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct LprError(LprErrorKind);

#[derive(Debug, Error)]
pub enum LprErrorKind {
    /// source cannot be opened or reopened
    #[error("failed to open video source {uri:?}: {reason}")]
    Connection { uri: String, reason: String },

    /// a single frame read failed
    #[error("failed to capture frame: {0}")]
    Capture(String),

    #[error("invalid region {name:?}: {reason}")]
    RegionBounds { name: String, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("gave up after {attempts} consecutive stream failures: {last}")]
    RetryBudgetExceeded { attempts: u32, last: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("publish to {topic:?} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error(transparent)]
    IOError(#[from] IOError),

    #[error(transparent)]
    ImageError(#[from] ImageError),

    #[error(transparent)]
    FontError(#[from] InvalidFont),

    #[error("tensor shape error: {0}")]
    ShapeError(#[from] ShapeError),

    #[cfg(feature = "tensorflow")]
    #[error(transparent)]
    TensorflowError(#[from] tensorflow::Status),
}

impl LprError {
    pub fn kind(&self) -> &LprErrorKind {
        &self.0
    }

    pub fn into_kind(self) -> LprErrorKind {
        self.0
    }

    pub fn connection(uri: &str, reason: impl ToString) -> Self {
        Self(LprErrorKind::Connection { uri: uri.to_string(), reason: reason.to_string() })
    }

    pub fn capture(reason: impl ToString) -> Self {
        Self(LprErrorKind::Capture(reason.to_string()))
    }

    pub fn region_bounds(name: &str, reason: impl ToString) -> Self {
        Self(LprErrorKind::RegionBounds { name: name.to_string(), reason: reason.to_string() })
    }

    pub fn inference(reason: impl ToString) -> Self {
        Self(LprErrorKind::Inference(reason.to_string()))
    }

    pub fn config(reason: impl ToString) -> Self {
        Self(LprErrorKind::Config(reason.to_string()))
    }

    pub fn is_retry_budget_exceeded(&self) -> bool {
        matches!(self.0, LprErrorKind::RetryBudgetExceeded { .. })
    }
}

impl LprErrorKind {
    /// Short stable tag, used as the `error` field in structured logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "ConnectionError",
            Self::Capture(_) => "CaptureError",
            Self::RegionBounds { .. } => "RegionBoundsError",
            Self::Inference(_) => "InferenceError",
            Self::RetryBudgetExceeded { .. } => "RetryBudgetExceeded",
            Self::Config(_) => "ConfigError",
            Self::Publish { .. } => "PublishError",
            Self::IOError(_) => "IOError",
            Self::ImageError(_) => "ImageError",
            Self::FontError(_) => "FontError",
            Self::ShapeError(_) => "ShapeError",
            #[cfg(feature = "tensorflow")]
            Self::TensorflowError(_) => "TensorflowError",
        }
    }
}

impl<T> From<T> for LprError
where T: Into<LprErrorKind>
{
    fn from(e: T) -> Self {
        Self(e.into())
    }
}
