//! Edge licence-plate recognition: capture frames, find plates inside
//! configured regions, read them and publish what was read.

pub mod config;
pub mod detector;
pub mod error;
pub mod inference;
pub mod logging;
pub mod overlay;
pub mod pipeline;
pub mod publisher;
pub mod recognizer;
pub mod region;
pub mod source;
#[cfg(feature = "tensorflow")]
pub mod tf;
pub mod utils;

pub use config::AppConfig;
pub use detector::{Detection, Detector};
pub use error::{LprError, LprErrorKind};
pub use inference::{Accelerator, InferenceBackend, Model};
pub use pipeline::{FrameReport, Pipeline, PlateEvent, RunSummary};
pub use publisher::{JsonLinesPublisher, Publisher};
pub use recognizer::{Recognition, Recognizer};
pub use source::{Frame, FrameSource, StreamState, VideoSource};
