//! Deployment configuration.
//!
//! Everything the pipeline needs is read once from a TOML file into
//! [`AppConfig`] and then handed to each component's constructor.

use serde::{Deserialize, Serialize};

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LprError;

pub const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    pub detector: DetectorConfig,
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    pub camera: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Mirror log lines to stderr; stdout carries published messages.
    #[serde(default = "default_true")]
    pub console: bool,
    /// Directory for daily rotated log files; no file logging when unset.
    pub directory: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            console: true,
            directory: None,
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_plate_topic")]
    pub plate_topic: String,
    #[serde(default = "default_error_topic")]
    pub error_topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { plate_topic: default_plate_topic(), error_topic: default_error_topic() }
    }
}

/// Reference to a model the inference backend knows how to load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Name of the input operation / tensor.
    pub input: String,
    /// Output operations / tensors, in the order the consumer expects them.
    pub outputs: Vec<String>,
}

/// Order in which colour planes are laid out in a model input tensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

impl ChannelOrder {
    /// Source RGB channel for each output plane.
    pub fn indices(&self) -> [usize; 3] {
        match self {
            ChannelOrder::Bgr => [2, 1, 0],
            ChannelOrder::Rgb => [0, 1, 2],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub threshold: f32,
    pub top_n: usize,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    /// Run suppression on the full filtered set before truncating to `top_n`.
    /// Off by default to keep the historical truncate-then-suppress order.
    #[serde(default)]
    pub nms_before_top_n: bool,
    /// The deployed detection graph was trained on BGR frames.
    #[serde(default)]
    pub channel_order: ChannelOrder,
    #[serde(default = "default_detector_size")]
    pub input_width: u32,
    #[serde(default = "default_detector_size")]
    pub input_height: u32,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `[time, batch, classes]`
    #[default]
    TimeMajor,
    /// `[batch, time, classes]`
    BatchMajor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_recognizer_width")]
    pub input_width: u32,
    #[serde(default = "default_recognizer_height")]
    pub input_height: u32,
    #[serde(default)]
    pub output_layout: OutputLayout,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
    /// A capture that yields no frame for this long is a capture failure.
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            capture_timeout_seconds: default_capture_timeout(),
        }
    }
}

impl RetryConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.capture_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// TrueType font for plate labels, the bundled DejaVu Sans when unset.
    pub font: Option<PathBuf>,
    /// Where to write the annotated frame after each processed frame.
    pub output: Option<PathBuf>,
    /// Hold every box until all regions of the frame are read, so overlapping
    /// regions crop clean pixels. Unset, each plate is drawn as soon as it is published.
    #[serde(default)]
    pub draw_after_regions: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

/// Named region of interest. Only corners 0 (top-left) and 2 (bottom-right)
/// are read; the polygon must be supplied in that corner order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionConfig {
    pub name: String,
    pub coordinates: Vec<Point>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub input_stream: String,
    pub image_size: ImageSize,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u64 {
    7
}

fn default_plate_topic() -> String {
    "alpr/ramp/req".to_string()
}

fn default_error_topic() -> String {
    "alpr/ramp/error".to_string()
}

fn default_iou_threshold() -> f32 {
    0.45
}

fn default_detector_size() -> u32 {
    300
}

fn default_alphabet() -> String {
    DEFAULT_ALPHABET.to_string()
}

fn default_max_text_len() -> usize {
    9
}

fn default_recognizer_width() -> u32 {
    200
}

fn default_recognizer_height() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> f64 {
    5.0
}

fn default_capture_timeout() -> f64 {
    30.0
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LprError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LprError> {
        let config: Self = toml::from_str(content).map_err(LprError::config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LprError> {
        if self.camera.is_empty() {
            return Err(LprError::config("at least one [[camera]] is required"));
        }
        for camera in &self.camera {
            camera.validate()?;
        }
        self.detector.validate()?;
        self.recognizer.validate()?;
        if !self.retry.retry_delay_seconds.is_finite() || self.retry.retry_delay_seconds < 0.0 {
            return Err(LprError::config("retry_delay_seconds must be a non-negative number"));
        }
        let timeout = self.retry.capture_timeout_seconds;
        if !timeout.is_finite() || timeout <= 0.0 || Duration::try_from_secs_f64(timeout).is_err() {
            return Err(LprError::config("capture_timeout_seconds must be a positive number"));
        }
        Ok(())
    }

    pub fn camera(&self, index: usize) -> Result<&CameraConfig, LprError> {
        self.camera.get(index).ok_or_else(|| {
            LprError::config(format!("camera index {} out of range ({} configured)", index, self.camera.len()))
        })
    }
}

impl CameraConfig {
    fn validate(&self) -> Result<(), LprError> {
        if self.image_size.width == 0 || self.image_size.height == 0 {
            return Err(LprError::config(format!("camera {}: image_size must be non-zero", self.input_stream)));
        }
        for region in &self.regions {
            if region.coordinates.len() < 4 {
                return Err(LprError::config(format!(
                    "region {:?} needs at least 4 corner points, got {}",
                    region.name,
                    region.coordinates.len()
                )));
            }
        }
        Ok(())
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<(), LprError> {
        check_unit("detector.threshold", self.threshold)?;
        check_unit("detector.iou_threshold", self.iou_threshold)?;
        if self.top_n == 0 {
            return Err(LprError::config("detector.top_n must be at least 1"));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(LprError::config("detector input size must be non-zero"));
        }
        if self.model.outputs.len() < 2 {
            return Err(LprError::config("detector model needs a scores and a boxes output"));
        }
        Ok(())
    }
}

impl RecognizerConfig {
    fn validate(&self) -> Result<(), LprError> {
        if self.alphabet.is_empty() {
            return Err(LprError::config("recognizer.alphabet must not be empty"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.alphabet.chars().find(|c| !seen.insert(*c)) {
            return Err(LprError::config(format!("recognizer.alphabet repeats {:?}", dup)));
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(LprError::config("recognizer input size must be non-zero"));
        }
        if self.model.outputs.is_empty() {
            return Err(LprError::config("recognizer model needs an output"));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<(), LprError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LprError::config(format!("{} must be within [0, 1], got {}", name, value)))
    }
}
