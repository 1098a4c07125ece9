use image::RgbImage;
use ndarray::{Array3, ArrayD};
use serde_json::{json, Value};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::AtomicBool;

use lpr_edge::config::AppConfig;
use lpr_edge::overlay::Overlay;
use lpr_edge::region::PixelRect;
use lpr_edge::{
    Detector, Frame, FrameSource, LprError, Model, Pipeline, Publisher, Recognizer, StreamState, VideoSource,
};

const CONFIG: &str = r#"
[logging]
console = false

[publisher]
plate_topic = "plates"
error_topic = "errors"

[retry]
max_retries = 2
retry_delay_seconds = 0.0

[detector]
threshold = 0.5
top_n = 5
input_width = 32
input_height = 32
[detector.model]
path = "detect.pb"
input = "input"
outputs = ["scores", "boxes"]

[recognizer]
input_width = 20
input_height = 5
[recognizer.model]
path = "ocr.pb"
input = "input"
outputs = ["logits"]

[[camera]]
input_stream = "scripted://gate"
image_size = { width = 640, height = 480 }

[[camera.regions]]
name = "gate-1"
coordinates = [{ x = 50, y = 50 }, { x = 50, y = 50 }, { x = 50, y = 200 }, { x = 50, y = 200 }]

[[camera.regions]]
name = "gate-2"
coordinates = [{ x = 300, y = 100 }, { x = 500, y = 100 }, { x = 500, y = 300 }, { x = 300, y = 300 }]
"#;

#[derive(Default)]
struct Recording(RefCell<Vec<(String, Value)>>);

impl Recording {
    fn on(&self, topic: &str) -> Vec<Value> {
        self.0.borrow().iter().filter(|(t, _)| t == topic).map(|(_, p)| p.clone()).collect()
    }
}

impl Publisher for Recording {
    fn publish(&self, topic: &str, payload: &Value) -> Result<(), LprError> {
        self.0.borrow_mut().push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

/// Two well separated boxes, the top-left one more confident.
fn two_plates() -> Box<dyn Model> {
    Box::new(|_: &ArrayD<f32>| -> Result<Vec<ArrayD<f32>>, LprError> {
        let scores = Array3::<f32>::from_shape_vec((1, 2, 2), vec![0.2, 0.8, 0.1, 0.9])?;
        let boxes = Array3::<f32>::from_shape_vec((1, 2, 4), vec![0.5, 0.5, 1.0, 1.0, 0.0, 0.0, 0.5, 0.5])?;
        Ok(vec![scores.into_dyn(), boxes.into_dyn()])
    })
}

fn logits(tokens: &[usize]) -> ArrayD<f32> {
    let mut logits = Array3::<f32>::zeros((tokens.len(), 1, 37));
    for (t, token) in tokens.iter().enumerate() {
        logits[[t, 0, *token]] = 10.0;
    }
    logits.into_dyn()
}

/// Reads the n-th entry of `plates` on the n-th call; `None` entries fail.
fn reader(plates: Vec<Option<Vec<usize>>>) -> Box<dyn Model> {
    let calls = Cell::new(0);
    Box::new(move |_: &ArrayD<f32>| -> Result<Vec<ArrayD<f32>>, LprError> {
        let n = calls.get();
        calls.set(n + 1);
        match &plates[n % plates.len()] {
            Some(tokens) => Ok(vec![logits(tokens)]),
            None => Err(LprError::inference("stub recognizer failure")),
        }
    })
}

fn pipeline(config: &AppConfig, recognizer: Box<dyn Model>) -> Pipeline<Recording> {
    Pipeline::new(
        config.camera[0].regions.clone(),
        Detector::new(two_plates(), &config.detector),
        Recognizer::new(recognizer, &config.recognizer),
        Overlay::boxes_only(),
        Recording::default(),
        config.publisher.clone(),
    )
}

enum Step {
    Frame,
    Fail,
}

/// Plays back a fixed sequence of captures, then ends the stream.
struct Scripted {
    steps: VecDeque<Step>,
    opens: u32,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> Self {
        Self { steps: steps.into(), opens: 0 }
    }
}

impl VideoSource for Scripted {
    type Handle = ();

    fn open(&mut self, _uri: &str) -> Result<(), LprError> {
        self.opens += 1;
        Ok(())
    }

    fn capture(&mut self, _handle: &mut ()) -> Result<Frame, LprError> {
        match self.steps.pop_front() {
            Some(Step::Frame) => Ok(Frame::new(RgbImage::new(640, 480))),
            _ => Err(LprError::capture("no data from camera")),
        }
    }

    fn close(&mut self, _handle: ()) {}

    fn is_streaming(&self, _handle: &()) -> bool {
        !self.steps.is_empty()
    }
}

#[test]
fn broken_region_does_not_stop_later_regions() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![Some(vec![0, 11, 0, 12]), Some(vec![2, 0, 3])]));
    let report = pipeline.process_frame(&mut Frame::new(RgbImage::new(640, 480)));

    assert_eq!(report.failed_regions, vec!["gate-1".to_string()]);
    assert_eq!(report.events.len(), 2);
    assert!(report.events.iter().all(|e| e.region == "gate-2"));
    assert_eq!(
        pipeline.publisher().on("plates"),
        vec![json!({ "licensePlate": "AB" }), json!({ "licensePlate": "12" })]
    );
    Ok(())
}

#[test]
fn failed_detection_does_not_stop_the_next() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![None, Some(vec![0, 36, 36, 0])]));
    let report = pipeline.process_frame(&mut Frame::new(RgbImage::new(640, 480)));

    assert_eq!(report.failed_detections, 1);
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].text, "Z");
    assert_eq!(pipeline.publisher().on("plates"), vec![json!({ "licensePlate": "Z" })]);
    Ok(())
}

#[test]
fn detections_map_back_to_frame_in_confidence_order() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![Some(vec![1])]));
    let mut frame = Frame::new(RgbImage::new(640, 480));
    let report = pipeline.process_frame(&mut frame);

    // gate-2 is 200x200 at (300, 100)
    let boxes: Vec<(PixelRect, f32)> = report.events.iter().map(|e| (e.bbox, e.confidence)).collect();
    assert_eq!(
        boxes,
        vec![
            (PixelRect { left: 300, top: 100, right: 400, bottom: 200 }, 0.9),
            (PixelRect { left: 400, top: 200, right: 500, bottom: 300 }, 0.8),
        ]
    );
    assert_eq!(frame.image.get_pixel(400, 200), &image::Rgb([0, 255, 0]));
    Ok(())
}

#[test]
fn retry_exhaustion_emits_one_error_event() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![Some(vec![5])]));
    let script = Scripted::new(vec![Step::Frame, Step::Fail, Step::Fail, Step::Fail, Step::Frame]);
    let mut frames = FrameSource::open(script, "scripted://gate", &config.retry)?.with_sleep(|_| {});

    let err = pipeline.run(&mut frames, &AtomicBool::new(false), None).unwrap_err();
    assert!(err.is_retry_budget_exceeded());
    assert_eq!(frames.state(), StreamState::Failed);
    assert_eq!(frames.source().opens, 3);

    let recording = pipeline.publisher();
    assert_eq!(recording.on("plates").len(), 2);
    let errors = recording.on("errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"], "Max retries exceeded");
    let message = errors[0]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("Error capturing and processing image: "), "{}", message);
    assert!(message.contains("no data from camera"), "{}", message);
    Ok(())
}

#[test]
fn good_capture_resets_the_budget() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![Some(vec![5])]));
    let script = Scripted::new(vec![
        Step::Frame,
        Step::Fail,
        Step::Fail,
        Step::Frame,
        Step::Fail,
        Step::Fail,
        Step::Frame,
    ]);
    let mut frames = FrameSource::open(script, "scripted://gate", &config.retry)?.with_sleep(|_| {});

    let summary = pipeline.run(&mut frames, &AtomicBool::new(false), None)?;
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.plates, 6);
    assert_eq!(summary.region_failures, 3);
    assert!(pipeline.publisher().on("errors").is_empty());
    Ok(())
}

#[test]
fn shutdown_and_frame_limit_stop_between_frames() -> Result<(), Box<dyn Error>> {
    let config = AppConfig::from_toml_str(CONFIG)?;
    let pipeline = pipeline(&config, reader(vec![Some(vec![5])]));

    let script = Scripted::new(vec![Step::Frame, Step::Frame, Step::Frame]);
    let mut frames = FrameSource::open(script, "scripted://gate", &config.retry)?;
    assert_eq!(pipeline.run(&mut frames, &AtomicBool::new(true), None)?.frames, 0);
    assert_eq!(pipeline.run(&mut frames, &AtomicBool::new(false), Some(2))?.frames, 2);
    assert_eq!(pipeline.run(&mut frames, &AtomicBool::new(false), None)?.frames, 1);
    Ok(())
}
