//! Frame -> region -> detection loop with per-scope failure isolation.

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{AppConfig, CameraConfig, PublisherConfig, RegionConfig};
use crate::detector::{Detection, Detector};
use crate::error::{LprError, LprErrorKind};
use crate::inference::{Accelerator, InferenceBackend};
use crate::overlay::Overlay;
use crate::publisher::{ErrorMessage, PlateMessage, Publisher};
use crate::recognizer::Recognizer;
use crate::region::{self, PixelRect, RegionCrop};
use crate::source::{Frame, FrameSource, VideoSource};

/// One recognised plate, in full-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateEvent {
    pub region: String,
    pub text: String,
    pub bbox: PixelRect,
    /// Detector confidence.
    pub confidence: f32,
}

#[derive(Debug, Default)]
pub struct FrameReport {
    pub events: Vec<PlateEvent>,
    pub failed_regions: Vec<String>,
    pub failed_detections: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub plates: u64,
    pub region_failures: u64,
    pub detection_failures: u64,
}

impl RunSummary {
    fn add(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.plates += report.events.len() as u64;
        self.region_failures += report.failed_regions.len() as u64;
        self.detection_failures += report.failed_detections as u64;
    }
}

pub struct Pipeline<P: Publisher> {
    regions: Vec<RegionConfig>,
    detector: Detector,
    recognizer: Recognizer,
    overlay: Overlay,
    publisher: P,
    topics: PublisherConfig,
}

impl<P: Publisher> Pipeline<P> {
    pub fn new(
        regions: Vec<RegionConfig>,
        detector: Detector,
        recognizer: Recognizer,
        overlay: Overlay,
        publisher: P,
        topics: PublisherConfig,
    ) -> Self {
        Self { regions, detector, recognizer, overlay, publisher, topics }
    }

    /// Load both models through `backend` and wire up everything for `camera`.
    ///
    /// Every inference call holds `accelerator` for its duration.
    pub fn build(
        config: &AppConfig,
        camera: &CameraConfig,
        backend: &dyn InferenceBackend,
        accelerator: &Accelerator,
        publisher: P,
    ) -> Result<Self, LprError> {
        let detector = Detector::new(accelerator.guard(backend.load(&config.detector.model)?), &config.detector);
        let recognizer =
            Recognizer::new(accelerator.guard(backend.load(&config.recognizer.model)?), &config.recognizer);
        let overlay = Overlay::new(&config.overlay)?;
        Ok(Self::new(camera.regions.clone(), detector, recognizer, overlay, publisher, config.publisher.clone()))
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Process every region of `frame`, publishing plates and drawing them.
    ///
    /// Never fails: region and detection errors are logged, counted and skipped.
    pub fn process_frame(&self, frame: &mut Frame) -> FrameReport {
        let _span = info_span!("frame", ts = frame.timestamp_ms).entered();
        let mut report = FrameReport::default();

        for region in &self.regions {
            if let Err(e) = self.process_region(&mut frame.image, region, &mut report) {
                warn!(region = %region.name, error = e.kind().name(), "region skipped: {}", e);
                report.failed_regions.push(region.name.clone());
            }
        }

        if self.overlay.draws_after_regions() {
            for event in &report.events {
                self.overlay.annotate(&mut frame.image, &event.bbox, &event.text);
            }
        }
        report
    }

    fn process_region(
        &self,
        image: &mut image::RgbImage,
        region: &RegionConfig,
        report: &mut FrameReport,
    ) -> Result<(), LprError> {
        let crop = region::extract(image, region)?;
        let detections = self.detector.detect(&crop.image)?;
        debug!(region = %region.name, detections = detections.len(), "region detected");

        for (i, detection) in detections.iter().enumerate() {
            match self.read_plate(&crop, &region.name, detection) {
                Ok(event) => {
                    info!(region = %event.region, plate = %event.text, confidence = event.confidence, "plate recognised");
                    self.send(&self.topics.plate_topic, &PlateMessage { license_plate: event.text.clone() });
                    // later overlapping regions crop these pixels unless drawing is deferred
                    if !self.overlay.draws_after_regions() {
                        self.overlay.annotate(image, &event.bbox, &event.text);
                    }
                    report.events.push(event);
                }
                Err(e) => {
                    warn!(region = %region.name, detection = i, error = e.kind().name(), "detection skipped: {}", e);
                    report.failed_detections += 1;
                }
            }
        }
        Ok(())
    }

    fn read_plate(&self, crop: &RegionCrop, region: &str, detection: &Detection) -> Result<PlateEvent, LprError> {
        let (w, h) = crop.image.dimensions();
        let local = detection.to_pixels(w, h).clamp_to(w, h);
        if local.is_empty() {
            return Err(LprError::inference(format!("detection box {:?} is empty inside the region", local)));
        }
        let recognition = self.recognizer.recognize(&region::crop(&crop.image, &local))?;
        debug!(text = %recognition.text, confidence = recognition.confidence, "recognised");
        let (dx, dy) = crop.origin;
        Ok(PlateEvent {
            region: region.to_string(),
            text: recognition.text,
            bbox: local.translate(dx, dy),
            confidence: detection.confidence,
        })
    }

    /// Best effort: a failed publish is logged, never propagated.
    fn send(&self, topic: &str, message: &impl Serialize) {
        let sent = serde_json::to_value(message)
            .map_err(|e| LprError::from(LprErrorKind::Publish { topic: topic.to_string(), reason: e.to_string() }))
            .and_then(|payload| self.publisher.publish(topic, &payload));
        if let Err(e) = sent {
            warn!(topic, "publish failed: {}", e);
        }
    }

    /// Pull frames until the source ends, `shutdown` is set, or `max_frames`
    /// frames have been processed.
    ///
    /// When the source gives up, the error event is published once and the
    /// `RetryBudgetExceeded` error is returned.
    pub fn run<S: VideoSource>(
        &self,
        source: &mut FrameSource<S>,
        shutdown: &AtomicBool,
        max_frames: Option<u64>,
    ) -> Result<RunSummary, LprError> {
        let mut summary = RunSummary::default();
        while !shutdown.load(Ordering::SeqCst) {
            if max_frames.is_some_and(|max| summary.frames >= max) {
                break;
            }
            let mut frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    if e.is_retry_budget_exceeded() {
                        error!(error = e.kind().name(), "stream failed: {}", e);
                        self.send(&self.topics.error_topic, &ErrorMessage::retries_exhausted(&e));
                    }
                    return Err(e);
                }
            };

            let report = self.process_frame(&mut frame);
            summary.add(&report);
            if let Err(e) = self.overlay.save(&frame.image) {
                warn!(error = e.kind().name(), "annotated frame not written: {}", e);
            }
        }
        info!(
            frames = summary.frames,
            plates = summary.plates,
            region_failures = summary.region_failures,
            detection_failures = summary.detection_failures,
            "pipeline stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use image::RgbImage;
    use ndarray::{Array3, ArrayD};
    use serde_json::Value;

    use std::cell::RefCell;
    use std::error::Error;
    use std::rc::Rc;

    use crate::config::{self, Point};
    use crate::inference::Model;

    #[derive(Default)]
    struct Recording(RefCell<Vec<(String, Value)>>);

    impl Publisher for Recording {
        fn publish(&self, topic: &str, payload: &Value) -> Result<(), LprError> {
            self.0.borrow_mut().push((topic.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn one_box(bbox: [f32; 4]) -> Box<dyn Model> {
        Box::new(move |_: &ArrayD<f32>| {
            let scores = Array3::<f32>::from_shape_vec((1, 1, 2), vec![0.1, 0.9])?.into_dyn();
            let boxes = Array3::<f32>::from_shape_vec((1, 1, 4), bbox.to_vec())?.into_dyn();
            Ok::<_, LprError>(vec![scores, boxes])
        })
    }

    fn reads(tokens: &'static [usize]) -> Box<dyn Model> {
        Box::new(move |_: &ArrayD<f32>| {
            let mut logits = Array3::<f32>::zeros((tokens.len(), 1, 37));
            for (t, token) in tokens.iter().enumerate() {
                logits[[t, 0, *token]] = 10.0;
            }
            Ok::<_, LprError>(vec![logits.into_dyn()])
        })
    }

    #[test]
    fn plate_is_published_in_frame_coordinates() -> Result<(), Box<dyn Error>> {
        let app = AppConfig::from_toml_str(config::test::SAMPLE)?;
        let pipeline = Pipeline::new(
            app.camera[0].regions.clone(),
            Detector::new(one_box([0.25, 0.5, 0.75, 1.0]), &app.detector),
            Recognizer::new(reads(&[0, 11, 0, 2, 2]), &app.recognizer),
            Overlay::boxes_only(),
            Recording::default(),
            app.publisher.clone(),
        );
        let mut frame = Frame::new(RgbImage::new(1280, 720));
        let report = pipeline.process_frame(&mut frame);

        // gate-1 spans (100, 200)-(600, 700)
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].text, "A1");
        assert_eq!(report.events[0].bbox, PixelRect { left: 225, top: 450, right: 475, bottom: 700 });
        assert_eq!(frame.image.get_pixel(225, 450), &image::Rgb([0, 255, 0]));

        let published = pipeline.publisher().0.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "alpr/ramp/req");
        assert_eq!(published[0].1, serde_json::json!({ "licensePlate": "A1" }));
        Ok(())
    }

    /// Pipeline over two identical regions whose detector records the pixel
    /// sum of every input it is given.
    fn overlapping(overlay: Overlay) -> Result<(Pipeline<Recording>, Rc<RefCell<Vec<f32>>>), Box<dyn Error>> {
        let app = AppConfig::from_toml_str(config::test::SAMPLE)?;
        let square = vec![
            Point { x: 0, y: 0 },
            Point { x: 100, y: 0 },
            Point { x: 100, y: 100 },
            Point { x: 0, y: 100 },
        ];
        let regions = ["a", "b"]
            .iter()
            .map(|name| RegionConfig { name: name.to_string(), coordinates: square.clone() })
            .collect();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sums = seen.clone();
        let detector = Box::new(move |input: &ArrayD<f32>| {
            sums.borrow_mut().push(input.sum());
            let scores = Array3::<f32>::from_shape_vec((1, 1, 2), vec![0.1, 0.9])?.into_dyn();
            let boxes = Array3::<f32>::from_shape_vec((1, 1, 4), vec![0.2, 0.2, 0.8, 0.8])?.into_dyn();
            Ok::<_, LprError>(vec![scores, boxes])
        });
        let pipeline = Pipeline::new(
            regions,
            Detector::new(detector, &app.detector),
            Recognizer::new(reads(&[5]), &app.recognizer),
            overlay,
            Recording::default(),
            app.publisher.clone(),
        );
        Ok((pipeline, seen))
    }

    #[test]
    fn plates_are_drawn_as_soon_as_published() -> Result<(), Box<dyn Error>> {
        let (pipeline, seen) = overlapping(Overlay::boxes_only())?;
        let report = pipeline.process_frame(&mut Frame::new(RgbImage::new(200, 200)));
        assert_eq!(report.events.len(), 2);
        let sums = seen.borrow();
        assert_eq!(sums[0], 0.0);
        assert!(sums[1] > 0.0, "second region should see the first box");
        Ok(())
    }

    #[test]
    fn deferred_drawing_keeps_overlapping_crops_clean() -> Result<(), Box<dyn Error>> {
        let (pipeline, seen) = overlapping(Overlay::boxes_only().with_draw_after_regions(true))?;
        let mut frame = Frame::new(RgbImage::new(200, 200));
        let report = pipeline.process_frame(&mut frame);
        assert_eq!(report.events.len(), 2);
        assert_eq!(*seen.borrow(), vec![0.0, 0.0]);
        assert_eq!(frame.image.get_pixel(20, 20), &image::Rgb([0, 255, 0]));
        Ok(())
    }

    #[test]
    fn empty_detection_box_is_skipped() -> Result<(), Box<dyn Error>> {
        let app = AppConfig::from_toml_str(config::test::SAMPLE)?;
        let pipeline = Pipeline::new(
            app.camera[0].regions.clone(),
            Detector::new(one_box([0.5, 0.5, 0.5, 0.9]), &app.detector),
            Recognizer::new(reads(&[3]), &app.recognizer),
            Overlay::boxes_only(),
            Recording::default(),
            app.publisher.clone(),
        );
        let report = pipeline.process_frame(&mut Frame::new(RgbImage::new(1280, 720)));
        assert!(report.events.is_empty());
        assert_eq!(report.failed_detections, 1);
        assert!(pipeline.publisher().0.borrow().is_empty());
        Ok(())
    }
}
